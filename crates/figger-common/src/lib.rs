//! Common infrastructure for the figger control-plane agent.
//!
//! The agent changes host state exclusively through external tools
//! (`ipvsadm` for the load-balancer table, `systemctl` for the dependent
//! service). This crate holds the pieces every such caller needs:
//!
//! - [`shell`]: shell command execution with proper quoting
//! - [`error`]: error types for command execution
//!
//! # Example
//!
//! ```ignore
//! use figger_common::shell::{self, IPVSADM_CMD, shellquote};
//!
//! async fn drop_service(addr: &str) -> figger_common::ShellResult<()> {
//!     let cmd = format!("{} -D -t {}", IPVSADM_CMD, shellquote(addr));
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{ShellError, ShellResult};
pub use shell::{exec, exec_or_throw, shellquote, ExecResult};
