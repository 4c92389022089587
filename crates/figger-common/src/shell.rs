//! Shell command execution for load-balancer and service tooling.
//!
//! Every host mutation the agent performs goes through [`exec`] or
//! [`exec_or_throw`]. Arguments that come from configuration or from
//! control requests must pass through [`shellquote`] first.
//!
//! # Example
//!
//! ```ignore
//! use figger_common::shell::{self, SYSTEMCTL_CMD, shellquote};
//!
//! let cmd = format!("{} start {}", SYSTEMCTL_CMD, shellquote("nginx"));
//! let result = shell::exec(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;
use tracing::instrument;

use crate::error::{ShellError, ShellResult};

/// Path to the `ipvsadm` command managing the IPVS virtual server table.
pub const IPVSADM_CMD: &str = "/sbin/ipvsadm";

/// Path to the `systemctl` command managing the dependent service.
pub const SYSTEMCTL_CMD: &str = "/bin/systemctl";

/// Shell used to run command lines.
pub const SH_CMD: &str = "/bin/sh";

/// Characters that need escaping inside shell double quotes:
/// `$`, `` ` ``, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// The string is wrapped in double quotes and every character with a
/// special meaning inside double quotes is backslash-escaped.
///
/// ```
/// use figger_common::shell::shellquote;
///
/// assert_eq!(shellquote("nginx"), "\"nginx\"");
/// assert_eq!(shellquote("a$b"), "\"a\\$b\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout and stderr joined, for error messages and logs.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs a command line through `/bin/sh -c` and collects its output.
///
/// Only a failure to spawn is an error here; a non-zero exit is reported
/// in the returned [`ExecResult`].
#[instrument(level = "debug")]
pub async fn exec(cmd: &str) -> ShellResult<ExecResult> {
    let output = Command::new(SH_CMD)
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ShellError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::debug!(
            command = %cmd,
            output = %result.combined_output(),
            "Command succeeded"
        );
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            output = %result.combined_output(),
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs a command line and turns a non-zero exit into an error.
///
/// Returns the trimmed stdout on success.
pub async fn exec_or_throw(cmd: &str) -> ShellResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(ShellError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
