//! Error types for external command execution.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use thiserror::Error;

/// Result type alias for shell operations.
pub type ShellResult<T> = Result<T, ShellError>;

/// Errors that can occur while running an external tool.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },
}

impl ShellError {
    /// Returns the command line this error refers to.
    pub fn command(&self) -> &str {
        match self {
            ShellError::ShellExec { command, .. } => command,
            ShellError::ShellCommandFailed { command, .. } => command,
        }
    }

    /// Returns the exit code, if the command got far enough to have one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ShellError::ShellExec { .. } => None,
            ShellError::ShellCommandFailed { exit_code, .. } => Some(*exit_code),
        }
    }
}
