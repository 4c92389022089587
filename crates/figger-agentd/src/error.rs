//! Error types for figger-agentd
//!
//! Recoverable errors (`Configurator`, `ChannelIo`) are logged with the
//! port they concern and never stop the control loop. `Poll` is the only
//! fatal variant.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::PortKey;

/// Backend configurator operation, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguratorOp {
    RegisterPort,
    DeregisterPort,
    StartBackend,
    StopBackend,
}

impl ConfiguratorOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfiguratorOp::RegisterPort => "register_port",
            ConfiguratorOp::DeregisterPort => "deregister_port",
            ConfiguratorOp::StartBackend => "start_backend",
            ConfiguratorOp::StopBackend => "stop_backend",
        }
    }
}

impl std::fmt::Display for ConfiguratorOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a [`BackendConfigurator`](crate::configurator::BackendConfigurator) call.
#[derive(Debug, Error)]
#[error("{operation} failed for {port}: {source}")]
pub struct ConfiguratorError {
    pub port: PortKey,
    pub operation: ConfiguratorOp,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl ConfiguratorError {
    pub fn new(
        port: PortKey,
        operation: ConfiguratorOp,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            port,
            operation,
            source: source.into(),
        }
    }
}

/// Errors that can occur in figger-agentd
#[derive(Debug, Error)]
pub enum AgentError {
    /// Descriptor could not be added to the readiness interest set
    #[error("Failed to register descriptor {fd}: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Descriptor is not in the readiness interest set
    #[error("Descriptor {fd} is not registered")]
    DescriptorNotRegistered { fd: RawFd },

    /// No live port under this key
    #[error("Port {port} is not registered")]
    PortNotRegistered { port: PortKey },

    /// A live port already exists under this key
    #[error("Port {port} is already registered")]
    PortAlreadyRegistered { port: PortKey },

    /// Load-balancer table or dependent service mutation failed
    #[error(transparent)]
    Configurator(#[from] ConfiguratorError),

    /// Pseudo-file read/write failure
    #[error("Channel {operation} failed on {}: {source}", .path.display())]
    ChannelIo {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// Readiness wait failed; the agent cannot continue
    #[error("Readiness wait failed: {0}")]
    Poll(#[source] io::Error),

    /// Protocol name other than tcp/udp
    #[error("Invalid protocol '{0}', expected tcp or udp")]
    InvalidProtocol(String),

    /// Port number outside 1..=65535
    #[error("Invalid port number '{0}'")]
    InvalidPortNumber(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The control loop is no longer accepting actions
    #[error("Control loop is not running")]
    LoopClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Returns true for errors that must terminate the agent.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Poll(_))
    }
}

/// Result type alias for figger-agentd operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    #[test]
    fn test_configurator_error_display() {
        let err = ConfiguratorError::new(
            PortKey::new(Protocol::Tcp, 8080),
            ConfiguratorOp::StartBackend,
            "exit code 1",
        );
        assert_eq!(err.to_string(), "start_backend failed for tcp-8080: exit code 1");

        let err: AgentError = err.into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_port_errors_display() {
        let port = PortKey::new(Protocol::Udp, 53);
        assert_eq!(
            AgentError::PortNotRegistered { port }.to_string(),
            "Port udp-53 is not registered"
        );
        assert_eq!(
            AgentError::PortAlreadyRegistered { port }.to_string(),
            "Port udp-53 is already registered"
        );
    }

    #[test]
    fn test_channel_io_display() {
        let err = AgentError::ChannelIo {
            path: PathBuf::from("/proc/figger/tcp-80"),
            operation: "read",
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(
            err.to_string(),
            "Channel read failed on /proc/figger/tcp-80: gone"
        );
    }

    #[test]
    fn test_poll_is_fatal() {
        assert!(AgentError::Poll(io::Error::from_raw_os_error(9)).is_fatal());
        assert!(!AgentError::LoopClosed.is_fatal());
    }
}
