//! Configuration file support for figger-agentd
//!
//! Loads and validates the agent configuration from a TOML file.
//! Default location: /etc/figger/agent.toml

use crate::error::{AgentError, Result};
use crate::types::PortKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/figger/agent.toml";

/// Environment variable holding the host address when `backend.host_ip` is empty.
pub const HOST_IP_ENV: &str = "FIGGER_HOST_IP";

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Directory holding one pseudo-file per port
    #[serde(default = "default_proc_dir")]
    pub proc_dir: PathBuf,

    /// Readiness wait timeout in milliseconds, 1 to 65535
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Capacity of the control action queue
    #[serde(default = "default_action_queue_depth")]
    pub action_queue_depth: usize,

    /// Capacity of the readiness batch queue
    #[serde(default = "default_readiness_queue_depth")]
    pub readiness_queue_depth: usize,

    /// Upper bound on concurrently running readiness handlers
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
}

/// Load-balancer backend and dependent service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Host address for virtual services and the real server; empty means
    /// read `FIGGER_HOST_IP`
    #[serde(default)]
    pub host_ip: String,

    /// Port the dependent service listens on
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,

    /// systemd unit started with the first live backend
    #[serde(default = "default_service")]
    pub service: String,

    /// IPVS scheduler for new virtual services
    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    /// Real server weight
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_ipvsadm_cmd")]
    pub ipvsadm_cmd: String,

    #[serde(default = "default_systemctl_cmd")]
    pub systemctl_cmd: String,
}

/// HTTP control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    #[serde(default = "default_http_listen")]
    pub listen: String,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A port added at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupPort {
    pub protocol: String,
    pub number: u32,
}

impl StartupPort {
    pub fn key(&self) -> Result<PortKey> {
        PortKey::parse(self.number, &self.protocol)
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiggerConfig {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ports: Vec<StartupPort>,
}

fn default_proc_dir() -> PathBuf {
    PathBuf::from("/proc/figger")
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_action_queue_depth() -> usize {
    64
}

fn default_readiness_queue_depth() -> usize {
    16
}

fn default_max_concurrent_handlers() -> usize {
    32
}

fn default_backend_port() -> u16 {
    80
}

fn default_service() -> String {
    "nginx".to_string()
}

fn default_scheduler() -> String {
    "rr".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_ipvsadm_cmd() -> String {
    figger_common::shell::IPVSADM_CMD.to_string()
}

fn default_systemctl_cmd() -> String {
    figger_common::shell::SYSTEMCTL_CMD.to_string()
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_listen() -> String {
    "0.0.0.0:8899".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proc_dir: default_proc_dir(),
            poll_timeout_ms: default_poll_timeout_ms(),
            action_queue_depth: default_action_queue_depth(),
            readiness_queue_depth: default_readiness_queue_depth(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host_ip: String::new(),
            backend_port: default_backend_port(),
            service: default_service(),
            scheduler: default_scheduler(),
            weight: default_weight(),
            ipvsadm_cmd: default_ipvsadm_cmd(),
            systemctl_cmd: default_systemctl_cmd(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            listen: default_http_listen(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FiggerConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                AgentError::Config(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(AgentError::Io(e)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AgentError::Config(format!("Failed to serialize config: {}", e)))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.poll_timeout_ms)
    }

    /// Host address from the file, else from `FIGGER_HOST_IP`.
    pub fn host_ip(&self) -> Result<String> {
        if !self.backend.host_ip.is_empty() {
            return Ok(self.backend.host_ip.clone());
        }
        match std::env::var(HOST_IP_ENV) {
            Ok(ip) if !ip.trim().is_empty() => Ok(ip.trim().to_string()),
            _ => Err(AgentError::Config(format!(
                "backend.host_ip is empty and {} is not set",
                HOST_IP_ENV
            ))),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.http
            .listen
            .parse()
            .map_err(|e| AgentError::Config(format!("http.listen '{}': {}", self.http.listen, e)))
    }

    /// Startup ports as keys.
    pub fn startup_ports(&self) -> Result<Vec<PortKey>> {
        self.ports.iter().map(StartupPort::key).collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.agent.proc_dir.as_os_str().is_empty() {
            return Err(AgentError::Config("agent.proc_dir must not be empty".to_string()));
        }

        // The epoll wait takes at most u16::MAX milliseconds; zero would spin.
        if self.agent.poll_timeout_ms == 0 || self.agent.poll_timeout_ms > u64::from(u16::MAX) {
            return Err(AgentError::Config(format!(
                "agent.poll_timeout_ms must be in 1..={}, got {}",
                u16::MAX,
                self.agent.poll_timeout_ms
            )));
        }

        if self.agent.action_queue_depth == 0 || self.agent.readiness_queue_depth == 0 {
            return Err(AgentError::Config("queue depths must be > 0".to_string()));
        }

        if self.agent.max_concurrent_handlers == 0 {
            return Err(AgentError::Config(
                "agent.max_concurrent_handlers must be > 0".to_string(),
            ));
        }

        if self.backend.backend_port == 0 {
            return Err(AgentError::Config("backend.backend_port must be > 0".to_string()));
        }

        if self.http.enabled {
            self.listen_addr()?;
        }

        self.startup_ports()?;
        Ok(())
    }
}
