//! Figger agent
//!
//! Keeps the IPVS backend table in sync with readiness signals delivered
//! through kernel pseudo-files, one per monitored port, under
//! `/proc/figger/<protocol>-<number>`. Each file is a single-byte
//! handshake: the kernel writes `'1'` to request activation or `'3'` to
//! request deactivation, the agent reconfigures the load balancer and
//! answers `'2'` or `'0'`.
//!
//! The [`ControlLoop`] owns the port registry. Ports are added and removed
//! through a [`ControlHandle`]; readiness comes from the
//! [`EventMultiplexer`] poller thread.

pub mod channel;
pub mod config_file;
pub mod configurator;
pub mod control_loop;
pub mod error;
pub mod metrics;
pub mod multiplexer;
pub mod port;
pub mod rest_api;
pub mod types;

pub use channel::{ChannelRead, NotificationChannel};
pub use config_file::FiggerConfig;
pub use configurator::{BackendConfigurator, ConfiguratorResult, IpvsCommands, IpvsConfigurator};
pub use control_loop::{ControlHandle, ControlLoop, PortFailure, PortStatus, ShutdownReport};
pub use error::{AgentError, ConfiguratorError, ConfiguratorOp, Result};
pub use metrics::MetricsCollector;
pub use multiplexer::{
    EventMultiplexer, Interest, Multiplexer, ReadinessBatch, ReadyEvent, ReadyKind, Token,
};
pub use port::{Port, PortState, PortStateMachine, Transition};
pub use types::{ActionKind, HandshakeCode, PortAction, PortKey, Protocol};
