//! Backend configurator: the load-balancer table and dependent service.
//!
//! [`BackendConfigurator`] is the only way the state machine touches the
//! host. [`IpvsConfigurator`] is the production implementation and shells
//! out to `ipvsadm` and `systemctl`.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use figger_common::shell::{self, shellquote};

use crate::config_file::BackendConfig;
use crate::error::{ConfiguratorError, ConfiguratorOp};
use crate::types::PortKey;

/// Result of a configurator call.
pub type ConfiguratorResult = std::result::Result<(), ConfiguratorError>;

/// Mutations of the load-balancer table and dependent service.
///
/// Calls complete before returning and may fail; callers hold the port's
/// lock for their whole duration.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendConfigurator: Send + Sync {
    /// Adds the virtual service for `port` (no backend yet).
    async fn register_port(&self, port: &PortKey) -> ConfiguratorResult;

    /// Removes the virtual service for `port`.
    async fn deregister_port(&self, port: &PortKey) -> ConfiguratorResult;

    /// Starts the dependent service and adds the live backend.
    async fn start_backend(&self, port: &PortKey) -> ConfiguratorResult;

    /// Removes the live backend and stops the dependent service.
    async fn stop_backend(&self, port: &PortKey) -> ConfiguratorResult;
}

/// Builds the command lines for one configured backend.
#[derive(Debug, Clone)]
pub struct IpvsCommands {
    settings: BackendConfig,
    host_ip: String,
}

impl IpvsCommands {
    pub fn new(settings: BackendConfig, host_ip: impl Into<String>) -> Self {
        Self {
            settings,
            host_ip: host_ip.into(),
        }
    }

    fn service_addr(&self, port: &PortKey) -> String {
        format!(
            "{} {}",
            port.protocol.ipvs_flag(),
            shellquote(&format!("{}:{}", self.host_ip, port.number))
        )
    }

    fn real_server(&self) -> String {
        shellquote(&format!("{}:{}", self.host_ip, self.settings.backend_port))
    }

    pub fn add_service(&self, port: &PortKey) -> String {
        format!(
            "{} -A {} -s {}",
            self.settings.ipvsadm_cmd,
            self.service_addr(port),
            shellquote(&self.settings.scheduler)
        )
    }

    pub fn delete_service(&self, port: &PortKey) -> String {
        format!("{} -D {}", self.settings.ipvsadm_cmd, self.service_addr(port))
    }

    pub fn add_real_server(&self, port: &PortKey) -> String {
        format!(
            "{} -a {} -r {} -m -w {}",
            self.settings.ipvsadm_cmd,
            self.service_addr(port),
            self.real_server(),
            self.settings.weight
        )
    }

    pub fn delete_real_server(&self, port: &PortKey) -> String {
        format!(
            "{} -d {} -r {}",
            self.settings.ipvsadm_cmd,
            self.service_addr(port),
            self.real_server()
        )
    }

    pub fn start_service(&self) -> String {
        format!(
            "{} start {}",
            self.settings.systemctl_cmd,
            shellquote(&self.settings.service)
        )
    }

    pub fn stop_service(&self) -> String {
        format!(
            "{} stop {}",
            self.settings.systemctl_cmd,
            shellquote(&self.settings.service)
        )
    }
}

/// Production configurator driving IPVS through `ipvsadm`.
#[derive(Debug, Clone)]
pub struct IpvsConfigurator {
    commands: IpvsCommands,
}

impl IpvsConfigurator {
    pub fn new(commands: IpvsCommands) -> Self {
        Self { commands }
    }

    async fn run(&self, port: &PortKey, operation: ConfiguratorOp, cmd: &str) -> ConfiguratorResult {
        shell::exec_or_throw(cmd).await.map(|_| ()).map_err(|e| {
            warn!(
                port = %port,
                %operation,
                command = e.command(),
                exit_code = ?e.exit_code(),
                "Configurator command failed"
            );
            ConfiguratorError::new(*port, operation, e)
        })
    }
}

#[async_trait]
impl BackendConfigurator for IpvsConfigurator {
    #[instrument(skip(self), fields(port = %port))]
    async fn register_port(&self, port: &PortKey) -> ConfiguratorResult {
        let op = ConfiguratorOp::RegisterPort;
        self.run(port, op, &self.commands.add_service(port)).await?;
        info!(port = %port, "Registered virtual service");
        Ok(())
    }

    #[instrument(skip(self), fields(port = %port))]
    async fn deregister_port(&self, port: &PortKey) -> ConfiguratorResult {
        let op = ConfiguratorOp::DeregisterPort;
        self.run(port, op, &self.commands.delete_service(port)).await?;
        info!(port = %port, "Deregistered virtual service");
        Ok(())
    }

    #[instrument(skip(self), fields(port = %port))]
    async fn start_backend(&self, port: &PortKey) -> ConfiguratorResult {
        let op = ConfiguratorOp::StartBackend;
        self.run(port, op, &self.commands.start_service()).await?;
        self.run(port, op, &self.commands.add_real_server(port)).await?;
        info!(port = %port, "Backend started");
        Ok(())
    }

    #[instrument(skip(self), fields(port = %port))]
    async fn stop_backend(&self, port: &PortKey) -> ConfiguratorResult {
        let op = ConfiguratorOp::StopBackend;
        self.run(port, op, &self.commands.delete_real_server(port)).await?;
        self.run(port, op, &self.commands.stop_service()).await?;
        info!(port = %port, "Backend stopped");
        Ok(())
    }
}
