//! Figger agent daemon
//!
//! Main entry point for figger-agentd. Watches the readiness pseudo-files
//! of every configured port and keeps the IPVS table in step with them.

use anyhow::Context;
use clap::Parser;
use figger_agentd::config_file::DEFAULT_CONFIG_PATH;
use figger_agentd::rest_api::{self, ApiState};
use figger_agentd::{
    ControlLoop, EventMultiplexer, FiggerConfig, IpvsCommands, IpvsConfigurator, MetricsCollector,
    PortAction,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "figger-agentd", version)]
#[command(about = "Keeps IPVS backends in sync with kernel readiness pseudo-files")]
struct Args {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = FiggerConfig::load_or_default(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    if args.check_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(&config.logging.level)?;
    info!(config = %args.config.display(), "figger-agentd: Starting");

    match run_daemon(config).await {
        Ok(()) => {
            info!("figger-agentd: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "figger-agentd: Exiting with error");
            Err(e)
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid logging.level '{}'", level))?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn run_daemon(config: FiggerConfig) -> anyhow::Result<()> {
    let host_ip = config.host_ip()?;
    let metrics = MetricsCollector::new().context("Failed to create metrics")?;

    let mux = Arc::new(EventMultiplexer::new()?);
    let readiness = mux.spawn_poller(config.poll_timeout(), config.agent.readiness_queue_depth)?;

    let configurator = Arc::new(IpvsConfigurator::new(IpvsCommands::new(
        config.backend.clone(),
        host_ip.clone(),
    )));
    info!(host_ip = %host_ip, service = %config.backend.service, "Backend configurator ready");

    let (control_loop, control) = ControlLoop::new(
        &config.agent,
        mux,
        configurator,
        readiness,
        metrics.clone(),
    );
    let mut loop_task = tokio::spawn(control_loop.run());

    for key in config.startup_ports()? {
        if let Err(e) = control.submit(PortAction::add(key)).await {
            warn!(port = %key, error = %e, "Failed to add startup port");
        }
    }

    if config.http.enabled {
        let addr = config.listen_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let state = ApiState {
            control: control.clone(),
            metrics,
        };
        tokio::spawn(async move {
            if let Err(e) = rest_api::serve(listener, state).await {
                error!(error = %e, "HTTP control surface stopped");
            }
        });
    }

    tokio::select! {
        joined = &mut loop_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).context("Control loop failed"),
            Err(e) => Err(e).context("Control loop task aborted"),
        },
        signal = shutdown_signal() => {
            info!(signal, "figger-agentd: Received shutdown signal");
            let report = control.submit_shutdown().await?;
            for failure in &report.failed {
                warn!(port = %failure.port, error = %failure.error, "Port not torn down");
            }
            info!(
                torn_down = report.torn_down.len(),
                failed = report.failed.len(),
                "figger-agentd: Graceful shutdown complete"
            );
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
