//! Prometheus metrics for the agent

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters and gauges updated by the control loop and its handlers.
#[derive(Clone)]
pub struct MetricsCollector {
    pub activation_acks_total: IntCounter,
    pub deactivation_acks_total: IntCounter,
    pub handshake_failures_total: IntCounter,
    pub channel_errors_total: IntCounter,
    pub hang_ups_total: IntCounter,
    pub live_ports: IntGauge,

    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let activation_acks_total = IntCounter::with_opts(Opts::new(
            "figger_activation_acks_total",
            "Activation requests acknowledged with a started code",
        ))?;
        registry.register(Box::new(activation_acks_total.clone()))?;

        let deactivation_acks_total = IntCounter::with_opts(Opts::new(
            "figger_deactivation_acks_total",
            "Deactivation requests acknowledged with an idle code",
        ))?;
        registry.register(Box::new(deactivation_acks_total.clone()))?;

        let handshake_failures_total = IntCounter::with_opts(Opts::new(
            "figger_handshake_failures_total",
            "Activation or deactivation requests left unacknowledged after a configurator failure",
        ))?;
        registry.register(Box::new(handshake_failures_total.clone()))?;

        let channel_errors_total = IntCounter::with_opts(Opts::new(
            "figger_channel_errors_total",
            "Notification channel read or write failures",
        ))?;
        registry.register(Box::new(channel_errors_total.clone()))?;

        let hang_ups_total = IntCounter::with_opts(Opts::new(
            "figger_hang_ups_total",
            "Notification channels that disappeared",
        ))?;
        registry.register(Box::new(hang_ups_total.clone()))?;

        let live_ports = IntGauge::with_opts(Opts::new(
            "figger_live_ports",
            "Ports currently registered with the control loop",
        ))?;
        registry.register(Box::new(live_ports.clone()))?;

        Ok(Self {
            activation_acks_total,
            deactivation_acks_total,
            handshake_failures_total,
            channel_errors_total,
            hang_ups_total,
            live_ports,
            registry: Arc::new(registry),
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
