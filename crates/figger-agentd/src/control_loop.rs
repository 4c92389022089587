//! The control loop: sole owner of the port registry.
//!
//! One task owns both registry maps (`token -> Port` and `key -> token`)
//! and is the only place they are mutated. Every registration gets a fresh
//! [`Token`], so readiness queued for a port that has since been removed
//! never reaches a port that reused its descriptor number. The loop selects
//! over three sources:
//!
//! - control messages from [`ControlHandle`]s (add, remove, shutdown,
//!   snapshot), applied strictly in submission order;
//! - readiness batches from the poller thread;
//! - completions of port tasks.
//!
//! Readable ports are dispatched to handler tasks that run concurrently
//! across ports. Per-port ordering comes from the port's own lock, not from
//! the loop. Backend teardown for remove and shutdown also runs as a port
//! task, so a stalled configurator call holds up only its own port. A
//! hung-up port is unregistered and dropped from the registry without
//! touching the backend.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::channel::ChannelRead;
use crate::config_file::AgentConfig;
use crate::configurator::BackendConfigurator;
use crate::error::{AgentError, Result};
use crate::metrics::MetricsCollector;
use crate::multiplexer::{Interest, Multiplexer, ReadinessBatch, ReadyEvent, ReadyKind, Token};
use crate::port::{Port, PortState};
use crate::types::{ActionKind, HandshakeCode, PortAction, PortKey};

/// A registered port as seen from outside the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortStatus {
    pub port: PortKey,
    pub token: Token,
    pub fd: RawFd,
    pub state: PortState,
}

/// A port whose teardown failed during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortFailure {
    pub port: PortKey,
    pub error: String,
}

/// Outcome of a shutdown request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub torn_down: Vec<PortKey>,
    pub failed: Vec<PortFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum ControlMessage {
    Action {
        action: PortAction,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<ShutdownReport>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PortStatus>>,
    },
}

/// Submits work to a running [`ControlLoop`].
///
/// Cloneable; the loop stops once every handle is dropped. Submission
/// waits for queue capacity, then for the loop to apply the request.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl std::fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ControlHandle {
    /// Starts monitoring `<protocol>-<number>`.
    pub async fn submit_add(&self, number: u32, protocol: &str) -> Result<()> {
        let key = PortKey::parse(number, protocol)?;
        self.submit(PortAction::add(key)).await
    }

    /// Stops monitoring `<protocol>-<number>` and deregisters its service.
    pub async fn submit_remove(&self, number: u32, protocol: &str) -> Result<()> {
        let key = PortKey::parse(number, protocol)?;
        self.submit(PortAction::remove(key)).await
    }

    pub async fn submit(&self, action: PortAction) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Action { action, reply }).await?;
        rx.await.map_err(|_| AgentError::LoopClosed)?
    }

    /// Tears down every registered port and empties the registry.
    pub async fn submit_shutdown(&self) -> Result<ShutdownReport> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Shutdown { reply }).await?;
        rx.await.map_err(|_| AgentError::LoopClosed)
    }

    /// Registered ports ordered by key.
    pub async fn snapshot(&self) -> Result<Vec<PortStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlMessage::Snapshot { reply }).await?;
        rx.await.map_err(|_| AgentError::LoopClosed)
    }

    async fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| AgentError::LoopClosed)
    }
}

/// Owner of the port registry and dispatcher of readiness handlers.
pub struct ControlLoop<M: Multiplexer> {
    proc_dir: PathBuf,
    mux: Arc<M>,
    configurator: Arc<dyn BackendConfigurator>,
    metrics: MetricsCollector,

    ports: HashMap<Token, Arc<Port>>,
    tokens: HashMap<PortKey, Token>,
    next_token: Token,
    /// Keys whose backend teardown is still running off the loop.
    retiring: HashMap<PortKey, watch::Receiver<()>>,

    messages: mpsc::Receiver<ControlMessage>,
    readiness: mpsc::Receiver<ReadinessBatch>,
    tasks: JoinSet<()>,
    handler_permits: Arc<Semaphore>,
}

/// A port already out of the registry whose backend is not yet torn down.
///
/// Dropping it, after or instead of its teardown, releases any add of the
/// same key that is waiting on it.
struct Retirement {
    port: Arc<Port>,
    _done: watch::Sender<()>,
}

impl Retirement {
    fn key(&self) -> PortKey {
        *self.port.key()
    }

    async fn teardown(self) -> Result<()> {
        self.port.teardown().await
    }
}

impl<M: Multiplexer> ControlLoop<M> {
    pub fn new(
        config: &AgentConfig,
        mux: Arc<M>,
        configurator: Arc<dyn BackendConfigurator>,
        readiness: mpsc::Receiver<ReadinessBatch>,
        metrics: MetricsCollector,
    ) -> (Self, ControlHandle) {
        let (tx, messages) = mpsc::channel(config.action_queue_depth.max(1));
        let control_loop = Self {
            proc_dir: config.proc_dir.clone(),
            mux,
            configurator,
            metrics,
            ports: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
            retiring: HashMap::new(),
            messages,
            readiness,
            tasks: JoinSet::new(),
            handler_permits: Arc::new(Semaphore::new(config.max_concurrent_handlers.max(1))),
        };
        (control_loop, ControlHandle { tx })
    }

    /// Runs until every [`ControlHandle`] is dropped (`Ok`) or readiness
    /// can no longer be observed (`Err(Poll)`).
    pub async fn run(mut self) -> Result<()> {
        info!(proc_dir = %self.proc_dir.display(), "Control loop started");

        loop {
            tokio::select! {
                batch = self.readiness.recv() => match batch {
                    Some(Ok(events)) => self.dispatch_readiness(events),
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!(error = %e, "Dropping readiness batch");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Readiness source failed, stopping control loop");
                        self.tasks.shutdown().await;
                        return Err(e);
                    }
                    None => {
                        error!("Readiness source closed, stopping control loop");
                        self.tasks.shutdown().await;
                        return Err(AgentError::Poll(std::io::Error::other(
                            "readiness poller stopped",
                        )));
                    }
                },
                message = self.messages.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        info!("All control handles dropped");
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Port task aborted");
                    }
                    self.retiring.retain(|_, done| done.has_changed().is_ok());
                }
            }
        }

        while self.tasks.join_next().await.is_some() {}
        info!(live_ports = self.ports.len(), "Control loop stopped");
        Ok(())
    }

    async fn handle_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Action { action, reply } => match action.kind {
                ActionKind::Add => {
                    let result = self.add_port(action.key).await;
                    finish_action(action, reply, result);
                }
                ActionKind::Remove => match self.remove_port(action.key) {
                    Ok(retirement) => {
                        self.tasks.spawn(async move {
                            let result = retirement.teardown().await;
                            if result.is_ok() {
                                info!(port = %action.key, "Port removed");
                            }
                            finish_action(action, reply, result);
                        });
                    }
                    Err(e) => finish_action(action, reply, Err(e)),
                },
            },
            ControlMessage::Shutdown { reply } => {
                let retirements = self.retire_all();
                self.tasks.spawn(async move {
                    let report = teardown_all(retirements).await;
                    // The submitter may have given up waiting.
                    let _ = reply.send(report);
                });
            }
            ControlMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Setup, open, reset to idle, register, insert. Anything failing after
    /// setup undoes it so no residue is left behind.
    ///
    /// A key removed moments ago may still be tearing down; its deregister
    /// must land before the new setup, so the add waits for it.
    #[instrument(skip(self))]
    async fn add_port(&mut self, key: PortKey) -> Result<()> {
        if self.tokens.contains_key(&key) {
            return Err(AgentError::PortAlreadyRegistered { port: key });
        }
        if let Some(mut done) = self.retiring.remove(&key) {
            debug!(port = %key, "Waiting for previous teardown");
            // Resolves with an error once the retirement is dropped.
            let _ = done.changed().await;
        }

        let port = Arc::new(Port::new(key, Arc::clone(&self.configurator)));
        port.setup().await?;

        self.next_token += 1;
        let token = self.next_token;
        if let Err(e) = self.go_live(&port, token) {
            if let Err(undo) = port.teardown().await {
                warn!(port = %key, error = %undo, "Failed to undo setup");
            }
            return Err(e);
        }

        self.ports.insert(token, port);
        self.tokens.insert(key, token);
        self.registry_changed();
        info!(port = %key, token, "Port added");
        Ok(())
    }

    fn go_live(&self, port: &Port, token: Token) -> Result<()> {
        let channel = port.open_channel(&self.proc_dir)?;
        channel.write(HandshakeCode::Idle)?;
        self.mux
            .register(channel.as_fd(), token, Interest::READABLE_HANGUP)
    }

    /// Unregisters the port and drops it from the registry. The returned
    /// retirement still owes the backend teardown, which waits for any
    /// handler holding the port's lock and so runs off the loop.
    #[instrument(skip(self))]
    fn remove_port(&mut self, key: PortKey) -> Result<Retirement> {
        let token = *self
            .tokens
            .get(&key)
            .ok_or(AgentError::PortNotRegistered { port: key })?;
        let Some(port) = self.ports.get(&token).cloned() else {
            self.tokens.remove(&key);
            self.registry_changed();
            return Err(AgentError::PortNotRegistered { port: key });
        };

        self.unregister(&port);
        self.forget(token, key);
        Ok(self.retire(port))
    }

    /// Empties the registry, returning every port in key order.
    fn retire_all(&mut self) -> Vec<Retirement> {
        let mut live: Vec<(Token, Arc<Port>)> = self
            .ports
            .iter()
            .map(|(token, port)| (*token, Arc::clone(port)))
            .collect();
        live.sort_by_key(|(_, port)| *port.key());

        live.into_iter()
            .map(|(token, port)| {
                self.unregister(&port);
                self.forget(token, *port.key());
                self.retire(port)
            })
            .collect()
    }

    fn retire(&mut self, port: Arc<Port>) -> Retirement {
        let (done, waiter) = watch::channel(());
        self.retiring.insert(*port.key(), waiter);
        Retirement { port, _done: done }
    }

    fn snapshot(&self) -> Vec<PortStatus> {
        let mut statuses: Vec<PortStatus> = self
            .tokens
            .iter()
            .filter_map(|(key, token)| {
                let port = self.ports.get(token)?;
                Some(PortStatus {
                    port: *key,
                    token: *token,
                    fd: port.channel()?.as_raw_fd(),
                    state: port.state(),
                })
            })
            .collect();
        statuses.sort_by_key(|s| s.port);
        statuses
    }

    fn dispatch_readiness(&mut self, events: Vec<ReadyEvent>) {
        for event in events {
            let Some(port) = self.ports.get(&event.token).cloned() else {
                debug!(token = event.token, kind = ?event.kind, "Readiness for retired registration");
                continue;
            };
            match event.kind {
                ReadyKind::HangUp => self.drop_hung_up(event.token, &port),
                ReadyKind::Readable => self.spawn_handler(port),
            }
        }
    }

    fn spawn_handler(&mut self, port: Arc<Port>) {
        // Level-triggered readiness repeats until the handler reads.
        if !port.try_mark_read_pending() {
            trace!(port = %port.key(), "Read already pending");
            return;
        }

        let permits = Arc::clone(&self.handler_permits);
        let metrics = self.metrics.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                port.clear_read_pending();
                return;
            };
            handle_readiness(&port, &metrics).await;
        });
    }

    fn drop_hung_up(&mut self, token: Token, port: &Port) {
        warn!(port = %port.key(), token, "Notification channel hung up, dropping port");
        self.unregister(port);
        self.forget(token, *port.key());
        self.metrics.hang_ups_total.inc();
    }

    fn unregister(&self, port: &Port) {
        let Some(channel) = port.channel() else {
            return;
        };
        if let Err(e) = self.mux.unregister(channel.as_fd()) {
            warn!(port = %port.key(), error = %e, "Failed to unregister descriptor");
        }
    }

    fn forget(&mut self, token: Token, key: PortKey) {
        self.ports.remove(&token);
        self.tokens.remove(&key);
        self.registry_changed();
    }

    fn registry_changed(&self) {
        debug_assert!(self.registry_consistent(), "port registry maps diverged");
        self.metrics.live_ports.set(self.ports.len() as i64);
    }

    /// Both maps hold exactly the same ports.
    fn registry_consistent(&self) -> bool {
        self.ports.len() == self.tokens.len()
            && self
                .tokens
                .iter()
                .all(|(key, token)| self.ports.get(token).is_some_and(|port| port.key() == key))
    }
}

fn finish_action(action: PortAction, reply: oneshot::Sender<Result<()>>, result: Result<()>) {
    if let Err(e) = &result {
        warn!(port = %action.key, kind = ?action.kind, error = %e, "Control action failed");
    }
    // The submitter may have given up waiting.
    let _ = reply.send(result);
}

/// Tears down each retired port in turn; one failure does not stop the rest.
async fn teardown_all(retirements: Vec<Retirement>) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for retirement in retirements {
        let key = retirement.key();
        match retirement.teardown().await {
            Ok(()) => report.torn_down.push(key),
            Err(e) => {
                warn!(port = %key, error = %e, "Teardown failed during shutdown");
                report.failed.push(PortFailure {
                    port: key,
                    error: e.to_string(),
                });
            }
        }
    }

    info!(
        torn_down = report.torn_down.len(),
        failed = report.failed.len(),
        "Shutdown complete"
    );
    report
}

/// Reacts to one readable notification channel.
///
/// `'1'` activates and acknowledges with `'2'` once the port is started;
/// `'3'` deactivates and acknowledges with `'0'` once it is stopped. No
/// acknowledgement is written when the configurator fails, so the kernel
/// side keeps waiting.
pub(crate) async fn handle_readiness(port: &Port, metrics: &MetricsCollector) {
    let Some(channel) = port.channel() else {
        port.clear_read_pending();
        return;
    };

    let observed = channel.read();
    port.clear_read_pending();

    let code = match observed {
        Ok(ChannelRead::Code(code)) => code,
        Ok(other) => {
            trace!(port = %port.key(), ?other, "Nothing to act on");
            return;
        }
        Err(e) => {
            metrics.channel_errors_total.inc();
            warn!(port = %port.key(), error = %e, "Failed to read notification channel");
            return;
        }
    };

    let ack = match code {
        HandshakeCode::ActivateRequested => match port.activate_backends().await {
            Ok(PortState::Started) => {
                metrics.activation_acks_total.inc();
                HandshakeCode::Started
            }
            Ok(state) => {
                debug!(port = %port.key(), ?state, "Activation not acknowledged");
                return;
            }
            Err(e) => {
                metrics.handshake_failures_total.inc();
                warn!(port = %port.key(), error = %e, "Activation request left unacknowledged");
                return;
            }
        },
        HandshakeCode::DeactivateRequested => match port.deactivate_backends().await {
            Ok(PortState::Stopped) => {
                metrics.deactivation_acks_total.inc();
                HandshakeCode::Idle
            }
            Ok(state) => {
                debug!(port = %port.key(), ?state, "Deactivation not acknowledged");
                return;
            }
            Err(e) => {
                metrics.handshake_failures_total.inc();
                warn!(port = %port.key(), error = %e, "Deactivation request left unacknowledged");
                return;
            }
        },
        HandshakeCode::Idle | HandshakeCode::Started => {
            trace!(port = %port.key(), ?code, "Own acknowledgement, ignoring");
            return;
        }
    };

    if let Err(e) = channel.write(ack) {
        metrics.channel_errors_total.inc();
        warn!(port = %port.key(), error = %e, "Failed to acknowledge");
    }
}
