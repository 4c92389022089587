//! Shared fakes for the control loop integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use figger_agentd::config_file::AgentConfig;
use figger_agentd::{
    AgentError, BackendConfigurator, ConfiguratorError, ConfiguratorOp, ConfiguratorResult,
    ControlHandle, ControlLoop, Interest, MetricsCollector, Multiplexer, PortKey, Protocol,
    ReadinessBatch, ReadyEvent, Result, Token,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Multiplexer that only records the interest set.
#[derive(Default)]
pub struct RecordingMultiplexer {
    registered: Mutex<HashMap<RawFd, (Token, Interest)>>,
    fail_register: AtomicBool,
}

impl RecordingMultiplexer {
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registered.lock().unwrap().contains_key(&fd)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    pub fn fail_next_registrations(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }
}

impl Multiplexer for RecordingMultiplexer {
    fn register(&self, fd: BorrowedFd<'_>, token: Token, interest: Interest) -> Result<()> {
        let raw = fd.as_raw_fd();
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(AgentError::Registration {
                fd: raw,
                source: std::io::Error::from_raw_os_error(1),
            });
        }
        self.registered.lock().unwrap().insert(raw, (token, interest));
        Ok(())
    }

    fn unregister(&self, fd: BorrowedFd<'_>) -> Result<()> {
        let raw = fd.as_raw_fd();
        match self.registered.lock().unwrap().remove(&raw) {
            Some(_) => Ok(()),
            None => Err(AgentError::DescriptorNotRegistered { fd: raw }),
        }
    }
}

/// Configurator that records calls and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingConfigurator {
    calls: Mutex<Vec<(ConfiguratorOp, PortKey)>>,
    failures: Mutex<Vec<(ConfiguratorOp, PortKey)>>,
    delay: Mutex<Option<Duration>>,
    stalls: Mutex<Vec<(ConfiguratorOp, PortKey, Duration)>>,
    in_flight: Mutex<HashMap<PortKey, usize>>,
    max_in_flight_per_port: AtomicUsize,
    total_in_flight: AtomicUsize,
    max_total_in_flight: AtomicUsize,
}

impl RecordingConfigurator {
    pub fn fail_on(&self, op: ConfiguratorOp, port: PortKey) {
        self.failures.lock().unwrap().push((op, port));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Delays only `op` on `port`, on top of any global delay.
    pub fn stall(&self, op: ConfiguratorOp, port: PortKey, delay: Duration) {
        self.stalls.lock().unwrap().push((op, port, delay));
    }

    pub fn calls(&self) -> Vec<(ConfiguratorOp, PortKey)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, port: PortKey) -> Vec<ConfiguratorOp> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| *p == port)
            .map(|(op, _)| *op)
            .collect()
    }

    pub fn count(&self, op: ConfiguratorOp, port: PortKey) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, p)| *o == op && *p == port)
            .count()
    }

    pub fn max_in_flight_per_port(&self) -> usize {
        self.max_in_flight_per_port.load(Ordering::SeqCst)
    }

    pub fn max_total_in_flight(&self) -> usize {
        self.max_total_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, op: ConfiguratorOp, port: &PortKey) -> ConfiguratorResult {
        self.calls.lock().unwrap().push((op, *port));

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let current = in_flight.entry(*port).or_insert(0);
            *current += 1;
            self.max_in_flight_per_port
                .fetch_max(*current, Ordering::SeqCst);
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total_in_flight.fetch_max(total, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let stall = self
            .stalls
            .lock()
            .unwrap()
            .iter()
            .find(|(o, p, _)| *o == op && p == port)
            .map(|(_, _, d)| *d);
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(current) = self.in_flight.lock().unwrap().get_mut(port) {
            *current -= 1;
        }

        if self.failures.lock().unwrap().contains(&(op, *port)) {
            return Err(ConfiguratorError::new(*port, op, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConfigurator for RecordingConfigurator {
    async fn register_port(&self, port: &PortKey) -> ConfiguratorResult {
        self.record(ConfiguratorOp::RegisterPort, port).await
    }

    async fn deregister_port(&self, port: &PortKey) -> ConfiguratorResult {
        self.record(ConfiguratorOp::DeregisterPort, port).await
    }

    async fn start_backend(&self, port: &PortKey) -> ConfiguratorResult {
        self.record(ConfiguratorOp::StartBackend, port).await
    }

    async fn stop_backend(&self, port: &PortKey) -> ConfiguratorResult {
        self.record(ConfiguratorOp::StopBackend, port).await
    }
}

/// A running control loop over a temporary proc directory.
pub struct Agent {
    pub dir: TempDir,
    pub control: ControlHandle,
    pub readiness: mpsc::Sender<ReadinessBatch>,
    pub mux: Arc<RecordingMultiplexer>,
    pub configurator: Arc<RecordingConfigurator>,
    pub metrics: MetricsCollector,
    pub task: JoinHandle<Result<()>>,
}

/// Starts a loop with one pseudo-file (content `'0'`) per name in `files`.
pub fn start_agent(files: &[&str]) -> Agent {
    start_agent_with(files, AgentConfig::default())
}

pub fn start_agent_with(files: &[&str], mut config: AgentConfig) -> Agent {
    let dir = tempfile::tempdir().unwrap();
    for name in files {
        std::fs::write(dir.path().join(name), b"0").unwrap();
    }
    config.proc_dir = dir.path().to_path_buf();

    let mux = Arc::new(RecordingMultiplexer::default());
    let configurator = Arc::new(RecordingConfigurator::default());
    let metrics = MetricsCollector::new().unwrap();
    let (readiness, readiness_rx) = mpsc::channel(8);

    let (control_loop, control) = ControlLoop::new(
        &config,
        Arc::clone(&mux),
        configurator.clone(),
        readiness_rx,
        metrics.clone(),
    );
    let task = tokio::spawn(control_loop.run());

    Agent {
        dir,
        control,
        readiness,
        mux,
        configurator,
        metrics,
        task,
    }
}

pub fn tcp(number: u16) -> PortKey {
    PortKey::new(Protocol::Tcp, number)
}

impl Agent {
    pub fn write(&self, key: PortKey, content: &[u8]) {
        std::fs::write(self.dir.path().join(key.to_string()), content).unwrap();
    }

    pub fn read(&self, key: PortKey) -> Vec<u8> {
        std::fs::read(self.dir.path().join(key.to_string())).unwrap()
    }

    pub async fn add(&self, key: PortKey) -> Result<()> {
        self.control
            .submit_add(u32::from(key.number), key.protocol.as_str())
            .await
    }

    pub async fn remove(&self, key: PortKey) -> Result<()> {
        self.control
            .submit_remove(u32::from(key.number), key.protocol.as_str())
            .await
    }

    pub async fn token_of(&self, key: PortKey) -> Token {
        self.status_of(key).await.token
    }

    pub async fn fd_of(&self, key: PortKey) -> RawFd {
        self.status_of(key).await.fd
    }

    async fn status_of(&self, key: PortKey) -> figger_agentd::PortStatus {
        self.control
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.port == key)
            .unwrap()
    }

    pub async fn keys(&self) -> Vec<PortKey> {
        self.control
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.port)
            .collect()
    }

    pub async fn state_of(&self, key: PortKey) -> Option<figger_agentd::PortState> {
        self.control
            .snapshot()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.port == key)
            .map(|s| s.state)
    }

    /// Injects a readiness batch as if the poller had reported it.
    pub async fn signal(&self, events: Vec<ReadyEvent>) {
        self.readiness.send(Ok(events)).await.unwrap();
    }

    /// Writes `code`, reports the port readable and waits for `expected`.
    pub async fn handshake(&self, key: PortKey, code: u8, expected: u8) -> bool {
        self.write(key, &[code]);
        let token = self.token_of(key).await;
        self.signal(vec![ReadyEvent::readable(token)]).await;
        wait_until(|| self.read(key) == [expected]).await
    }
}

/// Polls `condition` for up to two seconds.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
