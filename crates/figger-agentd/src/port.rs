//! Per-port backend lifecycle.
//!
//! A [`Port`] moves through `Stopped -> Starting -> Started -> Stopping ->
//! Stopped`. Every state-mutating operation holds the port's lock for its
//! whole duration, including the configurator call, so at most one such
//! operation is in flight per port. The intermediate states are only ever
//! visible while that lock is held.
//!
//! Transitions are optimistic: the target intermediate state is entered
//! first, then the configurator runs, then the [`Transition`] is either
//! committed to the next stable state or rolled back to the exact state
//! captured when it began.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::channel::NotificationChannel;
use crate::configurator::BackendConfigurator;
use crate::error::Result;
use crate::types::PortKey;

/// Backend registration state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl PortState {
    /// The state that follows this one in the lifecycle cycle.
    pub fn next(&self) -> PortState {
        match self {
            PortState::Stopped => PortState::Starting,
            PortState::Starting => PortState::Started,
            PortState::Started => PortState::Stopping,
            PortState::Stopping => PortState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PortState::Stopped => 0,
            PortState::Starting => 1,
            PortState::Started => 2,
            PortState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> PortState {
        match value {
            1 => PortState::Starting,
            2 => PortState::Started,
            3 => PortState::Stopping,
            _ => PortState::Stopped,
        }
    }
}

/// An in-flight transition: where it started and where it is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Transition {
    prior: PortState,
    target: PortState,
}

impl Transition {
    pub fn prior(&self) -> PortState {
        self.prior
    }

    pub fn target(&self) -> PortState {
        self.target
    }
}

/// Lock-free state machine; the owning [`Port`] serializes access.
#[derive(Debug)]
pub struct PortStateMachine {
    state: PortState,
}

impl Default for PortStateMachine {
    fn default() -> Self {
        Self {
            state: PortState::Stopped,
        }
    }
}

impl PortStateMachine {
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Enters `Starting`, unless activation is already underway or done.
    pub fn begin_activation(&mut self) -> Option<Transition> {
        match self.state {
            PortState::Starting | PortState::Started => None,
            _ => Some(self.enter(PortState::Starting, PortState::Started)),
        }
    }

    /// Enters `Stopping`, unless deactivation is already underway or done.
    pub fn begin_deactivation(&mut self) -> Option<Transition> {
        match self.state {
            PortState::Stopping | PortState::Stopped => None,
            _ => Some(self.enter(PortState::Stopping, PortState::Stopped)),
        }
    }

    pub fn commit(&mut self, transition: Transition) {
        debug_assert_eq!(self.state.next(), transition.target);
        self.state = transition.target;
    }

    pub fn rollback(&mut self, transition: Transition) {
        self.state = transition.prior;
    }

    fn enter(&mut self, intermediate: PortState, target: PortState) -> Transition {
        debug_assert_eq!(self.state.next(), intermediate);
        let transition = Transition {
            prior: self.state,
            target,
        };
        self.state = intermediate;
        transition
    }
}

/// A monitored port and everything needed to drive its backend.
pub struct Port {
    key: PortKey,
    machine: Mutex<PortStateMachine>,
    /// Mirror of the machine's state, readable without the lock.
    observed: AtomicU8,
    channel: OnceLock<NotificationChannel>,
    /// Set while a readiness handler is queued but has not read yet.
    read_pending: AtomicBool,
    configurator: Arc<dyn BackendConfigurator>,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("channel", &self.channel.get().map(|c| c.path().to_path_buf()))
            .finish()
    }
}

impl Port {
    pub fn new(key: PortKey, configurator: Arc<dyn BackendConfigurator>) -> Self {
        Self {
            key,
            machine: Mutex::new(PortStateMachine::default()),
            observed: AtomicU8::new(PortState::Stopped.as_u8()),
            channel: OnceLock::new(),
            read_pending: AtomicBool::new(false),
            configurator,
        }
    }

    pub fn key(&self) -> &PortKey {
        &self.key
    }

    /// Last state published by a transition; may lag an in-flight one.
    pub fn state(&self) -> PortState {
        PortState::from_u8(self.observed.load(Ordering::Acquire))
    }

    /// Opens the port's notification channel on first use.
    pub fn open_channel(&self, proc_dir: &Path) -> Result<&NotificationChannel> {
        if let Some(channel) = self.channel.get() {
            return Ok(channel);
        }
        let channel = NotificationChannel::open(NotificationChannel::path_for(proc_dir, &self.key))?;
        Ok(self.channel.get_or_init(|| channel))
    }

    pub fn channel(&self) -> Option<&NotificationChannel> {
        self.channel.get()
    }

    /// Marks a read as pending; false if one already was.
    pub(crate) fn try_mark_read_pending(&self) -> bool {
        self.read_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_read_pending(&self) {
        self.read_pending.store(false, Ordering::Release);
    }

    /// Registers the virtual service. Called once, before the port goes live.
    #[instrument(skip(self), fields(port = %self.key))]
    pub async fn setup(&self) -> Result<()> {
        let _machine = self.machine.lock().await;
        self.configurator.register_port(&self.key).await?;
        Ok(())
    }

    /// Brings the backend up; returns the resulting state.
    ///
    /// A no-op when the port is already `Starting` or `Started`. On failure
    /// the state is restored to what it was before the call and the error
    /// is returned.
    #[instrument(skip(self), fields(port = %self.key))]
    pub async fn activate_backends(&self) -> Result<PortState> {
        let mut machine = self.machine.lock().await;
        let Some(transition) = machine.begin_activation() else {
            debug!(port = %self.key, state = ?machine.state(), "Activation already done");
            return Ok(machine.state());
        };
        self.publish(&machine);

        match self.configurator.start_backend(&self.key).await {
            Ok(()) => {
                machine.commit(transition);
                self.publish(&machine);
                info!(port = %self.key, "Backends activated");
                Ok(machine.state())
            }
            Err(e) => {
                machine.rollback(transition);
                self.publish(&machine);
                warn!(port = %self.key, error = %e, state = ?machine.state(), "Activation failed, rolled back");
                Err(e.into())
            }
        }
    }

    /// Takes the backend down; returns the resulting state.
    ///
    /// Mirror image of [`activate_backends`](Self::activate_backends).
    #[instrument(skip(self), fields(port = %self.key))]
    pub async fn deactivate_backends(&self) -> Result<PortState> {
        let mut machine = self.machine.lock().await;
        let Some(transition) = machine.begin_deactivation() else {
            debug!(port = %self.key, state = ?machine.state(), "Deactivation already done");
            return Ok(machine.state());
        };
        self.publish(&machine);

        match self.configurator.stop_backend(&self.key).await {
            Ok(()) => {
                machine.commit(transition);
                self.publish(&machine);
                info!(port = %self.key, "Backends deactivated");
                Ok(machine.state())
            }
            Err(e) => {
                machine.rollback(transition);
                self.publish(&machine);
                warn!(port = %self.key, error = %e, state = ?machine.state(), "Deactivation failed, rolled back");
                Err(e.into())
            }
        }
    }

    /// Removes the virtual service regardless of the backend state.
    #[instrument(skip(self), fields(port = %self.key))]
    pub async fn teardown(&self) -> Result<()> {
        let _machine = self.machine.lock().await;
        self.configurator.deregister_port(&self.key).await?;
        Ok(())
    }

    fn publish(&self, machine: &PortStateMachine) {
        self.observed.store(machine.state().as_u8(), Ordering::Release);
    }
}
