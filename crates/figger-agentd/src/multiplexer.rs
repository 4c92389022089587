//! Readiness multiplexing over notification channel descriptors.
//!
//! The control loop only needs [`Multiplexer`] (register/unregister). The
//! blocking wait lives on [`EventMultiplexer`] and runs on a dedicated
//! poller thread that forwards batches through a bounded channel, so the
//! control loop can select over readiness and control actions together.
//!
//! Hang-up is reported as its own [`ReadyKind`] so a pseudo-file that
//! vanished is cleaned up instead of being read.
//!
//! Events carry the [`Token`] given at registration, not the descriptor
//! number. Descriptor numbers are reused as soon as a file is closed, so a
//! batch queued before a remove could otherwise hit the next port to open.

use std::os::fd::BorrowedFd;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{AgentError, Result};

/// Events a descriptor is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub hang_up: bool,
}

impl Interest {
    /// What every notification channel is registered for.
    pub const READABLE_HANGUP: Interest = Interest {
        readable: true,
        hang_up: true,
    };
}

/// Kind of readiness reported for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyKind {
    Readable,
    HangUp,
}

/// Identifies one registration; never reused while the process runs.
pub type Token = u64;

/// One ready registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub kind: ReadyKind,
}

impl ReadyEvent {
    pub fn readable(token: Token) -> Self {
        Self {
            token,
            kind: ReadyKind::Readable,
        }
    }

    pub fn hang_up(token: Token) -> Self {
        Self {
            token,
            kind: ReadyKind::HangUp,
        }
    }
}

/// A batch from one wait, or the fatal error that ended the poller.
pub type ReadinessBatch = Result<Vec<ReadyEvent>>;

/// Registration side of a readiness multiplexer.
pub trait Multiplexer: Send + Sync + 'static {
    /// Adds `fd` to the interest set; its events report `token`.
    fn register(&self, fd: BorrowedFd<'_>, token: Token, interest: Interest) -> Result<()>;

    /// Removes `fd` from the interest set.
    ///
    /// Fails with `DescriptorNotRegistered` if it was never added. A
    /// descriptor that is already closed is not an error.
    fn unregister(&self, fd: BorrowedFd<'_>) -> Result<()>;
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use tracing::{debug, error, info, warn};

    /// Maximum events returned by one wait.
    const MAX_EVENTS: usize = 64;

    /// epoll-backed multiplexer, level-triggered.
    pub struct EventMultiplexer {
        epoll: Epoll,
    }

    impl std::fmt::Debug for EventMultiplexer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EventMultiplexer").finish_non_exhaustive()
        }
    }

    impl EventMultiplexer {
        pub fn new() -> Result<Self> {
            let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
                .map_err(|e| AgentError::Poll(e.into()))?;
            debug!("Created epoll instance");
            Ok(Self { epoll })
        }

        /// Blocks until a registered descriptor is ready or `timeout`
        /// elapses (`None` waits forever). An interrupted wait returns an
        /// empty batch.
        pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
            let timeout = match timeout {
                None => EpollTimeout::NONE,
                Some(t) => EpollTimeout::from(u16::try_from(t.as_millis()).unwrap_or(u16::MAX)),
            };

            let mut events = [EpollEvent::empty(); MAX_EVENTS];
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => return Ok(Vec::new()),
                Err(e) => return Err(AgentError::Poll(e.into())),
            };

            Ok(events[..n].iter().map(to_ready_event).collect())
        }

        /// Runs [`wait`](Self::wait) on a dedicated thread and forwards
        /// non-empty batches. The thread exits when the receiver is
        /// dropped (noticed within one `timeout`) or after forwarding a
        /// fatal error.
        pub fn spawn_poller(
            self: &Arc<Self>,
            timeout: Duration,
            queue_depth: usize,
        ) -> Result<mpsc::Receiver<ReadinessBatch>> {
            let (tx, rx) = mpsc::channel(queue_depth);
            let mux = Arc::clone(self);

            std::thread::Builder::new()
                .name("figger-poller".to_string())
                .spawn(move || {
                    info!("Readiness poller started");
                    loop {
                        match mux.wait(Some(timeout)) {
                            Ok(events) if events.is_empty() => {
                                if tx.is_closed() {
                                    break;
                                }
                            }
                            Ok(events) => {
                                if tx.blocking_send(Ok(events)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "Readiness wait failed");
                                let fatal = e.is_fatal();
                                if tx.blocking_send(Err(e)).is_err() || fatal {
                                    break;
                                }
                            }
                        }
                    }
                    info!("Readiness poller stopped");
                })?;

            Ok(rx)
        }
    }

    fn to_ready_event(event: &EpollEvent) -> ReadyEvent {
        let token = event.data();
        let flags = event.events();
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
            ReadyEvent::hang_up(token)
        } else {
            ReadyEvent::readable(token)
        }
    }

    fn interest_flags(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.hang_up {
            flags |= EpollFlags::EPOLLHUP;
        }
        flags
    }

    impl Multiplexer for EventMultiplexer {
        fn register(&self, fd: BorrowedFd<'_>, token: Token, interest: Interest) -> Result<()> {
            let raw = fd.as_raw_fd();
            let mut event = EpollEvent::new(interest_flags(interest), token);
            let result = match self.epoll.add(fd, event) {
                // Already present: point it at the new token.
                Err(Errno::EEXIST) => self.epoll.modify(fd, &mut event),
                other => other,
            };
            result.map_err(|e| AgentError::Registration {
                fd: raw,
                source: e.into(),
            })
        }

        fn unregister(&self, fd: BorrowedFd<'_>) -> Result<()> {
            let raw = fd.as_raw_fd();
            match self.epoll.delete(fd) {
                Ok(()) => Ok(()),
                Err(Errno::ENOENT) => Err(AgentError::DescriptorNotRegistered { fd: raw }),
                Err(Errno::EBADF) => {
                    warn!(fd = raw, "Descriptor already closed while unregistering");
                    Ok(())
                }
                Err(e) => Err(AgentError::Registration {
                    fd: raw,
                    source: e.into(),
                }),
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::EventMultiplexer;

/// Stand-in for platforms without epoll; construction always fails.
#[cfg(not(target_os = "linux"))]
mod unsupported {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug)]
    pub struct EventMultiplexer;

    impl EventMultiplexer {
        pub fn new() -> Result<Self> {
            Err(AgentError::Poll(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "epoll is only available on Linux",
            )))
        }

        pub fn wait(&self, _timeout: Option<Duration>) -> Result<Vec<ReadyEvent>> {
            Ok(Vec::new())
        }

        pub fn spawn_poller(
            self: &Arc<Self>,
            _timeout: Duration,
            queue_depth: usize,
        ) -> Result<mpsc::Receiver<ReadinessBatch>> {
            let (_tx, rx) = mpsc::channel(queue_depth);
            Ok(rx)
        }
    }

    impl Multiplexer for EventMultiplexer {
        fn register(&self, _fd: BorrowedFd<'_>, _token: Token, _interest: Interest) -> Result<()> {
            Ok(())
        }

        fn unregister(&self, _fd: BorrowedFd<'_>) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::EventMultiplexer;
