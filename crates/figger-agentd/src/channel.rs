//! Notification channel over a kernel pseudo-file.
//!
//! Each monitored port has one file, `<proc_dir>/<protocol>-<number>`,
//! whose whole content is a single handshake byte. Reads and writes
//! always address offset 0 so they replace the content instead of
//! appending, and they go through the same descriptor that is registered
//! for readiness: reading is what clears the kernel side's readable flag.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::error::{AgentError, Result};
use crate::types::{HandshakeCode, PortKey};

/// The kernel peer answers reads shorter than this with EOF.
const READ_BUFFER_SIZE: usize = 16;

/// What a channel read observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRead {
    /// A known handshake code.
    Code(HandshakeCode),
    /// A byte outside the handshake alphabet.
    Unknown(u8),
    /// Nothing to read.
    Empty,
}

/// One open pseudo-file.
#[derive(Debug)]
pub struct NotificationChannel {
    path: PathBuf,
    file: File,
}

impl NotificationChannel {
    /// Path of the pseudo-file for `key` under `proc_dir`.
    pub fn path_for(proc_dir: &Path, key: &PortKey) -> PathBuf {
        proc_dir.join(key.to_string())
    }

    /// Opens the pseudo-file for reading and writing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| AgentError::ChannelIo {
                path: path.clone(),
                operation: "open",
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current handshake byte.
    pub fn read(&self) -> Result<ChannelRead> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = self
            .file
            .read_at(&mut buf, 0)
            .map_err(|source| self.io_error("read", source))?;

        let observed = match buf[..n].first() {
            None => ChannelRead::Empty,
            Some(&byte) => match HandshakeCode::from_byte(byte) {
                Some(code) => ChannelRead::Code(code),
                None => ChannelRead::Unknown(byte),
            },
        };
        trace!(path = %self.path.display(), ?observed, "Read channel");
        Ok(observed)
    }

    /// Replaces the content with `code`.
    pub fn write(&self, code: HandshakeCode) -> Result<()> {
        self.file
            .write_all_at(&[code.as_byte()], 0)
            .map_err(|source| self.io_error("write", source))?;
        trace!(path = %self.path.display(), ?code, "Wrote channel");
        Ok(())
    }

    fn io_error(&self, operation: &'static str, source: std::io::Error) -> AgentError {
        AgentError::ChannelIo {
            path: self.path.clone(),
            operation,
            source,
        }
    }
}

impl AsFd for NotificationChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for NotificationChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
