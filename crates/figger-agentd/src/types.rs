//! Core types shared by the agent modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AgentError;

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// `ipvsadm` service-address flag for this protocol.
    pub fn ipvs_flag(&self) -> &'static str {
        match self {
            Protocol::Tcp => "-t",
            Protocol::Udp => "-u",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AgentError;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(AgentError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Identity of a monitored port: `(protocol, number)`.
///
/// Displays as `<protocol>-<number>`, which is also the pseudo-file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortKey {
    pub protocol: Protocol,
    pub number: u16,
}

impl PortKey {
    pub fn new(protocol: Protocol, number: u16) -> Self {
        Self { protocol, number }
    }

    /// Builds a key from loosely typed request parameters.
    pub fn parse(number: u32, protocol: &str) -> Result<Self, AgentError> {
        let protocol = protocol.parse()?;
        let number = u16::try_from(number)
            .ok()
            .filter(|n| *n != 0)
            .ok_or_else(|| AgentError::InvalidPortNumber(number.to_string()))?;
        Ok(Self::new(protocol, number))
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.protocol, self.number)
    }
}

/// Single-byte code exchanged over a notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeCode {
    /// `'0'`: idle, or the agent acknowledged a deactivation.
    Idle,
    /// `'1'`: the kernel requests activation.
    ActivateRequested,
    /// `'2'`: the agent acknowledged an activation.
    Started,
    /// `'3'`: the kernel requests deactivation.
    DeactivateRequested,
}

impl HandshakeCode {
    pub fn as_byte(&self) -> u8 {
        match self {
            HandshakeCode::Idle => b'0',
            HandshakeCode::ActivateRequested => b'1',
            HandshakeCode::Started => b'2',
            HandshakeCode::DeactivateRequested => b'3',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(HandshakeCode::Idle),
            b'1' => Some(HandshakeCode::ActivateRequested),
            b'2' => Some(HandshakeCode::Started),
            b'3' => Some(HandshakeCode::DeactivateRequested),
            _ => None,
        }
    }
}

/// Kind of a control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Remove,
}

/// A request to add or remove a monitored port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAction {
    pub key: PortKey,
    pub kind: ActionKind,
}

impl PortAction {
    pub fn add(key: PortKey) -> Self {
        Self {
            key,
            kind: ActionKind::Add,
        }
    }

    pub fn remove(key: PortKey) -> Self {
        Self {
            key,
            kind: ActionKind::Remove,
        }
    }
}
