//! Node-side protocol for the BLE gateway.
//!
//! A reader node (a small Linux box or similar with a BLE radio) scans for
//! wearable sensors and reports what it sees to the gateway over a long
//! lived TCP connection. This crate defines everything both ends of that
//! connection have to agree on:
//!
//! 1. Identifiers: the stable [`NodeId`] a reader registers with, and the
//!    [`DeviceAddress`] of a physical sensor
//! 2. The closed message taxonomy, [`NodeMessage`] (node to gateway) and
//!    [`GatewayMessage`] (gateway to node)
//! 3. The framing codec: one JSON object per line, see [`codec`]
//! 4. A [`NodeClient`] that reader processes use to register, report
//!    and receive connect / disconnect directives
//!
//! BLE scanning itself is not part of this crate; a reader feeds whatever
//! its radio stack produces into the client.

pub mod codec;

mod client;
mod message;

pub use client::{NodeClient, NodeDirectives};
pub use message::{DeviceData, GatewayMessage, NodeConfig, NodeMessage};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Serde Error")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid device address {0:?}")]
    InvalidAddress(String),
    #[error("Connection closed")]
    Closed,
}

/// Stable identity of a reader node. Survives reconnects, unlike the
/// connection id the gateway assigns to each socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Address of a physical BLE sensor, normalised to upper case so the same
/// radio reported by two readers with different formatting maps to one
/// record on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn parse(addr: &str) -> Result<Self, ProtoError> {
        let trimmed = addr.trim();
        if trimmed.is_empty() {
            return Err(ProtoError::InvalidAddress(addr.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ProtoError;

    fn try_from(addr: String) -> Result<Self, Self::Error> {
        Self::parse(&addr)
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.0
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the unix epoch, as stamped by the reporting node
pub type Timestamp = i64;

pub fn timestamp_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}
