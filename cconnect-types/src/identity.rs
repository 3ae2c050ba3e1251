//! Device identity advertisement.
//!
//! The identity is what a backend broadcasts while discovering and what both
//! sides exchange at the start of the link handshake: stable device id,
//! human-readable name, protocol version and capability markers used to
//! negotiate packet-type compatibility before pairing.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current protocol version. Peers with a different major version reject the
/// handshake.
pub const PROTOCOL_VERSION: u32 = 7;

/// Rough device class, advertised for presentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::Desktop
    }
}

/// The logical peer identity, created on first discovery and updated on
/// re-discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable device id (certificate-derived where available).
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Device class for presentation.
    #[serde(default)]
    pub device_type: DeviceType,
    /// Protocol version for compatibility checking.
    pub protocol_version: u32,
    /// Packet types this device can receive.
    #[serde(default)]
    pub incoming_capabilities: BTreeSet<String>,
    /// Packet types this device can send.
    #[serde(default)]
    pub outgoing_capabilities: BTreeSet<String>,
    /// TCP port the device accepts link connections on, when advertised over
    /// a network backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

impl DeviceIdentity {
    /// Creates an identity with the current protocol version and no
    /// capabilities.
    pub fn new(device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            device_id,
            device_name: device_name.into(),
            device_type: DeviceType::default(),
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
            tcp_port: None,
        }
    }

    /// Sets the device class.
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Adds capability markers.
    pub fn with_capabilities(
        mut self,
        incoming: impl IntoIterator<Item = String>,
        outgoing: impl IntoIterator<Item = String>,
    ) -> Self {
        self.incoming_capabilities.extend(incoming);
        self.outgoing_capabilities.extend(outgoing);
        self
    }

    /// Sets the advertised link port.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    /// Whether this identity's protocol version is compatible with ours.
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}
