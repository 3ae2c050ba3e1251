//! Core configuration.
//!
//! A plain struct the embedding application fills in; persistence of these
//! values is the caller's concern.

use cconnect_types::{DeviceId, DeviceIdentity, DeviceType};
use std::collections::BTreeSet;
use std::time::Duration;

/// Configuration for the link and dispatch core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Our stable device id.
    pub device_id: DeviceId,
    /// Human-readable device name advertised to peers.
    pub device_name: String,
    /// Device class advertised to peers.
    pub device_type: DeviceType,
    /// DER-encoded local certificate, when the host supplies one. Key
    /// generation and validation primitives live outside this core.
    pub certificate_der: Option<Vec<u8>>,
    /// Packet types this device can receive, advertised for capability
    /// negotiation.
    pub incoming_capabilities: BTreeSet<String>,
    /// Packet types this device can send.
    pub outgoing_capabilities: BTreeSet<String>,
    /// Bound on the Connecting/Authenticating phases of a link handshake.
    pub handshake_timeout: Duration,
    /// How long an unanswered pairing request stays open.
    pub pairing_timeout: Duration,
    /// UDP port used for LAN discovery beacons.
    pub discovery_port: u16,
    /// Interval between LAN discovery beacons.
    pub broadcast_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::random(),
            device_name: "CConnect Device".to_string(),
            device_type: DeviceType::Desktop,
            certificate_der: None,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
            handshake_timeout: Duration::from_secs(10),
            pairing_timeout: Duration::from_secs(30),
            discovery_port: 1716,
            broadcast_interval: Duration::from_secs(5),
        }
    }
}

impl CoreConfig {
    /// Builds the identity advertisement for this device.
    pub fn local_identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.device_id.clone(), self.device_name.clone())
            .with_device_type(self.device_type)
            .with_capabilities(
                self.incoming_capabilities.iter().cloned(),
                self.outgoing_capabilities.iter().cloned(),
            )
    }
}
