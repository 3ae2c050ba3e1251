//! Core type definitions for CConnect.
//!
//! This crate defines the fundamental, plugin-agnostic types used throughout
//! the link and dispatch layers:
//! - Device identifiers (certificate-derived or locally generated)
//! - The network packet wire unit
//! - Device identity advertisements exchanged during discovery
//!
//! All packet-body *semantics* (clipboard contents, input events, contact
//! records, etc.) belong to their respective plugins, not here. This layer
//! only matches the `type` string verbatim and never interprets bodies.

mod identity;
mod ids;
mod packet;

pub use identity::{DeviceIdentity, DeviceType, PROTOCOL_VERSION};
pub use ids::DeviceId;
pub use packet::{Packet, PacketBody, PayloadInfo, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
}
