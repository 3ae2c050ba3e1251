//! Error types for the link and dispatch layers.
//!
//! The taxonomy mirrors how failures propagate: discovery errors recover
//! locally, handshake and transport errors surface as device state, contract
//! violations fail loudly, and nothing here aborts the process.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the link and dispatch core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transient discovery failure; the backend retries per its own policy.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Link handshake failed; the device surfaces this to observers.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeFailure),

    /// Transport failure on an established link; the link is closed and the
    /// device falls back to re-discovery.
    #[error("transport error: {0}")]
    Transport(String),

    /// A plugin sent a packet type it never declared as outgoing. This is a
    /// programming error in the plugin, never silently dropped.
    #[error("plugin {plugin_key:?} sent undeclared packet type {packet_type:?}")]
    DispatchContractViolation {
        plugin_key: String,
        packet_type: String,
    },

    /// Outbound send attempted with no established link. Not queued; retry
    /// policy belongs to the calling plugin.
    #[error("no active link")]
    NoActiveLink,

    /// Outbound dispatch named a plugin that is not enabled.
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Wire serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a link handshake can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    /// The peer certificate did not match the recorded fingerprint.
    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    /// The handshake did not complete within the configured timeout.
    #[error("handshake timed out")]
    Timeout,

    /// The peer speaks an incompatible protocol version.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    /// The peer aborted the handshake.
    #[error("peer aborted handshake: {0}")]
    PeerAborted(String),

    /// Malformed or unexpected handshake frame.
    #[error("handshake protocol error: {0}")]
    Protocol(String),
}
