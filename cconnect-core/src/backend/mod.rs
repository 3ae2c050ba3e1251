//! Transport backends: per-transport discovery plus link construction.
//!
//! A backend discovers candidate peers, reports them to its discovery sink
//! (the device registry in production, a mock in tests), and upgrades a
//! candidate into an authenticated link on request.

mod lan;
mod loopback;
mod radio;

pub use lan::{LanBackend, LanConfig};
pub use loopback::LoopbackBackend;
pub use radio::{RadioBackend, RadioPort, RadioSocket};

use crate::error::CoreResult;
use crate::link::{Link, LinkEvents};
use async_trait::async_trait;
use cconnect_types::{DeviceId, DeviceIdentity};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// The transport kinds a link can run over.
///
/// Declaration order is the outbound priority: when several backends hold an
/// established link to the same device, the earliest kind carries outbound
/// traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local network: UDP beacon discovery, TCP links.
    Lan,
    /// Short-range radio with a platform-supplied socket.
    Radio,
    /// In-process echo transport for self-test scenarios.
    Loopback,
}

impl BackendKind {
    /// All kinds in outbound priority order.
    pub const PRIORITY: [BackendKind; 3] =
        [BackendKind::Lan, BackendKind::Radio, BackendKind::Loopback];
}

/// A discovered peer a backend can connect to.
#[derive(Debug, Clone)]
pub struct ConnectCandidate {
    /// Identity from the discovery advertisement.
    pub identity: DeviceIdentity,
    /// The backend that produced this candidate.
    pub backend_kind: BackendKind,
    /// Resolved link address, for network backends.
    pub address: Option<SocketAddr>,
}

impl ConnectCandidate {
    /// Candidate without a network address (loopback, radio).
    pub fn local(identity: DeviceIdentity, backend_kind: BackendKind) -> Self {
        Self {
            identity,
            backend_kind,
            address: None,
        }
    }

    /// Candidate at a resolved network address.
    pub fn at(identity: DeviceIdentity, backend_kind: BackendKind, address: SocketAddr) -> Self {
        Self {
            identity,
            backend_kind,
            address: Some(address),
        }
    }
}

/// Where backends report discovery results. Implemented by the device
/// registry; mockable in tests.
///
/// After `stop_discovery` returns, a backend guarantees it makes no further
/// calls into its sink.
pub trait DiscoverySink: Send + Sync {
    /// A peer was discovered (or re-advertised) on a backend.
    fn on_device_discovered(&self, candidate: ConnectCandidate);

    /// A backend no longer reports the peer reachable.
    fn on_device_lost(&self, device_id: &DeviceId, kind: BackendKind);
}

/// A transport-specific discovery and connection strategy.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which transport this backend drives.
    fn kind(&self) -> BackendKind;

    /// Starts discovery. Candidates flow into the sink until
    /// `stop_discovery`.
    async fn start_discovery(&self) -> CoreResult<()>;

    /// Stops discovery. No sink calls happen after this returns; queued
    /// resolutions are abandoned rather than surfacing late.
    async fn stop_discovery(&self);

    /// Upgrades a candidate into an authenticated link. The returned event
    /// receiver delivers inbound packets and the final close notification.
    async fn connect(&self, candidate: &ConnectCandidate) -> CoreResult<(Arc<Link>, LinkEvents)>;
}
