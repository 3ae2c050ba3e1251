//! Device-to-device connectivity core.
//!
//! Discovers peer devices over multiple transports, establishes
//! authenticated links to them, and routes typed packets between links and
//! per-device plugins. The layering, bottom up:
//!
//! - [`resolver`]: serialized single-flight address resolution queue.
//! - [`link`]: handshake, framing and the per-link IO loops.
//! - [`backend`]: transport-specific discovery and connection (LAN, radio,
//!   loopback).
//! - [`device`] / [`registry`]: logical peers, pairing and link ownership.
//! - [`router`]: packet-type to plugin dispatch.
//!
//! The embedding application drives discovery, answers pairing prompts and
//! supplies plugins; everything else runs on the tokio runtime the core is
//! spawned onto.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod trust;

pub use backend::{Backend, BackendKind, ConnectCandidate, DiscoverySink};
pub use config::CoreConfig;
pub use device::{Device, DeviceSnapshot, PairingDirection, PairingState};
pub use error::{CoreError, CoreResult, HandshakeFailure};
pub use link::{Link, LinkContext, LinkEvent, LinkEvents, LinkState, PayloadSource, SendStatus};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use resolver::ResolutionSerializer;
pub use router::PluginRouter;
pub use trust::TrustStore;
