//! The logical peer device.
//!
//! A device aggregates at most one active link per backend (ordered by
//! outbound priority), the packet router, and the pairing state machine:
//!
//! ```text
//! Unpaired -> Requested(incoming|outgoing) -> Paired
//! ```
//!
//! `Unpaired` is reachable again from any state on explicit unpair or
//! certificate mismatch. Plugin-bound traffic flows only while `Paired`;
//! pairing packets are exempt and handled in any state. Links that never
//! finished their handshake are never attached, so the router only ever
//! sees authenticated traffic.

use crate::backend::{Backend, BackendKind, ConnectCandidate};
use crate::error::{CoreError, CoreResult, HandshakeFailure};
use crate::link::{Link, LinkEvent, LinkEvents, LinkState, PayloadSource, SendStatus};
use crate::registry::RegistryEvent;
use crate::router::PluginRouter;
use crate::trust::TrustStore;
use cconnect_plugin_sdk::Plugin;
use cconnect_types::{DeviceId, DeviceIdentity, Packet, PacketBody, PACKET_TYPE_PAIR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Who initiated an open pairing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingDirection {
    Incoming,
    Outgoing,
}

/// Pairing state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    /// No trust relationship.
    Unpaired,
    /// A pairing request is open in the given direction.
    Requested(PairingDirection),
    /// Mutual trust established; plugin traffic flows.
    Paired,
}

/// Read-only view of a device for UI and registry consumers.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub pairing_state: PairingState,
    /// Link state per backend that currently holds a link.
    pub connectivity: BTreeMap<BackendKind, LinkState>,
    pub enabled_plugins: Vec<String>,
}

/// One attached link. The pump task for it exits on its own when the link
/// delivers its final `Closed` event.
struct LinkSlot {
    link: Arc<Link>,
}

/// One logical peer: identity, pairing state, links and enabled plugins.
pub struct Device {
    identity: RwLock<DeviceIdentity>,
    pairing: RwLock<PairingState>,
    /// Bumped on every pairing transition so stale timeout watchers expire.
    pairing_epoch: AtomicU64,
    candidates: RwLock<BTreeMap<BackendKind, ConnectCandidate>>,
    links: RwLock<BTreeMap<BackendKind, LinkSlot>>,
    router: PluginRouter,
    trust: Arc<TrustStore>,
    local_fingerprint: Option<String>,
    events: broadcast::Sender<RegistryEvent>,
    pairing_timeout: Duration,
    closed: AtomicBool,
}

impl Device {
    pub(crate) fn new(
        identity: DeviceIdentity,
        trust: Arc<TrustStore>,
        local_fingerprint: Option<String>,
        events: broadcast::Sender<RegistryEvent>,
        pairing_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: RwLock::new(identity),
            pairing: RwLock::new(PairingState::Unpaired),
            pairing_epoch: AtomicU64::new(0),
            candidates: RwLock::new(BTreeMap::new()),
            links: RwLock::new(BTreeMap::new()),
            router: PluginRouter::new(),
            trust,
            local_fingerprint,
            events,
            pairing_timeout,
            closed: AtomicBool::new(false),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    /// The peer's identity.
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().unwrap().clone()
    }

    /// The peer's stable device id.
    pub fn device_id(&self) -> DeviceId {
        self.identity.read().unwrap().device_id.clone()
    }

    /// Current pairing state.
    pub fn pairing_state(&self) -> PairingState {
        *self.pairing.read().unwrap()
    }

    /// The device's packet router.
    pub fn router(&self) -> &PluginRouter {
        &self.router
    }

    /// Per-backend link states.
    pub fn connectivity(&self) -> BTreeMap<BackendKind, LinkState> {
        self.links
            .read()
            .unwrap()
            .iter()
            .map(|(kind, slot)| (*kind, slot.link.state()))
            .collect()
    }

    /// Whether any backend still reports this device reachable.
    pub fn is_reachable(&self) -> bool {
        !self.candidates.read().unwrap().is_empty() || !self.links.read().unwrap().is_empty()
    }

    /// Read-only snapshot for observers.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            identity: self.identity(),
            pairing_state: self.pairing_state(),
            connectivity: self.connectivity(),
            enabled_plugins: self.router.enabled_plugins(),
        }
    }

    // ── Discovery bookkeeping ────────────────────────────────────

    /// Updates the identity on re-discovery.
    pub(crate) fn update_identity(&self, identity: DeviceIdentity) {
        *self.identity.write().unwrap() = identity;
    }

    /// Records the latest candidate for a backend.
    pub(crate) fn record_candidate(&self, candidate: ConnectCandidate) {
        self.candidates
            .write()
            .unwrap()
            .insert(candidate.backend_kind, candidate);
    }

    /// The current candidate for a backend, if discovery reported one.
    pub fn candidate_for(&self, kind: BackendKind) -> Option<ConnectCandidate> {
        self.candidates.read().unwrap().get(&kind).cloned()
    }

    /// Drops a backend's candidate and closes its link. Returns whether any
    /// backend still reports the device.
    pub(crate) fn backend_lost(&self, kind: BackendKind) -> bool {
        self.candidates.write().unwrap().remove(&kind);
        let slot = self.links.write().unwrap().remove(&kind);
        if let Some(slot) = slot {
            slot.link.close();
        }
        self.is_reachable()
    }

    // ── Links ────────────────────────────────────────────────────

    /// Requests a link from a backend using its recorded candidate, then
    /// attaches it. Certificate mismatch drops the trust relationship.
    pub async fn connect_via(self: &Arc<Self>, backend: &dyn Backend) -> CoreResult<()> {
        let candidate = self
            .candidate_for(backend.kind())
            .ok_or_else(|| CoreError::Discovery("no candidate for backend".into()))?;
        match backend.connect(&candidate).await {
            Ok((link, events)) => {
                self.attach_link(link, events);
                Ok(())
            }
            Err(e) => {
                if let CoreError::Handshake(HandshakeFailure::CertificateRejected(_)) = &e {
                    self.on_certificate_mismatch();
                }
                Err(e)
            }
        }
    }

    /// Attaches an established link, replacing any previous link on the
    /// same backend, and starts pumping its inbound events.
    pub fn attach_link(self: &Arc<Self>, link: Arc<Link>, events: LinkEvents) {
        debug_assert!(link.is_established());
        if self.is_closed() {
            // A handshake that was still in flight when the device closed.
            link.close();
            return;
        }
        let kind = link.backend_kind();
        // Slot goes in before the pump starts, so the pump's removal on
        // close always finds its own link in place.
        let previous = self
            .links
            .write()
            .unwrap()
            .insert(kind, LinkSlot {
                link: Arc::clone(&link),
            });
        if let Some(previous) = previous {
            previous.link.close();
        }
        tokio::spawn(Self::pump_events(Arc::clone(self), link, events));
        self.emit(RegistryEvent::LinkStateChanged {
            device_id: self.device_id(),
            backend_kind: kind,
            state: LinkState::Established,
        });
    }

    /// The link that carries outbound traffic: the highest-priority
    /// established one.
    pub fn active_link(&self) -> Option<Arc<Link>> {
        self.links
            .read()
            .unwrap()
            .values()
            .map(|slot| &slot.link)
            .find(|link| link.is_established())
            .cloned()
    }

    async fn pump_events(device: Arc<Device>, link: Arc<Link>, mut events: LinkEvents) {
        let mut close_reason = None;
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Packet { packet, payload } => {
                    device.handle_inbound(packet, payload);
                }
                LinkEvent::Closed { reason } => {
                    close_reason = reason;
                    break;
                }
            }
        }

        let kind = link.backend_kind();
        if let Some(reason) = close_reason {
            warn!(device = %device.device_id(), ?kind, "link closed: {reason}");
        }

        // Only clear the slot if it still holds this link; a replacement
        // may already have been attached, and then the close is not a
        // connectivity change for this backend.
        let removed = {
            let mut links = device.links.write().unwrap();
            match links.get(&kind) {
                Some(slot) if Arc::ptr_eq(&slot.link, &link) => {
                    links.remove(&kind);
                    true
                }
                _ => false,
            }
        };
        if removed {
            device.emit(RegistryEvent::LinkStateChanged {
                device_id: device.device_id(),
                backend_kind: kind,
                state: LinkState::Closed,
            });
        }
    }

    // ── Packet flow ──────────────────────────────────────────────

    fn handle_inbound(self: &Arc<Self>, mut packet: Packet, payload: Option<Vec<u8>>) {
        if let Some(bytes) = payload {
            packet.attach_payload_bytes(Arc::new(bytes));
        }

        if packet.is_pair() {
            self.handle_pair_packet(&packet);
            return;
        }

        if self.pairing_state() != PairingState::Paired {
            debug!(
                device = %self.device_id(),
                packet_type = %packet.packet_type(),
                "dropping plugin packet from unpaired device"
            );
            return;
        }

        self.router.dispatch_inbound(&packet);
    }

    /// Validates an outbound packet against the plugin's declared outgoing
    /// types and forwards it to the priority-selected link. With no
    /// established link the send fails immediately; nothing is queued.
    pub fn dispatch_outbound(
        &self,
        plugin_key: &str,
        packet: Packet,
        payload: Option<PayloadSource>,
        status: Option<Arc<dyn SendStatus>>,
    ) -> CoreResult<()> {
        self.router.validate_outbound(plugin_key, &packet)?;
        let link = self.active_link().ok_or(CoreError::NoActiveLink)?;
        link.send(packet, payload, status)
    }

    // ── Plugins ──────────────────────────────────────────────────

    /// Enables a plugin on this device. Returns whether it ended up
    /// enabled.
    pub fn enable_plugin(&self, plugin: Arc<dyn Plugin>) -> bool {
        let enabled = self.router.enable_plugin(plugin);
        if enabled {
            self.emit(RegistryEvent::PluginsChanged {
                device_id: self.device_id(),
            });
        }
        enabled
    }

    /// Disables a plugin. Returns whether it was enabled.
    pub fn disable_plugin(&self, plugin_key: &str) -> bool {
        let disabled = self.router.disable_plugin(plugin_key);
        if disabled {
            self.emit(RegistryEvent::PluginsChanged {
                device_id: self.device_id(),
            });
        }
        disabled
    }

    // ── Pairing ──────────────────────────────────────────────────

    /// Sends a pairing request to the peer.
    pub fn request_pair(self: &Arc<Self>) -> CoreResult<()> {
        if self.pairing_state() == PairingState::Paired {
            return Ok(());
        }
        // State first: a fast peer response must find us in Requested.
        self.set_pairing(PairingState::Requested(PairingDirection::Outgoing));
        if let Err(e) = self.send_pair_packet(true) {
            self.set_pairing(PairingState::Unpaired);
            return Err(e);
        }
        self.spawn_pairing_watchdog();
        Ok(())
    }

    /// Accepts an incoming pairing request, recording the peer certificate
    /// fingerprint.
    pub fn accept_pair(&self) -> CoreResult<()> {
        if self.pairing_state() != PairingState::Requested(PairingDirection::Incoming) {
            return Err(CoreError::Transport("no incoming pairing request".into()));
        }
        self.record_link_fingerprint();
        self.send_pair_packet(true)?;
        self.set_pairing(PairingState::Paired);
        info!(device = %self.device_id(), "pairing accepted");
        Ok(())
    }

    /// Rejects an incoming pairing request.
    pub fn reject_pair(&self) -> CoreResult<()> {
        if self.pairing_state() != PairingState::Requested(PairingDirection::Incoming) {
            return Err(CoreError::Transport("no incoming pairing request".into()));
        }
        let _ = self.send_pair_packet(false);
        self.set_pairing(PairingState::Unpaired);
        Ok(())
    }

    /// Unpairs the device and drops its recorded certificate fingerprint.
    pub fn unpair(&self) {
        let _ = self.send_pair_packet(false);
        self.trust.forget(&self.device_id());
        self.set_pairing(PairingState::Unpaired);
        info!(device = %self.device_id(), "unpaired");
    }

    /// Handles a peer pairing packet: `{"pair": true}` is a request or an
    /// acceptance depending on our state, `{"pair": false}` a rejection or
    /// unpair.
    fn handle_pair_packet(self: &Arc<Self>, packet: &Packet) {
        let Some(pair) = packet.body_bool("pair") else {
            warn!(device = %self.device_id(), "pair packet without pair field");
            return;
        };
        let state = self.pairing_state();
        if pair {
            match state {
                PairingState::Unpaired => {
                    info!(device = %self.device_id(), "incoming pairing request");
                    self.set_pairing(PairingState::Requested(PairingDirection::Incoming));
                    self.spawn_pairing_watchdog();
                }
                PairingState::Requested(PairingDirection::Outgoing) => {
                    // Peer accepted our request.
                    self.record_link_fingerprint();
                    self.set_pairing(PairingState::Paired);
                    info!(device = %self.device_id(), "pairing confirmed by peer");
                }
                PairingState::Requested(PairingDirection::Incoming) => {
                    debug!(device = %self.device_id(), "duplicate pairing request ignored");
                }
                PairingState::Paired => {
                    // Never answered, or two paired devices would confirm
                    // each other forever.
                    debug!(device = %self.device_id(), "pair request while already paired");
                }
            }
        } else {
            match state {
                PairingState::Unpaired => {}
                PairingState::Paired => {
                    info!(device = %self.device_id(), "peer unpaired");
                    self.trust.forget(&self.device_id());
                    self.set_pairing(PairingState::Unpaired);
                }
                PairingState::Requested(_) => {
                    info!(device = %self.device_id(), "pairing request rejected by peer");
                    self.set_pairing(PairingState::Unpaired);
                }
            }
        }
    }

    /// Short code both sides can display during pairing: a digest over the
    /// two certificate fingerprints, identical on either device regardless of
    /// who initiated. `None` until a link with certificates is up.
    pub fn verification_code(&self) -> Option<String> {
        let local = self.local_fingerprint.as_deref()?;
        let link = self.active_link()?;
        let remote = link.remote_certificate_fingerprint()?;
        let (first, second) = if local <= remote {
            (local, remote)
        } else {
            (remote, local)
        };
        let mut hasher = Sha256::new();
        hasher.update(first.as_bytes());
        hasher.update(second.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Some(digest[..8].to_ascii_uppercase())
    }

    fn record_link_fingerprint(&self) {
        if let Some(link) = self.active_link() {
            if let Some(fingerprint) = link.remote_certificate_fingerprint() {
                self.trust
                    .record(self.device_id(), fingerprint.to_string());
            }
        }
    }

    fn send_pair_packet(&self, pair: bool) -> CoreResult<()> {
        let mut body = PacketBody::new();
        body.insert("pair".into(), Value::Bool(pair));
        let packet = Packet::new(PACKET_TYPE_PAIR, body);
        let link = self.active_link().ok_or(CoreError::NoActiveLink)?;
        link.send(packet, None, None)
    }

    fn set_pairing(&self, state: PairingState) {
        self.pairing_epoch.fetch_add(1, Ordering::SeqCst);
        *self.pairing.write().unwrap() = state;
        self.emit(RegistryEvent::PairingChanged {
            device_id: self.device_id(),
            state,
        });
    }

    /// Reverts an unanswered pairing request after the configured timeout.
    fn spawn_pairing_watchdog(self: &Arc<Self>) {
        let device = Arc::clone(self);
        let epoch = self.pairing_epoch.load(Ordering::SeqCst);
        let timeout = self.pairing_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if device.pairing_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            if matches!(device.pairing_state(), PairingState::Requested(_)) {
                info!(device = %device.device_id(), "pairing request timed out");
                device.set_pairing(PairingState::Unpaired);
            }
        });
    }

    /// Certificate mismatch forces the device back to `Unpaired` and drops
    /// the stale fingerprint.
    pub(crate) fn on_certificate_mismatch(&self) {
        warn!(device = %self.device_id(), "certificate mismatch, unpairing");
        self.trust.forget(&self.device_id());
        if self.pairing_state() != PairingState::Unpaired {
            self.set_pairing(PairingState::Unpaired);
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Closes all links and cancels in-flight work. Idempotent; identity
    /// and plugin configuration persist for reconnection.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<LinkSlot> = {
            let mut links = self.links.write().unwrap();
            std::mem::take(&mut *links).into_values().collect()
        };
        for slot in &slots {
            slot.link.close();
        }
        debug!(device = %self.device_id(), "device closed");
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}
