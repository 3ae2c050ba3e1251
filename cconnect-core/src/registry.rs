//! Device registry: the single owner of [`Device`] instances.
//!
//! Backends report discovery results into the registry through the
//! [`DiscoverySink`] trait; consumers look devices up by id and observe
//! changes through a broadcast event stream. Lookup never creates: only
//! discovery and adopted incoming links materialize a device. A device that
//! loses its last backend goes offline but is retained, so pairing state
//! and plugin configuration survive reconnection.

use crate::backend::{BackendKind, ConnectCandidate, DiscoverySink};
use crate::config::CoreConfig;
use crate::device::{Device, DeviceSnapshot, PairingState};
use crate::link::{Link, LinkEvents, LinkState};
use crate::trust::TrustStore;
use cconnect_types::{DeviceId, DeviceIdentity};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Registry-level change notifications, fanned out to all subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A backend reported a device (new or re-discovered).
    DeviceDiscovered {
        device_id: DeviceId,
        backend_kind: BackendKind,
    },
    /// A backend lost sight of a device.
    DeviceLost {
        device_id: DeviceId,
        backend_kind: BackendKind,
    },
    /// No backend reports the device any more. The device is retained.
    DeviceOffline { device_id: DeviceId },
    /// The device's pairing state changed.
    PairingChanged {
        device_id: DeviceId,
        state: PairingState,
    },
    /// A link on the device changed state.
    LinkStateChanged {
        device_id: DeviceId,
        backend_kind: BackendKind,
        state: LinkState,
    },
    /// The device's set of enabled plugins changed.
    PluginsChanged { device_id: DeviceId },
}

/// Owner of all known devices, keyed by device id.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
    trust: Arc<TrustStore>,
    local_fingerprint: Option<String>,
    events: broadcast::Sender<RegistryEvent>,
    pairing_timeout: Duration,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new(config: &CoreConfig, trust: Arc<TrustStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            trust,
            local_fingerprint: config
                .certificate_der
                .as_deref()
                .map(crate::trust::fingerprint),
            events,
            pairing_timeout: config.pairing_timeout,
        })
    }

    /// Subscribes to registry change events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Pure lookup by id. Never creates a device.
    pub fn get_device(&self, device_id: &DeviceId) -> Option<Arc<Device>> {
        self.devices.read().unwrap().get(device_id).cloned()
    }

    /// All known devices, discovered or retained-offline.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    /// Snapshots of all known devices.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices().iter().map(|d| d.snapshot()).collect()
    }

    /// Returns the device for this identity, creating it on first sight.
    fn get_or_create(&self, identity: DeviceIdentity) -> Arc<Device> {
        let mut devices = self.devices.write().unwrap();
        match devices.get(&identity.device_id) {
            Some(device) => {
                device.update_identity(identity);
                Arc::clone(device)
            }
            None => {
                info!(device = %identity.device_id, name = %identity.device_name, "new device");
                let device = Device::new(
                    identity.clone(),
                    Arc::clone(&self.trust),
                    self.local_fingerprint.clone(),
                    self.events.clone(),
                    self.pairing_timeout,
                );
                devices.insert(identity.device_id, Arc::clone(&device));
                device
            }
        }
    }

    /// Adopts a link a peer established towards us (e.g. from the LAN
    /// accept loop): materializes the device and attaches the link.
    pub fn adopt_link(&self, link: Arc<Link>, events: LinkEvents) -> Arc<Device> {
        let identity = link.remote_identity().clone();
        let kind = link.backend_kind();
        let device = self.get_or_create(identity);
        device.record_candidate(ConnectCandidate::local(device.identity(), kind));
        device.attach_link(link, events);
        device
    }

    /// Closes every device's links. Devices and their pairing state are
    /// retained.
    pub fn close_all(&self) {
        for device in self.devices() {
            device.close();
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.events.send(event);
    }
}

impl DiscoverySink for DeviceRegistry {
    fn on_device_discovered(&self, candidate: ConnectCandidate) {
        let backend_kind = candidate.backend_kind;
        let device = self.get_or_create(candidate.identity.clone());
        device.record_candidate(candidate);
        debug!(device = %device.device_id(), ?backend_kind, "device discovered");
        self.emit(RegistryEvent::DeviceDiscovered {
            device_id: device.device_id(),
            backend_kind,
        });
    }

    fn on_device_lost(&self, device_id: &DeviceId, backend_kind: BackendKind) {
        let Some(device) = self.get_device(device_id) else {
            return;
        };
        let still_reachable = device.backend_lost(backend_kind);
        self.emit(RegistryEvent::DeviceLost {
            device_id: device_id.clone(),
            backend_kind,
        });
        if !still_reachable {
            info!(device = %device_id, "device offline");
            self.emit(RegistryEvent::DeviceOffline {
                device_id: device_id.clone(),
            });
        }
    }
}
