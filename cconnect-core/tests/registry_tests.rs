use cconnect_core::backend::{BackendKind, ConnectCandidate, DiscoverySink};
use cconnect_core::config::CoreConfig;
use cconnect_core::device::PairingState;
use cconnect_core::registry::{DeviceRegistry, RegistryEvent};
use cconnect_core::trust::TrustStore;
use cconnect_types::{DeviceId, DeviceIdentity, DeviceType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn registry() -> Arc<DeviceRegistry> {
    DeviceRegistry::new(&CoreConfig::default(), Arc::new(TrustStore::new()))
}

fn phone(name: &str) -> DeviceIdentity {
    DeviceIdentity::new(DeviceId::random(), name).with_device_type(DeviceType::Phone)
}

async fn next_event(rx: &mut broadcast::Receiver<RegistryEvent>) -> RegistryEvent {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

// ── Discovery ───────────────────────────────────────────────────

#[tokio::test]
async fn discovery_materializes_a_device_once() {
    let registry = registry();
    let identity = phone("Pixel");
    let address: SocketAddr = "192.168.1.20:1716".parse().unwrap();

    registry.on_device_discovered(ConnectCandidate::at(
        identity.clone(),
        BackendKind::Lan,
        address,
    ));
    registry.on_device_discovered(ConnectCandidate::at(
        identity.clone(),
        BackendKind::Lan,
        address,
    ));

    assert_eq!(registry.devices().len(), 1);
    let device = registry.get_device(&identity.device_id).unwrap();
    assert_eq!(device.identity().device_name, "Pixel");
    assert_eq!(
        device.candidate_for(BackendKind::Lan).unwrap().address,
        Some(address)
    );
}

#[tokio::test]
async fn lookup_never_creates() {
    let registry = registry();
    assert!(registry.get_device(&DeviceId::random()).is_none());
    assert!(registry.devices().is_empty());
}

#[tokio::test]
async fn rediscovery_updates_identity_in_place() {
    let registry = registry();
    let mut identity = phone("Old Name");
    registry.on_device_discovered(ConnectCandidate::local(identity.clone(), BackendKind::Lan));

    identity.device_name = "New Name".to_string();
    registry.on_device_discovered(ConnectCandidate::local(identity.clone(), BackendKind::Lan));

    assert_eq!(registry.devices().len(), 1);
    let device = registry.get_device(&identity.device_id).unwrap();
    assert_eq!(device.identity().device_name, "New Name");
}

// ── Events ──────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_and_loss_are_broadcast() {
    let registry = registry();
    let mut events = registry.subscribe();
    let identity = phone("Pixel");

    registry.on_device_discovered(ConnectCandidate::local(identity.clone(), BackendKind::Lan));
    match next_event(&mut events).await {
        RegistryEvent::DeviceDiscovered {
            device_id,
            backend_kind,
        } => {
            assert_eq!(device_id, identity.device_id);
            assert_eq!(backend_kind, BackendKind::Lan);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    registry.on_device_lost(&identity.device_id, BackendKind::Lan);
    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::DeviceLost { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::DeviceOffline { .. }
    ));
}

#[tokio::test]
async fn no_offline_event_while_another_backend_remains() {
    let registry = registry();
    let identity = phone("Pixel");
    registry.on_device_discovered(ConnectCandidate::local(identity.clone(), BackendKind::Lan));
    registry.on_device_discovered(ConnectCandidate::local(
        identity.clone(),
        BackendKind::Loopback,
    ));

    let mut events = registry.subscribe();
    registry.on_device_lost(&identity.device_id, BackendKind::Lan);

    assert!(matches!(
        next_event(&mut events).await,
        RegistryEvent::DeviceLost { .. }
    ));
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert!(registry
        .get_device(&identity.device_id)
        .unwrap()
        .is_reachable());
}

// ── Offline retention ───────────────────────────────────────────

#[tokio::test]
async fn offline_devices_are_retained_with_identity() {
    let registry = registry();
    let identity = phone("Pixel");
    registry.on_device_discovered(ConnectCandidate::local(identity.clone(), BackendKind::Lan));
    registry.on_device_lost(&identity.device_id, BackendKind::Lan);

    let device = registry.get_device(&identity.device_id).unwrap();
    assert!(!device.is_reachable());
    assert_eq!(device.identity().device_name, "Pixel");
    assert_eq!(device.pairing_state(), PairingState::Unpaired);
    assert_eq!(registry.devices().len(), 1);
}

#[tokio::test]
async fn loss_of_unknown_device_is_ignored() {
    let registry = registry();
    let mut events = registry.subscribe();
    registry.on_device_lost(&DeviceId::random(), BackendKind::Lan);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

// ── Snapshots ───────────────────────────────────────────────────

#[tokio::test]
async fn snapshots_reflect_all_devices() {
    let registry = registry();
    registry.on_device_discovered(ConnectCandidate::local(phone("One"), BackendKind::Lan));
    registry.on_device_discovered(ConnectCandidate::local(phone("Two"), BackendKind::Loopback));

    let snapshots = registry.snapshots();
    assert_eq!(snapshots.len(), 2);
    for snapshot in snapshots {
        assert_eq!(snapshot.pairing_state, PairingState::Unpaired);
        assert!(snapshot.connectivity.is_empty());
        assert!(snapshot.enabled_plugins.is_empty());
    }
}
