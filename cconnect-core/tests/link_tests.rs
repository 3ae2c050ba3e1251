use cconnect_core::backend::BackendKind;
use cconnect_core::config::CoreConfig;
use cconnect_core::error::{CoreError, HandshakeFailure};
use cconnect_core::link::{
    Link, LinkContext, LinkEvent, LinkEvents, LinkState, PayloadSource, SendStatus,
    MAX_PAYLOAD_SIZE,
};
use cconnect_core::trust::TrustStore;
use cconnect_types::{DeviceId, Packet, PacketBody, PayloadInfo};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn test_ctx(name: &str, cert: &[u8]) -> LinkContext {
    let config = CoreConfig {
        device_id: DeviceId::random(),
        device_name: name.to_string(),
        certificate_der: Some(cert.to_vec()),
        handshake_timeout: Duration::from_secs(10),
        ..CoreConfig::default()
    };
    LinkContext::new(&config, Arc::new(TrustStore::new()))
}

async fn link_pair(
    ctx_a: &LinkContext,
    ctx_b: &LinkContext,
) -> ((Arc<Link>, LinkEvents), (Arc<Link>, LinkEvents)) {
    let (near, far) = tokio::io::duplex(1024 * 1024);
    let (a, b) = tokio::join!(
        Link::handshake(Box::new(near), BackendKind::Lan, ctx_a),
        Link::handshake(Box::new(far), BackendKind::Lan, ctx_b),
    );
    (a.unwrap(), b.unwrap())
}

async fn recv_packet(events: &mut LinkEvents) -> (Packet, Option<Vec<u8>>) {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(LinkEvent::Packet { packet, payload }) => return (packet, payload),
            Some(LinkEvent::Closed { reason }) => panic!("link closed: {reason:?}"),
            None => panic!("event channel closed"),
        }
    }
}

// ── State machine ───────────────────────────────────────────────

#[test]
fn state_machine_is_strictly_sequential_upward() {
    use LinkState::*;
    assert!(LinkState::can_transition(Discovered, Connecting));
    assert!(LinkState::can_transition(Connecting, Authenticating));
    assert!(LinkState::can_transition(Authenticating, Established));

    // No skipping stages.
    assert!(!LinkState::can_transition(Discovered, Authenticating));
    assert!(!LinkState::can_transition(Discovered, Established));
    assert!(!LinkState::can_transition(Connecting, Established));

    // No going back.
    assert!(!LinkState::can_transition(Established, Authenticating));
    assert!(!LinkState::can_transition(Authenticating, Connecting));
}

#[test]
fn closed_is_terminal_and_reachable_from_every_live_state() {
    use LinkState::*;
    for from in [Discovered, Connecting, Authenticating, Established] {
        assert!(LinkState::can_transition(from, Closed));
    }
    for to in [Discovered, Connecting, Authenticating, Established] {
        assert!(!LinkState::can_transition(Closed, to));
    }
}

// ── Handshake ───────────────────────────────────────────────────

#[tokio::test]
async fn handshake_establishes_both_sides() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), (link_b, _ev_b)) = link_pair(&ctx_a, &ctx_b).await;

    assert!(link_a.is_established());
    assert!(link_b.is_established());
    assert_eq!(link_a.remote_identity().device_name, "Beta");
    assert_eq!(link_b.remote_identity().device_name, "Alpha");
    assert!(link_a.remote_certificate_fingerprint().is_some());

    // First contact records the peer fingerprint.
    assert!(ctx_a.trust.is_trusted(&ctx_b.local_identity.device_id));
    assert!(ctx_b.trust.is_trusted(&ctx_a.local_identity.device_id));
}

#[tokio::test]
async fn handshake_rejects_incompatible_protocol_version() {
    let ctx = test_ctx("Local", b"cert");
    let (near, mut far) = tokio::io::duplex(64 * 1024);

    let peer = json!({
        "id": 1,
        "type": "cconnect.identity",
        "body": {
            "device_id": "feedfacefeedface",
            "device_name": "Ancient Peer",
            "protocol_version": 1,
        }
    });
    let writer = tokio::spawn(async move {
        let mut line = peer.to_string();
        line.push('\n');
        far.write_all(line.as_bytes()).await.unwrap();
        far
    });

    let err = Link::handshake(Box::new(near), BackendKind::Lan, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeFailure::VersionMismatch { theirs: 1, .. }));
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn handshake_rejects_changed_certificate() {
    let ctx = test_ctx("Local", b"cert");
    let peer_id = DeviceId::random();
    // A different certificate was recorded for this device earlier.
    ctx.trust.record(
        peer_id.clone(),
        cconnect_core::trust::fingerprint(b"the-old-cert"),
    );

    let (near, mut far) = tokio::io::duplex(64 * 1024);
    let peer = json!({
        "id": 1,
        "type": "cconnect.identity",
        "body": {
            "device_id": peer_id.to_string(),
            "device_name": "Impostor",
            "protocol_version": cconnect_types::PROTOCOL_VERSION,
            "certificate": hex::encode(b"a-brand-new-cert"),
        }
    });
    let writer = tokio::spawn(async move {
        let mut line = peer.to_string();
        line.push('\n');
        far.write_all(line.as_bytes()).await.unwrap();
        far
    });

    let err = Link::handshake(Box::new(near), BackendKind::Lan, &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeFailure::CertificateRejected(_)));
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn handshake_surfaces_peer_rejection() {
    let ctx = test_ctx("Local", b"cert");
    let (near, mut far) = tokio::io::duplex(64 * 1024);

    let identity = json!({
        "id": 1,
        "type": "cconnect.identity",
        "body": {
            "device_id": "cafecafecafecafe",
            "device_name": "Grumpy Peer",
            "protocol_version": cconnect_types::PROTOCOL_VERSION,
        }
    });
    let verdict = json!({
        "id": 2,
        "type": "cconnect.handshake",
        "body": { "accepted": false, "reason": "user declined" }
    });
    let writer = tokio::spawn(async move {
        let mut frames = identity.to_string();
        frames.push('\n');
        frames.push_str(&verdict.to_string());
        frames.push('\n');
        far.write_all(frames.as_bytes()).await.unwrap();
        far
    });

    let err = Link::handshake(Box::new(near), BackendKind::Lan, &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, HandshakeFailure::PeerAborted("user declined".into()));
    drop(writer.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let ctx = test_ctx("Local", b"cert");
    let (near, far) = tokio::io::duplex(64 * 1024);

    // Peer never writes a byte; the paused clock auto-advances past the
    // handshake deadline as soon as the runtime goes idle.
    let err = Link::handshake(Box::new(near), BackendKind::Lan, &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, HandshakeFailure::Timeout);
    drop(far);
}

// ── Established traffic ─────────────────────────────────────────

#[tokio::test]
async fn packets_arrive_in_submission_order() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), (_link_b, mut ev_b)) = link_pair(&ctx_a, &ctx_b).await;

    for i in 0..10 {
        let mut body = PacketBody::new();
        body.insert("seq".into(), json!(i));
        link_a
            .send(Packet::new("cconnect.ping", body), None, None)
            .unwrap();
    }

    for expected in 0..10 {
        let (packet, payload) = recv_packet(&mut ev_b).await;
        assert_eq!(packet.packet_type(), "cconnect.ping");
        assert_eq!(packet.body().get("seq"), Some(&json!(expected)));
        assert!(payload.is_none());
    }
}

struct ProgressRecorder {
    percents: Mutex<Vec<u8>>,
    outcome: Mutex<Option<Result<(), String>>>,
}

impl ProgressRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            percents: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        })
    }
}

impl SendStatus for ProgressRecorder {
    fn on_success(&self) {
        *self.outcome.lock().unwrap() = Some(Ok(()));
    }
    fn on_failure(&self, cause: CoreError) {
        *self.outcome.lock().unwrap() = Some(Err(cause.to_string()));
    }
    fn on_payload_progress(&self, percent: u8) {
        self.percents.lock().unwrap().push(percent);
    }
}

#[tokio::test]
async fn payload_travels_with_progress_reports() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), (_link_b, mut ev_b)) = link_pair(&ctx_a, &ctx_b).await;

    let bytes: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut packet = Packet::new("cconnect.share", PacketBody::new());
    packet.attach_payload(PayloadInfo::new(bytes.len() as u64));

    let recorder = ProgressRecorder::new();
    link_a
        .send(
            packet,
            Some(PayloadSource::Bytes(bytes.clone())),
            Some(recorder.clone()),
        )
        .unwrap();

    let (received, payload) = recv_packet(&mut ev_b).await;
    assert_eq!(received.packet_type(), "cconnect.share");
    assert_eq!(payload.as_deref(), Some(bytes.as_slice()));

    assert_eq!(*recorder.outcome.lock().unwrap(), Some(Ok(())));
    let percents = recorder.percents.lock().unwrap();
    assert_eq!(percents.first(), Some(&0));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn send_requires_payload_source_to_match_metadata() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), _b) = link_pair(&ctx_a, &ctx_b).await;

    // Metadata without bytes.
    let mut packet = Packet::new("cconnect.share", PacketBody::new());
    packet.attach_payload(PayloadInfo::new(16));
    assert!(link_a.send(packet, None, None).is_err());

    // Bytes without metadata.
    let packet = Packet::new("cconnect.share", PacketBody::new());
    assert!(link_a
        .send(packet, Some(PayloadSource::Bytes(vec![0u8; 16])), None)
        .is_err());
}

#[tokio::test]
async fn oversize_payload_declaration_closes_the_link() {
    let ctx = test_ctx("Local", b"cert");
    let (near, mut far) = tokio::io::duplex(64 * 1024);

    // Scripted peer: a complete handshake, then a packet declaring a payload
    // no honest sender could have attached. The declaration alone must kill
    // the link; buffering it would mean allocating on the peer's say-so.
    let identity = json!({
        "id": 1,
        "type": "cconnect.identity",
        "body": {
            "device_id": "beefbeefbeefbeef",
            "device_name": "Hostile Peer",
            "protocol_version": cconnect_types::PROTOCOL_VERSION,
        }
    });
    let verdict = json!({
        "id": 2,
        "type": "cconnect.handshake",
        "body": { "accepted": true }
    });
    let bomb = json!({
        "id": 3,
        "type": "cconnect.share",
        "body": {},
        "payloadSize": u64::MAX,
    });
    let writer = tokio::spawn(async move {
        let mut frames = String::new();
        for frame in [&identity, &verdict, &bomb] {
            frames.push_str(&frame.to_string());
            frames.push('\n');
        }
        far.write_all(frames.as_bytes()).await.unwrap();
        far
    });

    let (link, mut events) = Link::handshake(Box::new(near), BackendKind::Lan, &ctx)
        .await
        .unwrap();
    assert!(link.is_established());

    match timeout(WAIT, events.recv()).await.unwrap() {
        Some(LinkEvent::Closed { reason }) => assert!(reason.is_some()),
        Some(LinkEvent::Packet { .. }) => panic!("oversize declaration was delivered"),
        None => panic!("channel closed without a Closed event"),
    }
    assert_eq!(link.state(), LinkState::Closed);
    drop(writer.await.unwrap());
}

#[tokio::test]
async fn send_rejects_oversize_payload_metadata() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), _b) = link_pair(&ctx_a, &ctx_b).await;

    let mut packet = Packet::new("cconnect.share", PacketBody::new());
    packet.attach_payload(PayloadInfo::new(MAX_PAYLOAD_SIZE + 1));
    let err = link_a
        .send(packet, Some(PayloadSource::Bytes(Vec::new())), None)
        .unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
}

// ── Teardown ────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_sends() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, mut ev_a), _b) = link_pair(&ctx_a, &ctx_b).await;

    link_a.close();
    link_a.close();
    assert_eq!(link_a.state(), LinkState::Closed);

    let err = link_a
        .send(Packet::new("cconnect.ping", PacketBody::new()), None, None)
        .unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));

    // The owning side receives exactly one final Closed event.
    loop {
        match timeout(WAIT, ev_a.recv()).await.unwrap() {
            Some(LinkEvent::Closed { .. }) => break,
            Some(LinkEvent::Packet { .. }) => continue,
            None => panic!("channel closed without a Closed event"),
        }
    }
    assert!(timeout(WAIT, ev_a.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn peer_disconnect_surfaces_as_closed_event() {
    let ctx_a = test_ctx("Alpha", b"cert-alpha");
    let ctx_b = test_ctx("Beta", b"cert-beta");
    let ((link_a, _ev_a), (_link_b, mut ev_b)) = link_pair(&ctx_a, &ctx_b).await;

    link_a.close();

    loop {
        match timeout(WAIT, ev_b.recv()).await.unwrap() {
            Some(LinkEvent::Closed { .. }) => break,
            Some(LinkEvent::Packet { .. }) => continue,
            None => panic!("channel closed without a Closed event"),
        }
    }
}
