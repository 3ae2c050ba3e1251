//! One authenticated, bidirectional channel to a peer.
//!
//! A link is created by upgrading a connected transport stream through the
//! handshake state machine:
//!
//! ```text
//! Discovered -> Connecting -> Authenticating -> Established -> Closed
//! ```
//!
//! `Closed` is terminal; reconnection creates a new link. The handshake is a
//! mutual identity exchange (identity packet carrying the certificate) plus
//! an explicit accept frame from each side, bounded by the configured
//! timeout. An established link owns a read task delivering inbound packets
//! in byte order and a write task draining outbound packets in submission
//! order.

use crate::backend::BackendKind;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, HandshakeFailure};
use crate::trust::{self, TrustStore};
use cconnect_types::{DeviceIdentity, Packet, PacketBody, PACKET_TYPE_IDENTITY};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Packet type for the handshake accept/reject frame.
pub const PACKET_TYPE_HANDSHAKE: &str = "cconnect.handshake";

/// Upper bound on an in-band payload. Payload bytes are buffered in memory
/// before delivery, so the size a peer declares must be checked before any
/// allocation; an oversize declaration closes the link.
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// A transport stream a link can be built on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport stream handed to the handshake by a backend.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Link handshake and lifetime states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Candidate reported by discovery; no transport attempt yet.
    Discovered,
    /// Transport-level connection attempt in progress.
    Connecting,
    /// Mutual identity/certificate exchange in progress.
    Authenticating,
    /// Handshake acknowledged by both sides; packets flow.
    Established,
    /// Terminal. Transport error, rejection, timeout or teardown.
    Closed,
}

impl LinkState {
    /// Whether a direct transition between two states is legal. A link
    /// never skips `Connecting` or `Authenticating` on its way up, and
    /// `Closed` is reachable from every live state.
    pub fn can_transition(from: LinkState, to: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (from, to),
            (Discovered, Connecting)
                | (Connecting, Authenticating)
                | (Authenticating, Established)
                | (Discovered, Closed)
                | (Connecting, Closed)
                | (Authenticating, Closed)
                | (Established, Closed)
        )
    }
}

/// Shared state cell enforcing legal transitions, observable via `watch`.
pub(crate) struct StateCell {
    tx: watch::Sender<LinkState>,
}

impl StateCell {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(LinkState::Discovered);
        Arc::new(Self { tx })
    }

    pub(crate) fn get(&self) -> LinkState {
        *self.tx.borrow()
    }

    /// Advances to `next` if legal. Returns whether the transition took
    /// place; an illegal request (including re-closing a closed link) is a
    /// logged no-op, never a panic.
    pub(crate) fn advance(&self, next: LinkState) -> bool {
        let current = self.get();
        if current == next {
            return false;
        }
        if !LinkState::can_transition(current, next) {
            warn!(?current, ?next, "illegal link state transition ignored");
            return false;
        }
        debug!(?current, ?next, "link state transition");
        self.tx.send_replace(next);
        true
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }
}

/// Source of payload bytes for an outbound packet.
pub enum PayloadSource {
    /// Payload fully materialized in memory.
    Bytes(Vec<u8>),
    /// Payload streamed from a reader; must yield exactly the attached
    /// payload size.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader(_) => f.debug_tuple("Reader").finish(),
        }
    }
}

/// Delivery status callbacks for one outbound packet. `send` returns after
/// handing the packet to the write path; the outcome arrives here.
pub trait SendStatus: Send + Sync {
    fn on_success(&self) {}
    fn on_failure(&self, _cause: CoreError) {}
    /// Reported at least at 0 and 100 for packets carrying a payload.
    fn on_payload_progress(&self, _percent: u8) {}
}

/// Inbound event delivered by a link's read task.
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet arrived, with its payload bytes when one was attached.
    Packet {
        packet: Packet,
        payload: Option<Vec<u8>>,
    },
    /// The link closed. Emitted at most once, last.
    Closed { reason: Option<String> },
}

/// Receiver half for a link's inbound events, owned by the device.
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// Handshake parameters shared by every backend.
#[derive(Clone)]
pub struct LinkContext {
    /// Identity advertised to the peer.
    pub local_identity: DeviceIdentity,
    /// DER-encoded local certificate, when the host supplies one.
    pub local_cert_der: Option<Vec<u8>>,
    /// Fingerprint bookkeeping for handshake validation.
    pub trust: Arc<TrustStore>,
    /// Bound on the Connecting/Authenticating phases.
    pub handshake_timeout: Duration,
}

impl LinkContext {
    /// Builds a link context from the core configuration.
    pub fn new(config: &CoreConfig, trust: Arc<TrustStore>) -> Self {
        Self {
            local_identity: config.local_identity(),
            local_cert_der: config.certificate_der.clone(),
            trust,
            handshake_timeout: config.handshake_timeout,
        }
    }
}

struct OutboundEntry {
    packet: Packet,
    payload: Option<PayloadSource>,
    status: Option<Arc<dyn SendStatus>>,
}

/// An established, authenticated channel to one peer device. Owned by
/// exactly one device and never outlives it.
pub struct Link {
    backend_kind: BackendKind,
    remote_identity: DeviceIdentity,
    remote_fingerprint: Option<String>,
    state: Arc<StateCell>,
    outbound_tx: mpsc::Sender<OutboundEntry>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("backend_kind", &self.backend_kind)
            .field("remote", &self.remote_identity.device_id)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Link {
    /// Upgrades a connected transport stream into an established link.
    ///
    /// Runs the full state machine; on any failure (rejection, peer abort,
    /// timeout) the link transitions to `Closed` and the failure is
    /// returned, never swallowed. A handshake that outlives the timeout can
    /// never report `Established` afterwards.
    pub async fn handshake(
        stream: BoxedStream,
        backend_kind: BackendKind,
        ctx: &LinkContext,
    ) -> Result<(Arc<Link>, LinkEvents), HandshakeFailure> {
        let state = StateCell::new();
        state.advance(LinkState::Connecting);

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        state.advance(LinkState::Authenticating);
        let exchanged = tokio::time::timeout(
            ctx.handshake_timeout,
            Self::exchange(&mut reader, &mut writer, ctx),
        )
        .await;

        let (remote_identity, remote_fingerprint) = match exchanged {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => {
                warn!(kind = ?backend_kind, "handshake failed: {failure}");
                state.advance(LinkState::Closed);
                return Err(failure);
            }
            Err(_) => {
                warn!(kind = ?backend_kind, "handshake timed out");
                state.advance(LinkState::Closed);
                return Err(HandshakeFailure::Timeout);
            }
        };

        state.advance(LinkState::Established);
        info!(
            kind = ?backend_kind,
            device = %remote_identity.device_id,
            "link established"
        );

        let (events_tx, events_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        tokio::spawn(Self::read_loop(reader, events_tx, Arc::clone(&state)));
        tokio::spawn(Self::write_loop(writer, outbound_rx, Arc::clone(&state)));

        let link = Arc::new(Link {
            backend_kind,
            remote_identity,
            remote_fingerprint,
            state,
            outbound_tx,
        });
        Ok((link, events_rx))
    }

    /// The backend this link belongs to.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// The peer's identity as exchanged during the handshake.
    pub fn remote_identity(&self) -> &DeviceIdentity {
        &self.remote_identity
    }

    /// Hex fingerprint of the certificate the peer presented, if any.
    pub fn remote_certificate_fingerprint(&self) -> Option<&str> {
        self.remote_fingerprint.as_deref()
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    /// Whether the handshake completed and the link is live.
    pub fn is_established(&self) -> bool {
        self.state.get() == LinkState::Established
    }

    /// Watch channel following the link state.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Hands a packet to the write path and returns immediately; delivery
    /// outcome is reported through `status`. Outbound packets are written in
    /// submission order.
    pub fn send(
        &self,
        packet: Packet,
        payload: Option<PayloadSource>,
        status: Option<Arc<dyn SendStatus>>,
    ) -> CoreResult<()> {
        if !self.is_established() {
            return Err(CoreError::Transport("link not established".into()));
        }
        if packet.has_payload() != payload.is_some() {
            return Err(CoreError::Transport(
                "payload metadata and payload source must both be present or absent".into(),
            ));
        }
        if packet.payload_size().is_some_and(|size| size > MAX_PAYLOAD_SIZE) {
            return Err(CoreError::Transport(format!(
                "payload exceeds the {MAX_PAYLOAD_SIZE} byte limit"
            )));
        }
        self.outbound_tx
            .try_send(OutboundEntry {
                packet,
                payload,
                status,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    CoreError::Transport("outbound queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    CoreError::Transport("link closed".into())
                }
            })
    }

    /// Closes the link. Idempotent; the read and write tasks observe the
    /// state change and shut down, and the owning device receives a final
    /// `Closed` event.
    pub fn close(&self) {
        self.state.advance(LinkState::Closed);
    }

    // ── Handshake frames ─────────────────────────────────────────

    async fn exchange(
        reader: &mut BufReader<ReadHalf<BoxedStream>>,
        writer: &mut WriteHalf<BoxedStream>,
        ctx: &LinkContext,
    ) -> Result<(DeviceIdentity, Option<String>), HandshakeFailure> {
        Self::send_identity(writer, ctx).await?;

        let identity_packet = Self::recv_frame(reader).await?;
        if identity_packet.packet_type() != PACKET_TYPE_IDENTITY {
            return Err(HandshakeFailure::Protocol(format!(
                "expected identity packet, got {:?}",
                identity_packet.packet_type()
            )));
        }

        let remote_fingerprint = identity_packet
            .body_str("certificate")
            .and_then(|encoded| hex::decode(encoded).ok())
            .map(|der| trust::fingerprint(&der));
        let remote: DeviceIdentity =
            serde_json::from_value(Value::Object(identity_packet.body().clone()))
                .map_err(|e| HandshakeFailure::Protocol(format!("bad identity body: {e}")))?;

        if !remote.is_compatible() {
            let failure = HandshakeFailure::VersionMismatch {
                ours: cconnect_types::PROTOCOL_VERSION,
                theirs: remote.protocol_version,
            };
            let _ = Self::send_verdict(writer, false, Some(&failure.to_string())).await;
            return Err(failure);
        }

        if let Err(failure) = ctx
            .trust
            .validate(&remote.device_id, remote_fingerprint.as_deref())
        {
            let _ = Self::send_verdict(writer, false, Some(&failure.to_string())).await;
            return Err(failure);
        }

        Self::send_verdict(writer, true, None).await?;

        let verdict = Self::recv_frame(reader).await?;
        if verdict.packet_type() != PACKET_TYPE_HANDSHAKE {
            return Err(HandshakeFailure::Protocol(format!(
                "expected handshake verdict, got {:?}",
                verdict.packet_type()
            )));
        }
        if verdict.body_bool("accepted") != Some(true) {
            let reason = verdict
                .body_str("reason")
                .unwrap_or("no reason given")
                .to_string();
            return Err(HandshakeFailure::PeerAborted(reason));
        }

        Ok((remote, remote_fingerprint))
    }

    async fn send_identity(
        writer: &mut WriteHalf<BoxedStream>,
        ctx: &LinkContext,
    ) -> Result<(), HandshakeFailure> {
        let mut body = match serde_json::to_value(&ctx.local_identity) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(HandshakeFailure::Protocol(
                    "identity did not serialize to an object".into(),
                ))
            }
        };
        if let Some(der) = &ctx.local_cert_der {
            body.insert("certificate".into(), Value::String(hex::encode(der)));
        }
        Self::send_frame(writer, &Packet::new(PACKET_TYPE_IDENTITY, body)).await
    }

    async fn send_verdict(
        writer: &mut WriteHalf<BoxedStream>,
        accepted: bool,
        reason: Option<&str>,
    ) -> Result<(), HandshakeFailure> {
        let mut body = PacketBody::new();
        body.insert("accepted".into(), Value::Bool(accepted));
        if let Some(reason) = reason {
            body.insert("reason".into(), Value::String(reason.to_string()));
        }
        Self::send_frame(writer, &Packet::new(PACKET_TYPE_HANDSHAKE, body)).await
    }

    async fn send_frame(
        writer: &mut WriteHalf<BoxedStream>,
        packet: &Packet,
    ) -> Result<(), HandshakeFailure> {
        let line = packet
            .to_wire()
            .map_err(|e| HandshakeFailure::Protocol(e.to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| HandshakeFailure::Protocol(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| HandshakeFailure::Protocol(format!("flush failed: {e}")))
    }

    async fn recv_frame(
        reader: &mut BufReader<ReadHalf<BoxedStream>>,
    ) -> Result<Packet, HandshakeFailure> {
        match read_frame(reader).await {
            Ok(Some((packet, _))) => Ok(packet),
            Ok(None) => Err(HandshakeFailure::PeerAborted(
                "connection closed during handshake".into(),
            )),
            Err(e) => Err(HandshakeFailure::Protocol(e.to_string())),
        }
    }

    // ── Established I/O ──────────────────────────────────────────

    async fn read_loop(
        mut reader: BufReader<ReadHalf<BoxedStream>>,
        events_tx: mpsc::Sender<LinkEvent>,
        state: Arc<StateCell>,
    ) {
        let mut state_rx = state.subscribe();
        let reason = loop {
            tokio::select! {
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some((packet, payload))) => {
                        if events_tx
                            .send(LinkEvent::Packet { packet, payload })
                            .await
                            .is_err()
                        {
                            // Device side dropped the receiver.
                            break None;
                        }
                    }
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                },
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == LinkState::Closed {
                        break None;
                    }
                }
            }
        };

        state.advance(LinkState::Closed);
        let _ = events_tx.send(LinkEvent::Closed { reason }).await;
    }

    async fn write_loop(
        mut writer: WriteHalf<BoxedStream>,
        mut outbound_rx: mpsc::Receiver<OutboundEntry>,
        state: Arc<StateCell>,
    ) {
        let mut state_rx = state.subscribe();
        loop {
            tokio::select! {
                entry = outbound_rx.recv() => {
                    let Some(OutboundEntry { packet, payload, status }) = entry else {
                        break;
                    };
                    match Self::write_packet(&mut writer, &packet, payload, status.as_deref())
                        .await
                    {
                        Ok(()) => {
                            if let Some(status) = &status {
                                status.on_success();
                            }
                        }
                        Err(e) => {
                            warn!("link write failed: {e}");
                            if let Some(status) = &status {
                                status.on_failure(e);
                            }
                            state.advance(LinkState::Closed);
                            break;
                        }
                    }
                }
                _ = state_rx.changed() => {
                    if *state_rx.borrow() == LinkState::Closed {
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn write_packet(
        writer: &mut WriteHalf<BoxedStream>,
        packet: &Packet,
        payload: Option<PayloadSource>,
        status: Option<&dyn SendStatus>,
    ) -> CoreResult<()> {
        let line = packet.to_wire().map_err(|e| CoreError::Transport(e.to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;

        if let (Some(size), Some(source)) = (packet.payload_size(), payload) {
            Self::write_payload(writer, size, source, status).await?;
        }

        writer
            .flush()
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    async fn write_payload(
        writer: &mut WriteHalf<BoxedStream>,
        size: u64,
        source: PayloadSource,
        status: Option<&dyn SendStatus>,
    ) -> CoreResult<()> {
        let mut last_percent = 0u8;
        if let Some(status) = status {
            status.on_payload_progress(0);
        }

        let mut written: u64 = 0;
        match source {
            PayloadSource::Bytes(bytes) => {
                if bytes.len() as u64 != size {
                    return Err(CoreError::Transport(format!(
                        "payload is {} bytes but {} were attached",
                        bytes.len(),
                        size
                    )));
                }
                for chunk in bytes.chunks(16 * 1024) {
                    writer
                        .write_all(chunk)
                        .await
                        .map_err(|e| CoreError::Transport(e.to_string()))?;
                    written += chunk.len() as u64;
                    report_progress(status, written, size, &mut last_percent);
                }
            }
            PayloadSource::Reader(mut reader) => {
                let mut buf = [0u8; 16 * 1024];
                while written < size {
                    let want = usize::try_from(size - written)
                        .unwrap_or(buf.len())
                        .min(buf.len());
                    let n = reader
                        .read(&mut buf[..want])
                        .await
                        .map_err(|e| CoreError::Transport(e.to_string()))?;
                    if n == 0 {
                        return Err(CoreError::Transport("payload source ended early".into()));
                    }
                    writer
                        .write_all(&buf[..n])
                        .await
                        .map_err(|e| CoreError::Transport(e.to_string()))?;
                    written += n as u64;
                    report_progress(status, written, size, &mut last_percent);
                }
            }
        }

        if last_percent != 100 {
            if let Some(status) = status {
                status.on_payload_progress(100);
            }
        }
        Ok(())
    }
}

fn report_progress(status: Option<&dyn SendStatus>, written: u64, size: u64, last: &mut u8) {
    let percent = if size == 0 {
        100
    } else {
        ((written.saturating_mul(100)) / size) as u8
    };
    if percent != *last {
        *last = percent;
        if let Some(status) = status {
            status.on_payload_progress(percent);
        }
    }
}

/// Reads one wire frame: a packet line plus its payload bytes when the
/// packet declares a payload. Returns `None` on clean EOF.
async fn read_frame(
    reader: &mut BufReader<ReadHalf<BoxedStream>>,
) -> CoreResult<Option<(Packet, Option<Vec<u8>>)>> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }

    let packet = Packet::from_wire(line.trim_end())
        .map_err(|e| CoreError::Transport(format!("malformed packet: {e}")))?;

    let payload = match packet.payload_size() {
        Some(size) => {
            if size > MAX_PAYLOAD_SIZE {
                return Err(CoreError::Transport(format!(
                    "peer declared a {size} byte payload, limit is {MAX_PAYLOAD_SIZE}"
                )));
            }
            let mut buf = vec![0u8; size as usize];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|e| CoreError::Transport(format!("payload read failed: {e}")))?;
            Some(buf)
        }
        None => None,
    };

    Ok(Some((packet, payload)))
}
