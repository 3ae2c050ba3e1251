//! Local-network backend: UDP identity beacons plus TCP links.
//!
//! Discovery broadcasts our identity on the discovery port and listens for
//! peer beacons. Every beacon goes through the [`ResolutionSerializer`]
//! before being reported, since the platform resolution primitive is
//! single-flight. Incoming TCP connections are handshaked and handed to the
//! registry through the incoming-link channel.

use crate::backend::{Backend, BackendKind, ConnectCandidate, DiscoverySink};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult, HandshakeFailure};
use crate::link::{BoxedStream, Link, LinkContext, LinkEvents};
use crate::resolver::ResolutionSerializer;
use async_trait::async_trait;
use cconnect_types::{DeviceId, DeviceIdentity, Packet, PACKET_TYPE_IDENTITY};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the LAN backend.
#[derive(Debug, Clone)]
pub struct LanConfig {
    /// UDP port for discovery beacons.
    pub discovery_port: u16,
    /// Interval between our own beacons.
    pub broadcast_interval: Duration,
    /// Whether to send beacons (listening happens regardless).
    pub enable_broadcast: bool,
}

impl LanConfig {
    /// Derives the LAN configuration from the core configuration.
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            discovery_port: config.discovery_port,
            broadcast_interval: config.broadcast_interval,
            enable_broadcast: true,
        }
    }
}

/// Local-network discovery and connection backend.
pub struct LanBackend {
    ctx: LinkContext,
    sink: Arc<dyn DiscoverySink>,
    config: LanConfig,
    resolver: Arc<ResolutionSerializer<SocketAddr>>,
    running: Arc<AtomicBool>,
    /// Guards sink access: every sink call holds this lock, and
    /// `stop_discovery` flips it to false under the same lock, so a callback
    /// that raced past an atomic check can never reach the sink after stop
    /// has returned.
    sink_open: Arc<Mutex<bool>>,
    link_port: Arc<AtomicU16>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    incoming_tx: mpsc::Sender<(Arc<Link>, LinkEvents)>,
    incoming_rx: Mutex<Option<mpsc::Receiver<(Arc<Link>, LinkEvents)>>>,
    last_seen: Arc<Mutex<HashMap<DeviceId, Instant>>>,
}

impl LanBackend {
    /// Creates a LAN backend reporting into the given sink.
    pub fn new(ctx: LinkContext, sink: Arc<dyn DiscoverySink>, config: LanConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        Self {
            ctx,
            sink,
            config,
            resolver: ResolutionSerializer::new(),
            running: Arc::new(AtomicBool::new(false)),
            sink_open: Arc::new(Mutex::new(false)),
            link_port: Arc::new(AtomicU16::new(0)),
            tasks: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Takes the receiver for links established by peers connecting to us.
    /// The registry drains this; can be taken once.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<(Arc<Link>, LinkEvents)>> {
        self.incoming_rx.lock().unwrap().take()
    }

    /// The TCP port we accept link connections on. Zero until discovery has
    /// started.
    pub fn link_port(&self) -> u16 {
        self.link_port.load(Ordering::SeqCst)
    }

    /// The resolution queue, exposed for diagnostics.
    pub fn resolver(&self) -> &Arc<ResolutionSerializer<SocketAddr>> {
        &self.resolver
    }

    fn beacon_wire(&self) -> CoreResult<Vec<u8>> {
        let identity = self
            .ctx
            .local_identity
            .clone()
            .with_tcp_port(self.link_port());
        let body = match serde_json::to_value(&identity)? {
            Value::Object(map) => map,
            _ => return Err(CoreError::Discovery("identity serialization".into())),
        };
        Ok(Packet::new(PACKET_TYPE_IDENTITY, body)
            .to_wire()
            .map_err(|e| CoreError::Discovery(e.to_string()))?
            .into_bytes())
    }

    fn parse_beacon(datagram: &[u8]) -> Option<DeviceIdentity> {
        let line = std::str::from_utf8(datagram).ok()?;
        let packet = Packet::from_wire(line.trim_end()).ok()?;
        if packet.packet_type() != PACKET_TYPE_IDENTITY {
            return None;
        }
        serde_json::from_value(Value::Object(packet.body().clone())).ok()
    }
}

#[async_trait]
impl Backend for LanBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lan
    }

    async fn start_discovery(&self) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.sink_open.lock().unwrap() = true;

        // Link listener: peers connect here after seeing our beacon.
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| CoreError::Discovery(format!("link listener bind failed: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| CoreError::Discovery(e.to_string()))?
            .port();
        self.link_port.store(port, Ordering::SeqCst);

        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port))
            .await
            .map_err(|e| CoreError::Discovery(format!("discovery bind failed: {e}")))?;
        socket
            .set_broadcast(true)
            .map_err(|e| CoreError::Discovery(e.to_string()))?;
        let socket = Arc::new(socket);

        info!(link_port = port, discovery_port = self.config.discovery_port, "lan discovery started");

        let mut tasks = self.tasks.lock().unwrap();

        // Accept loop: handshake each incoming connection off the accept
        // thread, then hand the link to the registry.
        {
            let ctx = self.ctx.clone();
            let running = Arc::clone(&self.running);
            let incoming_tx = self.incoming_tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    debug!(%peer, "incoming lan connection");
                    let ctx = ctx.clone();
                    let running = Arc::clone(&running);
                    let incoming_tx = incoming_tx.clone();
                    tokio::spawn(async move {
                        let stream: BoxedStream = Box::new(stream);
                        match Link::handshake(stream, BackendKind::Lan, &ctx).await {
                            Ok(pair) => {
                                if running.load(Ordering::SeqCst) {
                                    let _ = incoming_tx.send(pair).await;
                                }
                            }
                            Err(e) => warn!(%peer, "incoming handshake failed: {e}"),
                        }
                    });
                }
            }));
        }

        // Beacon broadcast.
        if self.config.enable_broadcast {
            let socket_tx = Arc::clone(&socket);
            let interval = self.config.broadcast_interval;
            let port = self.config.discovery_port;
            let beacon = self.beacon_wire()?;
            tasks.push(tokio::spawn(async move {
                let target = SocketAddr::from((Ipv4Addr::BROADCAST, port));
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = socket_tx.send_to(&beacon, target).await {
                        debug!("beacon send failed: {e}");
                    }
                }
            }));
        }

        // Beacon receive loop. `self` methods are not available inside the
        // task, so the relevant handles are cloned into a lightweight
        // receiver context.
        {
            let receiver = BeaconReceiver {
                ctx: self.ctx.clone(),
                sink: Arc::clone(&self.sink),
                resolver: Arc::clone(&self.resolver),
                sink_open: Arc::clone(&self.sink_open),
                last_seen: Arc::clone(&self.last_seen),
            };
            let socket_rx = Arc::clone(&socket);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let Ok((n, source)) = socket_rx.recv_from(&mut buf).await else {
                        break;
                    };
                    if let Some(identity) = LanBackend::parse_beacon(&buf[..n]) {
                        receiver.handle_beacon(identity, source);
                    }
                }
            }));
        }

        // Reaper: peers whose beacons stop arriving are reported lost.
        {
            let sink = Arc::clone(&self.sink);
            let sink_open = Arc::clone(&self.sink_open);
            let last_seen = Arc::clone(&self.last_seen);
            let horizon = self.config.broadcast_interval * 3;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(horizon);
                loop {
                    ticker.tick().await;
                    let expired: Vec<DeviceId> = {
                        let mut seen = last_seen.lock().unwrap();
                        let now = Instant::now();
                        let expired: Vec<DeviceId> = seen
                            .iter()
                            .filter(|(_, at)| now.duration_since(**at) > horizon)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in &expired {
                            seen.remove(id);
                        }
                        expired
                    };
                    for id in expired {
                        let open = sink_open.lock().unwrap();
                        if *open {
                            info!(device = %id, "lan peer lost");
                            sink.on_device_lost(&id, BackendKind::Lan);
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    async fn stop_discovery(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Taking the gate lock waits out any sink call already in flight.
        *self.sink_open.lock().unwrap() = false;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        // Queued resolutions for this backend must never surface results
        // after stop.
        self.resolver.abandon(|_| true);
        self.last_seen.lock().unwrap().clear();
        info!("lan discovery stopped");
    }

    async fn connect(&self, candidate: &ConnectCandidate) -> CoreResult<(Arc<Link>, LinkEvents)> {
        let address = candidate
            .address
            .ok_or_else(|| CoreError::Transport("lan candidate has no address".into()))?;
        // The dial is part of the Connecting phase and shares the handshake
        // bound; an unresponsive address must not hang the caller.
        let stream = tokio::time::timeout(self.ctx.handshake_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| CoreError::Handshake(HandshakeFailure::Timeout))?
            .map_err(|e| CoreError::Transport(format!("connect to {address} failed: {e}")))?;
        let stream: BoxedStream = Box::new(stream);
        let pair = Link::handshake(stream, BackendKind::Lan, &self.ctx).await?;
        Ok(pair)
    }
}

/// Beacon-handling state shared with the receive task.
struct BeaconReceiver {
    ctx: LinkContext,
    sink: Arc<dyn DiscoverySink>,
    resolver: Arc<ResolutionSerializer<SocketAddr>>,
    sink_open: Arc<Mutex<bool>>,
    last_seen: Arc<Mutex<HashMap<DeviceId, Instant>>>,
}

impl BeaconReceiver {
    fn handle_beacon(&self, identity: DeviceIdentity, source: SocketAddr) {
        if identity.device_id == self.ctx.local_identity.device_id {
            return;
        }
        if !identity.is_compatible() {
            debug!(device = %identity.device_id, "ignoring beacon with incompatible protocol");
            return;
        }

        self.last_seen
            .lock()
            .unwrap()
            .insert(identity.device_id.clone(), Instant::now());

        let Some(port) = identity.tcp_port else {
            debug!(device = %identity.device_id, "beacon without link port");
            return;
        };
        let resolved = SocketAddr::new(source.ip(), port);

        let key = identity.device_id.to_string();
        let sink = Arc::clone(&self.sink);
        let sink_open = Arc::clone(&self.sink_open);
        self.resolver.enqueue_or_skip(
            key,
            Box::new(move || Box::pin(async move { Ok(resolved) })),
            Box::new(move |result| match result {
                Ok(address) => {
                    let open = sink_open.lock().unwrap();
                    if *open {
                        sink.on_device_discovered(ConnectCandidate::at(
                            identity,
                            BackendKind::Lan,
                            address,
                        ));
                    }
                }
                Err(e) => debug!("address resolution failed: {e}"),
            }),
        );
    }
}
