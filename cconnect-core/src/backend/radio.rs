//! Short-range radio backend.
//!
//! The platform owns the radio (scanning, bonding, socket creation) and
//! feeds connected sockets in through a [`RadioPort`] together with the
//! advertisement data seen during the scan. The backend keeps its own small
//! connection backlog and does not go through the resolution serializer;
//! only network discovery is subject to that constraint.

use crate::backend::{Backend, BackendKind, ConnectCandidate, DiscoverySink};
use crate::error::{CoreError, CoreResult};
use crate::link::{BoxedStream, Link, LinkContext, LinkEvents};
use async_trait::async_trait;
use cconnect_types::DeviceIdentity;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How many pending radio connections are kept before the oldest is dropped.
const BACKLOG_LIMIT: usize = 4;

/// A connected radio socket delivered by the platform layer.
pub struct RadioSocket {
    /// Identity from the peer's radio advertisement.
    pub identity: DeviceIdentity,
    /// The connected duplex stream.
    pub stream: BoxedStream,
}

/// Sender half the platform layer uses to deliver radio sockets.
pub type RadioPort = mpsc::Sender<RadioSocket>;

/// Short-range radio discovery and connection backend.
pub struct RadioBackend {
    ctx: LinkContext,
    sink: Arc<dyn DiscoverySink>,
    running: Arc<AtomicBool>,
    /// Sink calls hold this lock and `stop_discovery` flips it under the
    /// same lock, so no discovery report lands after stop has returned.
    sink_open: Arc<Mutex<bool>>,
    backlog: Arc<Mutex<VecDeque<RadioSocket>>>,
    started: AtomicBool,
    socket_rx: Mutex<Option<mpsc::Receiver<RadioSocket>>>,
}

impl RadioBackend {
    /// Creates a radio backend and the port the platform layer feeds
    /// sockets into.
    pub fn new(ctx: LinkContext, sink: Arc<dyn DiscoverySink>) -> (Self, RadioPort) {
        let (tx, rx) = mpsc::channel(8);
        let backend = Self {
            ctx,
            sink,
            running: Arc::new(AtomicBool::new(false)),
            sink_open: Arc::new(Mutex::new(false)),
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            started: AtomicBool::new(false),
            socket_rx: Mutex::new(Some(rx)),
        };
        (backend, tx)
    }

    /// Number of pending connections in the backlog.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().unwrap().len()
    }
}

#[async_trait]
impl Backend for RadioBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Radio
    }

    async fn start_discovery(&self) -> CoreResult<()> {
        self.running.store(true, Ordering::SeqCst);
        *self.sink_open.lock().unwrap() = true;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // One long-lived intake task for the backend's lifetime; stop only
        // flips the running flag so discovery can restart without losing the
        // platform port.
        let Some(mut rx) = self.socket_rx.lock().unwrap().take() else {
            return Ok(());
        };
        let running = Arc::clone(&self.running);
        let sink_open = Arc::clone(&self.sink_open);
        let backlog = Arc::clone(&self.backlog);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            while let Some(socket) = rx.recv().await {
                if !running.load(Ordering::SeqCst) {
                    debug!("radio socket dropped while discovery stopped");
                    continue;
                }
                let identity = socket.identity.clone();
                {
                    let mut backlog = backlog.lock().unwrap();
                    if backlog.len() >= BACKLOG_LIMIT {
                        warn!("radio backlog full, dropping oldest connection");
                        backlog.pop_front();
                    }
                    backlog.push_back(socket);
                }
                let open = sink_open.lock().unwrap();
                if *open {
                    sink.on_device_discovered(ConnectCandidate::local(
                        identity,
                        BackendKind::Radio,
                    ));
                }
            }
        });
        Ok(())
    }

    async fn stop_discovery(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            *self.sink_open.lock().unwrap() = false;
            self.backlog.lock().unwrap().clear();
            debug!("radio discovery stopped");
        }
    }

    async fn connect(&self, candidate: &ConnectCandidate) -> CoreResult<(Arc<Link>, LinkEvents)> {
        let socket = {
            let mut backlog = self.backlog.lock().unwrap();
            let position = backlog
                .iter()
                .position(|s| s.identity.device_id == candidate.identity.device_id);
            match position {
                Some(index) => backlog.remove(index),
                None => None,
            }
        };
        let Some(socket) = socket else {
            return Err(CoreError::Discovery(format!(
                "no pending radio connection for device {}",
                candidate.identity.device_id
            )));
        };
        let pair = Link::handshake(socket.stream, BackendKind::Radio, &self.ctx).await?;
        Ok(pair)
    }
}
