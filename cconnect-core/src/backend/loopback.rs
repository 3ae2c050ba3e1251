//! In-process loopback backend.
//!
//! Requires no network: discovery reports the local device itself, and
//! `connect` yields a link whose far end echoes every packet (payload
//! included) straight back. Used for self-test and single-device scenarios.

use crate::backend::{Backend, BackendKind, ConnectCandidate, DiscoverySink};
use crate::error::{CoreError, CoreResult};
use crate::link::{BoxedStream, Link, LinkContext, LinkEvent, LinkEvents, PayloadSource};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Backend that connects a device to itself.
pub struct LoopbackBackend {
    ctx: LinkContext,
    sink: Arc<dyn DiscoverySink>,
    running: AtomicBool,
}

impl LoopbackBackend {
    /// Creates a loopback backend reporting into the given sink.
    pub fn new(ctx: LinkContext, sink: Arc<dyn DiscoverySink>) -> Self {
        Self {
            ctx,
            sink,
            running: AtomicBool::new(false),
        }
    }

    /// Drives the far end of an echo link: every inbound packet is sent
    /// straight back on the same link.
    async fn echo_loop(link: Arc<Link>, mut events: LinkEvents) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Packet { packet, payload } => {
                    let payload = payload.map(PayloadSource::Bytes);
                    if link.send(packet, payload, None).is_err() {
                        break;
                    }
                }
                LinkEvent::Closed { .. } => break,
            }
        }
    }
}

#[async_trait]
impl Backend for LoopbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Loopback
    }

    async fn start_discovery(&self) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("loopback discovery: reporting local device");
        self.sink.on_device_discovered(ConnectCandidate::local(
            self.ctx.local_identity.clone(),
            BackendKind::Loopback,
        ));
        Ok(())
    }

    async fn stop_discovery(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.sink
                .on_device_lost(&self.ctx.local_identity.device_id, BackendKind::Loopback);
        }
    }

    async fn connect(&self, candidate: &ConnectCandidate) -> CoreResult<(Arc<Link>, LinkEvents)> {
        if candidate.identity.device_id != self.ctx.local_identity.device_id {
            return Err(CoreError::Discovery(
                "loopback can only connect to the local device".into(),
            ));
        }

        let (near, far) = tokio::io::duplex(256 * 1024);
        let near: BoxedStream = Box::new(near);
        let far: BoxedStream = Box::new(far);

        // Far end runs the same handshake with the same identity, then
        // echoes. Both sides run concurrently so neither blocks the other.
        let far_ctx = self.ctx.clone();
        let echo = tokio::spawn(async move {
            let (link, events) = Link::handshake(far, BackendKind::Loopback, &far_ctx).await?;
            Self::echo_loop(link, events).await;
            Ok::<_, crate::error::HandshakeFailure>(())
        });

        let near_result = Link::handshake(near, BackendKind::Loopback, &self.ctx).await;
        match near_result {
            Ok(pair) => Ok(pair),
            Err(failure) => {
                echo.abort();
                Err(failure.into())
            }
        }
    }
}
