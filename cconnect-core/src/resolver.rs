//! Serialization of low-level address resolution.
//!
//! The platform resolution primitive backing network discovery is unsafe to
//! invoke concurrently, so all resolutions go through this queue: at most one
//! in flight, strict FIFO, duplicates suppressed by service key. The lock
//! guards queue state only; resolve operations and result callbacks always
//! run outside it.

use crate::error::CoreResult;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Boxed future produced by a resolve operation.
pub type ResolveFuture<R> = Pin<Box<dyn Future<Output = CoreResult<R>> + Send>>;

/// A deferred resolve operation. Invoked at most once, when its request
/// reaches the head of the queue.
pub type ResolveOp<R> = Box<dyn FnOnce() -> ResolveFuture<R> + Send>;

/// Callback receiving the resolution result. Invoked exactly once for
/// requests that were enqueued, never for skipped duplicates or abandoned
/// requests.
pub type ResultCallback<R> = Box<dyn FnOnce(CoreResult<R>) + Send>;

struct PendingResolution<R> {
    service_key: String,
    /// Taken when the request starts; `None` marks the head as in flight.
    execute: Option<ResolveOp<R>>,
    on_result: Option<ResultCallback<R>>,
    abandoned: bool,
}

/// FIFO queue forcing at most one in-flight resolution.
pub struct ResolutionSerializer<R> {
    queue: Mutex<VecDeque<PendingResolution<R>>>,
}

impl<R: Send + 'static> ResolutionSerializer<R> {
    /// Creates an empty serializer.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Enqueues a resolution request, or skips it when a pending or
    /// in-flight request already carries the same service key.
    ///
    /// Returns whether the request was enqueued. A skipped request's
    /// `on_result` is never invoked.
    pub fn enqueue_or_skip(
        self: &Arc<Self>,
        service_key: impl Into<String>,
        execute: ResolveOp<R>,
        on_result: ResultCallback<R>,
    ) -> bool {
        let service_key = service_key.into();
        let start_now = {
            let mut queue = self.queue.lock().unwrap();
            if queue.iter().any(|p| p.service_key == service_key) {
                debug!(key = %service_key, "duplicate resolution request skipped");
                return false;
            }
            queue.push_back(PendingResolution {
                service_key,
                execute: Some(execute),
                on_result: Some(on_result),
                abandoned: false,
            });
            queue.len() == 1
        };
        if start_now {
            self.run_head();
        }
        true
    }

    /// Starts the head request if it has not started yet. The head stays in
    /// the queue while executing; requests arriving meanwhile are only
    /// appended.
    fn run_head(self: &Arc<Self>) {
        let execute = {
            let mut queue = self.queue.lock().unwrap();
            match queue.front_mut() {
                Some(head) => head.execute.take(),
                None => return,
            }
        };
        let Some(execute) = execute else {
            // Head already in flight; completion will advance the queue.
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = execute().await;
            this.complete_head(result);
        });
    }

    /// Pops the completed head, delivers its result, and starts the next
    /// request if any.
    fn complete_head(self: &Arc<Self>, result: CoreResult<R>) {
        let (callback, has_next) = {
            let mut queue = self.queue.lock().unwrap();
            let head = queue.pop_front();
            let callback = head.and_then(|mut h| {
                if h.abandoned {
                    debug!(key = %h.service_key, "abandoned resolution completed silently");
                    None
                } else {
                    h.on_result.take()
                }
            });
            (callback, !queue.is_empty())
        };

        if let Some(callback) = callback {
            if let Err(e) = &result {
                warn!("resolution failed: {e}");
            }
            callback(result);
        }
        if has_next {
            self.run_head();
        }
    }

    /// Abandons every request whose key matches the predicate: queued
    /// matches are dropped outright, an in-flight match completes without
    /// surfacing its result. Used by `stop_discovery` so no late results
    /// arrive after stop.
    pub fn abandon(&self, matches: impl Fn(&str) -> bool) {
        let mut queue = self.queue.lock().unwrap();
        if let Some(head) = queue.front_mut() {
            if matches(&head.service_key) {
                head.abandoned = true;
                head.on_result = None;
            }
        }
        let mut index = 1;
        while index < queue.len() {
            if matches(&queue[index].service_key) {
                queue.remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Number of requests currently queued or in flight.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the queue is empty and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}
