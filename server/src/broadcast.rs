//! Fan-out of ingested payloads to every live subscriber.
//!
//! # Architecture
//!
//! The broadcast system consists of three pieces:
//!
//! - [`BroadcastHub`] - A stopped hub: owns the ingestion queue and the
//!   [`SubscriberRegistry`] it delivers to
//! - [`Publisher`] - Cheap-clone producer handle that enqueues payloads
//! - [`HubHandle`] - A running hub; its dispatch loop drains the queue and
//!   writes each payload to every registered subscriber
//!
//! Exactly one dispatch loop consumes the queue, and each payload is fully
//! delivered (or failed and pruned) before the next one is dequeued. Every
//! subscriber therefore sees payloads in publish order. Starting the hub
//! consumes the [`BroadcastHub`], so a second consumer cannot be started.
//!
//! # Queue policy
//!
//! The ingestion queue is unbounded: [`Publisher::publish`] never blocks or
//! drops. Memory grows if the dispatch loop falls behind, which is bounded in
//! practice by the per-subscriber write timeout.
//!
//! # Example
//!
//! ```rust
//! use livewire_server::broadcast::BroadcastHub;
//! use livewire_server::registry::SubscriberRegistry;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = SubscriberRegistry::new();
//! let hub = BroadcastHub::new(registry.clone());
//! let publisher = hub.publisher();
//!
//! let running = hub.start();
//! publisher.publish(&b"{\"device_id\":\"esp32-01\",\"temp\":21.5}"[..]).unwrap();
//!
//! let summary = running.shutdown().await;
//! assert_eq!(summary.dispatched, 1);
//! assert!(publisher.publish(&b"late"[..]).is_err());
//! # }
//! ```

use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::registry::SubscriberRegistry;

/// Default bound on a single subscriber write during dispatch.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned to producers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub has shut down and no longer accepts payloads.
    #[error("ingestion queue closed")]
    QueueClosed,
}

/// Producer side of the ingestion queue.
#[derive(Debug, Clone)]
pub struct Publisher {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Publisher {
    /// Enqueues a payload for delivery to every live subscriber.
    ///
    /// Never blocks. Fails only once the hub has shut down.
    pub fn publish(&self, payload: impl Into<Bytes>) -> Result<(), HubError> {
        let payload = payload.into();
        trace!(bytes = payload.len(), "Publishing payload");
        self.sender.send(payload).map_err(|_| HubError::QueueClosed)
    }

    /// Returns `true` once the hub's queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Totals reported by the dispatch loop when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Payloads taken off the queue and fanned out.
    pub dispatched: u64,

    /// Subscribers removed because a write to them failed.
    pub pruned: u64,
}

/// A hub that has not been started yet.
#[derive(Debug)]
pub struct BroadcastHub {
    registry: SubscriberRegistry,
    sender: mpsc::UnboundedSender<Bytes>,
    queue: mpsc::UnboundedReceiver<Bytes>,
    send_timeout: Duration,
}

impl BroadcastHub {
    /// Creates a stopped hub delivering to `registry`.
    #[must_use]
    pub fn new(registry: SubscriberRegistry) -> Self {
        Self::with_send_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    /// Creates a stopped hub with a custom per-subscriber write timeout.
    #[must_use]
    pub fn with_send_timeout(registry: SubscriberRegistry, send_timeout: Duration) -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            registry,
            sender,
            queue,
            send_timeout,
        }
    }

    /// Returns a producer handle for the ingestion queue.
    ///
    /// Publishers obtained before [`start`](Self::start) stay valid while the
    /// hub runs.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        Publisher {
            sender: self.sender.clone(),
        }
    }

    /// Returns the registry this hub delivers to.
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Spawns the dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> HubHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let registry = self.registry.clone();
        let publisher = Publisher {
            sender: self.sender,
        };

        info!(send_timeout_ms = self.send_timeout.as_millis() as u64, "Broadcast hub starting");
        let dispatch = tokio::spawn(dispatch_loop(
            self.queue,
            self.registry,
            self.send_timeout,
            shutdown_rx,
        ));

        HubHandle {
            registry,
            publisher,
            shutdown: shutdown_tx,
            dispatch,
        }
    }
}

/// A running hub.
///
/// Dropping the handle also stops the dispatch loop, but only
/// [`shutdown`](Self::shutdown) waits for it and closes the subscribers.
#[derive(Debug)]
pub struct HubHandle {
    registry: SubscriberRegistry,
    publisher: Publisher,
    shutdown: oneshot::Sender<()>,
    dispatch: JoinHandle<DispatchSummary>,
}

impl HubHandle {
    /// Returns a producer handle for the ingestion queue.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Returns the registry this hub delivers to.
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Stops the hub.
    ///
    /// Closes the ingestion queue, lets the dispatch loop deliver whatever was
    /// already queued, waits for it to exit, then closes every registered
    /// subscriber.
    pub async fn shutdown(self) -> DispatchSummary {
        let _ = self.shutdown.send(());

        let summary = match self.dispatch.await {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "Dispatch loop terminated abnormally");
                DispatchSummary::default()
            }
        };

        let closed = self.registry.close_all().await;
        info!(
            dispatched = summary.dispatched,
            pruned = summary.pruned,
            closed_subscribers = closed,
            "Broadcast hub stopped"
        );
        summary
    }
}

async fn dispatch_loop(
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    registry: SubscriberRegistry,
    send_timeout: Duration,
    mut shutdown: oneshot::Receiver<()>,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();
    let mut closing = false;

    loop {
        let next = tokio::select! {
            _ = &mut shutdown, if !closing => {
                debug!("Closing ingestion queue");
                closing = true;
                queue.close();
                continue;
            }
            next = queue.recv() => next,
        };

        let Some(payload) = next else {
            break;
        };

        let pruned = registry
            .for_each_live(|handle| handle.deliver(payload.clone(), send_timeout).boxed())
            .await;

        summary.dispatched += 1;
        summary.pruned += pruned as u64;
        trace!(bytes = payload.len(), pruned, "Payload dispatched");
    }

    debug!(dispatched = summary.dispatched, "Dispatch loop exited");
    summary
}
