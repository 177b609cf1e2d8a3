//! Live subscriber bookkeeping for the broadcast hub.
//!
//! The [`SubscriberRegistry`] owns every [`SubscriberHandle`] that is currently
//! connected. A handle wraps the write half of one subscriber connection and
//! is closed exactly once: when a write to it fails, when the peer disconnects,
//! or when the hub shuts down.
//!
//! The write half is only one side of the connection. Whoever owns the read
//! side obtains a [`CloseSignal`] alongside the handle (see
//! [`SubscriberHandle::with_close_signal`]) and must drop the read side once
//! the signal fires, so a pruned subscriber releases its whole connection
//! even if the peer never answers the close frame.
//!
//! # Locking
//!
//! All operations go through a single async mutex. A broadcast pass holds the
//! lock for its whole duration, so no handle can be added or removed while a
//! message is being fanned out. Writes performed inside the pass must be
//! bounded (see [`SubscriberHandle::deliver`]) so one stalled subscriber cannot
//! hold the lock indefinitely.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use futures_util::{sink, FutureExt};
//! use livewire_server::registry::{DeliveryError, SubscriberHandle, SubscriberRegistry};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = SubscriberRegistry::new();
//! let handle = SubscriberHandle::new(Box::pin(sink::unfold((), |(), _msg: Bytes| async {
//!     Ok::<_, DeliveryError>(())
//! })));
//! registry.add(handle).await;
//!
//! let payload = Bytes::from_static(b"{\"temp\":21.5}");
//! let pruned = registry
//!     .for_each_live(|handle| handle.deliver(payload.clone(), Duration::from_secs(1)).boxed())
//!     .await;
//! assert_eq!(pruned, 0);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

/// Upper bound on closing a single subscriber connection.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Write half of a subscriber connection, as seen by the hub.
///
/// Payloads are opaque bytes; adapting them to the transport's framing is
/// the sink's job.
pub type SubscriberSink = Pin<Box<dyn Sink<Bytes, Error = DeliveryError> + Send>>;

/// Process-unique identifier of a subscriber handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A failed write to a single subscriber.
///
/// Delivery failures are handled locally by pruning the handle; they are
/// never surfaced to the publisher.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The write did not complete within the configured timeout.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The transport reported an error (peer gone, connection reset, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Creates a transport error from any displayable cause.
    pub fn transport(cause: impl fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }
}

/// Resolves once the paired [`SubscriberHandle`] has been closed or dropped.
pub type CloseSignal = oneshot::Receiver<()>;

/// Exclusively-owned handle to one live subscriber connection.
pub struct SubscriberHandle {
    id: SubscriberId,
    sink: SubscriberSink,
    // Never sent on; dropping it with the handle wakes the `CloseSignal`.
    _closed: oneshot::Sender<()>,
}

impl SubscriberHandle {
    /// Wraps a connection sink in a new handle with a fresh id.
    pub fn new(sink: SubscriberSink) -> Self {
        Self::with_close_signal(sink).0
    }

    /// Wraps a connection sink and returns the signal that fires when the
    /// handle goes away.
    pub fn with_close_signal(sink: SubscriberSink) -> (Self, CloseSignal) {
        let (closed_tx, closed_rx) = oneshot::channel();
        let handle = Self {
            id: SubscriberId::next(),
            sink,
            _closed: closed_tx,
        };
        (handle, closed_rx)
    }

    /// Returns this handle's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Writes one payload to the connection, failing if the write takes
    /// longer than `timeout`.
    pub async fn deliver(&mut self, payload: Bytes, timeout: Duration) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.sink.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    /// Closes the underlying connection. Consumes the handle so it can only
    /// happen once.
    ///
    /// Bounded by [`CLOSE_TIMEOUT`]: a sink that stalled on a write may stall
    /// on close as well. The [`CloseSignal`] fires when this returns,
    /// whether or not the close frame was flushed.
    async fn close(mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(subscriber = %self.id, error = %err, "Error while closing subscriber");
            }
            Err(_) => {
                debug!(subscriber = %self.id, "Timed out closing subscriber, dropping connection");
            }
        }
    }
}

impl fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Concurrent set of live subscriber handles.
///
/// Cloning is cheap and every clone refers to the same set.
///
/// After [`close_all`](Self::close_all) the registry stays closed: late
/// handles passed to [`add`](Self::add) are closed immediately.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    handles: Arc<Mutex<HashMap<SubscriberId, SubscriberHandle>>>,
    // Only written while `handles` is locked.
    closed: Arc<AtomicBool>,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle and returns its id.
    ///
    /// Re-adding an id that is already present leaves the existing handle in
    /// place and closes the duplicate. Once the registry is closed, every
    /// added handle is closed instead of registered.
    pub async fn add(&self, handle: SubscriberHandle) -> SubscriberId {
        let id = handle.id();
        let mut handles = self.handles.lock().await;

        if self.closed.load(Ordering::Acquire) {
            drop(handles);
            debug!(subscriber = %id, "Registry closed, rejecting subscriber");
            handle.close().await;
            return id;
        }

        if handles.contains_key(&id) {
            drop(handles);
            handle.close().await;
            return id;
        }

        handles.insert(id, handle);
        info!(subscriber = %id, live = handles.len(), "Subscriber added");
        id
    }

    /// Removes a handle and closes its connection.
    ///
    /// Returns `false` if the handle was not registered; removing twice is
    /// not an error.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut handles = self.handles.lock().await;
        let Some(handle) = handles.remove(&id) else {
            return false;
        };
        let live = handles.len();
        handle.close().await;
        info!(subscriber = %id, live, "Subscriber removed");
        true
    }

    /// Runs `deliver` against every registered handle, one at a time, while
    /// holding the registry lock.
    ///
    /// Handles for which `deliver` fails are removed and closed before this
    /// returns. Returns the number of handles pruned.
    pub async fn for_each_live<F>(&self, mut deliver: F) -> usize
    where
        F: for<'a> FnMut(&'a mut SubscriberHandle) -> BoxFuture<'a, Result<(), DeliveryError>>,
    {
        let mut handles = self.handles.lock().await;

        let mut failed = Vec::new();
        for (id, handle) in handles.iter_mut() {
            if let Err(err) = deliver(handle).await {
                debug!(subscriber = %id, error = %err, "Delivery failed, pruning subscriber");
                failed.push(*id);
            }
        }

        for id in &failed {
            if let Some(handle) = handles.remove(id) {
                handle.close().await;
            }
        }

        if !failed.is_empty() {
            info!(pruned = failed.len(), live = handles.len(), "Pruned dead subscribers");
        }
        failed.len()
    }

    /// Removes and closes every registered handle and marks the registry
    /// closed.
    ///
    /// Returns the number of handles closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<SubscriberHandle> = {
            let mut handles = self.handles.lock().await;
            self.closed.store(true, Ordering::Release);
            handles.drain().map(|(_, handle)| handle).collect()
        };

        let count = drained.len();
        for handle in drained {
            handle.close().await;
        }
        count
    }

    /// Returns `true` if `id` is currently registered.
    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.handles.lock().await.contains_key(&id)
    }

    /// Returns `true` once [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the number of live handles.
    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Returns `true` if no handles are registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry").finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures_util::FutureExt;
    use rand::Rng;

    const TIMEOUT: Duration = Duration::from_secs(1);

    async fn broadcast(registry: &SubscriberRegistry, payload: &'static str) -> usize {
        let payload = Bytes::from_static(payload.as_bytes());
        registry
            .for_each_live(|handle| handle.deliver(payload.clone(), TIMEOUT).boxed())
            .await
    }

    #[test]
    fn subscriber_ids_are_unique() {
        let (a, _) = recording_handle();
        let (b, _) = recording_handle();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn subscriber_id_display() {
        let id = SubscriberId(42);
        assert_eq!(id.to_string(), "sub-42");
        assert_eq!(id.as_u64(), 42);
    }

    #[tokio::test]
    async fn add_registers_handle() {
        let registry = SubscriberRegistry::new();
        assert!(registry.is_empty().await);

        let (handle, _) = recording_handle();
        let id = registry.add(handle).await;

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn remove_closes_handle_and_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (handle, recorder) = recording_handle();
        let id = registry.add(handle).await;

        assert!(registry.remove(id).await);
        assert!(recorder.is_closed());
        assert!(!registry.contains(id).await);

        assert!(!registry.remove(id).await);
    }

    #[tokio::test]
    async fn for_each_live_delivers_to_every_handle() {
        let registry = SubscriberRegistry::new();
        let (h1, r1) = recording_handle();
        let (h2, r2) = recording_handle();
        registry.add(h1).await;
        registry.add(h2).await;

        assert_eq!(broadcast(&registry, "hello").await, 0);

        assert_eq!(r1.received_strings(), vec!["hello"]);
        assert_eq!(r2.received_strings(), vec!["hello"]);
    }

    #[tokio::test]
    async fn for_each_live_prunes_only_failing_handle() {
        let registry = SubscriberRegistry::new();
        let (good, good_rec) = recording_handle();
        let (bad, bad_rec) = failing_after(0);
        registry.add(good).await;
        let bad_id = registry.add(bad).await;

        assert_eq!(broadcast(&registry, "A").await, 1);

        assert!(!registry.contains(bad_id).await);
        assert!(bad_rec.is_closed());
        assert!(bad_rec.received().is_empty());
        assert_eq!(good_rec.received_strings(), vec!["A"]);
        assert!(!good_rec.is_closed());
    }

    #[tokio::test]
    async fn pruned_handle_never_receives_later_messages() {
        let registry = SubscriberRegistry::new();
        let (flaky, flaky_rec) = failing_after(2);
        let (steady, steady_rec) = recording_handle();
        registry.add(flaky).await;
        registry.add(steady).await;

        for payload in ["1", "2", "3", "4"] {
            broadcast(&registry, payload).await;
        }

        assert_eq!(flaky_rec.received_strings(), vec!["1", "2"]);
        assert_eq!(steady_rec.received_strings(), vec!["1", "2", "3", "4"]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stalled_handle_times_out_and_is_pruned() {
        let registry = SubscriberRegistry::new();
        let id = registry.add(stalled_handle()).await;
        let (live, live_rec) = recording_handle();
        registry.add(live).await;

        let payload = Bytes::from_static(b"ping");
        let pruned = registry
            .for_each_live(|handle| {
                handle
                    .deliver(payload.clone(), Duration::from_millis(20))
                    .boxed()
            })
            .await;

        assert_eq!(pruned, 1);
        assert!(!registry.contains(id).await);
        assert_eq!(live_rec.received_strings(), vec!["ping"]);
    }

    #[tokio::test]
    async fn deliver_reports_timeout() {
        let mut handle = stalled_handle();
        let err = handle
            .deliver(Bytes::from_static(b"x"), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout(_)));
    }

    #[tokio::test]
    async fn close_all_closes_every_handle() {
        let registry = SubscriberRegistry::new();
        let recorders: Vec<Recorder> = {
            let mut recorders = Vec::new();
            for _ in 0..3 {
                let (handle, recorder) = recording_handle();
                registry.add(handle).await;
                recorders.push(recorder);
            }
            recorders
        };

        assert_eq!(registry.close_all().await, 3);
        assert!(registry.is_empty().await);
        assert!(recorders.iter().all(Recorder::is_closed));
    }

    #[tokio::test]
    async fn add_after_close_all_closes_late_handle() {
        let registry = SubscriberRegistry::new();
        registry.close_all().await;
        assert!(registry.is_closed());

        let (handle, recorder) = recording_handle();
        let id = registry.add(handle).await;

        assert!(!registry.contains(id).await);
        assert!(registry.is_empty().await);
        assert!(recorder.is_closed());
    }

    #[tokio::test]
    async fn close_signal_fires_when_handle_is_pruned() {
        let registry = SubscriberRegistry::new();
        let (handle, recorder, mut signal) = failing_after_with_signal(0);
        registry.add(handle).await;
        assert!(signal.try_recv().is_err());

        assert_eq!(broadcast(&registry, "x").await, 1);
        assert!(recorder.is_closed());
        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("close signal should fire after pruning")
            .unwrap_err();
    }

    #[tokio::test]
    async fn close_signal_fires_on_remove() {
        let registry = SubscriberRegistry::new();
        let (handle, signal) = SubscriberHandle::with_close_signal(Box::pin(
            futures_util::sink::unfold((), |(), _payload: Bytes| async { Ok::<_, DeliveryError>(()) }),
        ));
        let id = registry.add(handle).await;

        assert!(registry.remove(id).await);
        assert!(signal.await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mutation_stress() {
        let registry = SubscriberRegistry::new();
        let mut tasks = Vec::new();

        for worker in 0..8u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut owned = Vec::new();
                for _ in 0..200 {
                    let op: u8 = rand::rng().random_range(0..3);
                    match op {
                        0 => {
                            let (handle, recorder) = if worker % 2 == 0 {
                                recording_handle()
                            } else {
                                failing_after(rand::rng().random_range(0..4))
                            };
                            owned.push((registry.add(handle).await, recorder));
                        }
                        1 if !owned.is_empty() => {
                            let idx = rand::rng().random_range(0..owned.len());
                            let (id, recorder) = owned.swap_remove(idx);
                            registry.remove(id).await;
                            assert!(recorder.is_closed());
                        }
                        _ => {
                            // Count deliveries per handle within one pass.
                            let mut seen = std::collections::HashSet::new();
                            let payload = Bytes::from(format!("w{worker}"));
                            registry
                                .for_each_live(|handle| {
                                    assert!(seen.insert(handle.id()), "handle visited twice");
                                    handle.deliver(payload.clone(), TIMEOUT).boxed()
                                })
                                .await;
                        }
                    }
                    let should_yield = rand::rng().random_bool(0.1);
                    if should_yield {
                        tokio::task::yield_now().await;
                    }
                }
                owned
            }));
        }

        let mut survivors = Vec::new();
        for task in tasks {
            survivors.extend(task.await.expect("worker panicked"));
        }

        // Any registered handle must still be writable; closed ones must be gone.
        for (id, recorder) in &survivors {
            if registry.contains(*id).await {
                assert!(!recorder.is_closed());
            }
        }
        assert!(registry.len().await <= survivors.len());

        registry.close_all().await;
        assert!(survivors.iter().all(|(_, recorder)| recorder.is_closed()));
    }
}
