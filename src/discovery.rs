//! Store-backed service discovery.
//!
//! The [`StoreWatcher`] maintains the authoritative "address → metadata" view
//! for a base path in an external key-value store and republishes every
//! change to any number of subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StoreWatcher                           │
//! │   Initial listing │ Long-lived watch │ Backoff on failure   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      Fan-out                                │
//! │   Per-subscriber ordered delivery │ Bounded sends           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A slow subscriber never stalls the watch loop: each subscription gets a
//! dedicated forwarder that waits a bounded time for the subscriber to drain
//! and drops the snapshot (with a log line) when it does not.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::WatchConfig,
    error::{Result, StoreUnavailableSnafu},
};

/// Buffered snapshots per static-view subscription.
const STATIC_SUBSCRIBER_BUFFER: usize = 10;

/// One key/value pair as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    /// Store key; after base-path stripping, `service_path/address`.
    pub key: String,

    /// Opaque backend metadata (query-string encoded).
    pub value: String,
}

impl KvPair {
    /// Creates a pair.
    #[must_use]
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Errors the external store collaborator may report.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// The listed key does not exist.
    #[snafu(display("key not found: {key}"))]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// The store could not be reached or rejected the call.
    #[snafu(display("{message}"))]
    Unavailable {
        /// Error description.
        message: String,
    },
}

/// External key-value store contract backing discovery.
///
/// `watch_tree` yields batches of the current full tree; a `None` batch means
/// "every key under the base path is gone". The stream ending without an
/// error is a clean close and triggers an immediate rewatch.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Bulk-reads every pair under `base_path`.
    async fn list(&self, base_path: &str) -> std::result::Result<Vec<KvPair>, StoreError>;

    /// Opens a long-lived watch over `base_path`.
    async fn watch_tree(
        &self,
        base_path: &str,
    ) -> std::result::Result<mpsc::Receiver<Option<Vec<KvPair>>>, StoreError>;

    /// Releases the store handle.
    async fn close(&self);
}

/// Predicate deciding whether a stripped key is a recognizable backend.
pub type DiscoveryFilter = Arc<dyn Fn(&KvPair) -> bool + Send + Sync>;

/// One live subscription to discovery snapshots.
///
/// Delivery to a single subscription is strictly ordered; the channel closes
/// when the discovery source is closed or the subscription is removed.
#[derive(Debug)]
pub struct WatchSubscription {
    id: u64,
    receiver: mpsc::Receiver<Vec<KvPair>>,
}

impl WatchSubscription {
    /// Returns the subscription id, usable with `unsubscribe`.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next full snapshot, or `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<Vec<KvPair>> {
        self.receiver.recv().await
    }
}

/// A resolved view of backends for the transport layer.
///
/// Implemented by the live [`StoreWatcher`] and by [`StaticDiscovery`] for
/// fixed address sets.
pub trait ServiceDiscovery: Send + Sync + fmt::Debug {
    /// Returns the current full snapshot.
    fn services(&self) -> Vec<KvPair>;

    /// Subscribes to snapshot updates.
    fn subscribe(&self) -> WatchSubscription;

    /// Removes a subscription; its channel closes.
    fn unsubscribe(&self, id: u64);

    /// Shuts the view down. Idempotent.
    fn close(&self);
}

/// Static discovery view seeded from literal configured addresses.
///
/// `update` rewrites the backend set in place, which is what lets
/// single-address and address-list services reload without rebuilding their
/// transport.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    pairs: RwLock<Vec<KvPair>>,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<Vec<KvPair>>)>>,
    next_subscriber_id: AtomicU64,
}

impl StaticDiscovery {
    /// Creates a view over the given addresses.
    #[must_use]
    pub fn new(addresses: &[String]) -> Self {
        let view = Self::default();
        *view.pairs.write() = Self::to_pairs(addresses);
        view
    }

    /// Replaces the backend set and notifies subscribers.
    pub fn update(&self, addresses: &[String]) {
        let pairs = Self::to_pairs(addresses);
        *self.pairs.write() = pairs.clone();

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(id, tx)| match tx.try_send(pairs.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = *id, "static view subscriber lagging, update dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn to_pairs(addresses: &[String]) -> Vec<KvPair> {
        addresses.iter().map(|address| KvPair::new(address.clone(), "")).collect()
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn services(&self) -> Vec<KvPair> {
        self.pairs.read().clone()
    }

    fn subscribe(&self) -> WatchSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(STATIC_SUBSCRIBER_BUFFER);
        self.subscribers.lock().push((id, tx));
        WatchSubscription { id, receiver }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    fn close(&self) {
        self.subscribers.lock().clear();
    }
}

/// One fan-out target of the watcher.
struct Subscriber {
    id: u64,
    relay: mpsc::Sender<Vec<KvPair>>,
}

/// Long-lived watcher over the store's base path.
///
/// Survives store outages with exponential backoff (1s doubling to 30s by
/// default), treats a cleanly closed watch stream as "rewatch immediately",
/// and publishes a last-known-good snapshot throughout.
pub struct StoreWatcher {
    base_path: String,
    store: Arc<dyn KvStore>,
    pairs: RwLock<Vec<KvPair>>,
    // Own lock, independent of any routing-table lock.
    subscribers: Mutex<Vec<Subscriber>>,
    filter: Option<DiscoveryFilter>,
    options: WatchConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
    next_subscriber_id: AtomicU64,
}

impl fmt::Debug for StoreWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreWatcher")
            .field("base_path", &self.base_path)
            .field("backends", &self.pairs.read().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StoreWatcher {
    /// Performs the initial listing and starts the watch task.
    ///
    /// A "key not found" listing result means "zero backends registered"
    /// unless the watch configuration says otherwise.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` when the initial listing fails.
    pub async fn start(
        base_path: &str,
        store: Arc<dyn KvStore>,
        options: WatchConfig,
        filter: Option<DiscoveryFilter>,
    ) -> Result<Arc<Self>> {
        let watcher = Arc::new(Self {
            base_path: base_path.trim_end_matches('/').to_owned(),
            store,
            pairs: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            filter,
            options,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            next_subscriber_id: AtomicU64::new(0),
        });

        match watcher.store.list(&watcher.base_path).await {
            Ok(raw) => {
                watcher.set_pairs(raw);
            }
            Err(StoreError::KeyNotFound { .. }) if watcher.options.allow_key_not_found => {}
            Err(error) => {
                return StoreUnavailableSnafu { message: error.to_string() }.fail();
            }
        }

        tokio::spawn(Arc::clone(&watcher).watch_loop());
        Ok(watcher)
    }

    /// Returns the current full snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Vec<KvPair> {
        self.pairs.read().clone()
    }

    /// Returns the base path being watched.
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Returns true once `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Signals the watch task to exit and release the store.
    ///
    /// The store handle is closed exactly once, by the watch task on its way
    /// out; calling `close` again is a no-op.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
    }

    async fn watch_loop(self: Arc<Self>) {
        'rewatch: loop {
            let mut delay: Option<Duration> = None;
            let mut retries = self.options.max_retries;

            // Establish (or re-establish) the watch stream with backoff.
            let mut changes = loop {
                let attempt = tokio::select! {
                    () = self.cancel.cancelled() => break 'rewatch,
                    attempt = self.store.watch_tree(&self.base_path) => attempt,
                };
                match attempt {
                    Ok(changes) => break changes,
                    Err(error) => {
                        if let Some(left) = retries.as_mut() {
                            if *left == 0 {
                                tracing::error!(
                                    base_path = %self.base_path,
                                    error = %error,
                                    "watch retries exhausted, watcher stopping"
                                );
                                break 'rewatch;
                            }
                            *left -= 1;
                        }
                        let next = next_delay(delay, &self.options);
                        delay = Some(next);
                        tracing::warn!(
                            base_path = %self.base_path,
                            delay_ms = next.as_millis() as u64,
                            error = %error,
                            "watch failed, backing off"
                        );
                        tokio::select! {
                            () = self.cancel.cancelled() => break 'rewatch,
                            () = tokio::time::sleep(next) => {}
                        }
                    }
                }
            };

            // Drain change batches until the stream ends or we shut down.
            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break 'rewatch,
                    batch = changes.recv() => match batch {
                        None => {
                            tracing::warn!(
                                base_path = %self.base_path,
                                "watch stream closed, rewatching"
                            );
                            continue 'rewatch;
                        }
                        Some(None) => {
                            // Nil batch: every backend is gone.
                            *self.pairs.write() = Vec::new();
                            self.fanout(&[]);
                        }
                        Some(Some(raw)) => {
                            let snapshot = self.set_pairs(raw);
                            self.fanout(&snapshot);
                        }
                    },
                }
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
        self.store.close().await;
        tracing::debug!(base_path = %self.base_path, "watcher stopped");
    }

    /// Strips the base path, filters, and publishes a raw listing.
    fn set_pairs(&self, raw: Vec<KvPair>) -> Vec<KvPair> {
        let mut pairs = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(key) = self.strip_base(&entry.key) else {
                continue;
            };
            let pair = KvPair { key: key.to_owned(), value: entry.value };
            if let Some(filter) = &self.filter {
                if !(filter.as_ref())(&pair) {
                    continue;
                }
            }
            pairs.push(pair);
        }
        *self.pairs.write() = pairs.clone();
        pairs
    }

    /// Removes the base-path prefix from a store key.
    ///
    /// Returns `None` for the base-path key itself and for keys outside the
    /// base path.
    fn strip_base<'a>(&self, key: &'a str) -> Option<&'a str> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let base = self.base_path.strip_prefix('/').unwrap_or(&self.base_path);
        let rest = key.strip_prefix(base)?;
        let rest = rest.strip_prefix('/')?;
        if rest.is_empty() { None } else { Some(rest) }
    }

    /// Hands the snapshot to every subscriber's forwarder without blocking.
    fn fanout(&self, snapshot: &[KvPair]) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.iter() {
            match subscriber.relay.try_send(snapshot.to_vec()) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        base_path = %self.base_path,
                        subscriber = subscriber.id,
                        "subscriber queue full, snapshot dropped"
                    );
                }
            }
        }
    }
}

impl ServiceDiscovery for StoreWatcher {
    fn services(&self) -> Vec<KvPair> {
        self.snapshot()
    }

    fn subscribe(&self) -> WatchSubscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (relay, mut queue) = mpsc::channel::<Vec<KvPair>>(self.options.subscriber_buffer);
        let (out, receiver) = mpsc::channel(self.options.subscriber_buffer);
        let fanout_timeout = self.options.fanout_timeout;

        // One forwarder per subscription keeps delivery strictly ordered
        // while bounding how long a slow subscriber is waited on.
        tokio::spawn(async move {
            while let Some(snapshot) = queue.recv().await {
                match tokio::time::timeout(fanout_timeout, out.send(snapshot)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        tracing::warn!(
                            subscriber = id,
                            "subscriber did not drain in time, snapshot dropped"
                        );
                    }
                }
            }
        });

        self.subscribers.lock().push(Subscriber { id, relay });
        WatchSubscription { id, receiver }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|subscriber| subscriber.id != id);
    }

    fn close(&self) {
        self.shutdown();
    }
}

/// Advances the watch-retry delay: base on the first failure, doubling up to
/// the cap afterwards. A success resets `previous` to `None`.
fn next_delay(previous: Option<Duration>, options: &WatchConfig) -> Duration {
    match previous {
        None => options.initial_backoff,
        Some(delay) => (delay * 2).min(options.max_backoff),
    }
}
