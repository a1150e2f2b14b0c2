//! Controllable in-memory collaborators for testing the routing core.
//!
//! This module provides mock implementations of the two external
//! collaborators without standing up a real store or wire transport:
//!
//! - **[`MemoryStore`]**: an in-memory key-value store with watch streams,
//!   failure injection, and call counting
//! - **[`MockTransportFactory`]** / **[`MockTransport`]**: a transport layer
//!   that records every call and resolves addresses through the attached
//!   selection policy, exactly as a real transport would per attempt
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpc_router::mock::{MemoryStore, MockTransportFactory};
//! use rpc_router::{Router, RouterConfig};
//!
//! # async fn example() -> rpc_router::Result<()> {
//! let store = MemoryStore::new();
//! store.put("/game/orders/host1:9000", "avg=0&sid=A");
//!
//! let config = RouterConfig::builder()
//!     .with_base_path("/game")
//!     .with_service("orders", "discovery")
//!     .build()?;
//! let factory = MockTransportFactory::new();
//! let router = Router::new(config, factory).with_store(store);
//! router.start().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    discovery::{KvPair, KvStore, ServiceDiscovery, StoreError},
    error::{NoBackendSnafu, Result},
    push::PushMessage,
    resolution::SelectionPolicy,
    selector::CallHints,
    transport::{
        CallOptions, FailoverPolicy, Transport, TransportFactory, TransportOptions,
    },
};

/// Buffer for mock watch streams.
const WATCH_STREAM_BUFFER: usize = 16;

/// In-memory key-value store with watch support and failure injection.
///
/// Every mutation emits the current full tree to all open watch streams,
/// mirroring how tree-watching stores report changes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    watchers: Mutex<Vec<mpsc::Sender<Option<Vec<KvPair>>>>>,
    list_not_found: AtomicBool,
    fail_watch_remaining: AtomicUsize,
    watch_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts or replaces one key and notifies watch streams.
    pub fn put<K: Into<String>, V: Into<String>>(&self, key: K, value: V) {
        self.entries.lock().insert(key.into(), value.into());
        self.notify();
    }

    /// Removes one key and notifies watch streams.
    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
        self.notify();
    }

    /// Emits a nil batch ("every key is gone") to all watch streams.
    pub fn emit_nil_batch(&self) {
        self.entries.lock().clear();
        let watchers = self.watchers.lock();
        for tx in watchers.iter() {
            let _ = tx.try_send(None);
        }
    }

    /// Closes all open watch streams cleanly (no error).
    pub fn close_watch_streams(&self) {
        self.watchers.lock().clear();
    }

    /// Makes subsequent `list` calls report "key not found".
    pub fn fail_list_not_found(&self, fail: bool) {
        self.list_not_found.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` `watch_tree` calls fail as unavailable.
    pub fn fail_watch_attempts(&self, count: usize) {
        self.fail_watch_remaining.store(count, Ordering::SeqCst);
    }

    /// Returns how many times `watch_tree` was called.
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Returns how many times `close` was called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn tree(&self) -> Vec<KvPair> {
        self.entries.lock().iter().map(|(k, v)| KvPair::new(k.clone(), v.clone())).collect()
    }

    fn notify(&self) {
        let tree = self.tree();
        let mut watchers = self.watchers.lock();
        watchers.retain(|tx| tx.try_send(Some(tree.clone())).is_ok());
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list(&self, base_path: &str) -> std::result::Result<Vec<KvPair>, StoreError> {
        if self.list_not_found.load(Ordering::SeqCst) {
            return Err(StoreError::KeyNotFound { key: base_path.to_owned() });
        }
        Ok(self
            .tree()
            .into_iter()
            .filter(|pair| pair.key.starts_with(base_path))
            .collect())
    }

    async fn watch_tree(
        &self,
        _base_path: &str,
    ) -> std::result::Result<mpsc::Receiver<Option<Vec<KvPair>>>, StoreError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_watch_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_watch_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable { message: "injected watch failure".to_owned() });
        }

        let (tx, rx) = mpsc::channel(WATCH_STREAM_BUFFER);
        self.watchers.lock().push(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.watchers.lock().clear();
    }
}

/// One recorded transport interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Method that was invoked.
    pub method: String,

    /// Address the selection policy resolved, when one applied.
    pub address: Option<String>,
}

/// Recording transport that resolves backends through its selection policy.
pub struct MockTransport {
    service_path: String,
    selection: SelectionPolicy,
    discovery: Arc<dyn ServiceDiscovery>,
    push: Option<mpsc::Sender<PushMessage>>,
    rotation: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    closed: AtomicBool,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("service_path", &self.service_path)
            .field("calls", &self.calls.lock().len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockTransport {
    /// Returns the service path this transport serves.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Returns the discovery view this transport was built over.
    #[must_use]
    pub fn discovery(&self) -> &Arc<dyn ServiceDiscovery> {
        &self.discovery
    }

    /// Returns true once the routing core released this transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates a server-initiated push through this transport.
    ///
    /// Returns false when the routing core did not wire a push queue.
    pub async fn push(&self, message: PushMessage) -> bool {
        match &self.push {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }

    /// Resolves a backend address for one attempt, like a real transport
    /// does before dialing.
    fn resolve(&self, opts: &CallOptions) -> Result<String> {
        match &self.selection {
            SelectionPolicy::Custom(selector) => selector
                .select(&CallHints::from_metadata(&opts.metadata))
                .ok_or_else(|| {
                    NoBackendSnafu { service_path: self.service_path.clone() }.build()
                }),
            SelectionPolicy::RoundRobin | SelectionPolicy::Random => {
                let services = self.discovery.services();
                if services.is_empty() {
                    return NoBackendSnafu { service_path: self.service_path.clone() }.fail();
                }
                let index = self.rotation.fetch_add(1, Ordering::Relaxed) % services.len();
                Ok(services[index].key.clone())
            }
        }
    }

    fn record(&self, method: &str, address: Option<String>) {
        self.calls.lock().push(RecordedCall { method: method.to_owned(), address });
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<Bytes> {
        let address = self.resolve(&opts)?;
        self.record(method, Some(address));
        Ok(payload)
    }

    async fn broadcast(&self, method: &str, _payload: Bytes, _opts: CallOptions) -> Result<()> {
        for pair in self.discovery.services() {
            self.record(method, Some(pair.key));
        }
        Ok(())
    }

    fn go(&self, method: &str, _payload: Bytes, opts: CallOptions) -> Result<()> {
        let address = self.resolve(&opts)?;
        self.record(method, Some(address));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s and keeping every one it built.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns every transport built so far, in construction order.
    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }

    /// Returns the transports built for one service path.
    #[must_use]
    pub fn created_for(&self, service_path: &str) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.service_path == service_path)
            .cloned()
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn new_transport(
        &self,
        service_path: &str,
        _failover: FailoverPolicy,
        selection: SelectionPolicy,
        discovery: Arc<dyn ServiceDiscovery>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(MockTransport {
            service_path: service_path.to_owned(),
            selection,
            discovery,
            push: options.push.clone(),
            rotation: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
