//! Copy-on-write routing table and the top-level routing context.
//!
//! The [`Router`] maps service paths to per-service client entries. Readers
//! (`client`, `has`) load the published map without any lock; every mutation
//! builds a full copy and swaps it in atomically, so a reader sees either
//! the table before or after a change, never a half-built one.
//!
//! Replaced entries are not closed immediately: callers already holding the
//! old transport handle get a grace period to drain before the delayed close
//! fires.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::{
    client::{DiscoveryProvider, ServiceClient},
    config::RouterConfig,
    discovery::{DiscoveryFilter, KvStore, ServiceDiscovery, StoreWatcher},
    error::{ConfigSnafu, Result, ServiceNotFoundSnafu},
    push::PushPool,
    registry::HandlerRegistry,
    resolution::{ResolutionKind, ResolutionSpec, SELECTOR_TYPE_DISCOVERY, classify},
    selector::{META_PIN_ADDRESS, META_PIN_SERVER_ID, Select},
    transport::{CallOptions, Transport, TransportFactory, TransportOptions},
};

/// Lazily-created shared store watcher handed to registry-mode entries.
struct DiscoverySource {
    base_path: String,
    store: Arc<dyn KvStore>,
    options: crate::config::WatchConfig,
    filter: Option<DiscoveryFilter>,
    watcher: tokio::sync::Mutex<Option<Arc<StoreWatcher>>>,
}

impl fmt::Debug for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySource").field("base_path", &self.base_path).finish()
    }
}

#[async_trait]
impl DiscoveryProvider for DiscoverySource {
    async fn discovery(&self) -> Result<Arc<dyn ServiceDiscovery>> {
        let mut guard = self.watcher.lock().await;
        if let Some(watcher) = guard.as_ref() {
            if !watcher.is_closed() {
                return Ok(Arc::clone(watcher) as Arc<dyn ServiceDiscovery>);
            }
        }
        let watcher = StoreWatcher::start(
            &self.base_path,
            Arc::clone(&self.store),
            self.options.clone(),
            self.filter.clone(),
        )
        .await?;
        *guard = Some(Arc::clone(&watcher));
        Ok(watcher as Arc<dyn ServiceDiscovery>)
    }
}

/// Routing context: the service table plus everything entries are built from.
///
/// All registries that were process-wide globals in older designs (selection
/// policies, the service map, the handler registry) live here as fields; the
/// application composes one `Router` at its outermost composition point.
pub struct Router {
    config: RouterConfig,
    /// Current resolution strings, re-read on every reload.
    services: RwLock<HashMap<String, String>>,
    /// Service paths a reload (re)builds.
    watches: RwLock<HashSet<String>>,
    /// Custom selection policies, keyed by service path.
    policies: RwLock<HashMap<String, Arc<dyn Select>>>,
    /// Published routing table. Copy-on-write: never mutated in place.
    table: ArcSwap<HashMap<String, Arc<ServiceClient>>>,
    /// Serializes mutations; readers never touch it.
    write_lock: tokio::sync::Mutex<()>,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<HandlerRegistry>,
    store: Option<Arc<dyn KvStore>>,
    filter: Option<DiscoveryFilter>,
    source: Mutex<Option<Arc<DiscoverySource>>>,
    push: Mutex<Option<PushPool>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("services", &self.table.load().len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Router {
    /// Creates a router over the given configuration and transport factory.
    #[must_use]
    pub fn new(config: RouterConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let services = config.services.clone();
        Self {
            config,
            services: RwLock::new(services),
            watches: RwLock::new(HashSet::new()),
            policies: RwLock::new(HashMap::new()),
            table: ArcSwap::from_pointee(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
            factory,
            registry: Arc::new(HandlerRegistry::new()),
            store: None,
            filter: None,
            source: Mutex::new(None),
            push: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Attaches the external store backing registry-mode discovery.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the predicate deciding which store keys are backends.
    #[must_use]
    pub fn with_discovery_filter(mut self, filter: DiscoveryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Returns the local handler registry (in-process calls and pushes).
    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Registers a custom selection policy for one service path.
    ///
    /// Takes effect when the path's discovery-mode entry is (re)built.
    pub fn register_policy(&self, service_path: impl Into<String>, policy: Arc<dyn Select>) {
        self.policies.write().insert(service_path.into(), policy);
    }

    /// Registers service paths for `reload` to cover.
    pub fn watch<I, S>(&self, service_paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut watches = self.watches.write();
        for path in service_paths {
            watches.insert(path.into());
        }
    }

    /// Replaces one service's resolution string for the next reload.
    pub fn set_service(&self, service_path: impl Into<String>, value: impl Into<String>) {
        self.services.write().insert(service_path.into(), value.into());
    }

    /// Starts the router: spins up the push pool when handlers are
    /// registered and builds every watched service path.
    ///
    /// Idempotent: a second start is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first classification or construction failure; the table
    /// is left unchanged in that case.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.registry.is_empty() {
            let pool = PushPool::start(
                Arc::clone(&self.registry),
                self.config.push_workers,
                self.config.push_queue_capacity,
            );
            *self.push.lock() = Some(pool);
        }
        self.reload_inner().await
    }

    /// Rebuilds every watched service path from the current configuration.
    ///
    /// All-or-nothing for mode changes: the table swap happens only after
    /// every path resolved and started. In-place address reloads follow the
    /// live-update contract of the static view.
    ///
    /// # Errors
    ///
    /// Returns an error if the router is not started, a watched path has no
    /// configuration, classification fails, or an entry fails to start.
    pub async fn reload(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return ConfigSnafu { message: "router is not started" }.fail();
        }
        self.reload_inner().await
    }

    async fn reload_inner(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let current = self.table.load_full();
        let mut next: HashMap<String, Arc<ServiceClient>> = (*current).clone();
        let mut created: Vec<Arc<ServiceClient>> = Vec::new();
        let mut replaced: Vec<Arc<ServiceClient>> = Vec::new();

        let watched: Vec<String> = self.watches.read().iter().cloned().collect();
        for path in watched {
            let raw = match self.services.read().get(&path).cloned() {
                Some(raw) => raw,
                None => {
                    self.abort_created(created);
                    return ConfigSnafu { message: format!("service not configured: {path}") }
                        .fail();
                }
            };
            let spec = match self.classify_service(&path, &raw) {
                Ok(spec) => spec,
                Err(error) => {
                    self.abort_created(created);
                    return Err(error);
                }
            };

            let reused = match Self::reuse_in_place(current.get(&path), &spec) {
                Ok(reused) => reused,
                Err(error) => {
                    self.abort_created(created);
                    return Err(error);
                }
            };
            if reused.is_none() {
                match self.build_entry(&path, spec).await {
                    Ok(entry) => {
                        created.push(Arc::clone(&entry));
                        if let Some(old) = next.insert(path, entry) {
                            replaced.push(old);
                        }
                    }
                    Err(error) => {
                        self.abort_created(created);
                        return Err(error);
                    }
                }
            }
        }

        self.table.store(Arc::new(next));
        for old in replaced {
            self.schedule_close(old);
        }
        Ok(())
    }

    /// Adds or replaces one service path.
    ///
    /// Idempotent for an unchanged spec; an address change on a
    /// static-family entry is applied in place; a mode change builds a new
    /// entry and schedules the old one for a delayed close.
    ///
    /// # Errors
    ///
    /// Returns the entry's start failure, or `Closed` after shutdown.
    pub async fn add_service_path(
        &self,
        service_path: &str,
        spec: ResolutionSpec,
    ) -> Result<Arc<ServiceClient>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(crate::RouteError::Closed);
        }
        let _guard = self.write_lock.lock().await;
        let current = self.table.load_full();

        if let Some(entry) = Self::reuse_in_place(current.get(service_path), &spec)? {
            return Ok(entry);
        }

        let entry = self.build_entry(service_path, spec).await?;
        let mut next: HashMap<String, Arc<ServiceClient>> = (*current).clone();
        let replaced = next.insert(service_path.to_owned(), Arc::clone(&entry));
        self.table.store(Arc::new(next));

        if let Some(old) = replaced {
            tracing::info!(
                service_path,
                grace_ms = self.config.grace_period.as_millis() as u64,
                "resolution mode changed, draining the old client"
            );
            self.schedule_close(old);
        }
        Ok(entry)
    }

    /// Classifies a raw resolution string and adds the service path.
    ///
    /// # Errors
    ///
    /// Returns a classification or construction failure.
    pub async fn add_service(&self, service_path: &str, raw_value: &str) -> Result<Arc<ServiceClient>> {
        let spec = self.classify_service(service_path, raw_value)?;
        self.add_service_path(service_path, spec).await
    }

    /// Returns true if an entry exists for the path. Lock-free.
    #[must_use]
    pub fn has(&self, service_path: &str) -> bool {
        self.table.load().contains_key(service_path)
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.table.load().len()
    }

    /// Returns the resolved transport handle for the path. Lock-free.
    #[must_use]
    pub fn client(&self, service_path: &str) -> Option<Arc<dyn Transport>> {
        self.table.load().get(service_path).and_then(|c| c.transport())
    }

    /// Returns the transport for the path, lazily creating a discovery-mode
    /// entry for an unwatched path on first use.
    ///
    /// # Errors
    ///
    /// Returns the lazy entry's classification or construction failure.
    pub async fn client_or_load(&self, service_path: &str) -> Result<Arc<dyn Transport>> {
        if let Some(transport) = self.client(service_path) {
            return Ok(transport);
        }
        let raw = self
            .services
            .read()
            .get(service_path)
            .cloned()
            .unwrap_or_else(|| SELECTOR_TYPE_DISCOVERY.to_owned());
        let spec = self.classify_service(service_path, &raw)?;
        let entry = self.add_service_path(service_path, spec).await?;
        entry
            .transport()
            .ok_or_else(|| ServiceNotFoundSnafu { service_path: service_path.to_owned() }.build())
    }

    /// Unary call on the service's resolved transport.
    ///
    /// # Errors
    ///
    /// Returns `ServiceNotFound` for an unknown path, otherwise whatever the
    /// transport reports.
    pub async fn call(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<Bytes> {
        let transport = self.lookup(service_path)?;
        transport.call(service_method, payload, opts).await
    }

    /// Unary call pinned to one exact backend address.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_address(
        &self,
        address: &str,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let opts = CallOptions::new().with_metadata_entry(META_PIN_ADDRESS, address);
        self.call(service_path, service_method, payload, opts).await
    }

    /// Unary call restricted to one backend group.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_server_id(
        &self,
        server_id: &str,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let opts = CallOptions::new().with_metadata_entry(META_PIN_SERVER_ID, server_id);
        self.call(service_path, service_method, payload, opts).await
    }

    /// Unary call with caller-supplied metadata (hints included verbatim).
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_metadata(
        &self,
        metadata: crate::transport::Metadata,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let opts = CallOptions::new().with_metadata(metadata);
        self.call(service_path, service_method, payload, opts).await
    }

    /// Delivers the request to every backend of the service.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn broadcast(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<()> {
        let transport = self.lookup(service_path)?;
        transport.broadcast(service_method, payload, opts).await
    }

    /// Fire-and-forget dispatch.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub fn go(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<()> {
        let transport = self.lookup(service_path)?;
        transport.go(service_method, payload, opts)
    }

    /// Closes every entry, the push pool, and the shared watcher.
    ///
    /// Idempotent: a second close is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first transport close failure after attempting all.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(pool) = self.push.lock().take() {
            pool.shutdown();
        }

        let table = self.table.load_full();
        let mut first_error = None;
        for entry in table.values() {
            if let Err(error) = entry.close().await {
                tracing::warn!(
                    service_path = entry.service_path(),
                    error = %error,
                    "client close failed"
                );
                first_error.get_or_insert(error);
            }
        }
        self.table.store(Arc::new(HashMap::new()));

        let source = self.source.lock().clone();
        if let Some(source) = source {
            if let Some(watcher) = source.watcher.lock().await.as_ref() {
                watcher.shutdown();
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Decides whether `spec` can be served by the existing entry.
    ///
    /// `Ok(Some(entry))` reuses (or in-place reloads) the entry; `Ok(None)`
    /// means a fresh entry must be built.
    fn reuse_in_place(
        existing: Option<&Arc<ServiceClient>>,
        spec: &ResolutionSpec,
    ) -> Result<Option<Arc<ServiceClient>>> {
        let Some(entry) = existing else {
            return Ok(None);
        };
        let current = entry.spec();
        if current == *spec {
            return Ok(Some(Arc::clone(entry)));
        }
        if current.kind() == ResolutionKind::Static && spec.kind() == ResolutionKind::Static {
            entry.reload(spec.clone())?;
            return Ok(Some(Arc::clone(entry)));
        }
        Ok(None)
    }

    async fn build_entry(&self, service_path: &str, spec: ResolutionSpec) -> Result<Arc<ServiceClient>> {
        let entry = Arc::new(ServiceClient::new(
            service_path,
            spec,
            Arc::clone(&self.factory),
            Arc::clone(&self.registry),
            self.transport_options(),
        ));
        let source = self.source();
        let provider = source.as_deref().map(|s| s as &dyn DiscoveryProvider);
        entry.start(provider).await?;
        Ok(entry)
    }

    fn classify_service(&self, service_path: &str, raw_value: &str) -> Result<ResolutionSpec> {
        let policies = self.policies.read();
        classify(
            service_path,
            raw_value,
            self.config.local_address.as_deref(),
            policies.get(service_path),
        )
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.config.call_timeout,
            push: self.push.lock().as_ref().map(PushPool::sender),
        }
    }

    fn source(&self) -> Option<Arc<DiscoverySource>> {
        let mut guard = self.source.lock();
        if guard.is_none() {
            if let Some(store) = &self.store {
                *guard = Some(Arc::new(DiscoverySource {
                    base_path: self.config.base_path.clone(),
                    store: Arc::clone(store),
                    options: self.config.watch.clone(),
                    filter: self.filter.clone(),
                    watcher: tokio::sync::Mutex::new(None),
                }));
            }
        }
        guard.clone()
    }

    fn lookup(&self, service_path: &str) -> Result<Arc<dyn Transport>> {
        self.client(service_path)
            .ok_or_else(|| ServiceNotFoundSnafu { service_path: service_path.to_owned() }.build())
    }

    /// Schedules the delayed close of a replaced entry.
    fn schedule_close(&self, old: Arc<ServiceClient>) {
        let grace = self.config.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(error) = old.close().await {
                tracing::warn!(
                    service_path = old.service_path(),
                    error = %error,
                    "delayed close failed"
                );
            }
        });
    }

    /// Closes entries that were built during an aborted reload and never
    /// published.
    fn abort_created(&self, created: Vec<Arc<ServiceClient>>) {
        for entry in created {
            tokio::spawn(async move {
                let _ = entry.close().await;
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MemoryStore, MockTransportFactory};

    fn config() -> RouterConfig {
        RouterConfig::builder()
            .with_base_path("/game")
            .with_grace_period(Duration::from_millis(50))
            .build()
            .expect("valid test config")
    }

    fn router(factory: &Arc<MockTransportFactory>) -> Router {
        Router::new(config(), Arc::clone(factory) as Arc<dyn TransportFactory>)
    }

    #[tokio::test]
    async fn unchanged_spec_reuses_the_entry() {
        let factory = MockTransportFactory::new();
        let router = router(&factory);

        let spec = ResolutionSpec::SingleAddress("a:1".to_owned());
        let first = router.add_service_path("orders", spec.clone()).await.unwrap();
        let second = router.add_service_path("orders", spec).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second), "same spec must not rebuild the entry");
        assert_eq!(factory.created().len(), 1);
    }

    #[tokio::test]
    async fn address_change_reloads_in_place() {
        let factory = MockTransportFactory::new();
        let router = router(&factory);

        let first = router
            .add_service_path("orders", ResolutionSpec::SingleAddress("a:1".to_owned()))
            .await
            .unwrap();
        let second = router
            .add_service_path(
                "orders",
                ResolutionSpec::AddressList(vec!["b:2".to_owned(), "c:3".to_owned()]),
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created().len(), 1, "no second transport was built");
        assert_eq!(factory.created()[0].discovery().services().len(), 2);
    }

    #[tokio::test]
    async fn mode_change_swaps_and_drains_the_old_entry() {
        let factory = MockTransportFactory::new();
        let router = router(&factory);

        let old = router
            .add_service_path("orders", ResolutionSpec::SingleAddress("a:1".to_owned()))
            .await
            .unwrap();
        let new = router
            .add_service_path("orders", ResolutionSpec::InProcess)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&old, &new));

        // The old transport stays open through the grace window...
        let old_transport = factory.created()[0].clone();
        assert!(!old_transport.is_closed());

        // ...and is closed once it elapses.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !old_transport.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("old client drained and closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_observe_a_partial_table() {
        let factory = MockTransportFactory::new();
        let router = Arc::new(router(&factory));
        router
            .add_service_path("orders", ResolutionSpec::SingleAddress("a:1".to_owned()))
            .await
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..4 {
            let router = Arc::clone(&router);
            let stop = Arc::clone(&stop);
            readers.push(tokio::spawn(async move {
                let mut observed = 0_u64;
                while !stop.load(Ordering::Relaxed) {
                    assert!(router.has("orders"), "entry disappeared mid-mutation");
                    assert!(router.client("orders").is_some());
                    observed += 1;
                    if observed % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                observed
            }));
        }

        // Mutate the entry repeatedly while the readers hammer the table.
        for i in 0..20 {
            let spec = if i % 2 == 0 {
                ResolutionSpec::InProcess
            } else {
                ResolutionSpec::SingleAddress(format!("host{i}:9000"))
            };
            router.add_service_path("orders", spec).await.unwrap();
        }
        stop.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn reload_covers_watched_paths() {
        let factory = MockTransportFactory::new();
        let config = RouterConfig::builder()
            .with_base_path("/game")
            .with_service("billing", "a.b.c:9000,d.e.f:9000")
            .with_service("echo", "process")
            .build()
            .unwrap();
        let router = Router::new(config, Arc::clone(&factory) as Arc<dyn TransportFactory>);
        router.watch(["billing", "echo"]);

        router.start().await.unwrap();
        assert!(router.has("billing"));
        assert!(router.has("echo"));
        assert_eq!(router.size(), 2);
    }

    #[tokio::test]
    async fn reload_aborts_wholesale_on_bad_config() {
        let factory = MockTransportFactory::new();
        let config = RouterConfig::builder()
            .with_base_path("/game")
            .with_service("billing", "a:1")
            .build()
            .unwrap();
        let router = Router::new(config, Arc::clone(&factory) as Arc<dyn TransportFactory>);
        router.watch(["billing", "ghost"]);

        // "ghost" has no configuration: the whole reload fails and the
        // table stays empty.
        assert!(router.start().await.is_err());
        assert_eq!(router.size(), 0);
    }

    #[tokio::test]
    async fn reload_picks_up_service_changes() {
        let factory = MockTransportFactory::new();
        let config = RouterConfig::builder()
            .with_base_path("/game")
            .with_service("billing", "a:1")
            .build()
            .unwrap();
        let router = Router::new(config, Arc::clone(&factory) as Arc<dyn TransportFactory>);
        router.watch(["billing"]);
        router.start().await.unwrap();

        router.set_service("billing", "b:2,c:3");
        router.reload().await.unwrap();

        assert_eq!(factory.created().len(), 1, "address change stayed in place");
        assert_eq!(factory.created()[0].discovery().services().len(), 2);
    }

    #[tokio::test]
    async fn reload_before_start_is_rejected() {
        let factory = MockTransportFactory::new();
        let router = router(&factory);
        assert!(router.reload().await.is_err());
    }

    #[tokio::test]
    async fn lazy_load_defaults_to_discovery_mode() {
        let store = MemoryStore::new();
        store.put("/game/orders/host1:9000", "avg=0&sid=A");

        let factory = MockTransportFactory::new();
        let router = Router::new(config(), Arc::clone(&factory) as Arc<dyn TransportFactory>)
            .with_store(Arc::clone(&store) as Arc<dyn KvStore>);
        router.start().await.unwrap();

        assert!(!router.has("orders"));
        let transport = router.client_or_load("orders").await.unwrap();
        assert!(router.has("orders"));

        // Built-in fallback policy resolves over the watcher snapshot.
        let reply = transport
            .call("get", Bytes::from_static(b"x"), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"x"));

        router.close().await.unwrap();
    }

    #[tokio::test]
    async fn calls_on_unknown_paths_fail_cleanly() {
        let factory = MockTransportFactory::new();
        let router = router(&factory);

        let err = router
            .call("ghost", "get", Bytes::new(), CallOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::RouteError::ServiceNotFound { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_everything() {
        let store = MemoryStore::new();
        let factory = MockTransportFactory::new();
        let router = Router::new(config(), Arc::clone(&factory) as Arc<dyn TransportFactory>)
            .with_store(Arc::clone(&store) as Arc<dyn KvStore>);
        router.start().await.unwrap();

        router
            .add_service_path("orders", ResolutionSpec::Registry(crate::SelectionPolicy::Random))
            .await
            .unwrap();

        router.close().await.unwrap();
        router.close().await.unwrap();

        assert!(factory.created()[0].is_closed());
        tokio::time::timeout(Duration::from_secs(1), async {
            while store.close_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("store released exactly once");
        assert_eq!(store.close_calls(), 1);

        let err = router
            .add_service_path("orders", ResolutionSpec::InProcess)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::RouteError::Closed));
    }
}
