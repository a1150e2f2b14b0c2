//! Per-service client wrapper.
//!
//! A [`ServiceClient`] owns the resolved transport handle for one service
//! path and knows how to build it from any resolution mode. Address-mode
//! entries can be reloaded in place; a mode change requires a new entry
//! (the routing table handles the swap and the drain of the old one).

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    discovery::{ServiceDiscovery, StaticDiscovery},
    error::{AlreadyStartedSnafu, ConfigSnafu, Result},
    registry::HandlerRegistry,
    resolution::{ResolutionKind, ResolutionSpec, SelectionPolicy},
    transport::{FailoverPolicy, InProcessTransport, Transport, TransportFactory, TransportOptions},
};

/// Source of the shared discovery handle for registry-mode services.
///
/// The router implements this over its store watcher; point-to-point and
/// static services never consult it.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync + fmt::Debug {
    /// Returns the live discovery handle, creating it on first use.
    async fn discovery(&self) -> Result<Arc<dyn ServiceDiscovery>>;
}

/// Client entry for one service path.
pub struct ServiceClient {
    service_path: String,
    spec: RwLock<ResolutionSpec>,
    failover: FailoverPolicy,
    // Monotonic: once set it never resets, even if start fails.
    started: AtomicBool,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    static_view: RwLock<Option<Arc<StaticDiscovery>>>,
    subscription: Mutex<Option<(Arc<dyn ServiceDiscovery>, u64)>>,
    cancel: CancellationToken,
    registry: Arc<HandlerRegistry>,
    factory: Arc<dyn TransportFactory>,
    options: TransportOptions,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_path", &self.service_path)
            .field("spec", &*self.spec.read())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl ServiceClient {
    /// Creates an unstarted entry.
    #[must_use]
    pub fn new(
        service_path: impl Into<String>,
        spec: ResolutionSpec,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<HandlerRegistry>,
        options: TransportOptions,
    ) -> Self {
        Self {
            service_path: service_path.into(),
            spec: RwLock::new(spec),
            failover: FailoverPolicy::default(),
            started: AtomicBool::new(false),
            transport: RwLock::new(None),
            static_view: RwLock::new(None),
            subscription: Mutex::new(None),
            cancel: CancellationToken::new(),
            registry,
            factory,
            options,
        }
    }

    /// Returns the service path this entry serves.
    #[must_use]
    pub fn service_path(&self) -> &str {
        &self.service_path
    }

    /// Returns the current resolution spec.
    #[must_use]
    pub fn spec(&self) -> ResolutionSpec {
        self.spec.read().clone()
    }

    /// Returns true once `start` has been attempted.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Returns the resolved transport handle, if started.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Builds the transport handle from the resolution spec.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call, a configuration error for
    /// registry mode without a provider, or the factory's failure.
    pub async fn start(&self, provider: Option<&dyn DiscoveryProvider>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return AlreadyStartedSnafu { service_path: self.service_path.clone() }.fail();
        }

        let spec = self.spec.read().clone();
        let transport = match spec {
            ResolutionSpec::InProcess => Arc::new(InProcessTransport::new(
                self.service_path.clone(),
                Arc::clone(&self.registry),
            )) as Arc<dyn Transport>,
            ResolutionSpec::SingleAddress(address) => self.start_static(&[address])?,
            ResolutionSpec::AddressList(addresses) => self.start_static(&addresses)?,
            ResolutionSpec::Registry(policy) => self.start_registry(policy, provider).await?,
        };

        *self.transport.write() = Some(transport);
        tracing::debug!(service_path = %self.service_path, "service client started");
        Ok(())
    }

    fn start_static(&self, addresses: &[String]) -> Result<Arc<dyn Transport>> {
        let view = Arc::new(StaticDiscovery::new(addresses));
        *self.static_view.write() = Some(Arc::clone(&view));
        self.factory.new_transport(
            &self.service_path,
            self.failover,
            SelectionPolicy::Random,
            view,
            &self.options,
        )
    }

    async fn start_registry(
        &self,
        policy: SelectionPolicy,
        provider: Option<&dyn DiscoveryProvider>,
    ) -> Result<Arc<dyn Transport>> {
        let Some(provider) = provider else {
            return ConfigSnafu {
                message: format!(
                    "service '{}' uses discovery but no store is configured",
                    self.service_path
                ),
            }
            .fail();
        };
        let discovery = provider.discovery().await?;

        if let SelectionPolicy::Custom(selector) = &policy {
            // Seed the selector and keep it fed with every snapshot change.
            selector.update_server(&discovery.services());
            let mut subscription = discovery.subscribe();
            *self.subscription.lock() = Some((Arc::clone(&discovery), subscription.id()));

            let selector = Arc::clone(selector);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        snapshot = subscription.recv() => match snapshot {
                            Some(snapshot) => selector.update_server(&snapshot),
                            None => return,
                        },
                    }
                }
            });
        }

        self.factory.new_transport(
            &self.service_path,
            self.failover,
            policy,
            discovery,
            &self.options,
        )
    }

    /// Rewrites the live backend set for a static-family entry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when either the current or the new spec
    /// is not static-family: a resolution-mode change cannot be applied in
    /// place and needs a new entry.
    pub fn reload(&self, new_spec: ResolutionSpec) -> Result<()> {
        let current_kind = self.spec.read().kind();
        if current_kind != ResolutionKind::Static || new_spec.kind() != ResolutionKind::Static {
            return ConfigSnafu {
                message: format!(
                    "service '{}' cannot change resolution mode in place",
                    self.service_path
                ),
            }
            .fail();
        }

        if !self.started.load(Ordering::SeqCst) {
            // Not built yet: the upcoming start picks up the new addresses.
            *self.spec.write() = new_spec;
            return Ok(());
        }

        let addresses = new_spec.addresses().unwrap_or_default();
        match self.static_view.read().as_ref() {
            Some(view) => view.update(&addresses),
            None => {
                return ConfigSnafu {
                    message: format!(
                        "service '{}' has no static backend view to reload",
                        self.service_path
                    ),
                }
                .fail();
            }
        }
        *self.spec.write() = new_spec;
        tracing::debug!(service_path = %self.service_path, "backend set reloaded in place");
        Ok(())
    }

    /// Releases the transport handle and detaches from discovery.
    ///
    /// The shared discovery handle itself stays open; the router owns it.
    ///
    /// # Errors
    ///
    /// Returns the transport's close failure.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some((discovery, id)) = self.subscription.lock().take() {
            discovery.unsubscribe(id);
        }
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        discovery::{KvStore, StoreWatcher},
        mock::{MemoryStore, MockTransportFactory},
        selector::{CallHints, Select, WeightedSelector},
        transport::CallOptions,
    };

    #[derive(Debug)]
    struct FixedProvider(Arc<dyn ServiceDiscovery>);

    #[async_trait]
    impl DiscoveryProvider for FixedProvider {
        async fn discovery(&self) -> Result<Arc<dyn ServiceDiscovery>> {
            Ok(Arc::clone(&self.0))
        }
    }

    fn entry(spec: ResolutionSpec, factory: &Arc<MockTransportFactory>) -> ServiceClient {
        ServiceClient::new(
            "orders",
            spec,
            Arc::clone(factory) as Arc<dyn TransportFactory>,
            Arc::new(HandlerRegistry::new()),
            TransportOptions::default(),
        )
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let factory = MockTransportFactory::new();
        let client = entry(ResolutionSpec::SingleAddress("a:1".to_owned()), &factory);

        client.start(None).await.unwrap();
        let err = client.start(None).await.unwrap_err();
        assert!(matches!(err, crate::RouteError::AlreadyStarted { .. }));
    }

    #[tokio::test]
    async fn in_process_entry_builds_local_transport() {
        let factory = MockTransportFactory::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_function("orders", "get", |req: crate::registry::Request| {
            Ok(req.payload)
        });

        let client = ServiceClient::new(
            "orders",
            ResolutionSpec::InProcess,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            registry,
            TransportOptions::default(),
        );
        client.start(None).await.unwrap();

        // No factory involvement: the in-process path bypasses it entirely.
        assert!(factory.created().is_empty());

        let transport = client.transport().unwrap();
        let reply = transport
            .call("get", Bytes::from_static(b"x"), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn address_list_reload_keeps_the_transport() {
        let factory = MockTransportFactory::new();
        let client = entry(
            ResolutionSpec::AddressList(vec!["a.b.c:9000".to_owned(), "d.e.f:9000".to_owned()]),
            &factory,
        );
        client.start(None).await.unwrap();

        let before = client.transport().unwrap();
        client
            .reload(ResolutionSpec::AddressList(vec!["g.h.i:9000".to_owned()]))
            .unwrap();
        let after = client.transport().unwrap();

        assert!(Arc::ptr_eq(&before, &after), "reload must not rebuild the transport");

        let addresses: Vec<String> = factory.created()[0]
            .discovery()
            .services()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(addresses, vec!["g.h.i:9000".to_owned()]);
    }

    #[tokio::test]
    async fn single_address_reloads_into_list_in_place() {
        let factory = MockTransportFactory::new();
        let client = entry(ResolutionSpec::SingleAddress("a:1".to_owned()), &factory);
        client.start(None).await.unwrap();

        client
            .reload(ResolutionSpec::AddressList(vec!["a:1".to_owned(), "b:2".to_owned()]))
            .unwrap();
        assert_eq!(factory.created()[0].discovery().services().len(), 2);
    }

    #[tokio::test]
    async fn mode_change_reload_is_rejected() {
        let factory = MockTransportFactory::new();
        let client = entry(ResolutionSpec::SingleAddress("a:1".to_owned()), &factory);
        client.start(None).await.unwrap();

        let err = client.reload(ResolutionSpec::InProcess).unwrap_err();
        assert!(matches!(err, crate::RouteError::Config { .. }));
    }

    #[tokio::test]
    async fn registry_mode_without_provider_is_config_error() {
        let factory = MockTransportFactory::new();
        let client = entry(
            ResolutionSpec::Registry(crate::resolution::SelectionPolicy::Random),
            &factory,
        );

        let err = client.start(None).await.unwrap_err();
        assert!(matches!(err, crate::RouteError::Config { .. }));
    }

    #[tokio::test]
    async fn registry_mode_feeds_the_selector() {
        let store = MemoryStore::new();
        store.put("/game/orders/host1:9000", "avg=2&sid=A");
        store.put("/game/orders/host2:9000", "avg=1&sid=A");

        let watcher = StoreWatcher::start(
            "/game",
            Arc::clone(&store) as Arc<dyn KvStore>,
            crate::config::WatchConfig::default(),
            None,
        )
        .await
        .unwrap();
        let provider = FixedProvider(Arc::clone(&watcher) as Arc<dyn ServiceDiscovery>);

        let selector = Arc::new(WeightedSelector::new("orders"));
        let factory = MockTransportFactory::new();
        let client = entry(
            ResolutionSpec::Registry(crate::resolution::SelectionPolicy::Custom(
                Arc::clone(&selector) as Arc<dyn Select>,
            )),
            &factory,
        );
        client.start(Some(&provider)).await.unwrap();

        // Seeded from the watcher's current snapshot.
        assert_eq!(
            selector.select(&CallHints::default()).as_deref(),
            Some("host2:9000")
        );

        // A store change flows through the watcher into the selector.
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.watch_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch stream established");
        store.put("/game/orders/host3:9000", "avg=0&sid=A");
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let picked = selector.select(&CallHints::pin_server_id("A"));
                if picked.as_deref() == Some("host3:9000") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("selector saw the new backend");

        client.close().await.unwrap();
        watcher.shutdown();
    }

    #[tokio::test]
    async fn close_releases_the_transport() {
        let factory = MockTransportFactory::new();
        let client = entry(ResolutionSpec::SingleAddress("a:1".to_owned()), &factory);
        client.start(None).await.unwrap();

        client.close().await.unwrap();
        assert!(client.transport().is_none());
        assert!(factory.created()[0].is_closed());
    }

    #[tokio::test]
    async fn unstarted_reload_updates_the_spec_only() {
        let factory = MockTransportFactory::new();
        let client = entry(ResolutionSpec::SingleAddress("a:1".to_owned()), &factory);

        client
            .reload(ResolutionSpec::AddressList(vec!["b:2".to_owned()]))
            .unwrap();
        assert_eq!(client.spec(), ResolutionSpec::AddressList(vec!["b:2".to_owned()]));

        client.start(None).await.unwrap();
        let addresses: Vec<String> = factory.created()[0]
            .discovery()
            .services()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(addresses, vec!["b:2".to_owned()]);
    }
}
