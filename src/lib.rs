//! Client-side routing, service discovery, and load balancing for RPC
//! clients.
//!
//! Given a logical service name, this crate resolves at call time which
//! remote (or local) endpoint should handle the request, keeps that
//! resolution current as the fleet of backing servers changes, and balances
//! load across qualifying backends. Wire encoding, sockets, and payload
//! (de)serialization belong to a pluggable transport collaborator.
//!
//! # Features
//!
//! - **Four resolution modes**: in-process, fixed address, static address
//!   list, registry-backed discovery — classified from plain configuration
//!   strings
//! - **Copy-on-write routing table**: readers never block on writers, and a
//!   replaced entry drains through a grace period before closing
//! - **Live discovery**: a store watcher that survives outages with
//!   exponential backoff and fans snapshots out to any number of subscribers
//! - **Weighted selection**: least-loaded balancing with group partitioning
//!   and per-call pinning hints
//! - **Push dispatch**: a bounded worker pool redispatching server pushes
//!   into the local handler registry
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rpc_router::{Router, RouterConfig, WeightedSelector};
//!
//! #[tokio::main]
//! async fn main() -> rpc_router::Result<()> {
//!     let config = RouterConfig::builder()
//!         .with_base_path("/game")
//!         .with_service("orders", "discovery")
//!         .with_service("billing", "10.0.0.1:9000,10.0.0.2:9000")
//!         .with_service("echo", "process")
//!         .build()?;
//!
//!     let router = Router::new(config, transport_factory).with_store(store);
//!     router.register_policy("orders", Arc::new(WeightedSelector::new("orders")));
//!     router.watch(["orders", "billing", "echo"]);
//!     router.start().await?;
//!
//!     let reply = router
//!         .call("orders", "get", payload, Default::default())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Router (Public API)                     │
//! │  .client() │ .call() │ .broadcast() │ .reload()             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Copy-on-Write Routing Table                 │
//! │   ServicePath → ServiceClient │ Delayed close on swap       │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Resolution │ Selection │ Discovery                   │
//! │   classify() │ WeightedSelector │ StoreWatcher fan-out      │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Transport Collaborator (external)              │
//! │   call │ broadcast │ go │ close                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod discovery;
mod error;
pub mod mock;
mod push;
mod registry;
mod resolution;
mod router;
mod selector;
mod transport;

// Public API exports
pub use client::{DiscoveryProvider, ServiceClient};
pub use config::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_GRACE_PERIOD, RouterConfig, RouterConfigBuilder, StoreConfig,
    WatchConfig,
};
pub use discovery::{
    DiscoveryFilter, KvPair, KvStore, ServiceDiscovery, StaticDiscovery, StoreError, StoreWatcher,
    WatchSubscription,
};
pub use error::{Result, RouteError};
pub use push::{PushMessage, PushPool};
pub use registry::{HandlerFn, HandlerRegistry, Request, ServiceHandler};
pub use resolution::{
    ResolutionKind, ResolutionSpec, SELECTOR_TYPE_DISCOVERY, SELECTOR_TYPE_LOCAL,
    SELECTOR_TYPE_PROCESS, SelectionPolicy, classify,
};
pub use router::Router;
pub use selector::{
    CallHints, GROUP_ALL, META_BACKEND_GROUPS, META_BACKEND_LOAD, META_PIN_ADDRESS,
    META_PIN_SERVER_ID, Select, WeightedSelector,
};
pub use transport::{
    CallOptions, FailoverPolicy, InProcessTransport, Metadata, Transport, TransportFactory,
    TransportOptions,
};
