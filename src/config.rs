//! Router configuration with builder pattern.
//!
//! Provides type-safe configuration for the routing core including:
//! - The service map (service path → resolution string)
//! - The discovery base path and the local bind address
//! - Watch/backoff tuning for the store watcher
//! - Grace delay for redirected clients and push worker sizing

use std::{collections::HashMap, time::Duration};

use snafu::ensure;

use crate::error::{ConfigSnafu, Result};

/// Default grace delay before a redirected client entry is closed (5 seconds).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default call timeout applied when a call carries no deadline (5 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of push-message workers.
pub const DEFAULT_PUSH_WORKERS: usize = 4;

/// Upper bound on push-message workers.
pub const MAX_PUSH_WORKERS: usize = 10;

/// Default capacity of the inbound push-message queue.
pub const DEFAULT_PUSH_QUEUE_CAPACITY: usize = 256;

/// Initial watch-retry backoff (1 second).
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Watch-retry backoff cap (30 seconds).
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How long a fan-out send waits for a slow subscriber before dropping
/// the snapshot (1 minute).
const DEFAULT_FANOUT_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffered snapshots per watch subscription.
const DEFAULT_SUBSCRIBER_BUFFER: usize = 10;

/// Configuration for the routing core.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Service path → resolution string (`process`, `discovery`, `local`,
    /// a single address, or a comma-separated address list).
    pub(crate) services: HashMap<String, String>,

    /// Base path under which backends register in the external store.
    pub(crate) base_path: String,

    /// This process's own bound address, used by the `local` resolution mode.
    pub(crate) local_address: Option<String>,

    /// Grace delay before a replaced client entry is closed.
    pub(crate) grace_period: Duration,

    /// Default call timeout when the caller sets no deadline.
    pub(crate) call_timeout: Duration,

    /// Number of push-message workers (clamped to 1..=[`MAX_PUSH_WORKERS`]).
    pub(crate) push_workers: usize,

    /// Capacity of the inbound push-message queue.
    pub(crate) push_queue_capacity: usize,

    /// Watch/backoff tuning for the store watcher.
    pub(crate) watch: WatchConfig,
}

impl RouterConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }

    /// Returns the configured service map.
    #[must_use]
    pub fn services(&self) -> &HashMap<String, String> {
        &self.services
    }

    /// Returns the discovery base path.
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Returns this process's own bound address, if configured.
    #[must_use]
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// Returns the grace delay for redirected client entries.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Returns the default call timeout.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Returns the watch configuration.
    #[must_use]
    pub fn watch(&self) -> &WatchConfig {
        &self.watch
    }
}

/// Builder for [`RouterConfig`].
#[derive(Debug, Default)]
pub struct RouterConfigBuilder {
    services: HashMap<String, String>,
    base_path: Option<String>,
    local_address: Option<String>,
    grace_period: Option<Duration>,
    call_timeout: Option<Duration>,
    push_workers: Option<usize>,
    push_queue_capacity: Option<usize>,
    watch: Option<WatchConfig>,
}

impl RouterConfigBuilder {
    /// Adds one service path with its resolution string.
    #[must_use]
    pub fn with_service<P, V>(mut self, path: P, value: V) -> Self
    where
        P: Into<String>,
        V: Into<String>,
    {
        self.services.insert(path.into(), value.into());
        self
    }

    /// Replaces the whole service map.
    #[must_use]
    pub fn with_services(mut self, services: HashMap<String, String>) -> Self {
        self.services = services;
        self
    }

    /// Sets the discovery base path backends register under.
    #[must_use]
    pub fn with_base_path<S: Into<String>>(mut self, base_path: S) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Sets this process's own bound address (enables the `local` mode).
    #[must_use]
    pub fn with_local_address<S: Into<String>>(mut self, address: S) -> Self {
        self.local_address = Some(address.into());
        self
    }

    /// Sets the grace delay before a replaced client entry is closed.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Sets the default call timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets the push worker count (clamped to 1..=[`MAX_PUSH_WORKERS`]).
    #[must_use]
    pub fn with_push_workers(mut self, workers: usize) -> Self {
        self.push_workers = Some(workers);
        self
    }

    /// Sets the inbound push-message queue capacity.
    #[must_use]
    pub fn with_push_queue_capacity(mut self, capacity: usize) -> Self {
        self.push_queue_capacity = Some(capacity);
        self
    }

    /// Sets the watch configuration.
    #[must_use]
    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = Some(watch);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path is empty, a timeout is zero, or the
    /// push queue capacity is zero.
    pub fn build(self) -> Result<RouterConfig> {
        let base_path = self.base_path.unwrap_or_else(|| "rpc".to_owned());
        ensure!(
            !base_path.trim_matches('/').is_empty(),
            ConfigSnafu { message: "base_path cannot be empty" }
        );

        let grace_period = self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
        let call_timeout = self.call_timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        ensure!(!call_timeout.is_zero(), ConfigSnafu { message: "call_timeout cannot be zero" });

        let push_workers =
            self.push_workers.unwrap_or(DEFAULT_PUSH_WORKERS).clamp(1, MAX_PUSH_WORKERS);
        let push_queue_capacity = self.push_queue_capacity.unwrap_or(DEFAULT_PUSH_QUEUE_CAPACITY);
        ensure!(
            push_queue_capacity > 0,
            ConfigSnafu { message: "push_queue_capacity cannot be zero" }
        );

        let watch = self.watch.unwrap_or_default();
        watch.validate()?;

        Ok(RouterConfig {
            services: self.services,
            base_path: base_path.trim_end_matches('/').to_owned(),
            local_address: self.local_address,
            grace_period,
            call_timeout,
            push_workers,
            push_queue_capacity,
            watch,
        })
    }
}

/// Watch/backoff tuning for the store watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// First retry delay after a failed watch call.
    pub(crate) initial_backoff: Duration,

    /// Retry delay cap.
    pub(crate) max_backoff: Duration,

    /// Watch retry budget. `None` retries forever.
    pub(crate) max_retries: Option<u32>,

    /// Whether a "key not found" on the initial listing means
    /// "zero backends registered" rather than an error.
    pub(crate) allow_key_not_found: bool,

    /// How long a fan-out send waits for a slow subscriber.
    pub(crate) fanout_timeout: Duration,

    /// Buffered snapshots per watch subscription.
    pub(crate) subscriber_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries: None,
            allow_key_not_found: true,
            fanout_timeout: DEFAULT_FANOUT_TIMEOUT,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl WatchConfig {
    /// Sets the first retry delay.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the retry delay cap.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Sets the watch retry budget. `None` retries forever.
    #[must_use]
    pub fn with_max_retries(mut self, retries: Option<u32>) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets whether "key not found" on the initial listing is an error.
    #[must_use]
    pub fn with_allow_key_not_found(mut self, allow: bool) -> Self {
        self.allow_key_not_found = allow;
        self
    }

    /// Sets how long a fan-out send waits for a slow subscriber.
    #[must_use]
    pub fn with_fanout_timeout(mut self, timeout: Duration) -> Self {
        self.fanout_timeout = timeout;
        self
    }

    /// Sets the buffered snapshot count per subscription.
    #[must_use]
    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.initial_backoff.is_zero(),
            ConfigSnafu { message: "initial_backoff cannot be zero" }
        );
        ensure!(
            self.max_backoff >= self.initial_backoff,
            ConfigSnafu { message: "max_backoff cannot be below initial_backoff" }
        );
        ensure!(
            self.subscriber_buffer > 0,
            ConfigSnafu { message: "subscriber_buffer cannot be zero" }
        );
        Ok(())
    }
}

/// Connection parameters for the external store backing discovery.
///
/// Parsed from a URL of the form `redis://host:port?password=..&db=..`
/// as the surrounding application's configuration supplies it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreConfig {
    /// Store address as `host:port`.
    pub address: String,

    /// Optional authentication secret.
    pub password: Option<String>,

    /// Optional namespace/bucket selector.
    pub bucket: Option<String>,
}

impl StoreConfig {
    /// Parses store connection parameters from a URL string.
    ///
    /// The scheme is optional; query parameters `password` and `db` map to
    /// the auth secret and bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL has no host.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
        let (host, query) = match rest.split_once('?') {
            Some((host, query)) => (host, Some(query)),
            None => (rest, None),
        };
        ensure!(!host.is_empty(), ConfigSnafu { message: format!("store URL has no host: {url}") });

        let mut password = None;
        let mut bucket = None;
        if let Some(query) = query {
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("password", v)) if !v.is_empty() => password = Some(v.to_owned()),
                    Some(("db", v)) if !v.is_empty() => bucket = Some(v.to_owned()),
                    _ => {}
                }
            }
        }

        Ok(Self { address: host.to_owned(), password, bucket })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn builder_applies_defaults() {
        let config = RouterConfig::builder().build().expect("valid default config");

        assert_eq!(config.base_path(), "rpc");
        assert_eq!(config.grace_period(), DEFAULT_GRACE_PERIOD);
        assert_eq!(config.call_timeout(), DEFAULT_CALL_TIMEOUT);
        assert_eq!(config.push_workers, DEFAULT_PUSH_WORKERS);
        assert!(config.watch().max_retries.is_none());
    }

    #[test]
    fn builder_trims_trailing_slash_from_base_path() {
        let config = RouterConfig::builder().with_base_path("/game/").build().unwrap();
        assert_eq!(config.base_path(), "/game");
    }

    #[test]
    fn builder_rejects_empty_base_path() {
        let result = RouterConfig::builder().with_base_path("//").build();
        assert!(result.is_err());
    }

    #[test]
    fn push_workers_are_clamped() {
        let config = RouterConfig::builder().with_push_workers(100).build().unwrap();
        assert_eq!(config.push_workers, MAX_PUSH_WORKERS);

        let config = RouterConfig::builder().with_push_workers(0).build().unwrap();
        assert_eq!(config.push_workers, 1);
    }

    #[test]
    fn watch_config_rejects_inverted_backoff() {
        let watch = WatchConfig::default()
            .with_initial_backoff(Duration::from_secs(10))
            .with_max_backoff(Duration::from_secs(1));
        let result = RouterConfig::builder().with_watch(watch).build();
        assert!(result.is_err());
    }

    #[test]
    fn store_config_from_url_extracts_all_parts() {
        let store = StoreConfig::from_url("redis://10.0.0.5:6379?password=hunter2&db=13").unwrap();
        assert_eq!(store.address, "10.0.0.5:6379");
        assert_eq!(store.password.as_deref(), Some("hunter2"));
        assert_eq!(store.bucket.as_deref(), Some("13"));
    }

    #[test]
    fn store_config_from_url_without_scheme_or_query() {
        let store = StoreConfig::from_url("localhost:6379").unwrap();
        assert_eq!(store.address, "localhost:6379");
        assert!(store.password.is_none());
        assert!(store.bucket.is_none());
    }

    #[test]
    fn store_config_from_url_rejects_empty_host() {
        assert!(StoreConfig::from_url("redis://?db=1").is_err());
    }
}
