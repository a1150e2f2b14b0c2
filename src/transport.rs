//! Transport collaborator contracts and the in-process fast path.
//!
//! Everything downstream of a resolved backend — wire encoding, sockets,
//! payload (de)serialization — lives behind [`Transport`] and
//! [`TransportFactory`]. The routing core hands a factory a resolved
//! discovery view plus a selection policy and gets back a callable handle.
//!
//! The one transport implemented here is [`InProcessTransport`]: it
//! short-circuits calls straight into the local handler registry with no
//! socket and no serialization beyond what the handler itself performs.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DEFAULT_CALL_TIMEOUT,
    discovery::ServiceDiscovery,
    error::Result,
    push::PushMessage,
    registry::{HandlerRegistry, Request},
    resolution::SelectionPolicy,
};

/// Call and backend metadata: opaque string key/value pairs.
pub type Metadata = HashMap<String, String>;

/// Per-call options: deadline, cancellation, and metadata-borne hints.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for this call. `None` falls back to the transport default.
    pub timeout: Option<Duration>,

    /// Cancellation signal. A cancelled in-flight call is not retried.
    pub cancel: Option<CancellationToken>,

    /// Call metadata, including routing hints.
    pub metadata: Metadata,
}

impl CallOptions {
    /// Creates empty call options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the call deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Replaces the call metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata_entry<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Failure handling the transport applies across backend attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverPolicy {
    /// Retry the call on another backend.
    #[default]
    Failover,
    /// Retry the call on the same backend.
    Failtry,
    /// Fail immediately.
    Failfast,
}

/// Options handed to the transport factory.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Default call timeout when a call carries no deadline.
    pub timeout: Duration,

    /// Inbound queue for server-initiated pushes, when the application
    /// registered push handlers. Transports that support pushes feed it.
    pub push: Option<mpsc::Sender<PushMessage>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self { timeout: DEFAULT_CALL_TIMEOUT, push: None }
    }
}

/// A callable handle for one resolved service.
///
/// Implementations are supplied by the transport collaborator, except for
/// [`InProcessTransport`]. All methods take [`CallOptions`] so every blocking
/// operation accepts a deadline/cancellation signal.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Unary call: one request, one reply.
    async fn call(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<Bytes>;

    /// Delivers the request to every known backend.
    async fn broadcast(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<()>;

    /// Fire-and-forget: dispatches the request without waiting for a reply.
    fn go(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<()>;

    /// Releases the handle. Calls already in flight may still complete.
    async fn close(&self) -> Result<()>;
}

/// Builds transport handles from resolved discovery views.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Creates a transport for one service path.
    ///
    /// # Errors
    ///
    /// Returns whatever the collaborator considers a construction failure,
    /// passed through verbatim.
    fn new_transport(
        &self,
        service_path: &str,
        failover: FailoverPolicy,
        selection: SelectionPolicy,
        discovery: Arc<dyn ServiceDiscovery>,
        options: &TransportOptions,
    ) -> Result<Arc<dyn Transport>>;
}

/// Transport that dispatches directly into the local handler registry.
pub struct InProcessTransport {
    service_path: String,
    registry: Arc<HandlerRegistry>,
}

impl fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessTransport").field("service_path", &self.service_path).finish()
    }
}

impl InProcessTransport {
    /// Creates an in-process transport for one service path.
    #[must_use]
    pub fn new<S: Into<String>>(service_path: S, registry: Arc<HandlerRegistry>) -> Self {
        Self { service_path: service_path.into(), registry }
    }

    fn request(&self, method: &str, payload: Bytes, opts: &CallOptions) -> Request {
        Request {
            service_path: self.service_path.clone(),
            service_method: method.to_owned(),
            payload,
            metadata: opts.metadata.clone(),
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn call(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<Bytes> {
        if opts.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(crate::RouteError::Cancelled);
        }
        self.registry.invoke(self.request(method, payload, &opts))
    }

    async fn broadcast(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<()> {
        // This process is the only member, so a broadcast is one local call.
        self.call(method, payload, opts).await.map(|_| ())
    }

    fn go(&self, method: &str, payload: Bytes, opts: CallOptions) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let request = self.request(method, payload, &opts);
        tokio::spawn(async move {
            if let Err(error) = registry.invoke(request) {
                tracing::debug!(error = %error, "in-process fire-and-forget failed");
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
