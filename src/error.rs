//! Routing error types with retryability classification.
//!
//! Provides a two-tier error model:
//! - **Resolution errors**: Unclassifiable configuration, missing services, no
//!   live backend for a discovery-mode lookup
//! - **Runtime errors**: Store outages, transport failures, handler faults
//!
//! Errors include retryability classification so callers can distinguish
//! "try again" conditions (a momentarily empty backend set) from fatal ones
//! (a malformed resolution string).

use snafu::Snafu;

/// Result type alias for routing operations.
pub type Result<T> = std::result::Result<T, RouteError>;

/// Routing and discovery error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RouteError {
    /// Configuration could not be classified or validated.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// No backend is currently available for the service.
    ///
    /// Surfaced when a discovery-mode selection finds an empty candidate
    /// list. Retryable: the watcher may deliver backends at any moment.
    #[snafu(display("No backend available for service '{service_path}'"))]
    NoBackend {
        /// The service path that failed to resolve.
        service_path: String,
    },

    /// No client entry exists for the requested service path.
    #[snafu(display("Service not found: {service_path}"))]
    ServiceNotFound {
        /// The unknown service path.
        service_path: String,
    },

    /// No handler is registered for the requested method.
    #[snafu(display("Method not found: {service_path}/{service_method}"))]
    MethodNotFound {
        /// Service path of the request.
        service_path: String,
        /// Method that has no registered handler.
        service_method: String,
    },

    /// The client wrapper was started twice.
    #[snafu(display("Client already started: {service_path}"))]
    AlreadyStarted {
        /// Service path of the doubly-started client.
        service_path: String,
    },

    /// The external store rejected a list or watch call.
    ///
    /// Absorbed by the watcher's retry loop during normal operation; only
    /// surfaced to callers when the initial listing fails outright.
    #[snafu(display("Store unavailable: {message}"))]
    StoreUnavailable {
        /// Error description from the store.
        message: String,
    },

    /// Opaque error from the transport collaborator, passed through verbatim.
    #[snafu(display("Transport error: {source}"))]
    Transport {
        /// Underlying transport error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A registered handler returned a failure or panicked.
    #[snafu(display("Handler error: {message}"))]
    Handler {
        /// Failure or panic description.
        message: String,
    },

    /// The call was cancelled before completion.
    #[snafu(display("Call cancelled"))]
    Cancelled,

    /// The router or watcher is shut down.
    #[snafu(display("Router is closed"))]
    Closed,
}

impl RouteError {
    /// Returns true if the operation may succeed when retried by the caller.
    ///
    /// Retryable:
    /// - `NoBackend`: the discovery snapshot may repopulate at any moment
    /// - `StoreUnavailable`: the watcher keeps reconnecting in the background
    ///
    /// Non-retryable: configuration problems, unknown services/methods,
    /// double starts, shutdown, and cancellation. `Transport` errors are
    /// opaque passthroughs; this layer cannot judge them, so they are not
    /// retried here — the transport's own failover policy already applied.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoBackend { .. } => true,
            Self::StoreUnavailable { .. } => true,
            Self::Config { .. }
            | Self::ServiceNotFound { .. }
            | Self::MethodNotFound { .. }
            | Self::AlreadyStarted { .. }
            | Self::Transport { .. }
            | Self::Handler { .. }
            | Self::Cancelled
            | Self::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backend_is_retryable() {
        let err = RouteError::NoBackend { service_path: "orders".to_owned() };
        assert!(err.is_retryable());
    }

    #[test]
    fn store_unavailable_is_retryable() {
        let err = RouteError::StoreUnavailable { message: "connection refused".to_owned() };
        assert!(err.is_retryable());
    }

    #[test]
    fn config_error_not_retryable() {
        let err = RouteError::Config { message: "empty resolution string".to_owned() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn already_started_not_retryable() {
        let err = RouteError::AlreadyStarted { service_path: "orders".to_owned() };
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_error_passes_message_through() {
        let inner = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = RouteError::Transport { source: Box::new(inner) };
        assert!(err.to_string().contains("pipe closed"));
        assert!(!err.is_retryable());
    }
}
