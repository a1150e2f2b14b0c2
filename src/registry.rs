//! Local handler registry for in-process calls and server pushes.
//!
//! Handlers are registered once, as either a plain function or a service
//! object covering every method of one service path, and invoked through a
//! single seam chosen at registration time. Invocation recovers from handler
//! panics so one faulty handler cannot take down a push worker or an
//! in-process caller.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;

use crate::{
    error::{HandlerSnafu, MethodNotFoundSnafu, Result},
    transport::Metadata,
};

/// One inbound request as the dispatch layer sees it.
#[derive(Debug, Clone)]
pub struct Request {
    /// Logical service the request targets.
    pub service_path: String,

    /// Method within the service.
    pub service_method: String,

    /// Opaque payload; (de)serialization is the handler's business.
    pub payload: Bytes,

    /// Request metadata.
    pub metadata: Metadata,
}

/// A function handler for one (service, method) pair.
pub type HandlerFn = dyn Fn(Request) -> Result<Bytes> + Send + Sync;

/// A service object handling every method of one service path.
pub trait ServiceHandler: Send + Sync {
    /// Handles one request for the given method.
    fn call(&self, method: &str, request: Request) -> Result<Bytes>;
}

/// Registry of local handlers, keyed by service path and method.
///
/// Function handlers take precedence over a service object registered for
/// the same path.
#[derive(Default)]
pub struct HandlerRegistry {
    functions: DashMap<(String, String), Arc<HandlerFn>>,
    services: DashMap<String, Arc<dyn ServiceHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("functions", &self.functions.len())
            .field("services", &self.services.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function handler for one (service, method) pair.
    pub fn register_function<P, M, F>(&self, service_path: P, service_method: M, handler: F)
    where
        P: Into<String>,
        M: Into<String>,
        F: Fn(Request) -> Result<Bytes> + Send + Sync + 'static,
    {
        self.functions.insert((service_path.into(), service_method.into()), Arc::new(handler));
    }

    /// Registers a service object handling every method of one service path.
    pub fn register_service<P>(&self, service_path: P, handler: Arc<dyn ServiceHandler>)
    where
        P: Into<String>,
    {
        self.services.insert(service_path.into(), handler);
    }

    /// Returns true if no handler is registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.services.is_empty()
    }

    /// Returns true if any handler covers the given service path.
    #[must_use]
    pub fn has_service(&self, service_path: &str) -> bool {
        self.services.contains_key(service_path)
            || self.functions.iter().any(|entry| entry.key().0 == service_path)
    }

    /// Dispatches one request to its registered handler.
    ///
    /// A panicking handler is caught and reported as a handler error; the
    /// caller (push worker or in-process transport) stays alive.
    ///
    /// # Errors
    ///
    /// Returns `MethodNotFound` when nothing matches, or the handler's own
    /// failure.
    pub fn invoke(&self, request: Request) -> Result<Bytes> {
        let key = (request.service_path.clone(), request.service_method.clone());
        if let Some(handler) = self.functions.get(&key).map(|h| Arc::clone(h.value())) {
            return invoke_recovering(&request, move |req| (handler.as_ref())(req));
        }

        if let Some(service) = self.services.get(&request.service_path).map(|s| Arc::clone(s.value()))
        {
            let method = request.service_method.clone();
            return invoke_recovering(&request, move |req| service.call(&method, req));
        }

        MethodNotFoundSnafu {
            service_path: request.service_path,
            service_method: request.service_method,
        }
        .fail()
    }
}

/// Runs one handler, converting a panic into a handler error.
fn invoke_recovering<F>(request: &Request, handler: F) -> Result<Bytes>
where
    F: FnOnce(Request) -> Result<Bytes>,
{
    let service_path = request.service_path.clone();
    let service_method = request.service_method.clone();
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(request.clone()))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            tracing::warn!(
                service_path = %service_path,
                service_method = %service_method,
                panic = %message,
                "handler panicked"
            );
            HandlerSnafu { message: format!("handler panicked: {message}") }.fail()
        }
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request(path: &str, method: &str) -> Request {
        Request {
            service_path: path.to_owned(),
            service_method: method.to_owned(),
            payload: Bytes::from_static(b"ping"),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn function_handler_round_trip() {
        let registry = HandlerRegistry::new();
        registry.register_function("echo", "say", |req: Request| Ok(req.payload));

        let reply = registry.invoke(request("echo", "say")).unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[test]
    fn service_handler_receives_method_name() {
        struct Echo;
        impl ServiceHandler for Echo {
            fn call(&self, method: &str, _request: Request) -> Result<Bytes> {
                Ok(Bytes::from(method.to_owned()))
            }
        }

        let registry = HandlerRegistry::new();
        registry.register_service("echo", Arc::new(Echo));

        let reply = registry.invoke(request("echo", "shout")).unwrap();
        assert_eq!(reply, Bytes::from_static(b"shout"));
    }

    #[test]
    fn function_takes_precedence_over_service() {
        struct Fallback;
        impl ServiceHandler for Fallback {
            fn call(&self, _method: &str, _request: Request) -> Result<Bytes> {
                Ok(Bytes::from_static(b"service"))
            }
        }

        let registry = HandlerRegistry::new();
        registry.register_service("echo", Arc::new(Fallback));
        registry.register_function("echo", "say", |_| Ok(Bytes::from_static(b"function")));

        assert_eq!(registry.invoke(request("echo", "say")).unwrap(), Bytes::from_static(b"function"));
        assert_eq!(
            registry.invoke(request("echo", "other")).unwrap(),
            Bytes::from_static(b"service")
        );
    }

    #[test]
    fn unmatched_request_is_method_not_found() {
        let registry = HandlerRegistry::new();
        let err = registry.invoke(request("echo", "say")).unwrap_err();
        assert!(err.to_string().contains("echo/say"));
    }

    #[test]
    fn panicking_handler_is_recovered() {
        let registry = HandlerRegistry::new();
        registry.register_function("echo", "boom", |_| panic!("kaboom"));

        let err = registry.invoke(request("echo", "boom")).unwrap_err();
        assert!(err.to_string().contains("kaboom"));

        // Registry still serves other handlers afterwards.
        registry.register_function("echo", "say", |req: Request| Ok(req.payload));
        assert!(registry.invoke(request("echo", "say")).is_ok());
    }

    #[test]
    fn has_service_sees_both_kinds() {
        struct Noop;
        impl ServiceHandler for Noop {
            fn call(&self, _method: &str, _request: Request) -> Result<Bytes> {
                Ok(Bytes::new())
            }
        }

        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register_function("a", "m", |_| Ok(Bytes::new()));
        registry.register_service("b", Arc::new(Noop));

        assert!(registry.has_service("a"));
        assert!(registry.has_service("b"));
        assert!(!registry.has_service("c"));
        assert!(!registry.is_empty());
    }
}
