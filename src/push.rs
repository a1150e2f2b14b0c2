//! Worker pool draining server-initiated push messages.
//!
//! Transports that support pushes feed inbound messages into a bounded
//! queue; a fixed pool of workers drains it and redispatches each message
//! into the local handler registry. A panicking handler is recovered per
//! message, so one bad push cannot take a worker down.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    RouteError,
    registry::{HandlerRegistry, Request},
    transport::Metadata,
};

/// One server-initiated push as the transport delivers it.
#[derive(Debug, Clone)]
pub struct PushMessage {
    /// Logical service the push targets.
    pub service_path: String,

    /// Method within the service.
    pub service_method: String,

    /// Opaque payload.
    pub payload: Bytes,

    /// Push metadata.
    pub metadata: Metadata,
}

/// Fixed pool of workers redispatching pushes into the handler registry.
///
/// Activated by the router only when at least one handler is registered.
#[derive(Debug)]
pub struct PushPool {
    tx: mpsc::Sender<PushMessage>,
    cancel: CancellationToken,
}

impl PushPool {
    /// Starts `workers` workers draining a queue of the given capacity.
    #[must_use]
    pub fn start(registry: Arc<HandlerRegistry>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        for worker in 0..workers {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&registry),
                Arc::clone(&rx),
                cancel.clone(),
            ));
        }
        tracing::debug!(workers, capacity, "push worker pool started");

        Self { tx, cancel }
    }

    /// Returns the inbound queue handle for transports to feed.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<PushMessage> {
        self.tx.clone()
    }

    /// Signals every worker to exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn worker_loop(
    worker: usize,
    registry: Arc<HandlerRegistry>,
    rx: Arc<Mutex<mpsc::Receiver<PushMessage>>>,
    cancel: CancellationToken,
) {
    loop {
        // Hold the receiver lock only while waiting for one message so the
        // pool shares a single queue.
        let message = {
            let mut rx = rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => None,
                message = rx.recv() => message,
            }
        };
        let Some(message) = message else {
            tracing::debug!(worker, "push worker stopping");
            return;
        };

        let request = Request {
            service_path: message.service_path,
            service_method: message.service_method,
            payload: message.payload,
            metadata: message.metadata,
        };
        match registry.invoke(request) {
            Ok(_) => {}
            Err(RouteError::MethodNotFound { service_path, service_method }) => {
                tracing::warn!(
                    worker,
                    service_path = %service_path,
                    service_method = %service_method,
                    "push message has no registered handler, dropped"
                );
            }
            Err(error) => {
                tracing::warn!(worker, error = %error, "push handler failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn message(path: &str, method: &str, payload: &'static [u8]) -> PushMessage {
        PushMessage {
            service_path: path.to_owned(),
            service_method: method.to_owned(),
            payload: Bytes::from_static(payload),
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn pushes_reach_their_handler() {
        let registry = Arc::new(HandlerRegistry::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        registry.register_function("events", "on_update", move |req: Request| {
            seen_tx.send(req.payload).ok();
            Ok(Bytes::new())
        });

        let pool = PushPool::start(Arc::clone(&registry), 2, 16);
        pool.sender().send(message("events", "on_update", b"first")).await.unwrap();
        pool.sender().send(message("events", "on_update", b"second")).await.unwrap();

        let mut payloads = vec![
            seen_rx.recv().await.unwrap(),
            seen_rx.recv().await.unwrap(),
        ];
        payloads.sort();
        assert_eq!(payloads, vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);

        pool.shutdown();
    }

    #[tokio::test]
    async fn panicking_handler_does_not_kill_the_worker() {
        let registry = Arc::new(HandlerRegistry::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        registry.register_function("events", "boom", |_| panic!("push handler exploded"));
        registry.register_function("events", "ok", move |req: Request| {
            seen_tx.send(req.payload).ok();
            Ok(Bytes::new())
        });

        // One worker: the panic and the follow-up land on the same worker.
        let pool = PushPool::start(Arc::clone(&registry), 1, 16);
        pool.sender().send(message("events", "boom", b"")).await.unwrap();
        pool.sender().send(message("events", "ok", b"survived")).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .expect("worker survived the panic")
            .unwrap();
        assert_eq!(delivered, Bytes::from_static(b"survived"));

        pool.shutdown();
    }

    #[tokio::test]
    async fn unmatched_pushes_are_dropped() {
        let registry = Arc::new(HandlerRegistry::new());
        let pool = PushPool::start(Arc::clone(&registry), 1, 4);

        // Nothing registered: the message is logged and dropped, the pool
        // keeps accepting.
        pool.sender().send(message("events", "nobody", b"")).await.unwrap();
        pool.sender().send(message("events", "nobody", b"")).await.unwrap();

        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_eventually() {
        let registry = Arc::new(HandlerRegistry::new());
        let pool = PushPool::start(registry, 2, 4);
        pool.shutdown();

        // Workers exit; the queue may still accept until they drop, so only
        // assert the shutdown signal itself is idempotent.
        pool.shutdown();
    }
}
