//! Pending request table for request/reply over queues.
//!
//! Each in-flight request is keyed by a UUIDv4 correlation id. A reply is
//! routed by that id alone, so replies may arrive in any order.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::bus::{DispatchError, InboundMessage};

/// Continuation invoked with the deserialized reply body.
pub type ResponseHandler = Box<dyn FnOnce(Value) + Send + 'static>;

struct PendingEntry {
    handler: ResponseHandler,
    expires_at: Instant,
}

/// Correlation id to handler map.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handler under a fresh correlation id and return the id.
    pub async fn register(&self, handler: ResponseHandler, ttl: Duration) -> String {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let entry = PendingEntry {
            handler,
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .lock()
            .await
            .insert(correlation_id.clone(), entry);
        correlation_id
    }

    /// Route one reply to its handler.
    ///
    /// The entry is removed before the handler runs, so a handler is invoked at
    /// most once no matter how many copies of the reply arrive. A malformed body
    /// fails only this message; the pending entry stays in place.
    pub async fn dispatch(&self, message: InboundMessage) -> Result<(), DispatchError> {
        let correlation_id = message
            .correlation_id
            .ok_or(DispatchError::MissingCorrelationId)?;

        let response: Value = serde_json::from_slice(&message.body).map_err(|source| {
            DispatchError::MalformedBody {
                correlation_id: correlation_id.clone(),
                source,
            }
        })?;

        let entry = self.entries.lock().await.remove(&correlation_id);
        let Some(entry) = entry else {
            return Err(DispatchError::UnknownCorrelationId(correlation_id));
        };

        debug!(correlation_id = %correlation_id, "Dispatching reply");
        catch_unwind(AssertUnwindSafe(move || (entry.handler)(response)))
            .map_err(|_| DispatchError::HandlerPanicked(correlation_id))
    }

    /// Drop a pending entry without invoking it. Returns whether it existed.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        self.entries.lock().await.remove(correlation_id).is_some()
    }

    /// Evict every entry whose deadline has passed. Returns how many were evicted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn contains(&self, correlation_id: &str) -> bool {
        self.entries.lock().await.contains_key(correlation_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    const TTL: Duration = Duration::from_secs(30);

    fn recording_handler() -> (ResponseHandler, Arc<StdMutex<Vec<Value>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = received.clone();
        let handler: ResponseHandler = Box::new(move |value| sink.lock().unwrap().push(value));
        (handler, received)
    }

    #[tokio::test]
    async fn test_dispatch_invokes_matching_handler_once() {
        let pending = PendingRequests::new();
        let (handler, received) = recording_handler();
        let id = pending.register(handler, TTL).await;

        let reply = InboundMessage::reply(&id, &json!({"b": 2}));
        pending.dispatch(reply.clone()).await.unwrap();
        let second = pending.dispatch(reply).await;

        assert_eq!(*received.lock().unwrap(), vec![json!({"b": 2})]);
        assert!(matches!(second, Err(DispatchError::UnknownCorrelationId(_))));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_id_invokes_nothing() {
        let pending = PendingRequests::new();
        let (handler, received) = recording_handler();
        let id = pending.register(handler, TTL).await;

        let result = pending
            .dispatch(InboundMessage::reply("never-issued", &json!({})))
            .await;

        assert!(matches!(result, Err(DispatchError::UnknownCorrelationId(ref s)) if s == "never-issued"));
        assert!(received.lock().unwrap().is_empty());
        assert!(pending.contains(&id).await);
    }

    #[tokio::test]
    async fn test_dispatch_missing_correlation_id() {
        let pending = PendingRequests::new();
        let result = pending
            .dispatch(InboundMessage::new(b"{}".to_vec(), None))
            .await;
        assert!(matches!(result, Err(DispatchError::MissingCorrelationId)));
    }

    #[tokio::test]
    async fn test_malformed_body_keeps_entry() {
        let pending = PendingRequests::new();
        let (handler, received) = recording_handler();
        let id = pending.register(handler, TTL).await;

        let result = pending
            .dispatch(InboundMessage::new(b"not json".to_vec(), Some(id.clone())))
            .await;

        assert!(matches!(result, Err(DispatchError::MalformedBody { .. })));
        assert!(pending.contains(&id).await);

        pending
            .dispatch(InboundMessage::reply(&id, &json!("late but fine")))
            .await
            .unwrap();
        assert_eq!(*received.lock().unwrap(), vec![json!("late but fine")]);
    }

    #[tokio::test]
    async fn test_replies_route_by_id_in_any_order() {
        let pending = PendingRequests::new();
        let (first, first_rx) = recording_handler();
        let (second, second_rx) = recording_handler();
        let first_id = pending.register(first, TTL).await;
        let second_id = pending.register(second, TTL).await;
        assert_ne!(first_id, second_id);

        pending
            .dispatch(InboundMessage::reply(&second_id, &json!(2)))
            .await
            .unwrap();
        pending
            .dispatch(InboundMessage::reply(&first_id, &json!(1)))
            .await
            .unwrap();

        assert_eq!(*first_rx.lock().unwrap(), vec![json!(1)]);
        assert_eq!(*second_rx.lock().unwrap(), vec![json!(2)]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let pending = PendingRequests::new();
        let id = pending
            .register(Box::new(|_| panic!("handler blew up")), TTL)
            .await;

        let result = pending.dispatch(InboundMessage::reply(&id, &json!({}))).await;

        assert!(matches!(result, Err(DispatchError::HandlerPanicked(_))));
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancel_removes_without_invoking() {
        let pending = PendingRequests::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = pending
            .register(
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                TTL,
            )
            .await;

        assert!(pending.cancel(&id).await);
        assert!(!pending.cancel(&id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_expired_entries() {
        let pending = PendingRequests::new();
        let (short, _) = recording_handler();
        let (long, _) = recording_handler();
        let short_id = pending.register(short, Duration::from_millis(100)).await;
        let long_id = pending.register(long, Duration::from_secs(10)).await;

        tokio::time::advance(Duration::from_millis(200)).await;

        assert_eq!(pending.sweep_expired().await, 1);
        assert!(!pending.contains(&short_id).await);
        assert!(pending.contains(&long_id).await);
    }
}
