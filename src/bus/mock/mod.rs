//! Mock broker implementation for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Broker, BrokerChannel, BusError, DeliveryStream, InboundMessage, OutboundMessage, Result,
};

/// Mock broker for testing.
///
/// Every successful `connect` hands out the same `MockChannel`, reopened, so a
/// test can inspect what was declared and published across reconnects.
#[derive(Default)]
pub struct MockBroker {
    channel: Arc<MockChannel>,
    connect_calls: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of connect attempts made so far, failed ones included.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Arc<MockChannel> {
        Arc::clone(&self.channel)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let attempt = self.connect_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::Connection(format!(
                "Mock connect failure on attempt {}",
                attempt
            )));
        }

        self.channel.closed.store(false, Ordering::SeqCst);
        let channel: Arc<dyn BrokerChannel> = self.channel.clone();
        Ok(channel)
    }
}

/// In-memory channel recording declarations and publishes.
#[derive(Default)]
pub struct MockChannel {
    declared: RwLock<Vec<String>>,
    published: RwLock<Vec<(String, OutboundMessage)>>,
    consumers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Result<InboundMessage>>>>>,
    fail_on_publish: AtomicBool,
    fail_on_close: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    connection_releases: AtomicUsize,
}

impl MockChannel {
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_close(&self, fail: bool) {
        self.fail_on_close.store(fail, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Number of times the underlying connection was released by `close`.
    pub fn connection_releases(&self) -> usize {
        self.connection_releases.load(Ordering::SeqCst)
    }

    /// Simulate the broker dropping the connection (restart, heartbeat loss).
    ///
    /// Ends every consumer stream and marks the channel closed without going
    /// through `close`.
    pub async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.consumers.write().await.clear();
    }

    pub async fn declared(&self) -> Vec<String> {
        self.declared.read().await.clone()
    }

    pub async fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Number of live consumers on `queue`.
    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.consumers
            .read()
            .await
            .get(queue)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Push a message to every consumer of `queue`. Returns how many received it.
    pub async fn deliver(&self, queue: &str, message: InboundMessage) -> usize {
        self.push(queue, Ok(message)).await
    }

    /// Push a transport error to every consumer of `queue`.
    pub async fn deliver_error(&self, queue: &str, error: BusError) -> usize {
        self.push(queue, Err(error)).await
    }

    async fn push(&self, queue: &str, item: Result<InboundMessage>) -> usize {
        let consumers = self.consumers.read().await;
        let Some(senders) = consumers.get(queue) else {
            return 0;
        };

        senders
            .iter()
            .filter(|tx| tx.send(clone_item(&item)).is_ok())
            .count()
    }
}

fn clone_item(item: &Result<InboundMessage>) -> Result<InboundMessage> {
    match item {
        Ok(message) => Ok(message.clone()),
        Err(e) => Err(BusError::Consume(e.to_string())),
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut declared = self.declared.write().await;
        if !declared.iter().any(|q| q == queue) {
            declared.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }
        self.published
            .write()
            .await
            .push((queue.to_string(), message));
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        // Dropping the senders ends every consumer stream, as a real close would.
        self.consumers.write().await.clear();
        self.closed.store(true, Ordering::SeqCst);

        // `fail_on_close` models the channel close failing; the connection is
        // still released.
        let channel = if self.fail_on_close.load(Ordering::SeqCst) {
            Err(BusError::Close("Mock channel close failure".to_string()))
        } else {
            Ok(())
        };
        self.connection_releases.fetch_add(1, Ordering::SeqCst);
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_broker_fails_requested_attempts() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_channel_delivers_to_consumers() {
        let channel = MockChannel::default();
        let mut stream = channel.consume("replies").await.unwrap();

        let delivered = channel
            .deliver("replies", InboundMessage::new(b"{}".to_vec(), None))
            .await;
        assert_eq!(delivered, 1);

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.body, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_mock_channel_close_ends_consumers() {
        let channel = MockChannel::default();
        let mut stream = channel.consume("replies").await.unwrap();

        channel.close().await.unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(channel.consumer_count("replies").await, 0);
        assert_eq!(channel.close_calls(), 1);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_mock_channel_close_failure_still_releases_connection() {
        let channel = MockChannel::default();
        channel.set_fail_on_close(true);

        let result = channel.close().await;

        assert!(matches!(result, Err(BusError::Close(_))));
        assert_eq!(channel.connection_releases(), 1);
    }

    #[tokio::test]
    async fn test_mock_channel_kill_ends_consumers_without_close() {
        let broker = MockBroker::new();
        let channel = broker.channel();
        let mut stream = channel.consume("replies").await.unwrap();

        channel.kill().await;

        assert!(stream.next().await.is_none());
        assert!(!channel.is_open());
        assert_eq!(channel.close_calls(), 0);

        broker.connect().await.unwrap();
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_mock_channel_fail_on_publish() {
        let channel = MockChannel::default();
        channel.set_fail_on_publish(true);

        let result = channel
            .publish("q", OutboundMessage::new(b"{}".to_vec()))
            .await;

        assert!(matches!(result, Err(BusError::Publish(_))));
        assert_eq!(channel.published_count().await, 0);
    }
}
