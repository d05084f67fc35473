//! Messaging facade: RPC over queues and fire-and-forget notifications.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionManager, Session};
use super::correlator::{PendingRequests, ResponseHandler};
use crate::bus::{Broker, BusError, DeliveryStream, DispatchError, OutboundMessage, Result};
use crate::config::MessagingConfig;

/// Running reply consumer, bound to the connection generation it consumes on.
struct ReplyConsumer {
    generation: u64,
    handle: JoinHandle<()>,
}

type ConsumerRegistry = Arc<Mutex<HashMap<String, ReplyConsumer>>>;

/// Handle to the process-wide messaging component.
///
/// Construct once at startup and clone the handle into every call site; all
/// clones share one connection, one pending-request table and one reply
/// consumer per reply queue.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

struct Inner {
    config: MessagingConfig,
    connection: ConnectionManager,
    pending: Arc<PendingRequests>,
    reply_consumers: ConsumerRegistry,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MessagingService {
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection: ConnectionManager::new(broker, config.clone()),
                config,
                pending: Arc::new(PendingRequests::new()),
                reply_consumers: Arc::new(Mutex::new(HashMap::new())),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Service backed by RabbitMQ at `config.url`.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: MessagingConfig) -> Self {
        let broker = crate::bus::AmqpBroker::new(config.url.clone());
        Self::new(Arc::new(broker), config)
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.inner.config
    }

    /// Connect to the broker if not already connected.
    pub async fn ensure_ready(&self) -> Result<()> {
        self.inner.connection.ensure_ready().await.map(|_| ())
    }

    /// Whether the service holds an open broker channel.
    ///
    /// Waits behind a connect that is still retrying, so it can take up to
    /// `(connect_attempts - 1) * connect_retry_delay` to answer.
    pub async fn is_ready(&self) -> bool {
        self.inner.connection.is_ready().await
    }

    /// Send `payload` to `request_queue` and route the reply to `on_response`.
    ///
    /// Returns the correlation id once the request has been handed to the
    /// broker. If no reply arrives within `rpc_timeout` the entry is evicted
    /// and the handler dropped without being called.
    ///
    /// `on_response` runs at most once, inline on the consumer task for
    /// `reply_queue`. That task dispatches replies one at a time, so a handler
    /// that blocks or does heavy work delays every other reply on the same
    /// queue. Hand such work off with `tokio::spawn` or a channel.
    pub async fn request_rpc<T, F>(
        &self,
        request_queue: &str,
        reply_queue: &str,
        payload: &T,
        on_response: F,
    ) -> Result<String>
    where
        T: Serialize + ?Sized,
        F: FnOnce(Value) + Send + 'static,
    {
        let session = self.inner.connection.ensure_ready().await?;
        let channel = &session.channel;
        channel.declare_queue(request_queue).await?;
        channel.declare_queue(reply_queue).await?;
        self.ensure_reply_consumer(&session, reply_queue).await?;

        let body = serde_json::to_vec(payload)?;
        let handler: ResponseHandler = Box::new(on_response);
        let correlation_id = self
            .inner
            .pending
            .register(handler, self.inner.config.rpc_timeout())
            .await;

        let message = OutboundMessage::request(body, correlation_id.clone(), reply_queue);
        if let Err(e) = channel.publish(request_queue, message).await {
            self.inner.pending.cancel(&correlation_id).await;
            return Err(e);
        }

        debug!(
            request_queue = %request_queue,
            reply_queue = %reply_queue,
            correlation_id = %correlation_id,
            "Sent RPC request"
        );
        Ok(correlation_id)
    }

    /// Send a request and wait for its reply, up to `rpc_timeout`.
    pub async fn request<T>(
        &self,
        request_queue: &str,
        reply_queue: &str,
        payload: &T,
    ) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        let correlation_id = self
            .request_rpc(request_queue, reply_queue, payload, move |response| {
                let _ = tx.send(response);
            })
            .await?;

        match tokio::time::timeout(self.inner.config.rpc_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            // Err(_) from rx means the sweeper evicted the entry first.
            Ok(Err(_)) | Err(_) => {
                self.inner.pending.cancel(&correlation_id).await;
                warn!(
                    request_queue = %request_queue,
                    correlation_id = %correlation_id,
                    "RPC request timed out"
                );
                Err(BusError::Timeout(correlation_id))
            }
        }
    }

    /// Publish `payload` to `queue` with no reply expected.
    ///
    /// Success means the broker accepted the message, nothing more.
    pub async fn publish_notification<T>(&self, queue: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let channel = self.inner.connection.ensure_ready().await?.channel;
        channel.declare_queue(queue).await?;

        let body = serde_json::to_vec(payload)?;
        channel.publish(queue, OutboundMessage::new(body)).await?;

        debug!(queue = %queue, "Published notification");
        Ok(())
    }

    /// Publish to the configured notifications queue.
    pub async fn notify<T>(&self, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish_notification(&self.inner.config.notifications_queue, payload)
            .await
    }

    /// Evict pending requests past their deadline. Returns how many were evicted.
    pub async fn sweep_expired(&self) -> usize {
        self.inner.pending.sweep_expired().await
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }

    /// Stop reply consumers and the sweeper, then release the connection.
    ///
    /// Never fails. Pending requests stay registered and expire normally.
    /// A close issued during a retrying connect waits for that connect to
    /// finish, up to `(connect_attempts - 1) * connect_retry_delay`.
    pub async fn close(&self) {
        for (queue, consumer) in self.inner.reply_consumers.lock().await.drain() {
            consumer.handle.abort();
            debug!(queue = %queue, "Stopped reply consumer");
        }
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        self.inner.connection.close().await;
    }

    /// Start a consumer on `reply_queue` unless one is already running on
    /// this session's connection.
    async fn ensure_reply_consumer(&self, session: &Session, reply_queue: &str) -> Result<()> {
        let mut consumers = self.inner.reply_consumers.lock().await;
        if let Some(existing) = consumers.get(reply_queue) {
            if existing.generation == session.generation && !existing.handle.is_finished() {
                return Ok(());
            }
        }
        // Left over from a connection that has since been replaced.
        if let Some(stale) = consumers.remove(reply_queue) {
            stale.handle.abort();
        }

        let stream = session.channel.consume(reply_queue).await?;
        let handle = tokio::spawn(consume_replies(
            reply_queue.to_string(),
            session.generation,
            stream,
            Arc::clone(&self.inner.pending),
            Arc::clone(&self.inner.reply_consumers),
        ));
        consumers.insert(
            reply_queue.to_string(),
            ReplyConsumer {
                generation: session.generation,
                handle,
            },
        );
        drop(consumers);

        info!(
            queue = %reply_queue,
            generation = session.generation,
            "Registered reply consumer"
        );
        self.ensure_sweeper().await;
        Ok(())
    }

    async fn ensure_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let interval = self.inner.config.sweep_interval();
        if interval.is_zero() {
            warn!("sweep_interval_ms is 0, background expiry sweep disabled");
            return;
        }

        let pending = Arc::clone(&self.inner.pending);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = pending.sweep_expired().await;
                if evicted > 0 {
                    warn!(evicted, "Evicted expired RPC requests");
                }
            }
        }));
    }
}

/// Reply consumer loop. Per-message failures are logged and skipped.
async fn consume_replies(
    queue: String,
    generation: u64,
    mut stream: DeliveryStream,
    pending: Arc<PendingRequests>,
    registry: ConsumerRegistry,
) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(message) => match pending.dispatch(message).await {
                Ok(()) => {}
                Err(e @ DispatchError::UnknownCorrelationId(_)) => {
                    debug!(queue = %queue, error = %e, "Dropped unmatched reply");
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to dispatch reply");
                }
            },
            Err(e) => {
                error!(queue = %queue, error = %e, "Reply consumer delivery error");
            }
        }
    }

    info!(queue = %queue, generation, "Reply consumer stream ended");
    let mut consumers = registry.lock().await;
    if consumers
        .get(&queue)
        .is_some_and(|consumer| consumer.generation == generation)
    {
        consumers.remove(&queue);
    }
}
