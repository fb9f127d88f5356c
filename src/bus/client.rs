use crate::bus::broker::{Delivery, MemoryBroker, OverflowPolicy, Queue};
use crate::bus::envelope::Envelope;
use crate::bus::routing::BusExchange;
use crate::bus::BusError;
use chrono::Utc;
use futures_util::future::BoxFuture;
use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-client bus settings; defaults mirror the broker contract.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Component tag stamped into every envelope's `source`.
    pub source: String,
    /// Bounded in-memory buffer used while the broker is unreachable.
    pub publish_buffer: usize,
    /// Handler retries before a message is dead-lettered.
    pub max_retries: u32,
    /// Backoff per retry attempt; the last entry repeats.
    pub retry_backoff: Vec<Duration>,
    /// Default request/response timeout.
    pub request_timeout: Duration,
    /// Cap for the reconnect/flush backoff.
    pub reconnect_max_backoff: Duration,
}

impl BusConfig {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            publish_buffer: 10_000,
            max_retries: 3,
            retry_backoff: vec![
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(5),
            ],
            request_timeout: Duration::from_secs(5),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}

/// How a handler failed. Retryable failures re-enter the backoff loop;
/// fatal ones (malformed envelope, schema violation) go straight to the DLQ.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("retryable: {0}")]
    Retry(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;
pub type Handler = Arc<dyn Fn(Delivery) -> HandlerFuture + Send + Sync>;

/// Box an async closure into a subscription handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |d| Box::pin(f(d)))
}

/// Declarative description of a consumer queue and its bindings.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub queue: String,
    pub bindings: Vec<(BusExchange, String)>,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    pub prefetch: usize,
}

impl Subscription {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            bindings: Vec::new(),
            capacity: 1_000,
            overflow: OverflowPolicy::Reject,
            prefetch: 10,
        }
    }

    pub fn bind(mut self, exchange: BusExchange, pattern: &str) -> Self {
        self.bindings.push((exchange, pattern.to_string()));
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// High-rate streams keep the newest messages instead of blocking.
    pub fn drop_oldest(mut self) -> Self {
        self.overflow = OverflowPolicy::DropOldest;
        self
    }
}

/// Running consumer; aborting it stops both the pump and the worker task.
pub struct SubscriptionHandle {
    pub queue: Arc<Queue>,
    pump: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn abort(&self) {
        self.pump.abort();
        self.worker.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker accepted the message into `n` queues.
    Confirmed(usize),
    /// Broker unreachable; the message sits in the client buffer.
    Buffered,
}

/// Typed access to the fabric for one component. Cheap to clone via `Arc`.
pub struct BusClient {
    broker: Arc<MemoryBroker>,
    cfg: BusConfig,
    pending: Mutex<VecDeque<(BusExchange, String, Envelope)>>,
}

impl BusClient {
    pub fn new(broker: Arc<MemoryBroker>, cfg: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            broker,
            cfg,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub fn source(&self) -> &str {
        &self.cfg.source
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Build an envelope stamped with this client's source tag.
    pub fn envelope(&self, correlation_id: Option<Uuid>, payload: serde_json::Value) -> Envelope {
        Envelope::new(&self.cfg.source, correlation_id, payload)
    }

    /// Publish with outage buffering: while the broker is down, messages
    /// queue locally (bounded) and flush in order on recovery. A full buffer
    /// fails the publish with `Unavailable`.
    pub async fn publish(
        &self,
        exchange: BusExchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<PublishOutcome, BusError> {
        if self.broker.is_available() {
            self.flush_pending().await;
            if self.broker.is_available() {
                match self
                    .broker
                    .publish(exchange, routing_key, envelope.clone())
                    .await
                {
                    Ok(n) => return Ok(PublishOutcome::Confirmed(n)),
                    Err(BusError::Unavailable) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut pending = self.pending.lock().await;
        if pending.len() >= self.cfg.publish_buffer {
            return Err(BusError::Unavailable);
        }
        pending.push_back((exchange, routing_key.to_string(), envelope));
        debug!(
            "BusClient [{}]: broker down, buffered publish to {} ({} pending)",
            self.cfg.source,
            routing_key,
            pending.len()
        );
        Ok(PublishOutcome::Buffered)
    }

    /// Publish requiring broker confirmation; never buffers. Commands and
    /// requests that must not be silently deferred use this.
    pub async fn publish_confirmed(
        &self,
        exchange: BusExchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<usize, BusError> {
        let n = self.broker.publish(exchange, routing_key, envelope).await?;
        if n == 0 {
            return Err(BusError::NoRoute {
                route: routing_key.to_string(),
            });
        }
        Ok(n)
    }

    /// Drain the outage buffer in original order. Stops at the first failure
    /// and keeps the rest for the next attempt.
    pub async fn flush_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Some((exchange, key, envelope)) = pending.pop_front() {
            match self.broker.publish(exchange, &key, envelope.clone()).await {
                Ok(_) => {}
                Err(BusError::Unavailable) => {
                    pending.push_front((exchange, key, envelope));
                    break;
                }
                Err(e) => {
                    // Anything else is unroutable; dropping beats wedging the
                    // whole buffer behind it.
                    error!(
                        "BusClient [{}]: dropping unflushable message on {}: {}",
                        self.cfg.source, key, e
                    );
                }
            }
        }
        if !pending.is_empty() {
            debug!(
                "BusClient [{}]: {} messages still buffered",
                self.cfg.source,
                pending.len()
            );
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Background task that flushes the outage buffer as soon as the broker
    /// comes back, with jittered exponential backoff while it is down.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(100);
            loop {
                if client.broker.is_available() {
                    client.flush_pending().await;
                    backoff = Duration::from_millis(100);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                } else {
                    let jitter_ms = rand::rng().random_range(0..=backoff.as_millis() as u64 / 4);
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    backoff = (backoff * 2).min(client.cfg.reconnect_max_backoff);
                }
            }
        })
    }

    /// Declare the queue and bindings, then consume with at-least-once
    /// semantics: retryable handler failures back off per the retry table and
    /// dead-letter after `max_retries`; fatal failures dead-letter at once.
    pub async fn subscribe(
        self: &Arc<Self>,
        spec: Subscription,
        handler: Handler,
    ) -> SubscriptionHandle {
        let queue = self
            .broker
            .declare_queue(&spec.queue, spec.capacity, spec.overflow)
            .await;
        for (exchange, pattern) in &spec.bindings {
            self.broker.bind(&spec.queue, *exchange, pattern).await;
        }

        // The prefetch window sits between the pump and the serial worker:
        // at most `prefetch` deliveries are pulled ahead of processing.
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Delivery>(spec.prefetch);

        let pump_queue = Arc::clone(&queue);
        let pump = tokio::spawn(async move {
            loop {
                let delivery = pump_queue.recv().await;
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        let max_retries = self.cfg.max_retries;
        let backoff = self.cfg.retry_backoff.clone();
        let queue_name = spec.queue.clone();
        let worker = tokio::spawn(async move {
            while let Some(mut delivery) = rx.recv().await {
                loop {
                    match (handler)(delivery.clone()).await {
                        Ok(()) => break,
                        Err(HandlerError::Fatal(reason)) => {
                            client.broker.dead_letter(&delivery, &reason).await;
                            break;
                        }
                        Err(HandlerError::Retry(reason)) => {
                            if delivery.redelivered >= max_retries {
                                client.broker.dead_letter(&delivery, &reason).await;
                                break;
                            }
                            let wait = backoff
                                .get(delivery.redelivered as usize)
                                .or(backoff.last())
                                .copied()
                                .unwrap_or(Duration::from_millis(100));
                            warn!(
                                "BusClient [{}]: handler failed on '{}' ({}), retry {}/{} in {:?}",
                                client.cfg.source,
                                queue_name,
                                reason,
                                delivery.redelivered + 1,
                                max_retries,
                                wait
                            );
                            tokio::time::sleep(wait).await;
                            delivery.redelivered += 1;
                        }
                    }
                }
            }
        });

        SubscriptionHandle {
            queue,
            pump,
            worker,
        }
    }

    /// Request/response over the fabric. Publishes to `route` on the
    /// `requests` exchange with an ephemeral reply queue bound to
    /// `<reply_prefix>.<correlation_id>`, then awaits the matching response.
    pub async fn request(
        &self,
        route: &str,
        reply_prefix: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, BusError> {
        let timeout = timeout.unwrap_or(self.cfg.request_timeout);
        let correlation_id = Uuid::new_v4();
        let reply_key = format!("{}.{}", reply_prefix, correlation_id);
        let reply_queue_name = format!("responses.{}.{}", self.cfg.source, correlation_id);

        let reply_queue = self
            .broker
            .declare_queue(&reply_queue_name, 8, OverflowPolicy::Reject)
            .await;
        self.broker
            .bind(&reply_queue_name, BusExchange::Responses, &reply_key)
            .await;

        let envelope = self
            .envelope(Some(correlation_id), payload)
            .with_reply_to(reply_key)
            .with_deadline(Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_default());

        let publish = self
            .publish_confirmed(BusExchange::Requests, route, envelope)
            .await;
        if let Err(e) = publish {
            self.broker.delete_queue(&reply_queue_name).await;
            return Err(e);
        }

        let result = tokio::time::timeout(timeout, async {
            loop {
                let delivery = reply_queue.recv().await;
                if delivery.envelope.correlation_id == Some(correlation_id) {
                    return delivery.envelope;
                }
                warn!(
                    "BusClient [{}]: discarding mismatched response {}",
                    self.cfg.source, delivery.envelope.message_id
                );
            }
        })
        .await;

        self.broker.delete_queue(&reply_queue_name).await;

        match result {
            Ok(envelope) => Ok(envelope),
            Err(_) => Err(BusError::RequestTimeout {
                route: route.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Publish the response for a request delivery to its `reply_to` key.
    pub async fn respond(
        &self,
        request: &Delivery,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        let Some(reply_to) = request.envelope.reply_to.clone() else {
            return Err(BusError::Envelope("request has no reply_to".to_string()));
        };
        let envelope = self.envelope(request.envelope.correlation_id, payload);
        self.broker
            .publish(BusExchange::Responses, &reply_to, envelope)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(broker: &Arc<MemoryBroker>, source: &str) -> Arc<BusClient> {
        BusClient::new(Arc::clone(broker), BusConfig::new(source))
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let broker = MemoryBroker::new();
        let publisher = client(&broker, "pub");
        let consumer = client(&broker, "sub");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        let _sub = consumer
            .subscribe(
                Subscription::new("t.events").bind(BusExchange::Events, "events.#"),
                handler(move |_d| {
                    let seen = Arc::clone(&seen_in);
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;

        for _ in 0..5 {
            publisher
                .publish(
                    BusExchange::Events,
                    "events.trade_executed",
                    publisher.envelope(None, json!({})),
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn outage_buffers_and_flushes_in_order() {
        let broker = MemoryBroker::new();
        let publisher = client(&broker, "pub");
        let q = broker
            .declare_queue("sink", 100, OverflowPolicy::Reject)
            .await;
        broker.bind("sink", BusExchange::Events, "events.#").await;

        broker.set_available(false);
        for i in 0..10 {
            let outcome = publisher
                .publish(
                    BusExchange::Events,
                    "events.trade_executed",
                    publisher.envelope(None, json!({ "i": i })),
                )
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Buffered);
        }
        assert_eq!(publisher.pending_len().await, 10);

        broker.set_available(true);
        publisher.flush_pending().await;
        assert_eq!(publisher.pending_len().await, 0);

        for i in 0..10 {
            let d = q.try_recv().unwrap();
            assert_eq!(d.envelope.payload["i"], i);
        }
    }

    #[tokio::test]
    async fn buffer_overflow_fails_publish() {
        let broker = MemoryBroker::new();
        let mut cfg = BusConfig::new("pub");
        cfg.publish_buffer = 2;
        let publisher = BusClient::new(Arc::clone(&broker), cfg);

        broker.set_available(false);
        for _ in 0..2 {
            publisher
                .publish(
                    BusExchange::Events,
                    "events.error",
                    publisher.envelope(None, json!({})),
                )
                .await
                .unwrap();
        }
        let err = publisher
            .publish(
                BusExchange::Events,
                "events.error",
                publisher.envelope(None, json!({})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Unavailable));
    }

    #[tokio::test]
    async fn retry_then_dead_letter() {
        let broker = MemoryBroker::new();
        let mut cfg = BusConfig::new("sub");
        cfg.retry_backoff = vec![Duration::from_millis(1)];
        cfg.max_retries = 2;
        let consumer = BusClient::new(Arc::clone(&broker), cfg);

        let dlq = broker.declare_queue("dlq", 10, OverflowPolicy::Reject).await;
        broker.bind("dlq", BusExchange::Dlx, "#").await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = Arc::clone(&attempts);
        let _sub = consumer
            .subscribe(
                Subscription::new("t.cmd").bind(BusExchange::Commands, "commands.#"),
                handler(move |_d| {
                    let attempts = Arc::clone(&attempts_in);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(HandlerError::Retry("boom".to_string()))
                    }
                }),
            )
            .await;

        consumer
            .publish(
                BusExchange::Commands,
                "commands.execute_trade",
                consumer.envelope(None, json!({})),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Initial attempt + 2 retries, then dead-lettered.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let dead = dlq.try_recv().expect("message should be dead-lettered");
        assert_eq!(
            dead.headers[crate::bus::broker::HEADER_FIRST_DEATH_REASON],
            "boom"
        );
    }

    #[tokio::test]
    async fn fatal_errors_skip_retries() {
        let broker = MemoryBroker::new();
        let consumer = client(&broker, "sub");
        let dlq = broker.declare_queue("dlq", 10, OverflowPolicy::Reject).await;
        broker.bind("dlq", BusExchange::Dlx, "#").await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in = Arc::clone(&attempts);
        let _sub = consumer
            .subscribe(
                Subscription::new("t.cmd").bind(BusExchange::Commands, "commands.#"),
                handler(move |_d| {
                    let attempts = Arc::clone(&attempts_in);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(HandlerError::Fatal("schema_violation".to_string()))
                    }
                }),
            )
            .await;

        consumer
            .publish(
                BusExchange::Commands,
                "commands.execute_trade",
                consumer.envelope(None, json!({ "bad": true })),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(dlq.try_recv().is_some());
    }

    #[tokio::test]
    async fn request_response_matches_correlation() {
        let broker = MemoryBroker::new();
        let requester = client(&broker, "worker.s1");
        let responder = client(&broker, "capital");

        let responder_in = Arc::clone(&responder);
        let _sub = responder
            .subscribe(
                Subscription::new("capital.requests")
                    .bind(BusExchange::Requests, "request.capital.allocation.#"),
                handler(move |d| {
                    let responder = Arc::clone(&responder_in);
                    async move {
                        responder
                            .respond(&d, json!({ "result": "denied" }))
                            .await
                            .map_err(|e| HandlerError::Retry(e.to_string()))
                    }
                }),
            )
            .await;

        let response = requester
            .request(
                "request.capital.allocation.s1",
                "response.capital.allocation",
                json!({ "strategy_id": "s1" }),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(response.payload["result"], "denied");
        assert!(response.correlation_id.is_some());
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let broker = MemoryBroker::new();
        let requester = client(&broker, "worker.s1");
        // Queue exists but its consumer never answers.
        broker
            .declare_queue("capital.requests", 10, OverflowPolicy::Reject)
            .await;
        broker
            .bind("capital.requests", BusExchange::Requests, "request.#")
            .await;

        let err = requester
            .request(
                "request.capital.allocation.s1",
                "response.capital.allocation",
                json!({}),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::RequestTimeout { .. }));
    }
}
