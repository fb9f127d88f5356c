use crate::bus::envelope::{Envelope, EnvelopeError};
use crate::bus::routing::{keys, topic_matches, BusExchange};
use crate::bus::BusError;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

pub const HEADER_FIRST_DEATH_REASON: &str = "x-first-death-reason";
pub const HEADER_DEATH_COUNT: &str = "x-death-count";
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// What a queue does when full. Market-data queues drop the oldest tick and
/// keep going; command and request queues refuse the new message so nothing
/// silently skips the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    Reject,
    DropOldest,
}

/// A message as handed to a consumer: envelope plus routing metadata and the
/// redelivery count maintained across retries.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: BusExchange,
    pub routing_key: String,
    pub envelope: Envelope,
    pub redelivered: u32,
    pub headers: BTreeMap<String, String>,
}

enum PushOutcome {
    Enqueued,
    Dropped(Delivery),
    Rejected,
}

struct QueueInner {
    buffer: VecDeque<Delivery>,
    dropped: u64,
}

/// A bounded, named queue. Competing consumers are safe: each delivery is
/// handed to exactly one `recv` caller.
pub struct Queue {
    name: String,
    capacity: usize,
    overflow: OverflowPolicy,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Queue {
    fn new(name: &str, capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            overflow,
            inner: Mutex::new(QueueInner {
                buffer: VecDeque::new(),
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, delivery: Delivery) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.buffer.len() >= self.capacity {
                match self.overflow {
                    OverflowPolicy::Reject => {
                        inner.dropped += 1;
                        PushOutcome::Rejected
                    }
                    OverflowPolicy::DropOldest => {
                        let old = inner.buffer.pop_front();
                        inner.dropped += 1;
                        inner.buffer.push_back(delivery);
                        match old {
                            Some(d) => PushOutcome::Dropped(d),
                            None => PushOutcome::Enqueued,
                        }
                    }
                }
            } else {
                inner.buffer.push_back(delivery);
                PushOutcome::Enqueued
            }
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        outcome
    }

    /// Requeue a delivery at the back with its redelivery count bumped.
    pub fn requeue(&self, mut delivery: Delivery) {
        delivery.redelivered += 1;
        // Redeliveries bypass the overflow policy: the broker never loses an
        // unacked message.
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.buffer.push_back(delivery);
        }
        self.notify.notify_one();
    }

    pub async fn recv(&self) -> Delivery {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(d) = inner.buffer.pop_front() {
                    return d;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Delivery> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .buffer
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().expect("queue lock poisoned").dropped
    }
}

struct Binding {
    exchange: BusExchange,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, Arc<Queue>>,
    bindings: Vec<Binding>,
}

/// In-process broker implementing topic exchanges, bounded queues,
/// redelivery and dead-lettering. One instance per process; clients share it
/// by `Arc`.
pub struct MemoryBroker {
    topology: RwLock<Topology>,
    available: AtomicBool,
    published_total: AtomicU64,
    dead_lettered_total: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topology: RwLock::new(Topology::default()),
            available: AtomicBool::new(true),
            published_total: AtomicU64::new(0),
            dead_lettered_total: AtomicU64::new(0),
        })
    }

    /// Declare (or fetch) a queue. Idempotent on name; capacity and policy of
    /// an existing queue are left untouched.
    pub async fn declare_queue(
        &self,
        name: &str,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> Arc<Queue> {
        let mut topo = self.topology.write().await;
        topo.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Queue::new(name, capacity, overflow)))
            .clone()
    }

    pub async fn delete_queue(&self, name: &str) {
        let mut topo = self.topology.write().await;
        topo.queues.remove(name);
        topo.bindings.retain(|b| b.queue != name);
    }

    pub async fn bind(&self, queue: &str, exchange: BusExchange, pattern: &str) {
        let mut topo = self.topology.write().await;
        let exists = topo
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            topo.bindings.push(Binding {
                exchange,
                pattern: pattern.to_string(),
                queue: queue.to_string(),
            });
        }
    }

    /// Simulate broker connectivity. While unavailable every publish fails
    /// with `BusError::Unavailable`; clients buffer and flush on recovery.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn dead_lettered_total(&self) -> u64 {
        self.dead_lettered_total.load(Ordering::Relaxed)
    }

    /// Route an envelope to every queue bound to `exchange` with a matching
    /// pattern. Returns how many queues accepted it.
    pub async fn publish(
        &self,
        exchange: BusExchange,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<usize, BusError> {
        let (matched, drops) = self.route(exchange, routing_key, envelope, 0).await?;

        // Overflowed market-data queues surface as a system event so
        // downstream consumers know ticks went missing.
        for (queue, dropped_total) in drops {
            let notice = Envelope::new(
                "bus",
                None,
                json!({ "queue": queue, "dropped_total": dropped_total }),
            );
            let _ = self
                .route(
                    BusExchange::Events,
                    &keys::system("market_data_drop"),
                    notice,
                    1,
                )
                .await;
        }
        Ok(matched)
    }

    async fn route(
        &self,
        exchange: BusExchange,
        routing_key: &str,
        envelope: Envelope,
        depth: u8,
    ) -> Result<(usize, Vec<(String, u64)>), BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable);
        }
        match envelope.to_bytes() {
            Ok(_) => {}
            Err(EnvelopeError::PayloadTooLarge { size }) => {
                return Err(BusError::PayloadTooLarge { size });
            }
            Err(e) => return Err(BusError::Envelope(e.to_string())),
        }

        let targets: Vec<Arc<Queue>> = {
            let topo = self.topology.read().await;
            topo.bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
                .filter_map(|b| topo.queues.get(&b.queue).cloned())
                .collect()
        };

        self.published_total.fetch_add(1, Ordering::Relaxed);

        let mut matched = 0;
        let mut drops = Vec::new();
        for queue in targets {
            let delivery = Delivery {
                exchange,
                routing_key: routing_key.to_string(),
                envelope: envelope.clone(),
                redelivered: 0,
                headers: BTreeMap::new(),
            };
            match queue.push(delivery) {
                PushOutcome::Enqueued => matched += 1,
                PushOutcome::Dropped(old) => {
                    matched += 1;
                    debug!(
                        "MemoryBroker: queue '{}' full, dropped oldest {} ({})",
                        queue.name(),
                        old.routing_key,
                        old.envelope.message_id
                    );
                    if depth == 0 && exchange == BusExchange::MarketData {
                        drops.push((queue.name().to_string(), queue.dropped_total()));
                    }
                }
                PushOutcome::Rejected => {
                    warn!(
                        "MemoryBroker: queue '{}' full, rejected {} on {}",
                        queue.name(),
                        envelope.message_id,
                        routing_key
                    );
                }
            }
        }
        Ok((matched, drops))
    }

    /// Route a poisoned delivery to the dead-letter exchange with `x-death`
    /// diagnostics. The original routing key is preserved so DLQ consumers
    /// can tell where it came from.
    pub async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        self.dead_lettered_total.fetch_add(1, Ordering::Relaxed);

        let mut headers = delivery.headers.clone();
        headers
            .entry(HEADER_FIRST_DEATH_REASON.to_string())
            .or_insert_with(|| reason.to_string());
        headers.insert(
            HEADER_DEATH_COUNT.to_string(),
            (delivery.redelivered + 1).to_string(),
        );
        headers.insert(
            HEADER_ORIGINAL_ROUTING_KEY.to_string(),
            delivery.routing_key.clone(),
        );

        warn!(
            "MemoryBroker: dead-lettering {} from {} ({})",
            delivery.envelope.message_id, delivery.routing_key, reason
        );

        let targets: Vec<Arc<Queue>> = {
            let topo = self.topology.read().await;
            topo.bindings
                .iter()
                .filter(|b| {
                    b.exchange == BusExchange::Dlx
                        && topic_matches(&b.pattern, &delivery.routing_key)
                })
                .filter_map(|b| topo.queues.get(&b.queue).cloned())
                .collect()
        };
        for queue in targets {
            let dead = Delivery {
                exchange: BusExchange::Dlx,
                routing_key: delivery.routing_key.clone(),
                envelope: delivery.envelope.clone(),
                redelivered: delivery.redelivered,
                headers: headers.clone(),
            };
            queue.push(dead);
        }
    }
}
