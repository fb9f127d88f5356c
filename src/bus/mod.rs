//! Broker-backed message fabric: typed pub/sub, request/response, ack and
//! retry with dead-lettering. Components never call each other directly;
//! everything crosses this layer.

pub mod broker;
pub mod client;
pub mod envelope;
pub mod routing;

pub use broker::{Delivery, MemoryBroker, OverflowPolicy, Queue};
pub use client::{
    handler, BusClient, BusConfig, Handler, HandlerError, PublishOutcome, Subscription,
    SubscriptionHandle,
};
pub use envelope::{Envelope, EnvelopeError, MAX_ENVELOPE_BYTES};
pub use routing::{keys, topic_matches, BusExchange};

use thiserror::Error;

/// Failures surfaced by the fabric itself.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker unreachable and the client buffer is exhausted.
    #[error("message bus unavailable")]
    Unavailable,

    #[error("envelope exceeds size limit: {size} bytes")]
    PayloadTooLarge { size: usize },

    #[error("no consumers bound for route '{route}'")]
    NoRoute { route: String },

    #[error("request on '{route}' timed out after {timeout_ms}ms")]
    RequestTimeout { route: String, timeout_ms: u64 },

    #[error("envelope error: {0}")]
    Envelope(String),
}
