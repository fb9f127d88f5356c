pub mod circuit_breaker;
pub mod exchange;
pub mod observability;
pub mod persistence;

pub use circuit_breaker::{CircuitBreaker, CircuitOpen, CircuitState, CircuitTransition};
