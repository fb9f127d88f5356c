use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests pass through
    Open,     // Failure threshold breached - reject all requests
    HalfOpen, // Testing if service recovered - allow limited requests
}

/// A state change worth announcing on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    HalfOpened,
    Closed,
}

impl CircuitTransition {
    /// Suffix for `events.system.exchange_circuit_*` routing keys.
    pub fn event_suffix(&self) -> &'static str {
        match self {
            CircuitTransition::Opened => "exchange_circuit_open",
            CircuitTransition::HalfOpened => "exchange_circuit_half_open",
            CircuitTransition::Closed => "exchange_circuit_closed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit open, retry in {remaining_ms}ms")]
pub struct CircuitOpen {
    pub remaining_ms: i64,
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker for protecting against cascading exchange failures.
///
/// Callers check `try_acquire` before the guarded call, then report the
/// outcome with `record_success`/`record_failure`. Returned transitions let
/// the caller publish state changes without polling.
pub struct CircuitBreaker {
    state: Arc<RwLock<CircuitBreakerState>>,
    failure_threshold: usize,
    success_threshold: usize,
    cool_down: Duration,
    name: String,
}

impl CircuitBreaker {
    /// # Arguments
    /// * `name` - Identifier for logging
    /// * `failure_threshold` - Consecutive failures before opening
    /// * `success_threshold` - Consecutive successes in HalfOpen to close
    /// * `cool_down` - Wait before transitioning Open -> HalfOpen
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        success_threshold: usize,
        cool_down: Duration,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
            failure_threshold,
            success_threshold,
            cool_down,
            name: name.into(),
        }
    }

    /// Gate a call. While open and inside the cool-down this fails fast;
    /// once the cool-down elapses the circuit half-opens for a probe.
    pub async fn try_acquire(&self) -> Result<Option<CircuitTransition>, CircuitOpen> {
        let mut state = self.state.write().await;
        if state.state != CircuitState::Open {
            return Ok(None);
        }
        if let Some(last_failure) = state.last_failure_time {
            let elapsed = last_failure.elapsed();
            if elapsed >= self.cool_down {
                info!(
                    "CircuitBreaker [{}]: Transitioning Open -> HalfOpen (cool-down elapsed)",
                    self.name
                );
                state.state = CircuitState::HalfOpen;
                state.success_count = 0;
                return Ok(Some(CircuitTransition::HalfOpened));
            }
            let remaining = self.cool_down - elapsed;
            return Err(CircuitOpen {
                remaining_ms: remaining.as_millis() as i64,
            });
        }
        Ok(None)
    }

    /// Record a successful call.
    pub async fn record_success(&self) -> Option<CircuitTransition> {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.success_threshold {
                    info!(
                        "CircuitBreaker [{}]: Transitioning HalfOpen -> Closed ({} successes)",
                        self.name, state.success_count
                    );
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    return Some(CircuitTransition::Closed);
                }
                None
            }
            CircuitState::Closed => {
                state.failure_count = 0;
                None
            }
            CircuitState::Open => {
                warn!(
                    "CircuitBreaker [{}]: Success recorded in Open state (unexpected)",
                    self.name
                );
                None
            }
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) -> Option<CircuitTransition> {
        let mut state = self.state.write().await;
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.failure_threshold {
                    error!(
                        "CircuitBreaker [{}]: Transitioning Closed -> Open ({} failures)",
                        self.name, state.failure_count
                    );
                    state.state = CircuitState::Open;
                    return Some(CircuitTransition::Opened);
                }
                None
            }
            CircuitState::HalfOpen => {
                // Any failure in HalfOpen immediately reopens circuit
                warn!(
                    "CircuitBreaker [{}]: Transitioning HalfOpen -> Open (failure during recovery)",
                    self.name
                );
                state.state = CircuitState::Open;
                state.success_count = 0;
                Some(CircuitTransition::Opened)
            }
            CircuitState::Open => None,
        }
    }

    /// Get current circuit state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn circuit_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new("test", 3, 1, Duration::from_secs(1));

        assert!(cb.record_failure().await.is_none());
        assert!(cb.record_failure().await.is_none());
        assert_eq!(cb.record_failure().await, Some(CircuitTransition::Opened));
        assert_eq!(cb.state().await, CircuitState::Open);

        let err = cb.try_acquire().await.unwrap_err();
        assert!(err.remaining_ms > 0);
    }

    #[tokio::test]
    async fn success_resets_failure_streak_while_closed() {
        let cb = CircuitBreaker::new("test", 3, 1, Duration::from_secs(1));
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_recovers_through_half_open() {
        let cb = CircuitBreaker::new("test", 2, 2, Duration::from_millis(50));

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(
            cb.try_acquire().await.unwrap(),
            Some(CircuitTransition::HalfOpened)
        );
        assert!(cb.record_success().await.is_none());
        assert_eq!(cb.record_success().await, Some(CircuitTransition::Closed));
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", 2, 2, Duration::from_millis(50));

        cb.record_failure().await;
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        cb.try_acquire().await.unwrap();

        assert_eq!(cb.record_failure().await, Some(CircuitTransition::Opened));
        assert_eq!(cb.state().await, CircuitState::Open);
    }
}
