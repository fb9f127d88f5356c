use crate::config::ExecutionOptions;
use crate::domain::errors::ExecutionError;
use chrono::{NaiveDate, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Classic token bucket; refills continuously, waits when empty.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait first.
    /// Zero means go now.
    pub fn take(&self) -> Duration {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - state.tokens;
            state.tokens -= 1.0;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

/// Exchange rate budget: request and order buckets plus a hard daily order
/// cap. Soft exhaustion delays; the daily cap rejects outright.
pub struct RateLimits {
    requests: TokenBucket,
    orders: TokenBucket,
    orders_per_day: u32,
    daily: Mutex<DailyCounter>,
}

impl RateLimits {
    pub fn new(cfg: &ExecutionOptions) -> Self {
        Self {
            requests: TokenBucket::new(
                cfg.requests_per_minute.max(1),
                cfg.requests_per_minute.max(1) as f64 / 60.0,
            ),
            orders: TokenBucket::new(
                cfg.orders_per_second.max(1),
                cfg.orders_per_second.max(1) as f64,
            ),
            orders_per_day: cfg.orders_per_day,
            daily: Mutex::new(DailyCounter {
                date: Utc::now().date_naive(),
                count: 0,
            }),
        }
    }

    /// Budget one REST request, sleeping through soft exhaustion.
    pub async fn acquire_request(&self) {
        let wait = self.requests.take();
        if !wait.is_zero() {
            debug!("RateLimits: request budget exhausted, delaying {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Budget one order. The per-second bucket delays; the per-day counter is
    /// a hard rejection.
    pub async fn acquire_order(&self) -> Result<(), ExecutionError> {
        {
            let mut daily = self.daily.lock().expect("daily counter lock poisoned");
            let today = Utc::now().date_naive();
            if daily.date != today {
                daily.date = today;
                daily.count = 0;
            }
            if daily.count >= self.orders_per_day {
                warn!(
                    "RateLimits: daily order cap {} reached",
                    self.orders_per_day
                );
                return Err(ExecutionError::RateLimited {
                    category: "orders_per_day".to_string(),
                });
            }
            daily.count += 1;
        }

        let wait = self.orders.take().max(self.requests.take());
        if !wait.is_zero() {
            debug!("RateLimits: order budget exhausted, delaying {:?}", wait);
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}
