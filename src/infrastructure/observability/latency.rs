use prometheus::Histogram;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

/// Placement allowance with a warm price cache: tick to exchange-accepted
/// command inside 200ms.
pub const WARM_PLACEMENT_BUDGET: Duration = Duration::from_millis(200);

/// Placement allowance on a cache miss: 500ms end to end.
pub const COLD_PLACEMENT_BUDGET: Duration = Duration::from_millis(500);

/// Times one order placement. Recording happens on drop so every exit path
/// of the placement code is measured; overruns against the warm/cold budget
/// are flagged with the order that blew it.
pub struct PlacementTimer {
    start: Instant,
    histogram: Histogram,
    budget: Duration,
    symbol: String,
    client_order_id: Uuid,
}

impl PlacementTimer {
    pub fn new(
        histogram: Histogram,
        symbol: &str,
        client_order_id: Uuid,
        cache_warm: bool,
    ) -> Self {
        let budget = if cache_warm {
            WARM_PLACEMENT_BUDGET
        } else {
            COLD_PLACEMENT_BUDGET
        };
        Self {
            start: Instant::now(),
            histogram,
            budget,
            symbol: symbol.to_string(),
            client_order_id,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

impl Drop for PlacementTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.histogram.observe(elapsed.as_secs_f64());
        if elapsed > self.budget {
            warn!(
                "Latency: order {} on {} took {:?}, over the {:?} budget",
                self.client_order_id, self.symbol, elapsed, self.budget
            );
        }
    }
}
