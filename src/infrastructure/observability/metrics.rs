use crate::infrastructure::observability::PlacementTimer;
use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Process-wide trading metrics. Cheap to clone; all members share the same
/// underlying collectors.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_placed: IntCounter,
    pub orders_failed: IntCounter,
    pub proposals_approved: IntCounter,
    pub proposals_denied: IntCounter,
    pub reconciliation_runs: IntCounter,
    pub reconciliation_repairs: IntCounter,
    /// Seconds from command receipt to exchange acknowledgement.
    pub order_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let orders_placed = IntCounter::new("orders_placed_total", "Orders accepted by the exchange")?;
        let orders_failed = IntCounter::new("orders_failed_total", "Order placements that failed")?;
        let proposals_approved =
            IntCounter::new("proposals_approved_total", "Allocation requests approved")?;
        let proposals_denied =
            IntCounter::new("proposals_denied_total", "Allocation requests denied")?;
        let reconciliation_runs =
            IntCounter::new("reconciliation_runs_total", "Reconciliation sweeps executed")?;
        let reconciliation_repairs = IntCounter::new(
            "reconciliation_repairs_total",
            "Discrepancies repaired by the reconciler",
        )?;
        let order_latency = Histogram::with_opts(
            HistogramOpts::new("order_latency_seconds", "Command receipt to exchange ack")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.2, 0.5, 1.0, 2.5, 10.0]),
        )?;

        registry.register(Box::new(orders_placed.clone()))?;
        registry.register(Box::new(orders_failed.clone()))?;
        registry.register(Box::new(proposals_approved.clone()))?;
        registry.register(Box::new(proposals_denied.clone()))?;
        registry.register(Box::new(reconciliation_runs.clone()))?;
        registry.register(Box::new(reconciliation_repairs.clone()))?;
        registry.register(Box::new(order_latency.clone()))?;

        Ok(Self {
            registry,
            orders_placed,
            orders_failed,
            proposals_approved,
            proposals_denied,
            reconciliation_runs,
            reconciliation_repairs,
            order_latency,
        })
    }

    /// Start timing an order placement against the warm/cold latency budget.
    pub fn placement_timer(
        &self,
        symbol: &str,
        client_order_id: Uuid,
        cache_warm: bool,
    ) -> PlacementTimer {
        PlacementTimer::new(
            self.order_latency.clone(),
            symbol,
            client_order_id,
            cache_warm,
        )
    }

    /// Log a snapshot of every collector, prefixed for log scrapers.
    pub fn report(&self) {
        info!(
            "METRICS: orders_placed={} orders_failed={} proposals_approved={} proposals_denied={} reconciliation_runs={} reconciliation_repairs={}",
            self.orders_placed.get(),
            self.orders_failed.get(),
            self.proposals_approved.get(),
            self.proposals_denied.get(),
            self.reconciliation_runs.get(),
            self.reconciliation_repairs.get(),
        );
        let count = self.order_latency.get_sample_count();
        let mean_ms = if count > 0 {
            self.order_latency.get_sample_sum() / count as f64 * 1000.0
        } else {
            0.0
        };
        info!(
            "METRICS: order_latency_count={} order_latency_mean_ms={:.2}",
            count, mean_ms
        );
        // The registry keeps the collectors exportable should a push gateway
        // ever be wired up.
        let _ = self.registry.gather().len();
    }

    /// Spawn the interval reporter.
    pub fn spawn_reporter(&self, interval_secs: u64) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                metrics.report();
            }
        })
    }
}
