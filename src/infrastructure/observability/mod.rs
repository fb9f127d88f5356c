//! Push-based metrics: counters and latency histograms gathered into the
//! process registry and logged on an interval. No HTTP server, no incoming
//! connections.

mod latency;
mod metrics;

pub use latency::{PlacementTimer, COLD_PLACEMENT_BUDGET, WARM_PLACEMENT_BUDGET};
pub use metrics::Metrics;
