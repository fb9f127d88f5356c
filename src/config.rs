use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_decimal(key: &str, default: &str) -> Result<Decimal> {
    let raw = env_or(key, default);
    Decimal::from_str(&raw).with_context(|| format!("invalid decimal in {}", key))
}

/// Bus fabric tuning.
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub prefetch_commands: usize,
    pub prefetch_market_data: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: Vec<u64>,
    pub publish_buffer: usize,
    pub request_timeout_ms: u64,
}

impl BusOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

/// Portfolio-level risk limits. Fields ending in `_percent` are whole
/// percents (10 = 10%); `default_risk_percent` is a fraction (0.02 = 2%),
/// matching how sizing is quoted.
#[derive(Debug, Clone)]
pub struct TradingOptions {
    pub max_position_size_percent: Decimal,
    pub max_daily_loss_percent: Decimal,
    pub max_portfolio_exposure_percent: Decimal,
    pub stop_loss_percent: Decimal,
    pub default_risk_percent: Decimal,
    pub min_position_size_usd: Decimal,
    pub max_position_size_usd: Decimal,
    pub max_positions_per_symbol: u32,
    pub min_available_capital: Decimal,
    /// Extra slice reserved on top of notional to cover fees.
    pub fee_buffer: Decimal,
    /// Proposals older than this are denied stale.
    pub proposal_freshness_ms: i64,
    /// Capital for the default portfolio seeded on first start.
    pub initial_capital: Decimal,
}

/// Exchange connector tuning.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub order_timeout_ms: u64,
    pub retry_attempts: u32,
    pub slippage_tolerance: Decimal,
    pub circuit_breaker_threshold: usize,
    pub circuit_breaker_cool_down_ms: u64,
    pub requests_per_minute: u32,
    pub orders_per_second: u32,
    pub orders_per_day: u32,
    pub price_cache_ttl_ms: u64,
    pub price_cache_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub interval_ms: u64,
    pub size_tolerance: Decimal,
    /// Orders younger than this are left alone even if the exchange does not
    /// report them yet.
    pub stale_order_grace_ms: i64,
    /// Policy switch: cancel reconciler-created orphan orders after the grace
    /// period instead of keeping them.
    pub auto_cancel_orphans: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_consecutive_failures: u32,
    pub proposal_ttl_ms: i64,
    pub frame_capacity: usize,
    pub backfill_bars: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub exchange_id: String,
    pub base_currency: String,
    pub symbols: Vec<String>,
    pub strategies_file: Option<String>,
    pub observability_interval_secs: u64,
    pub bus: BusOptions,
    pub trading: TradingOptions,
    pub execution: ExecutionOptions,
    pub reconcile: ReconcileOptions,
    pub worker: WorkerOptions,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let retry_backoff_ms = env_or("BUS_RETRY_BACKOFF_MS", "100,1000,5000")
            .split(',')
            .map(|s| {
                s.trim()
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("invalid BUS_RETRY_BACKOFF_MS entry: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let symbols = env_or("SYMBOLS", "BTC/USDT")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite://data/tradewire.db"),
            exchange_id: env_or("EXCHANGE_ID", "mock"),
            base_currency: env_or("BASE_CURRENCY", "USDT"),
            symbols,
            strategies_file: env::var("STRATEGIES_FILE").ok(),
            observability_interval_secs: env_parse("OBSERVABILITY_INTERVAL", 60)?,
            bus: BusOptions {
                prefetch_commands: env_parse("BUS_PREFETCH_COMMANDS", 10)?,
                prefetch_market_data: env_parse("BUS_PREFETCH_MARKET_DATA", 100)?,
                max_retries: env_parse("BUS_MAX_RETRIES", 3)?,
                retry_backoff_ms,
                publish_buffer: env_parse("BUS_PUBLISH_BUFFER", 10_000)?,
                request_timeout_ms: env_parse("BUS_REQUEST_TIMEOUT_MS", 5_000)?,
            },
            trading: TradingOptions {
                max_position_size_percent: env_decimal("TRADING_MAX_POSITION_SIZE_PERCENT", "10")?,
                max_daily_loss_percent: env_decimal("TRADING_MAX_DAILY_LOSS_PERCENT", "5")?,
                max_portfolio_exposure_percent: env_decimal(
                    "TRADING_MAX_PORTFOLIO_EXPOSURE_PERCENT",
                    "50",
                )?,
                stop_loss_percent: env_decimal("TRADING_STOP_LOSS_PERCENT", "2")?,
                default_risk_percent: env_decimal("TRADING_DEFAULT_RISK_PERCENT", "0.02")?,
                min_position_size_usd: env_decimal("TRADING_MIN_POSITION_SIZE_USD", "10")?,
                max_position_size_usd: env_decimal("TRADING_MAX_POSITION_SIZE_USD", "100000")?,
                max_positions_per_symbol: env_parse("TRADING_MAX_POSITIONS_PER_SYMBOL", 1)?,
                min_available_capital: env_decimal("TRADING_MIN_AVAILABLE_CAPITAL", "10")?,
                fee_buffer: env_decimal("TRADING_FEE_BUFFER", "0.002")?,
                proposal_freshness_ms: env_parse("TRADING_PROPOSAL_FRESHNESS_MS", 2_000)?,
                initial_capital: env_decimal("TRADING_INITIAL_CAPITAL", "10000")?,
            },
            execution: ExecutionOptions {
                order_timeout_ms: env_parse("EXECUTION_ORDER_TIMEOUT_MS", 10_000)?,
                retry_attempts: env_parse("EXECUTION_RETRY_ATTEMPTS", 3)?,
                slippage_tolerance: env_decimal("EXECUTION_SLIPPAGE_TOLERANCE", "0.005")?,
                circuit_breaker_threshold: env_parse("EXECUTION_CIRCUIT_BREAKER_THRESHOLD", 5)?,
                circuit_breaker_cool_down_ms: env_parse(
                    "EXECUTION_CIRCUIT_BREAKER_COOL_DOWN_MS",
                    30_000,
                )?,
                requests_per_minute: env_parse("EXECUTION_REQUESTS_PER_MINUTE", 1_200)?,
                orders_per_second: env_parse("EXECUTION_ORDERS_PER_SECOND", 10)?,
                orders_per_day: env_parse("EXECUTION_ORDERS_PER_DAY", 100_000)?,
                price_cache_ttl_ms: env_parse("EXECUTION_PRICE_CACHE_TTL_MS", 500)?,
                price_cache_capacity: env_parse("EXECUTION_PRICE_CACHE_CAPACITY", 512)?,
            },
            reconcile: ReconcileOptions {
                interval_ms: env_parse("RECONCILE_INTERVAL_MS", 60_000)?,
                size_tolerance: env_decimal("RECONCILE_SIZE_TOLERANCE", "0.00000001")?,
                stale_order_grace_ms: env_parse("RECONCILE_STALE_ORDER_GRACE_MS", 300_000)?,
                auto_cancel_orphans: env_parse("RECONCILE_AUTO_CANCEL_ORPHANS", false)?,
            },
            worker: WorkerOptions {
                max_consecutive_failures: env_parse("WORKER_MAX_CONSECUTIVE_FAILURES", 5)?,
                proposal_ttl_ms: env_parse("WORKER_PROPOSAL_TTL_MS", 60_000)?,
                frame_capacity: env_parse("WORKER_FRAME_CAPACITY", 500)?,
                backfill_bars: env_parse("WORKER_BACKFILL_BARS", 200)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_match_the_documented_values() {
        // Only read env-free defaults here; the suite must not depend on the
        // caller's environment.
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.bus.prefetch_commands, 10);
        assert_eq!(cfg.bus.prefetch_market_data, 100);
        assert_eq!(cfg.bus.max_retries, 3);
        assert_eq!(cfg.bus.publish_buffer, 10_000);
        assert_eq!(cfg.bus.request_timeout_ms, 5_000);
        assert_eq!(cfg.reconcile.interval_ms, 60_000);
        assert_eq!(cfg.reconcile.size_tolerance, dec!(0.00000001));
        assert_eq!(cfg.worker.max_consecutive_failures, 5);
        assert_eq!(cfg.worker.proposal_ttl_ms, 60_000);
    }

    #[test]
    fn retry_backoff_converts_to_durations() {
        let bus = BusOptions {
            prefetch_commands: 10,
            prefetch_market_data: 100,
            max_retries: 3,
            retry_backoff_ms: vec![100, 1000, 5000],
            publish_buffer: 10_000,
            request_timeout_ms: 5_000,
        };
        assert_eq!(
            bus.retry_backoff(),
            vec![
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(5)
            ]
        );
    }
}
