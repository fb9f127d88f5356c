//! Tradewire engine - headless trading core
//!
//! Boots the message fabric, the Capital Managers, the Exchange Connector,
//! the Reconciler and one worker per active strategy, then runs until
//! interrupted. With the mock exchange a random-walk feed can be enabled to
//! exercise the full pipeline without touching a real venue.

use anyhow::Result;
use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, Level};
use tracing_subscriber::prelude::*;
use tradewire::application::engine::CoreEngine;
use tradewire::config::Config;
use tradewire::domain::types::Candle;
use tradewire::infrastructure::exchange::MockExchange;

#[derive(Debug, Parser)]
#[command(name = "tradewire", about = "Broker-fabric crypto trading core")]
struct Args {
    /// Override DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Feed the mock exchange a random-walk price stream.
    #[arg(long)]
    simulate: bool,

    /// Seconds between simulated bars.
    #[arg(long, default_value_t = 5)]
    simulate_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Tradewire {} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    info!(
        "Configuration loaded: exchange={}, symbols={:?}",
        config.exchange_id, config.symbols
    );

    let symbols = config.symbols.clone();
    let engine = CoreEngine::build(config).await?;
    let handle = engine.start().await?;
    info!("Trading core running.");

    let mut sim_task = None;
    if args.simulate {
        match handle.mock.clone() {
            Some(mock) => {
                info!(
                    "Paper feed enabled ({}s bars on {:?})",
                    args.simulate_interval, symbols
                );
                sim_task = Some(tokio::spawn(simulate(
                    mock,
                    symbols,
                    args.simulate_interval,
                )));
            }
            None => info!("--simulate ignored: exchange is not the mock"),
        }
    }

    info!("Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");

    if let Some(task) = sim_task {
        task.abort();
    }
    handle.shutdown(Duration::from_secs(10)).await;
    Ok(())
}

/// Random-walk bar generator for paper trading against the mock exchange.
async fn simulate(mock: std::sync::Arc<MockExchange>, symbols: Vec<String>, period_secs: u64) {
    use rand::Rng;

    let mut prices: Vec<f64> = symbols.iter().map(|_| 50_000.0).collect();
    let mut ticker = interval(Duration::from_secs(period_secs.max(1)));
    loop {
        ticker.tick().await;
        for (i, symbol) in symbols.iter().enumerate() {
            let drift: f64 = rand::rng().random_range(-0.01..0.01);
            let open = prices[i];
            let close = (open * (1.0 + drift)).max(1.0);
            prices[i] = close;

            let candle = Candle {
                symbol: symbol.clone(),
                exchange: "mock".to_string(),
                open: Decimal::from_f64(open).unwrap_or_default(),
                high: Decimal::from_f64(open.max(close)).unwrap_or_default(),
                low: Decimal::from_f64(open.min(close)).unwrap_or_default(),
                close: Decimal::from_f64(close).unwrap_or_default(),
                volume: Decimal::from_f64(rand::rng().random_range(1.0..100.0))
                    .unwrap_or_default(),
                close_ts: chrono::Utc::now(),
            };
            mock.inject_bar(candle).await;
        }
    }
}
