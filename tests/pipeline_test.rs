//! End-to-end pipeline: bars in, validated orders out, fills applied.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradewire::application::capital::{attach_bus, CapitalManager, RuleSet};
use tradewire::application::engine::CoreEngine;
use tradewire::application::reconciler::ReconcileGate;
use tradewire::bus::{BusClient, BusConfig, BusExchange, MemoryBroker, OverflowPolicy};
use tradewire::config::{
    BusOptions, Config, ExecutionOptions, ReconcileOptions, TradingOptions, WorkerOptions,
};
use tradewire::domain::entities::{Portfolio, SizingParams, StrategyDef, StrategyKind};
use tradewire::domain::repositories::{
    PortfolioRepository, PositionRepository, StrategyRepository, TradeRepository,
};
use tradewire::domain::types::{
    AllocationRequest, AllocationResponse, AllocationVerdict, Candle, OrderSide, Proposal,
    TradeStatus,
};
use tradewire::infrastructure::observability::Metrics;
use tradewire::infrastructure::persistence::{
    Database, SqlitePortfolioRepository, SqlitePositionRepository, SqliteStrategyRepository,
    SqliteTradeRepository,
};
use uuid::Uuid;

fn test_config(database_url: &str, strategies_file: Option<String>) -> Config {
    Config {
        database_url: database_url.to_string(),
        exchange_id: "mock".to_string(),
        base_currency: "USDT".to_string(),
        symbols: vec!["BTC/USDT".to_string()],
        strategies_file,
        observability_interval_secs: 3600,
        bus: BusOptions {
            prefetch_commands: 10,
            prefetch_market_data: 100,
            max_retries: 3,
            retry_backoff_ms: vec![50, 100],
            publish_buffer: 10_000,
            request_timeout_ms: 5_000,
        },
        trading: TradingOptions {
            max_position_size_percent: dec!(10),
            max_daily_loss_percent: dec!(5),
            max_portfolio_exposure_percent: dec!(50),
            stop_loss_percent: dec!(2),
            default_risk_percent: dec!(0.02),
            min_position_size_usd: Decimal::ZERO,
            max_position_size_usd: dec!(100000),
            max_positions_per_symbol: 1,
            min_available_capital: Decimal::ZERO,
            fee_buffer: dec!(0.002),
            proposal_freshness_ms: 2_000,
            initial_capital: dec!(10000),
        },
        execution: ExecutionOptions {
            order_timeout_ms: 2_000,
            retry_attempts: 3,
            slippage_tolerance: dec!(0.005),
            circuit_breaker_threshold: 5,
            circuit_breaker_cool_down_ms: 30_000,
            requests_per_minute: 10_000,
            orders_per_second: 100,
            orders_per_day: 100_000,
            price_cache_ttl_ms: 500,
            price_cache_capacity: 64,
        },
        reconcile: ReconcileOptions {
            interval_ms: 60_000,
            size_tolerance: dec!(0.00000001),
            stale_order_grace_ms: 300_000,
            auto_cancel_orphans: false,
        },
        worker: WorkerOptions {
            max_consecutive_failures: 5,
            proposal_ttl_ms: 60_000,
            frame_capacity: 100,
            backfill_bars: 50,
        },
    }
}

fn bar(symbol: &str, close: Decimal, ts: chrono::DateTime<Utc>) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        exchange: "mock".to_string(),
        open: close,
        high: close,
        low: close,
        close,
        volume: dec!(1),
        close_ts: ts,
    }
}

#[tokio::test]
async fn ma_cross_flows_from_bar_to_filled_position() {
    let dir = std::env::temp_dir().join(format!("tradewire-e2e-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db_url = format!("sqlite://{}", dir.join("core.db").display());
    let strategies_path = dir.join("strategies.toml");
    std::fs::write(
        &strategies_path,
        r#"
[[strategies]]
id = "ma-btc"
kind = "ma_crossover"
exchange = "mock"
symbol = "BTC/USDT"
risk_percent = "0.001"

[strategies.params]
fast_period = 2
slow_period = 4
"#,
    )
    .unwrap();

    let cfg = test_config(&db_url, Some(strategies_path.display().to_string()));
    let engine = CoreEngine::build(cfg).await.unwrap();
    let handle = engine.start().await.unwrap();
    let mock = handle.mock.clone().expect("mock exchange");

    // Let subscriptions and the worker's backfill settle before feeding bars.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Downtrend, then a sharp recovery: the fast SMA crosses above the slow
    // one on the last bar.
    let closes = [
        dec!(110),
        dec!(108),
        dec!(106),
        dec!(104),
        dec!(102),
        dec!(100),
        dec!(99),
        dec!(112),
    ];
    let base = Utc::now() - ChronoDuration::minutes(closes.len() as i64);
    for (i, close) in closes.iter().enumerate() {
        mock.inject_bar(bar(
            "BTC/USDT",
            *close,
            base + ChronoDuration::minutes(i as i64),
        ))
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Poll until the fill has worked its way through connector and manager.
    let db = Database::new(&db_url).await.unwrap();
    let trades = SqliteTradeRepository::new(db.pool.clone());
    let positions = SqlitePositionRepository::new(db.pool.clone());

    let mut closed = Vec::new();
    for _ in 0..100 {
        closed = trades.find_by_status(&[TradeStatus::Closed]).await.unwrap();
        if !closed.is_empty() && !positions.find_open().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(closed.len(), 1, "exactly one trade for one signal");
    let trade = &closed[0];
    assert_eq!(trade.symbol, "BTC/USDT");
    assert_eq!(trade.side, OrderSide::Buy);
    // risk 10 USDT over a 2% stop at 112 => notional 500.
    let notional = trade.amount * dec!(112);
    assert!(
        notional > dec!(499) && notional <= dec!(500),
        "notional {} out of range",
        notional
    );

    let open = positions.find_open().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].size, trade.amount);
    assert_eq!(open[0].average_entry, dec!(112));

    // Capital: the basis stays held, fees come out of the total.
    let portfolio_id = *handle.capital.keys().next().unwrap();
    let snapshot = handle.capital[&portfolio_id].snapshot().await.unwrap();
    assert!(snapshot.portfolio.total_capital < dec!(10000));
    assert!(snapshot.portfolio.total_capital > dec!(9999));
    assert!(snapshot.portfolio.available_capital < dec!(9501));
    assert!(snapshot.portfolio.available_capital > dec!(9498));
    assert_eq!(snapshot.open_reservations, 0);

    handle.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn duplicate_proposal_yields_one_command() {
    let db = Database::in_memory().await.unwrap();
    let portfolios: Arc<dyn PortfolioRepository> =
        Arc::new(SqlitePortfolioRepository::new(db.pool.clone()));
    let strategies: Arc<dyn StrategyRepository> =
        Arc::new(SqliteStrategyRepository::new(db.pool.clone()));
    let trades: Arc<dyn TradeRepository> = Arc::new(SqliteTradeRepository::new(db.pool.clone()));
    let positions: Arc<dyn PositionRepository> =
        Arc::new(SqlitePositionRepository::new(db.pool.clone()));

    let portfolio = Portfolio::new("main", "USDT", dec!(10000));
    portfolios.save(&portfolio).await.unwrap();
    let def = StrategyDef {
        id: "s1".to_string(),
        kind: StrategyKind::MaCrossover,
        exchange: "mock".to_string(),
        symbol: "BTC/USDT".to_string(),
        params: serde_json::json!({}),
        sizing: SizingParams {
            risk_percent: dec!(0.001),
            lot_step: dec!(0.0001),
            min_amount: dec!(0.0001),
        },
        active: true,
        portfolio_id: portfolio.id,
    };
    strategies.save(&def).await.unwrap();

    let cfg = test_config("unused", None);
    let rules = RuleSet::from_config(&cfg.trading);
    let (manager, handle) = CapitalManager::new(
        portfolio,
        rules,
        cfg.trading.clone(),
        trades,
        positions,
        portfolios,
        strategies,
        Metrics::new().unwrap(),
        ReconcileGate::new(),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(manager.run(shutdown_rx));

    let broker = MemoryBroker::new();
    let capital_bus = BusClient::new(Arc::clone(&broker), BusConfig::new("capital"));
    let _subs = attach_bus(&capital_bus, handle, &["s1".to_string()], 10).await;

    // Count every execute_trade the manager emits.
    let probe = broker
        .declare_queue("probe.commands", 16, OverflowPolicy::Reject)
        .await;
    broker
        .bind(
            "probe.commands",
            BusExchange::Commands,
            "commands.execute_trade",
        )
        .await;

    let worker_bus = BusClient::new(Arc::clone(&broker), BusConfig::new("worker.s1"));
    let request = AllocationRequest {
        strategy_id: "s1".to_string(),
        exchange: "mock".to_string(),
        symbol: "BTC/USDT".to_string(),
        fingerprint: "same-fp".to_string(),
        proposal: Proposal {
            side: OrderSide::Buy,
            signal_price: dec!(50000),
            stop_loss_price: Some(dec!(49000)),
            take_profit_price: None,
            intent_tag: "ma_cross_long".to_string(),
            strategy_params: serde_json::json!({}),
            bar_close_ts: Utc::now(),
        },
        requested_at: Utc::now(),
    };
    let payload = serde_json::to_value(&request).unwrap();

    let first: AllocationResponse = worker_bus
        .request(
            "request.capital.allocation.s1",
            "response.capital.allocation",
            payload.clone(),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap()
        .parse_payload()
        .unwrap();
    assert_eq!(first.result, AllocationVerdict::Approved);

    // Same fingerprint 100ms later: denied, and no second command.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second: AllocationResponse = worker_bus
        .request(
            "request.capital.allocation.s1",
            "response.capital.allocation",
            payload,
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap()
        .parse_payload()
        .unwrap();
    assert_eq!(second.result, AllocationVerdict::Denied);
    assert!(second.reasons.contains(&"duplicate_proposal".to_string()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.len(), 1, "exactly one execute_trade command");
}
