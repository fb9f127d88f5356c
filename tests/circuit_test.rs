//! Circuit breaker behavior at the connector boundary: open on consecutive
//! failures, fail fast while open, recover through a half-open probe.

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tradewire::application::connector::ExchangeConnector;
use tradewire::bus::broker::HEADER_FIRST_DEATH_REASON;
use tradewire::bus::{BusClient, BusConfig, BusExchange, MemoryBroker, OverflowPolicy, Queue};
use tradewire::config::{BusOptions, ExecutionOptions};
use tradewire::domain::repositories::TradeRepository;
use tradewire::domain::types::{OrderSide, OrderType, TradeCommand};
use tradewire::infrastructure::exchange::MockExchange;
use tradewire::infrastructure::observability::Metrics;
use tradewire::infrastructure::persistence::{Database, SqliteTradeRepository};
use uuid::Uuid;

struct World {
    bus: Arc<BusClient>,
    mock: Arc<MockExchange>,
    dlq: Arc<Queue>,
    circuit_open: Arc<Queue>,
    circuit_closed: Arc<Queue>,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

async fn world(threshold: usize, cool_down_ms: u64) -> World {
    let db = Database::in_memory().await.unwrap();
    let trades: Arc<dyn TradeRepository> = Arc::new(SqliteTradeRepository::new(db.pool.clone()));

    let broker = MemoryBroker::new();
    // No handler retries: each failed command dead-letters at once, so the
    // test counts one placement attempt per publish.
    let mut bus_cfg = BusConfig::new("connector");
    bus_cfg.max_retries = 0;
    bus_cfg.retry_backoff = vec![Duration::from_millis(1)];
    let bus = BusClient::new(Arc::clone(&broker), bus_cfg);

    let dlq = broker.declare_queue("dlq", 64, OverflowPolicy::Reject).await;
    broker.bind("dlq", BusExchange::Dlx, "#").await;
    let circuit_open = broker
        .declare_queue("probe.open", 16, OverflowPolicy::Reject)
        .await;
    broker
        .bind(
            "probe.open",
            BusExchange::Events,
            "events.system.exchange_circuit_open",
        )
        .await;
    let circuit_closed = broker
        .declare_queue("probe.closed", 16, OverflowPolicy::Reject)
        .await;
    broker
        .bind(
            "probe.closed",
            BusExchange::Events,
            "events.system.exchange_circuit_closed",
        )
        .await;

    let mock = Arc::new(MockExchange::new());
    let execution = ExecutionOptions {
        order_timeout_ms: 1_000,
        retry_attempts: 3,
        slippage_tolerance: dec!(0.005),
        circuit_breaker_threshold: threshold,
        circuit_breaker_cool_down_ms: cool_down_ms,
        requests_per_minute: 10_000,
        orders_per_second: 1_000,
        orders_per_day: 100_000,
        price_cache_ttl_ms: 500,
        price_cache_capacity: 64,
    };
    let bus_opts = BusOptions {
        prefetch_commands: 10,
        prefetch_market_data: 100,
        max_retries: 0,
        retry_backoff_ms: vec![1],
        publish_buffer: 1_000,
        request_timeout_ms: 1_000,
    };

    let connector = ExchangeConnector::new(
        Arc::clone(&bus),
        mock.clone(),
        trades,
        execution,
        bus_opts,
        vec!["BTC/USDT".to_string()],
        Metrics::new().unwrap(),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    connector.start(shutdown_rx).await.unwrap();

    World {
        bus,
        mock,
        dlq,
        circuit_open,
        circuit_closed,
        _shutdown: shutdown_tx,
    }
}

fn command() -> TradeCommand {
    TradeCommand {
        strategy_id: "s1".to_string(),
        exchange: "mock".to_string(),
        symbol: "BTC/USDT".to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        amount: dec!(0.01),
        price: Some(dec!(50000)),
        stop_loss: None,
        take_profit: None,
        client_order_id: Uuid::new_v4(),
    }
}

async fn send(world: &World, command: &TradeCommand) {
    let payload = serde_json::to_value(command).unwrap();
    let envelope = world.bus.envelope(Some(command.client_order_id), payload);
    world
        .bus
        .publish(BusExchange::Commands, "commands.execute_trade", envelope)
        .await
        .unwrap();
}

async fn drain_until(queue: &Arc<Queue>, at_least: usize) -> Vec<tradewire::bus::Delivery> {
    let mut seen = Vec::new();
    for _ in 0..100 {
        while let Some(d) = queue.try_recv() {
            seen.push(d);
        }
        if seen.len() >= at_least {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    seen
}

#[tokio::test]
async fn consecutive_failures_open_then_half_open_recovers() {
    let world = world(3, 300).await;
    world.mock.fail_next(3).await;

    // Three 5xx placements: the third opens the circuit.
    for _ in 0..3 {
        send(&world, &command()).await;
    }
    let open_events = drain_until(&world.circuit_open, 1).await;
    assert_eq!(open_events.len(), 1, "circuit opened exactly once");
    let dead = drain_until(&world.dlq, 3).await;
    assert_eq!(dead.len(), 3);

    // While open: fail fast, no placement reaches the exchange.
    send(&world, &command()).await;
    let dead = drain_until(&world.dlq, 1).await;
    assert_eq!(dead.len(), 1);
    assert!(
        dead[0].headers[HEADER_FIRST_DEATH_REASON].contains("exchange_unavailable"),
        "fast-fail reason, got {:?}",
        dead[0].headers
    );
    assert_eq!(world.mock.order_count().await, 0);

    // After the cool-down the half-open probe succeeds and the circuit
    // closes again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    send(&world, &command()).await;
    let closed_events = drain_until(&world.circuit_closed, 1).await;
    assert_eq!(closed_events.len(), 1, "circuit closed after probe");
    assert_eq!(world.mock.order_count().await, 1);
}

#[tokio::test]
async fn duplicate_command_never_places_twice() {
    let world = world(5, 30_000).await;
    let command = command();

    send(&world, &command).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(&world, &command).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(world.mock.order_count().await, 1);
}
