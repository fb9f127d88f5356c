//! Exchange Connector: the sole boundary to the exchange adapter. Executes
//! commands, streams market data, maps order events onto trade records and
//! guards the exchange with rate limits and a circuit breaker.

pub mod price_cache;
pub mod rate_limit;

pub use price_cache::PriceCache;
pub use rate_limit::{RateLimits, TokenBucket};

use crate::bus::{
    handler, keys, BusClient, BusExchange, HandlerError, Subscription, SubscriptionHandle,
};
use crate::config::{BusOptions, ExecutionOptions};
use crate::domain::events::{TradeExecutedEvent, WsReconnectedEvent};
use crate::domain::ports::ExchangeAdapter;
use crate::domain::repositories::TradeRepository;
use crate::domain::types::{
    CancelCommand, ExchangeStreamEvent, HistoryRequest, HistoryResponse, OrderAck, OrderState,
    OrderUpdate, TradeCommand, TradeStatus,
};
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitTransition};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a client_order_id stays in the local seen-set. The exchange's own
/// idempotency is the backstop once entries expire.
const SEEN_TTL: Duration = Duration::from_secs(3600);

pub struct ConnectorHandles {
    pub subscriptions: Vec<SubscriptionHandle>,
    pub stream_task: JoinHandle<()>,
}

pub struct ExchangeConnector {
    bus: Arc<BusClient>,
    adapter: Arc<dyn ExchangeAdapter>,
    trades: Arc<dyn TradeRepository>,
    cfg: ExecutionOptions,
    bus_opts: BusOptions,
    symbols: Vec<String>,
    metrics: Metrics,
    circuit: CircuitBreaker,
    limits: RateLimits,
    price_cache: PriceCache,
    seen: Mutex<HashMap<Uuid, (OrderAck, Instant)>>,
    symbol_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ExchangeConnector {
    pub fn new(
        bus: Arc<BusClient>,
        adapter: Arc<dyn ExchangeAdapter>,
        trades: Arc<dyn TradeRepository>,
        cfg: ExecutionOptions,
        bus_opts: BusOptions,
        symbols: Vec<String>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let circuit = CircuitBreaker::new(
            "exchange",
            cfg.circuit_breaker_threshold,
            1,
            Duration::from_millis(cfg.circuit_breaker_cool_down_ms),
        );
        let limits = RateLimits::new(&cfg);
        let price_cache = PriceCache::new(
            Duration::from_millis(cfg.price_cache_ttl_ms),
            cfg.price_cache_capacity,
        );
        Arc::new(Self {
            bus,
            adapter,
            trades,
            cfg,
            bus_opts,
            symbols,
            metrics,
            circuit,
            limits,
            price_cache,
            seen: Mutex::new(HashMap::new()),
            symbol_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cached_price(&self, symbol: &str) -> Option<rust_decimal::Decimal> {
        self.price_cache.get(symbol)
    }

    /// Connect, sweep open orders, wire the command/request consumers and
    /// start the market stream.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConnectorHandles> {
        self.adapter.connect().await?;
        self.startup_sweep().await?;

        let mut subscriptions = Vec::new();

        let execute = Arc::clone(self);
        subscriptions.push(
            self.bus
                .subscribe(
                    Subscription::new("connector.commands")
                        .bind(BusExchange::Commands, keys::EXECUTE_TRADE)
                        .prefetch(self.bus_opts.prefetch_commands),
                    handler(move |delivery| {
                        let connector = Arc::clone(&execute);
                        async move { connector.handle_execute(delivery).await }
                    }),
                )
                .await,
        );

        let cancel = Arc::clone(self);
        subscriptions.push(
            self.bus
                .subscribe(
                    Subscription::new("connector.cancels")
                        .bind(BusExchange::Commands, keys::CANCEL_ORDER)
                        .prefetch(self.bus_opts.prefetch_commands),
                    handler(move |delivery| {
                        let connector = Arc::clone(&cancel);
                        async move { connector.handle_cancel(delivery).await }
                    }),
                )
                .await,
        );

        let history = Arc::clone(self);
        subscriptions.push(
            self.bus
                .subscribe(
                    Subscription::new("connector.history")
                        .bind(BusExchange::Requests, "request.market_data.history.#")
                        .prefetch(self.bus_opts.prefetch_commands),
                    handler(move |delivery| {
                        let connector = Arc::clone(&history);
                        async move { connector.handle_history(delivery).await }
                    }),
                )
                .await,
        );

        let stream_task = tokio::spawn(Self::stream_loop(Arc::clone(self), shutdown));

        info!(
            "ExchangeConnector: started on '{}' ({} symbols)",
            self.adapter.name(),
            self.symbols.len()
        );
        Ok(ConnectorHandles {
            subscriptions,
            stream_task,
        })
    }

    /// Match exchange-visible open orders back onto pending trade records so
    /// a restart does not leave acknowledged orders stuck in `pending`.
    async fn startup_sweep(&self) -> Result<()> {
        let open_orders = self.adapter.get_open_orders().await?;
        let mut repaired = 0;
        for order in &open_orders {
            let Some(client_order_id) = order.client_order_id else {
                continue;
            };
            let Some(mut trade) = self.trades.find_by_correlation(client_order_id).await? else {
                continue;
            };
            if trade.status == TradeStatus::Pending {
                trade.exchange_order_id = Some(order.exchange_order_id.clone());
                trade.transition(TradeStatus::Open)?;
                self.trades.update(&trade).await?;
                repaired += 1;
            }
        }
        info!(
            "ExchangeConnector: startup sweep saw {} open order(s), repaired {}",
            open_orders.len(),
            repaired
        );
        Ok(())
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.symbol_locks.lock().expect("symbol lock map poisoned");
        locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn seen_ack(&self, client_order_id: Uuid) -> Option<OrderAck> {
        let mut seen = self.seen.lock().expect("seen set poisoned");
        seen.retain(|_, (_, at)| at.elapsed() < SEEN_TTL);
        seen.get(&client_order_id).map(|(ack, _)| ack.clone())
    }

    async fn publish_circuit_transition(&self, transition: Option<CircuitTransition>) {
        if let Some(transition) = transition {
            let envelope = self.bus.envelope(None, serde_json::json!({}));
            let _ = self
                .bus
                .publish(
                    BusExchange::Events,
                    &keys::system(transition.event_suffix()),
                    envelope,
                )
                .await;
        }
    }

    async fn handle_execute(
        self: &Arc<Self>,
        delivery: crate::bus::Delivery,
    ) -> Result<(), HandlerError> {
        let command: TradeCommand = delivery
            .envelope
            .parse_payload()
            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;

        // Expired commands are abandoned; reconciliation owns the aftermath.
        if delivery.envelope.is_expired(Utc::now()) {
            warn!(
                "ExchangeConnector: command {} past deadline, abandoning",
                command.client_order_id
            );
            self.mark_trade_failed(command.client_order_id, "deadline_exceeded")
                .await;
            return Ok(());
        }

        // Idempotency: a replayed command returns the recorded ack and
        // nothing reaches the exchange twice.
        if let Some(ack) = self.seen_ack(command.client_order_id) {
            debug!(
                "ExchangeConnector: duplicate command {} (order {}), skipping",
                command.client_order_id, ack.exchange_order_id
            );
            return Ok(());
        }

        // Order-mutating work is serialized per symbol.
        let lock = self.symbol_lock(&command.symbol);
        let _guard = lock.lock().await;

        self.limits.acquire_order().await.map_err(|e| {
            self.metrics.orders_failed.inc();
            HandlerError::Retry(format!("rate_limited: {}", e))
        })?;

        match self.circuit.try_acquire().await {
            Ok(transition) => self.publish_circuit_transition(transition).await,
            Err(open) => {
                return Err(HandlerError::Retry(format!(
                    "exchange_unavailable: retry in {}ms",
                    open.remaining_ms
                )));
            }
        }

        // A warm price cache means the tight 200ms budget applies; a miss
        // gets the 500ms allowance.
        let cache_warm = self.price_cache.get(&command.symbol).is_some();
        let timer =
            self.metrics
                .placement_timer(&command.symbol, command.client_order_id, cache_warm);
        let placed = tokio::time::timeout(
            Duration::from_millis(self.cfg.order_timeout_ms),
            self.adapter.place_order(&command),
        )
        .await;
        drop(timer);

        match placed {
            Ok(Ok(ack)) => {
                let transition = self.circuit.record_success().await;
                self.publish_circuit_transition(transition).await;
                self.metrics.orders_placed.inc();
                self.seen
                    .lock()
                    .expect("seen set poisoned")
                    .insert(command.client_order_id, (ack.clone(), Instant::now()));
                self.record_ack(&command, &ack).await;
                Ok(())
            }
            Ok(Err(e)) => {
                let transition = self.circuit.record_failure().await;
                self.publish_circuit_transition(transition).await;
                self.metrics.orders_failed.inc();
                Err(HandlerError::Retry(format!("order placement failed: {}", e)))
            }
            Err(_) => {
                // Timed out: counts against the circuit but is NOT retried;
                // the order may have reached the exchange and the reconciler
                // will find out.
                let transition = self.circuit.record_failure().await;
                self.publish_circuit_transition(transition).await;
                self.metrics.orders_failed.inc();
                warn!(
                    "ExchangeConnector: placement of {} timed out after {}ms, leaving to reconciliation",
                    command.client_order_id, self.cfg.order_timeout_ms
                );
                Ok(())
            }
        }
    }

    async fn record_ack(&self, command: &TradeCommand, ack: &OrderAck) {
        match self.trades.find_by_correlation(command.client_order_id).await {
            Ok(Some(mut trade)) => {
                trade.exchange_order_id = Some(ack.exchange_order_id.clone());
                if trade.status == TradeStatus::Pending {
                    if let Err(e) = trade.transition(TradeStatus::Open) {
                        warn!("ExchangeConnector: {}", e);
                    }
                }
                if let Err(e) = self.trades.update(&trade).await {
                    error!(
                        "ExchangeConnector: failed to record ack for {}: {}",
                        command.client_order_id, e
                    );
                }
            }
            Ok(None) => warn!(
                "ExchangeConnector: ack for unknown correlation {}",
                command.client_order_id
            ),
            Err(e) => error!("ExchangeConnector: trade lookup failed: {}", e),
        }
    }

    async fn mark_trade_failed(&self, client_order_id: Uuid, reason: &str) {
        if let Ok(Some(mut trade)) = self.trades.find_by_correlation(client_order_id).await
            && !trade.status.is_terminal()
        {
            let target = if trade.status == TradeStatus::Pending {
                TradeStatus::Failed
            } else {
                TradeStatus::Canceled
            };
            if trade.transition(target).is_ok() {
                if let Err(e) = self.trades.update(&trade).await {
                    error!("ExchangeConnector: failed to mark trade {}: {}", reason, e);
                } else {
                    let event = TradeExecutedEvent {
                        fill: OrderUpdate {
                            client_order_id,
                            exchange_order_id: trade
                                .exchange_order_id
                                .clone()
                                .unwrap_or_default(),
                            symbol: trade.symbol.clone(),
                            state: OrderState::Canceled,
                            filled_amount: rust_decimal::Decimal::ZERO,
                            avg_fill_price: None,
                            fee: rust_decimal::Decimal::ZERO,
                            ts: Utc::now(),
                        },
                        trade,
                    };
                    self.publish_trade_executed(&event).await;
                }
            }
        }
    }

    async fn handle_cancel(
        self: &Arc<Self>,
        delivery: crate::bus::Delivery,
    ) -> Result<(), HandlerError> {
        let command: CancelCommand = delivery
            .envelope
            .parse_payload()
            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;

        let lock = self.symbol_lock(&command.symbol);
        let _guard = lock.lock().await;

        self.limits.acquire_request().await;
        match self.adapter.cancel_order(command.client_order_id).await {
            Ok(true) => {
                info!(
                    "ExchangeConnector: canceled order {}",
                    command.client_order_id
                );
                Ok(())
            }
            Ok(false) => {
                warn!(
                    "ExchangeConnector: cancel for unknown order {}",
                    command.client_order_id
                );
                Ok(())
            }
            Err(e) => Err(HandlerError::Retry(format!("cancel failed: {}", e))),
        }
    }

    async fn handle_history(
        self: &Arc<Self>,
        delivery: crate::bus::Delivery,
    ) -> Result<(), HandlerError> {
        let request: HistoryRequest = delivery
            .envelope
            .parse_payload()
            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;

        self.limits.acquire_request().await;
        let bars = self
            .adapter
            .get_market_data(&request.symbol, &request.timeframe, request.limit)
            .await
            .map_err(|e| HandlerError::Retry(format!("history fetch failed: {}", e)))?;

        let payload = serde_json::to_value(HistoryResponse { bars })
            .map_err(|e| HandlerError::Fatal(format!("encode history: {}", e)))?;
        self.bus
            .respond(&delivery, payload)
            .await
            .map_err(|e| HandlerError::Retry(e.to_string()))
    }

    async fn stream_loop(connector: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut reconnect_backoff = Duration::from_millis(500);
        let mut down_since: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut rx = match connector.adapter.stream(connector.symbols.clone()).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(
                        "ExchangeConnector: stream subscribe failed ({}), retrying in {:?}",
                        e, reconnect_backoff
                    );
                    tokio::time::sleep(reconnect_backoff).await;
                    reconnect_backoff = (reconnect_backoff * 2).min(Duration::from_secs(30));
                    continue;
                }
            };
            reconnect_backoff = Duration::from_millis(500);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                connector
                                    .handle_stream_event(event, &mut down_since)
                                    .await;
                            }
                            None => {
                                warn!("ExchangeConnector: market stream closed, reconnecting");
                                down_since.get_or_insert_with(Instant::now);
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_stream_event(
        self: &Arc<Self>,
        event: ExchangeStreamEvent,
        down_since: &mut Option<Instant>,
    ) {
        match event {
            ExchangeStreamEvent::Bar(candle) => {
                self.price_cache.insert(&candle.symbol, candle.close);
                let key = keys::market_data(&candle.exchange, &candle.symbol);
                let payload = match serde_json::to_value(&candle) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("ExchangeConnector: failed to encode bar: {}", e);
                        return;
                    }
                };
                let envelope = self.bus.envelope(None, payload);
                if let Err(e) = self.bus.publish(BusExchange::MarketData, &key, envelope).await {
                    debug!("ExchangeConnector: tick publish failed: {}", e);
                }
            }
            ExchangeStreamEvent::Order(update) => {
                self.handle_order_update(update).await;
            }
            ExchangeStreamEvent::Connected { gap_ms } => {
                let measured = down_since
                    .take()
                    .map(|t| t.elapsed().as_millis() as i64)
                    .unwrap_or(0);
                let gap_ms = gap_ms.max(measured);
                if gap_ms > 0 {
                    info!(
                        "ExchangeConnector: stream reconnected after {}ms gap",
                        gap_ms
                    );
                    let event = WsReconnectedEvent {
                        exchange: self.adapter.name().to_string(),
                        gap_ms,
                    };
                    if let Ok(payload) = serde_json::to_value(&event) {
                        let envelope = self.bus.envelope(None, payload);
                        let _ = self
                            .bus
                            .publish(
                                BusExchange::Events,
                                &keys::system("ws_reconnected"),
                                envelope,
                            )
                            .await;
                    }
                }
            }
            ExchangeStreamEvent::Disconnected => {
                warn!("ExchangeConnector: stream reported disconnect");
                down_since.get_or_insert_with(Instant::now);
            }
        }
    }

    /// Map an exchange order event onto the trade record and broadcast the
    /// post-image. Runs under the symbol lock so it cannot interleave with an
    /// in-flight placement for the same symbol.
    async fn handle_order_update(self: &Arc<Self>, update: OrderUpdate) {
        let lock = self.symbol_lock(&update.symbol);
        let _guard = lock.lock().await;

        let mut trade = match self.trades.find_by_correlation(update.client_order_id).await {
            Ok(Some(trade)) => trade,
            Ok(None) => {
                warn!(
                    "ExchangeConnector: order update for unknown correlation {} (reconciler will pick it up)",
                    update.client_order_id
                );
                return;
            }
            Err(e) => {
                error!("ExchangeConnector: trade lookup failed: {}", e);
                return;
            }
        };

        let target = match update.state {
            OrderState::Accepted | OrderState::PartiallyFilled => TradeStatus::Open,
            OrderState::Filled => TradeStatus::Closed,
            OrderState::Canceled => TradeStatus::Canceled,
            OrderState::Rejected => {
                if trade.status == TradeStatus::Pending {
                    TradeStatus::Failed
                } else {
                    TradeStatus::Canceled
                }
            }
        };

        // A fill can arrive before the ack's pending->open hop was recorded.
        if trade.status == TradeStatus::Pending
            && target == TradeStatus::Closed
            && trade.transition(TradeStatus::Open).is_err()
        {
            return;
        }
        if trade.status != target {
            if let Err(e) = trade.transition(target) {
                warn!(
                    "ExchangeConnector: dropping out-of-order update for {}: {}",
                    update.client_order_id, e
                );
                return;
            }
        }

        if trade.exchange_order_id.is_none() {
            trade.exchange_order_id = Some(update.exchange_order_id.clone());
        }
        if let Some(price) = update.avg_fill_price {
            // Market orders carry no limit price; the tick cache supplies the
            // slippage reference instead.
            let reference = trade.price.or_else(|| self.price_cache.get(&update.symbol));
            if let Some(expected) = reference
                && expected > rust_decimal::Decimal::ZERO
            {
                let slippage = ((price - expected) / expected).abs();
                if slippage > self.cfg.slippage_tolerance {
                    warn!(
                        "ExchangeConnector: fill for {} slipped {} past tolerance {} (expected {}, got {})",
                        update.client_order_id, slippage, self.cfg.slippage_tolerance, expected, price
                    );
                }
            }
            trade.price = Some(price);
            trade.cost = update.filled_amount * price;
        }
        trade.fee += update.fee;

        if let Err(e) = self.trades.update(&trade).await {
            error!(
                "ExchangeConnector: failed to persist update for {}: {}",
                update.client_order_id, e
            );
            return;
        }

        let event = TradeExecutedEvent {
            trade,
            fill: update,
        };
        self.publish_trade_executed(&event).await;
    }

    async fn publish_trade_executed(&self, event: &TradeExecutedEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(p) => p,
            Err(e) => {
                error!("ExchangeConnector: failed to encode trade_executed: {}", e);
                return;
            }
        };
        let envelope = self
            .bus
            .envelope(Some(event.trade.correlation_id), payload);
        if let Err(e) = self
            .bus
            .publish(BusExchange::Events, keys::TRADE_EXECUTED, envelope)
            .await
        {
            error!("ExchangeConnector: trade_executed publish failed: {}", e);
        }
    }
}
