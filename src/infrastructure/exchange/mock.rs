use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{
    Candle, ExchangeOrder, ExchangePosition, ExchangeStreamEvent, FillRecord, OrderAck,
    OrderState, TradeCommand,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

const STREAM_BUFFER: usize = 256;
const TAKER_FEE_RATE: Decimal = dec!(0.001);

struct MockState {
    orders: HashMap<Uuid, OrderAck>,
    open_orders: Vec<ExchangeOrder>,
    positions: Vec<ExchangePosition>,
    balances: HashMap<String, Decimal>,
    history: Vec<FillRecord>,
    bars: HashMap<String, Vec<Candle>>,
    fail_remaining: u32,
    order_seq: u64,
}

/// In-process exchange used by the integration suite and paper-trading mode.
///
/// Orders are acknowledged immediately; with `auto_fill` enabled a full fill
/// is streamed right after the ack. Failures are scripted with `fail_next`.
pub struct MockExchange {
    name: String,
    auto_fill: bool,
    state: Arc<RwLock<MockState>>,
    subscribers: Arc<RwLock<Vec<Sender<ExchangeStreamEvent>>>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::with_auto_fill(true)
    }

    pub fn with_auto_fill(auto_fill: bool) -> Self {
        Self {
            name: "mock".to_string(),
            auto_fill,
            state: Arc::new(RwLock::new(MockState {
                orders: HashMap::new(),
                open_orders: Vec::new(),
                positions: Vec::new(),
                balances: HashMap::new(),
                history: Vec::new(),
                bars: HashMap::new(),
                fail_remaining: 0,
                order_seq: 0,
            })),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Make the next `n` order placements fail with a simulated 5xx.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.fail_remaining = n;
    }

    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(asset.to_string(), amount);
    }

    pub async fn seed_bars(&self, symbol: &str, bars: Vec<Candle>) {
        self.state
            .write()
            .await
            .bars
            .insert(symbol.to_string(), bars);
    }

    /// Script an order the exchange reports but the system never placed.
    pub async fn add_open_order(&self, order: ExchangeOrder) {
        self.state.write().await.open_orders.push(order);
    }

    pub async fn add_position(&self, position: ExchangePosition) {
        self.state.write().await.positions.push(position);
    }

    pub async fn add_history(&self, fill: FillRecord) {
        self.state.write().await.history.push(fill);
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }

    /// Broadcast a stream event to every subscriber; dead receivers are
    /// pruned.
    pub async fn push_event(&self, event: ExchangeStreamEvent) {
        let mut subs = self.subscribers.write().await;
        let mut alive = Vec::new();
        for tx in subs.iter() {
            if tx.send(event.clone()).await.is_ok() {
                alive.push(tx.clone());
            }
        }
        *subs = alive;
    }

    pub async fn inject_bar(&self, candle: Candle) {
        let mut state = self.state.write().await;
        state
            .bars
            .entry(candle.symbol.clone())
            .or_default()
            .push(candle.clone());
        drop(state);
        self.push_event(ExchangeStreamEvent::Bar(candle)).await;
    }

    /// Simulate a stream drop and recovery with the given gap.
    pub async fn reconnect_stream(&self, gap_ms: i64) {
        self.push_event(ExchangeStreamEvent::Disconnected).await;
        self.push_event(ExchangeStreamEvent::Connected { gap_ms }).await;
    }

    fn fill_price(command: &TradeCommand, state: &MockState) -> Decimal {
        if let Some(price) = command.price {
            return price;
        }
        state
            .bars
            .get(&command.symbol)
            .and_then(|bars| bars.last())
            .map(|b| b.close)
            .unwrap_or(Decimal::ZERO)
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        info!("MockExchange: connected");
        Ok(())
    }

    async fn place_order(&self, command: &TradeCommand) -> Result<OrderAck> {
        let fill = {
            let mut state = self.state.write().await;

            // Idempotency: a known client_order_id returns the existing order.
            if let Some(existing) = state.orders.get(&command.client_order_id) {
                debug!(
                    "MockExchange: duplicate client_order_id {}, returning existing order {}",
                    command.client_order_id, existing.exchange_order_id
                );
                return Ok(existing.clone());
            }

            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                bail!("simulated exchange 5xx");
            }

            state.order_seq += 1;
            let ack = OrderAck {
                client_order_id: command.client_order_id,
                exchange_order_id: format!("mock-{}", state.order_seq),
                state: OrderState::Accepted,
                accepted_at: Utc::now(),
            };
            state.orders.insert(command.client_order_id, ack.clone());

            if self.auto_fill {
                let price = Self::fill_price(command, &state);
                let fee = command.amount * price * TAKER_FEE_RATE;
                state.history.push(FillRecord {
                    client_order_id: Some(command.client_order_id),
                    exchange_order_id: ack.exchange_order_id.clone(),
                    symbol: command.symbol.clone(),
                    side: command.side,
                    amount: command.amount,
                    price,
                    fee,
                    ts: Utc::now(),
                });
                Some((ack, price, fee))
            } else {
                state.open_orders.push(ExchangeOrder {
                    client_order_id: Some(command.client_order_id),
                    exchange_order_id: ack.exchange_order_id.clone(),
                    symbol: command.symbol.clone(),
                    side: command.side,
                    amount: command.amount,
                    filled_amount: Decimal::ZERO,
                    price: command.price,
                    state: OrderState::Accepted,
                    created_at: Utc::now(),
                });
                return Ok(ack);
            }
        };

        let (ack, price, fee) = fill.expect("auto_fill branch always yields a fill");
        self.push_event(ExchangeStreamEvent::Order(
            crate::domain::types::OrderUpdate {
                client_order_id: command.client_order_id,
                exchange_order_id: ack.exchange_order_id.clone(),
                symbol: command.symbol.clone(),
                state: OrderState::Filled,
                filled_amount: command.amount,
                avg_fill_price: Some(price),
                fee,
                ts: Utc::now(),
            },
        ))
        .await;
        Ok(ack)
    }

    async fn cancel_order(&self, client_order_id: Uuid) -> Result<bool> {
        let removed = {
            let mut state = self.state.write().await;
            let before = state.open_orders.len();
            state
                .open_orders
                .retain(|o| o.client_order_id != Some(client_order_id));
            let removed = state.open_orders.len() < before;
            if removed {
                if let Some(ack) = state.orders.get_mut(&client_order_id) {
                    ack.state = OrderState::Canceled;
                }
            }
            removed
        };
        if removed {
            let update = {
                let state = self.state.read().await;
                state.orders.get(&client_order_id).map(|ack| {
                    crate::domain::types::OrderUpdate {
                        client_order_id,
                        exchange_order_id: ack.exchange_order_id.clone(),
                        symbol: String::new(),
                        state: OrderState::Canceled,
                        filled_amount: Decimal::ZERO,
                        avg_fill_price: None,
                        fee: Decimal::ZERO,
                        ts: Utc::now(),
                    }
                })
            };
            if let Some(update) = update {
                self.push_event(ExchangeStreamEvent::Order(update)).await;
            }
        }
        Ok(removed)
    }

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>> {
        Ok(self.state.read().await.balances.clone())
    }

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        Ok(self.state.read().await.open_orders.clone())
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        Ok(self.state.read().await.positions.clone())
    }

    async fn get_market_data(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let state = self.state.read().await;
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        let start = bars.len().saturating_sub(limit);
        Ok(bars[start..].to_vec())
    }

    async fn get_trade_history(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .iter()
            .filter(|f| f.symbol == symbol && f.ts >= since)
            .cloned()
            .collect())
    }

    async fn stream(&self, _symbols: Vec<String>) -> Result<Receiver<ExchangeStreamEvent>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tx.send(ExchangeStreamEvent::Connected { gap_ms: 0 })
            .await
            .ok();
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{OrderSide, OrderType};
    use tokio_test::assert_ok;

    fn command(amount: Decimal, price: Decimal) -> TradeCommand {
        TradeCommand {
            strategy_id: "s1".to_string(),
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            amount,
            price: Some(price),
            stop_loss: None,
            take_profit: None,
            client_order_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn place_order_is_idempotent_on_client_order_id() {
        let exchange = MockExchange::new();
        let cmd = command(dec!(0.1), dec!(50000));

        let first = exchange.place_order(&cmd).await.unwrap();
        let second = exchange.place_order(&cmd).await.unwrap();

        assert_eq!(first.exchange_order_id, second.exchange_order_id);
        assert_eq!(exchange.order_count().await, 1);
    }

    #[tokio::test]
    async fn auto_fill_streams_a_filled_update() {
        let exchange = MockExchange::new();
        let mut rx = exchange.stream(vec!["BTC/USDT".to_string()]).await.unwrap();
        // Drain the initial Connected event.
        assert!(matches!(
            rx.recv().await,
            Some(ExchangeStreamEvent::Connected { .. })
        ));

        let cmd = command(dec!(0.5), dec!(40000));
        exchange.place_order(&cmd).await.unwrap();

        match rx.recv().await {
            Some(ExchangeStreamEvent::Order(update)) => {
                assert_eq!(update.client_order_id, cmd.client_order_id);
                assert_eq!(update.state, OrderState::Filled);
                assert_eq!(update.filled_amount, dec!(0.5));
                assert_eq!(update.avg_fill_price, Some(dec!(40000)));
            }
            other => panic!("expected order update, got {:?}", other.is_some()),
        }
    }

    #[tokio::test]
    async fn scripted_failures_then_recovery() {
        let exchange = MockExchange::new();
        exchange.fail_next(2).await;

        assert!(exchange.place_order(&command(dec!(1), dec!(10))).await.is_err());
        assert!(exchange.place_order(&command(dec!(1), dec!(10))).await.is_err());
        assert_ok!(exchange.place_order(&command(dec!(1), dec!(10))).await);
    }
}
