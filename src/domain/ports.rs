use crate::domain::entities::StrategyDef;
use crate::domain::types::{
    Candle, ExchangeOrder, ExchangePosition, ExchangeStreamEvent, FillRecord, Frame, OrderAck,
    Proposal, TradeCommand,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

/// The contract every strategy implementation fulfils. The worker hosts one
/// instance per active strategy definition.
///
/// `populate_indicators` and `on_data` are pure: for the same frame and tick
/// they must return the same result, and must not mutate their inputs. The
/// worker relies on this to skip recomputation on replays.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Routing keys the worker must subscribe to before the first tick.
    fn required_subscriptions(&self) -> Vec<String>;

    /// Derive indicator columns from the window. Pure and idempotent.
    fn populate_indicators(&self, frame: &Frame) -> Frame;

    /// Decide on the latest bar. Pure; `None` means no trade intent.
    fn on_data(&self, latest: &Candle, frame: &Frame) -> Option<Proposal>;

    /// Lifecycle hook: load state, warm caches.
    async fn on_start(&mut self, def: &StrategyDef) -> Result<()>;

    /// Lifecycle hook: persist state before the worker stops.
    async fn on_stop(&mut self) -> Result<()>;
}

/// Sole boundary to an exchange. Implementations map to any CCXT-like SDK;
/// the core ships a mock used for tests and paper trading.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Idempotent on `command.client_order_id`: resubmitting the same id
    /// returns the existing order instead of placing a new one.
    async fn place_order(&self, command: &TradeCommand) -> Result<OrderAck>;

    async fn cancel_order(&self, client_order_id: Uuid) -> Result<bool>;

    async fn get_balance(&self) -> Result<HashMap<String, Decimal>>;

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn get_market_data(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    async fn get_trade_history(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>>;

    /// Subscribe to bars and order updates for `symbols`. The receiver is the
    /// stream; the adapter reconnects internally and signals gaps with
    /// `ExchangeStreamEvent::Connected`.
    async fn stream(&self, symbols: Vec<String>) -> Result<Receiver<ExchangeStreamEvent>>;
}
