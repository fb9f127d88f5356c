//! Payloads of `events.*` routing keys.

use crate::domain::entities::Trade;
use crate::domain::types::OrderUpdate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `events.trade_executed`: full post-image of the trade plus the fill that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeExecutedEvent {
    pub trade: Trade,
    pub fill: OrderUpdate,
}

/// `events.system.ws_reconnected`: stream came back after `gap_ms` of
/// silence; consumers decide whether to backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsReconnectedEvent {
    pub exchange: String,
    pub gap_ms: i64,
}

/// `events.system.strategy_halted`: the worker gave up after consecutive
/// failures and the supervisor should mark the strategy inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyHaltedEvent {
    pub strategy_id: String,
    pub consecutive_failures: u32,
    pub reason: String,
}

/// `events.system.position_reconciled`: the reconciler repaired a
/// discrepancy between the database and the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReconciledEvent {
    pub portfolio_id: Uuid,
    pub subject: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_delta: Option<Decimal>,
}

/// `events.system.reconciliation_alert`: a conflict the reconciler refuses
/// to auto-resolve; state was left untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationAlertEvent {
    pub portfolio_id: Uuid,
    pub detail: String,
}
