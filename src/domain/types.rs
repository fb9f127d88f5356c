use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(format!("unknown position side '{}'", other)),
        }
    }
}

impl PositionSide {
    pub fn from_entry(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::StopLoss => write!(f, "stop_loss"),
            OrderType::TakeProfit => write!(f, "take_profit"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop_loss" => Ok(OrderType::StopLoss),
            "take_profit" => Ok(OrderType::TakeProfit),
            other => Err(format!("unknown order type '{}'", other)),
        }
    }
}

/// Lifecycle status of a trade record.
///
/// Valid paths: pending -> open -> {closed, canceled} and pending -> failed.
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Canceled,
    Failed,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::Canceled | TradeStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            TradeStatus::Pending => matches!(
                next,
                TradeStatus::Open | TradeStatus::Canceled | TradeStatus::Failed
            ),
            TradeStatus::Open => matches!(next, TradeStatus::Closed | TradeStatus::Canceled),
            TradeStatus::Closed | TradeStatus::Canceled | TradeStatus::Failed => false,
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
            TradeStatus::Canceled => "canceled",
            TradeStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "open" => Ok(TradeStatus::Open),
            "closed" => Ok(TradeStatus::Closed),
            "canceled" => Ok(TradeStatus::Canceled),
            "failed" => Ok(TradeStatus::Failed),
            other => Err(format!("unknown trade status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One OHLCV bar as delivered on `market_data.<exchange>.<symbol>`.
///
/// All numeric fields are decimals so nothing loses precision on the wire
/// (rust_decimal serializes as strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Close timestamp of the bar, UTC with millisecond precision.
    pub close_ts: DateTime<Utc>,
}

/// Rolling window of bars plus indicator columns computed by a strategy.
///
/// `Strategy::populate_indicators` consumes a frame by reference and returns a
/// new one; the input is never mutated so replays stay deterministic.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    candles: Vec<Candle>,
    indicators: BTreeMap<String, Vec<Option<Decimal>>>,
    max_len: usize,
}

impl Frame {
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            candles: Vec::new(),
            indicators: BTreeMap::new(),
            max_len,
        }
    }

    /// Append a bar, evicting the oldest once the window is full.
    /// A bar with the same close timestamp as the last replaces it.
    pub fn push(&mut self, candle: Candle) {
        if let Some(last) = self.candles.last()
            && last.close_ts == candle.close_ts
        {
            *self.candles.last_mut().unwrap() = candle;
            self.indicators.clear();
            return;
        }
        self.candles.push(candle);
        if self.max_len > 0 && self.candles.len() > self.max_len {
            self.candles.remove(0);
        }
        // Indicator columns are stale once the window moves.
        self.indicators.clear();
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn set_indicator(&mut self, name: &str, column: Vec<Option<Decimal>>) {
        self.indicators.insert(name.to_string(), column);
    }

    pub fn indicator(&self, name: &str) -> Option<&[Option<Decimal>]> {
        self.indicators.get(name).map(|v| v.as_slice())
    }

    /// Latest value of an indicator column, if present and computed.
    pub fn indicator_last(&self, name: &str) -> Option<Decimal> {
        self.indicators
            .get(name)
            .and_then(|col| col.last().copied().flatten())
    }

    /// Value of an indicator column at `offset` bars back from the latest.
    pub fn indicator_back(&self, name: &str, offset: usize) -> Option<Decimal> {
        let col = self.indicators.get(name)?;
        if col.len() <= offset {
            return None;
        }
        col[col.len() - 1 - offset]
    }
}

/// A strategy's candidate trade, prior to risk validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub side: OrderSide,
    pub signal_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    /// Stable tag naming the trading intent, e.g. "ma_cross_long".
    pub intent_tag: String,
    pub strategy_params: serde_json::Value,
    /// Close timestamp of the bar that produced the signal.
    pub bar_close_ts: DateTime<Utc>,
}

/// Payload of `request.capital.allocation.<strategy_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub strategy_id: String,
    pub exchange: String,
    pub symbol: String,
    pub fingerprint: String,
    pub proposal: Proposal,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationVerdict {
    Approved,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioImpact {
    pub position_size_percent: Decimal,
    pub new_portfolio_risk_percent: Decimal,
    pub available_capital_after: Decimal,
}

/// Payload of `response.capital.allocation.<correlation_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub result: AllocationVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_quantity: Option<Decimal>,
    pub risk_level: RiskLevel,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio_impact: Option<PortfolioImpact>,
}

/// Payload of `commands.execute_trade`. `client_order_id` equals the
/// correlation id of the approving allocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCommand {
    pub strategy_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    pub client_order_id: Uuid,
}

/// Payload of `commands.cancel_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelCommand {
    pub exchange: String,
    pub symbol: String,
    pub client_order_id: Uuid,
}

/// Exchange-side view of an order's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Acknowledgement returned by `ExchangeAdapter::place_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub client_order_id: Uuid,
    pub exchange_order_id: String,
    pub state: OrderState,
    pub accepted_at: DateTime<Utc>,
}

/// A fill/lifecycle update streamed by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub client_order_id: Uuid,
    pub exchange_order_id: String,
    pub symbol: String,
    pub state: OrderState,
    pub filled_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

/// An open order as reported by the exchange (reconciliation input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub client_order_id: Option<Uuid>,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
}

/// A position as reported by the exchange (reconciliation input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
}

/// One historical fill, used to backfill missed executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub client_order_id: Option<Uuid>,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: DateTime<Utc>,
}

/// Events delivered by `ExchangeAdapter::stream`.
#[derive(Debug, Clone)]
pub enum ExchangeStreamEvent {
    Bar(Candle),
    Order(OrderUpdate),
    /// Stream (re)established. Carries the time the connection was down.
    Connected { gap_ms: i64 },
    Disconnected,
}

/// Payload of `request.market_data.history.<strategy_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub symbol: String,
    pub timeframe: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub bars: Vec<Candle>,
}

// ===== Symbol handling =====

/// Validates an application symbol: `BASE/QUOTE`, both legs uppercase ASCII.
pub fn validate_symbol(symbol: &str) -> Result<(), String> {
    let Some((base, quote)) = symbol.split_once('/') else {
        return Err(format!("symbol '{}' is missing the '/' separator", symbol));
    };
    if base.is_empty() || quote.is_empty() {
        return Err(format!("symbol '{}' has an empty leg", symbol));
    }
    let leg_ok = |leg: &str| {
        leg.chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    };
    if !leg_ok(base) || !leg_ok(quote) {
        return Err(format!("symbol '{}' must be uppercase BASE/QUOTE", symbol));
    }
    Ok(())
}

/// Lowercased, de-slashed form used inside routing keys:
/// `BTC/USDT` -> `btcusdt`.
pub fn routing_symbol(symbol: &str) -> String {
    symbol.replace('/', "").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(ts_ms: i64, close: Decimal) -> Candle {
        Candle {
            symbol: "BTC/USDT".to_string(),
            exchange: "mock".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_ts: DateTime::from_timestamp_millis(ts_ms).unwrap(),
        }
    }

    #[test]
    fn trade_status_paths() {
        assert!(TradeStatus::Pending.can_transition_to(TradeStatus::Open));
        assert!(TradeStatus::Pending.can_transition_to(TradeStatus::Failed));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Closed));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Canceled));

        assert!(!TradeStatus::Open.can_transition_to(TradeStatus::Pending));
        assert!(!TradeStatus::Closed.can_transition_to(TradeStatus::Open));
        assert!(!TradeStatus::Canceled.can_transition_to(TradeStatus::Closed));
        assert!(!TradeStatus::Failed.can_transition_to(TradeStatus::Open));
    }

    #[test]
    fn frame_window_evicts_oldest() {
        let mut frame = Frame::with_capacity(3);
        for i in 0..5 {
            frame.push(candle(i * 60_000, dec!(100) + Decimal::from(i)));
        }
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.last().unwrap().close, dec!(104));
        assert_eq!(frame.candles()[0].close, dec!(102));
    }

    #[test]
    fn frame_replaces_same_bar() {
        let mut frame = Frame::with_capacity(10);
        frame.push(candle(60_000, dec!(100)));
        frame.push(candle(60_000, dec!(101)));
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.last().unwrap().close, dec!(101));
    }

    #[test]
    fn symbol_validation() {
        assert!(validate_symbol("BTC/USDT").is_ok());
        assert!(validate_symbol("1INCH/USDT").is_ok());
        assert!(validate_symbol("btc/usdt").is_err());
        assert!(validate_symbol("BTCUSDT").is_err());
        assert!(validate_symbol("/USDT").is_err());
    }

    #[test]
    fn routing_symbol_lowercases_and_strips() {
        assert_eq!(routing_symbol("BTC/USDT"), "btcusdt");
        assert_eq!(routing_symbol("ETH/BTC"), "ethbtc");
    }
}
