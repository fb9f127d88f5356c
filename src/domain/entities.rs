use crate::domain::errors::DomainError;
use crate::domain::types::{OrderSide, OrderType, PositionSide, TradeStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One trading account's capital pool. Balance is owned by the Capital
/// Manager; nobody else mutates it.
///
/// Invariant: `0 <= available_capital <= total_capital`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: Uuid,
    pub name: String,
    pub base_currency: String,
    pub total_capital: Decimal,
    pub available_capital: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(name: &str, base_currency: &str, total_capital: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            base_currency: base_currency.to_string(),
            total_capital,
            available_capital: total_capital,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hold `amount` of available capital. Reserving exactly down to zero is
    /// allowed; one satoshi more is not.
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), DomainError> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::InvalidAmount { amount });
        }
        if amount > self.available_capital {
            return Err(DomainError::InsufficientCapital {
                requested: amount,
                available: self.available_capital,
            });
        }
        self.available_capital -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Return a previously held amount to the pool, clamped to the total so
    /// the invariant survives double releases from replayed messages.
    pub fn release(&mut self, amount: Decimal) {
        self.available_capital = (self.available_capital + amount).min(self.total_capital);
        self.updated_at = Utc::now();
    }

    /// Apply a realized profit or loss to both capital figures.
    pub fn apply_realized(&mut self, delta: Decimal) {
        self.total_capital += delta;
        self.available_capital = (self.available_capital + delta)
            .max(Decimal::ZERO)
            .min(self.total_capital);
        self.updated_at = Utc::now();
    }
}

/// Closed set of strategy kinds the engine knows how to construct. Custom
/// kinds plug in through the `Strategy` trait without appearing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MaCrossover,
    MeanReversion,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::MaCrossover => write!(f, "ma_crossover"),
            StrategyKind::MeanReversion => write!(f, "mean_reversion"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ma_crossover" => Ok(StrategyKind::MaCrossover),
            "mean_reversion" => Ok(StrategyKind::MeanReversion),
            other => Err(format!("unknown strategy kind '{}'", other)),
        }
    }
}

/// Position sizing parameters attached to a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingParams {
    /// Fraction of total capital risked per trade, e.g. 0.02.
    pub risk_percent: Decimal,
    /// Smallest order increment accepted by the exchange.
    pub lot_step: Decimal,
    /// Smallest order amount accepted by the exchange.
    pub min_amount: Decimal,
}

impl Default for SizingParams {
    fn default() -> Self {
        Self {
            risk_percent: Decimal::new(2, 2),  // 0.02
            lot_step: Decimal::new(1, 4),      // 0.0001
            min_amount: Decimal::new(1, 4),    // 0.0001
        }
    }
}

/// Configuration record for one strategy instance. Immutable while active
/// except through the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDef {
    pub id: String,
    pub kind: StrategyKind,
    pub exchange: String,
    pub symbol: String,
    pub params: serde_json::Value,
    pub sizing: SizingParams,
    pub active: bool,
    pub portfolio_id: Uuid,
}

/// A single order's journey through the system. Created by the Capital
/// Manager; only the Exchange Connector mutates status afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub strategy_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub cost: Decimal,
    pub fee: Decimal,
    pub status: TradeStatus,
    pub exchange_order_id: Option<String>,
    pub correlation_id: Uuid,
    pub fingerprint: Option<String>,
    /// Set on records the Reconciler created for orders unknown to the system.
    pub reconciled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    /// Move to `next`, enforcing the state machine and monotone timestamps.
    pub fn transition(&mut self, next: TradeStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        let now = Utc::now();
        self.updated_at = if now > self.updated_at { now } else { self.updated_at };
        Ok(())
    }

    pub fn notional(&self) -> Decimal {
        self.amount * self.price.unwrap_or(Decimal::ZERO)
    }
}

/// An open or closed position, aggregated from fills.
///
/// Invariant: `open == closed_at.is_none()`; size strictly positive while
/// open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub strategy_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub average_entry: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub total_fees: Decimal,
    pub open: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn open_from_fill(
        strategy_id: &str,
        symbol: &str,
        side: PositionSide,
        size: Decimal,
        price: Decimal,
        fee: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            size,
            average_entry: price,
            stop_loss: None,
            take_profit: None,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            total_fees: fee,
            open: true,
            opened_at: at,
            closed_at: None,
        }
    }

    /// Fold an additional entry-side fill in: size-weighted average entry,
    /// partial fills supported.
    pub fn add_fill(&mut self, size: Decimal, price: Decimal, fee: Decimal) {
        let new_size = self.size + size;
        if new_size > Decimal::ZERO {
            self.average_entry =
                (self.average_entry * self.size + price * size) / new_size;
        }
        self.size = new_size;
        self.total_fees += fee;
    }

    /// Reduce the position by an exit-side fill; returns the realized P&L of
    /// the reduced slice. Closes the position when size reaches zero.
    pub fn reduce(&mut self, size: Decimal, price: Decimal, fee: Decimal, at: DateTime<Utc>) -> Decimal {
        let closed = size.min(self.size);
        let pnl = match self.side {
            PositionSide::Long => (price - self.average_entry) * closed,
            PositionSide::Short => (self.average_entry - price) * closed,
        };
        self.size -= closed;
        self.realized_pnl += pnl;
        self.total_fees += fee;
        if self.size <= Decimal::ZERO {
            self.open = false;
            self.closed_at = Some(at);
            self.unrealized_pnl = Decimal::ZERO;
        }
        pnl
    }

    pub fn mark(&mut self, price: Decimal) {
        if !self.open {
            return;
        }
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.average_entry) * self.size,
            PositionSide::Short => (self.average_entry - price) * self.size,
        };
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.average_entry
    }
}

/// Portfolio rule kinds consulted on every proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    MaxPositionSizePercent,
    MaxDailyLossPercent,
    MaxPortfolioExposurePercent,
    MaxPositionsPerSymbol,
    MinPositionSizeUsd,
    MaxPositionSizeUsd,
    BlacklistSymbol,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleKind::MaxPositionSizePercent => "max_position_size_percent",
            RuleKind::MaxDailyLossPercent => "max_daily_loss_percent",
            RuleKind::MaxPortfolioExposurePercent => "max_portfolio_exposure_percent",
            RuleKind::MaxPositionsPerSymbol => "max_positions_per_symbol",
            RuleKind::MinPositionSizeUsd => "min_position_size_usd",
            RuleKind::MaxPositionSizeUsd => "max_position_size_usd",
            RuleKind::BlacklistSymbol => "blacklist_symbol",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_position_size_percent" => Ok(RuleKind::MaxPositionSizePercent),
            "max_daily_loss_percent" => Ok(RuleKind::MaxDailyLossPercent),
            "max_portfolio_exposure_percent" => Ok(RuleKind::MaxPortfolioExposurePercent),
            "max_positions_per_symbol" => Ok(RuleKind::MaxPositionsPerSymbol),
            "min_position_size_usd" => Ok(RuleKind::MinPositionSizeUsd),
            "max_position_size_usd" => Ok(RuleKind::MaxPositionSizeUsd),
            "blacklist_symbol" => Ok(RuleKind::BlacklistSymbol),
            other => Err(format!("unknown rule kind '{}'", other)),
        }
    }
}

/// One rule row: numeric kinds carry a decimal, blacklist carries a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioRule {
    pub portfolio_id: Uuid,
    pub kind: RuleKind,
    pub value: String,
}

impl PortfolioRule {
    pub fn decimal_value(&self) -> Option<Decimal> {
        self.value.parse().ok()
    }
}

/// Durable worker checkpoint, persisted on each accepted fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyState {
    pub strategy_id: String,
    pub last_processed_bar_ts: Option<DateTime<Utc>>,
    pub last_fingerprint: Option<String>,
    pub open_position_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn reserve_to_exactly_zero_is_allowed() {
        let mut p = Portfolio::new("main", "USDT", dec!(10000));
        assert!(p.reserve(dec!(10000)).is_ok());
        assert_eq!(p.available_capital, dec!(0));
    }

    #[test]
    fn reserve_one_satoshi_above_available_is_denied() {
        let mut p = Portfolio::new("main", "USDT", dec!(10000));
        let err = p.reserve(dec!(10000.00000001)).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientCapital { .. }));
        assert_eq!(p.available_capital, dec!(10000));
    }

    #[test]
    fn double_release_cannot_exceed_total() {
        let mut p = Portfolio::new("main", "USDT", dec!(1000));
        p.reserve(dec!(400)).unwrap();
        p.release(dec!(400));
        p.release(dec!(400));
        assert_eq!(p.available_capital, dec!(1000));
    }

    #[test]
    fn trade_transition_rejects_invalid_path() {
        let now = Utc::now();
        let mut trade = Trade {
            id: Uuid::new_v4(),
            strategy_id: "s1".to_string(),
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            amount: dec!(0.1),
            price: Some(dec!(50000)),
            cost: dec!(5000),
            fee: Decimal::ZERO,
            status: TradeStatus::Pending,
            exchange_order_id: None,
            correlation_id: Uuid::new_v4(),
            fingerprint: None,
            reconciled: false,
            created_at: now,
            updated_at: now,
        };

        trade.transition(TradeStatus::Open).unwrap();
        trade.transition(TradeStatus::Closed).unwrap();
        let err = trade.transition(TradeStatus::Open).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn position_average_entry_is_size_weighted() {
        let mut pos = Position::open_from_fill(
            "s1",
            "BTC/USDT",
            PositionSide::Long,
            dec!(1),
            dec!(100),
            dec!(0.1),
            Utc::now(),
        );
        pos.add_fill(dec!(3), dec!(200), dec!(0.3));
        assert_eq!(pos.size, dec!(4));
        assert_eq!(pos.average_entry, dec!(175));
    }

    #[test]
    fn position_reduce_realizes_pnl_and_closes() {
        let mut pos = Position::open_from_fill(
            "s1",
            "BTC/USDT",
            PositionSide::Long,
            dec!(2),
            dec!(100),
            Decimal::ZERO,
            Utc::now(),
        );
        let pnl = pos.reduce(dec!(2), dec!(110), Decimal::ZERO, Utc::now());
        assert_eq!(pnl, dec!(20));
        assert!(!pos.open);
        assert!(pos.closed_at.is_some());
    }
}
