use crate::domain::types::TradeStatus;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Invariant violations inside the domain model.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid trade transition {from} -> {to}")]
    InvalidTransition { from: TradeStatus, to: TradeStatus },

    #[error("insufficient capital: requested {requested}, available {available}")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },

    #[error("invalid amount {amount}")]
    InvalidAmount { amount: Decimal },

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

/// Why the Capital Manager turned a proposal down. Travels on the wire as the
/// `reasons` field of a denied allocation response, never as an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    InsufficientCapital,
    RiskLimitExceeded,
    StaleProposal,
    DeadlineExceeded,
    DuplicateProposal,
    /// The symbol sits behind a forced reconciliation that has not finished.
    PendingReconciliation,
    StrategyInactive,
    PortfolioInactive,
    SymbolBlacklisted,
    InternalError,
}

impl fmt::Display for DenialCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenialCode::InsufficientCapital => "insufficient_capital",
            DenialCode::RiskLimitExceeded => "risk_limit_exceeded",
            DenialCode::StaleProposal => "stale_proposal",
            DenialCode::DeadlineExceeded => "deadline_exceeded",
            DenialCode::DuplicateProposal => "duplicate_proposal",
            DenialCode::PendingReconciliation => "pending_reconciliation",
            DenialCode::StrategyInactive => "strategy_inactive",
            DenialCode::PortfolioInactive => "portfolio_inactive",
            DenialCode::SymbolBlacklisted => "symbol_blacklisted",
            DenialCode::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// A denial: machine-readable code plus a human-readable detail line.
#[derive(Debug, Clone, Error)]
#[error("{code}: {detail}")]
pub struct Denial {
    pub code: DenialCode,
    pub detail: String,
}

impl Denial {
    pub fn new(code: DenialCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Failures at the exchange boundary.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("rate limited: {category}")]
    RateLimited { category: String },

    #[error("exchange unavailable: circuit open for {remaining_ms}ms")]
    ExchangeUnavailable { remaining_ms: i64 },

    #[error("exchange timeout after {timeout_ms}ms")]
    ExchangeTimeout { timeout_ms: u64 },

    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("adapter error: {0}")]
    Adapter(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_codes_render_snake_case() {
        assert_eq!(DenialCode::InsufficientCapital.to_string(), "insufficient_capital");
        assert_eq!(DenialCode::DuplicateProposal.to_string(), "duplicate_proposal");
        assert_eq!(DenialCode::StaleProposal.to_string(), "stale_proposal");
        assert_eq!(
            DenialCode::PendingReconciliation.to_string(),
            "pending_reconciliation"
        );
    }

    #[test]
    fn denial_formats_code_and_detail() {
        let d = Denial::new(DenialCode::RiskLimitExceeded, "notional 50000 exceeds 10% cap");
        assert_eq!(
            d.to_string(),
            "risk_limit_exceeded: notional 50000 exceeds 10% cap"
        );
    }
}
