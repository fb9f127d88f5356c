use crate::application::capital::sizing::SizedOrder;
use crate::config::TradingOptions;
use crate::domain::entities::{Portfolio, PortfolioRule, Position, RuleKind, StrategyDef};
use crate::domain::errors::{Denial, DenialCode};
use crate::domain::types::AllocationRequest;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use tracing::debug;

/// Effective limits for one portfolio: config defaults overridden by
/// `portfolio_rules` rows.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub max_position_size_percent: Decimal,
    pub max_daily_loss_percent: Decimal,
    pub max_portfolio_exposure_percent: Decimal,
    pub max_positions_per_symbol: u32,
    pub min_position_size_usd: Decimal,
    pub max_position_size_usd: Decimal,
    pub min_available_capital: Decimal,
    pub blacklist: HashSet<String>,
}

impl RuleSet {
    pub fn from_config(cfg: &TradingOptions) -> Self {
        Self {
            max_position_size_percent: cfg.max_position_size_percent,
            max_daily_loss_percent: cfg.max_daily_loss_percent,
            max_portfolio_exposure_percent: cfg.max_portfolio_exposure_percent,
            max_positions_per_symbol: cfg.max_positions_per_symbol,
            min_position_size_usd: cfg.min_position_size_usd,
            max_position_size_usd: cfg.max_position_size_usd,
            min_available_capital: cfg.min_available_capital,
            blacklist: HashSet::new(),
        }
    }

    /// Overlay per-portfolio rule rows on the config defaults.
    pub fn apply_rules(&mut self, rules: &[PortfolioRule]) {
        for rule in rules {
            match rule.kind {
                RuleKind::BlacklistSymbol => {
                    self.blacklist.insert(rule.value.clone());
                }
                RuleKind::MaxPositionSizePercent => {
                    if let Some(v) = rule.decimal_value() {
                        self.max_position_size_percent = v;
                    }
                }
                RuleKind::MaxDailyLossPercent => {
                    if let Some(v) = rule.decimal_value() {
                        self.max_daily_loss_percent = v;
                    }
                }
                RuleKind::MaxPortfolioExposurePercent => {
                    if let Some(v) = rule.decimal_value() {
                        self.max_portfolio_exposure_percent = v;
                    }
                }
                RuleKind::MaxPositionsPerSymbol => {
                    if let Some(v) = rule.decimal_value() {
                        self.max_positions_per_symbol = v.try_into().unwrap_or(u32::MAX);
                    }
                }
                RuleKind::MinPositionSizeUsd => {
                    if let Some(v) = rule.decimal_value() {
                        self.min_position_size_usd = v;
                    }
                }
                RuleKind::MaxPositionSizeUsd => {
                    if let Some(v) = rule.decimal_value() {
                        self.max_position_size_usd = v;
                    }
                }
            }
        }
    }
}

/// Everything the checks look at, assembled by the manager under its
/// serialization domain so the numbers are mutually consistent.
pub struct ValidationContext<'a> {
    pub request: &'a AllocationRequest,
    pub strategy: &'a StrategyDef,
    pub portfolio: &'a Portfolio,
    pub rules: &'a RuleSet,
    pub open_positions: &'a [Position],
    /// Notional currently reserved for pending trades.
    pub pending_notional: Decimal,
    /// Open positions plus pending trades on this symbol, across strategies.
    pub positions_on_symbol: u32,
    /// Realized loss booked today (positive number).
    pub realized_loss_today: Decimal,
    /// A market-data gap forced a reconciliation for this symbol and the
    /// sweep has not completed yet.
    pub symbol_held_for_reconciliation: bool,
    pub now: DateTime<Utc>,
    pub freshness_limit_ms: i64,
}

/// Checks that run before sizing (spec order 1-4); first failure wins.
pub fn validate_pre_size(ctx: &ValidationContext<'_>) -> Result<(), Denial> {
    if !ctx.strategy.active {
        return Err(Denial::new(
            DenialCode::StrategyInactive,
            format!("strategy {} is inactive", ctx.strategy.id),
        ));
    }
    if !ctx.portfolio.active {
        return Err(Denial::new(
            DenialCode::PortfolioInactive,
            format!("portfolio {} is inactive", ctx.portfolio.id),
        ));
    }

    // Gapped symbols trade again only after the forced sweep realigns state.
    if ctx.symbol_held_for_reconciliation {
        return Err(Denial::new(
            DenialCode::PendingReconciliation,
            format!(
                "{} is awaiting reconciliation after a market-data gap",
                ctx.request.symbol
            ),
        ));
    }

    if ctx.rules.blacklist.contains(&ctx.request.symbol) {
        return Err(Denial::new(
            DenialCode::SymbolBlacklisted,
            format!("{} is blacklisted", ctx.request.symbol),
        ));
    }

    let age_ms = (ctx.now - ctx.request.requested_at).num_milliseconds();
    if age_ms > ctx.freshness_limit_ms {
        return Err(Denial::new(
            DenialCode::StaleProposal,
            format!("proposal is {}ms old (limit {}ms)", age_ms, ctx.freshness_limit_ms),
        ));
    }

    if ctx.portfolio.available_capital < ctx.rules.min_available_capital {
        return Err(Denial::new(
            DenialCode::InsufficientCapital,
            format!(
                "available {} below minimum {}",
                ctx.portfolio.available_capital, ctx.rules.min_available_capital
            ),
        ));
    }

    Ok(())
}

/// Checks that need the sized order (spec order 5-8).
pub fn validate_post_size(ctx: &ValidationContext<'_>, sized: &SizedOrder) -> Result<(), Denial> {
    let total = ctx.portfolio.total_capital;
    if total <= Decimal::ZERO {
        return Err(Denial::new(
            DenialCode::InternalError,
            "portfolio has no capital".to_string(),
        ));
    }

    // 5. Position concentration.
    let size_pct = sized.notional / total * dec!(100);
    if size_pct > ctx.rules.max_position_size_percent {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "position would be {:.2}% of capital (cap {}%)",
                size_pct, ctx.rules.max_position_size_percent
            ),
        ));
    }

    // 6. Daily drawdown: booked losses plus the risk this trade adds.
    let projected_loss = ctx.realized_loss_today + sized.risk_amount;
    let loss_pct = projected_loss / total * dec!(100);
    if loss_pct > ctx.rules.max_daily_loss_percent {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "projected daily loss {:.2}% exceeds {}%",
                loss_pct, ctx.rules.max_daily_loss_percent
            ),
        ));
    }

    // 7. Portfolio exposure across open positions and pending trades.
    let open_notional: Decimal = ctx.open_positions.iter().map(|p| p.notional()).sum();
    let exposure = open_notional + ctx.pending_notional + sized.notional;
    let exposure_pct = exposure / total * dec!(100);
    if exposure_pct > ctx.rules.max_portfolio_exposure_percent {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "portfolio exposure would be {:.2}% (cap {}%)",
                exposure_pct, ctx.rules.max_portfolio_exposure_percent
            ),
        ));
    }

    // 8. Per-symbol position count, counted across strategies.
    if ctx.positions_on_symbol >= ctx.rules.max_positions_per_symbol {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "{} already has {} position(s) (cap {})",
                ctx.request.symbol, ctx.positions_on_symbol, ctx.rules.max_positions_per_symbol
            ),
        ));
    }

    debug!(
        "Validation: {} {} notional {} passed all checks",
        ctx.request.strategy_id, ctx.request.symbol, sized.notional
    );
    Ok(())
}
