use crate::domain::entities::SizingParams;
use crate::domain::errors::{Denial, DenialCode};
use crate::domain::types::Proposal;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

/// Inputs to the fixed-fractional model beyond the proposal itself.
#[derive(Debug, Clone)]
pub struct SizingInputs {
    pub total_capital: Decimal,
    /// Fraction of total capital risked, e.g. 0.02.
    pub risk_percent: Decimal,
    /// Fallback stop distance as whole percent of the signal price when the
    /// proposal carries no stop.
    pub default_stop_percent: Decimal,
    pub min_position_usd: Decimal,
    pub max_position_usd: Decimal,
    pub lot_step: Decimal,
    pub min_amount: Decimal,
}

impl SizingInputs {
    pub fn new(total_capital: Decimal, sizing: &SizingParams) -> Self {
        Self {
            total_capital,
            risk_percent: sizing.risk_percent,
            default_stop_percent: dec!(2),
            min_position_usd: Decimal::ZERO,
            max_position_usd: Decimal::MAX,
            lot_step: sizing.lot_step,
            min_amount: sizing.min_amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub amount: Decimal,
    pub notional: Decimal,
    pub stop_loss: Decimal,
    pub risk_amount: Decimal,
}

/// Fixed-fractional sizing: `risk_amount = total_capital * risk_percent`,
/// `amount = risk_amount / stop_distance`, clamped by the USD bounds and
/// truncated to the exchange lot step. Truncation only ever rounds down, so
/// the computed risk cap is never exceeded.
pub fn size_fixed_fractional(proposal: &Proposal, inputs: &SizingInputs) -> Result<SizedOrder, Denial> {
    let price = proposal.signal_price;
    if price <= Decimal::ZERO {
        return Err(Denial::new(
            DenialCode::InternalError,
            format!("non-positive signal price {}", price),
        ));
    }

    let stop_loss = proposal
        .stop_loss_price
        .unwrap_or_else(|| price * (Decimal::ONE - inputs.default_stop_percent / dec!(100)));
    let stop_distance = (price - stop_loss).abs();
    let stop_distance = if stop_distance > Decimal::ZERO {
        stop_distance
    } else {
        price * inputs.default_stop_percent / dec!(100)
    };

    let risk_amount = inputs.total_capital * inputs.risk_percent;
    let mut amount = match risk_amount.checked_div(stop_distance) {
        Some(a) => a,
        None => {
            return Err(Denial::new(
                DenialCode::InternalError,
                "stop distance underflow".to_string(),
            ));
        }
    };

    // Clamp notional into the USD window, then truncate to lot precision.
    if amount * price > inputs.max_position_usd {
        amount = inputs.max_position_usd / price;
    }
    if inputs.lot_step > Decimal::ZERO {
        amount = (amount / inputs.lot_step).floor() * inputs.lot_step;
    }

    let notional = amount * price;
    if amount < inputs.min_amount {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "sized amount {} below exchange minimum {}",
                amount, inputs.min_amount
            ),
        ));
    }
    if notional < inputs.min_position_usd {
        return Err(Denial::new(
            DenialCode::RiskLimitExceeded,
            format!(
                "notional {} below minimum position size {}",
                notional, inputs.min_position_usd
            ),
        ));
    }

    debug!(
        "Sizing: risk {} / stop distance {} -> amount {} (notional {})",
        risk_amount, stop_distance, amount, notional
    );

    Ok(SizedOrder {
        amount,
        notional,
        stop_loss,
        risk_amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderSide;
    use chrono::Utc;
    use serde_json::json;

    fn proposal(price: Decimal, stop: Option<Decimal>) -> Proposal {
        Proposal {
            side: OrderSide::Buy,
            signal_price: price,
            stop_loss_price: stop,
            take_profit_price: None,
            intent_tag: "test".to_string(),
            strategy_params: json!({}),
            bar_close_ts: Utc::now(),
        }
    }

    fn inputs(total: Decimal, risk: Decimal) -> SizingInputs {
        SizingInputs {
            total_capital: total,
            risk_percent: risk,
            default_stop_percent: dec!(2),
            min_position_usd: Decimal::ZERO,
            max_position_usd: dec!(100000),
            lot_step: dec!(0.0001),
            min_amount: dec!(0.0001),
        }
    }

    #[test]
    fn risk_over_stop_distance() {
        // 10_000 * 0.02 = 200 risk; stop distance 1_000 -> 0.2 units.
        let sized = size_fixed_fractional(
            &proposal(dec!(50000), Some(dec!(49000))),
            &inputs(dec!(10000), dec!(0.02)),
        )
        .unwrap();
        assert_eq!(sized.risk_amount, dec!(200));
        assert_eq!(sized.amount, dec!(0.2));
        assert_eq!(sized.notional, dec!(10000));
    }

    #[test]
    fn tight_stop_inflates_amount() {
        // Stop distance 200 -> 1.0 BTC.
        let sized = size_fixed_fractional(
            &proposal(dec!(50000), Some(dec!(49800))),
            &inputs(dec!(10000), dec!(0.02)),
        )
        .unwrap();
        assert_eq!(sized.amount, dec!(1.0));
    }

    #[test]
    fn missing_stop_uses_default_two_percent() {
        // Default stop distance = 2% of 50_000 = 1_000.
        let sized = size_fixed_fractional(
            &proposal(dec!(50000), None),
            &inputs(dec!(10000), dec!(0.02)),
        )
        .unwrap();
        assert_eq!(sized.stop_loss, dec!(49000));
        assert_eq!(sized.amount, dec!(0.2));
    }

    #[test]
    fn truncation_rounds_down_to_lot_step() {
        // 10_000 * 0.015 = 150; distance 700 -> 0.214285...; step 0.0001.
        let sized = size_fixed_fractional(
            &proposal(dec!(50000), Some(dec!(49300))),
            &inputs(dec!(10000), dec!(0.015)),
        )
        .unwrap();
        assert_eq!(sized.amount, dec!(0.2142));
        assert!(sized.amount * dec!(700) <= sized.risk_amount);
    }

    #[test]
    fn max_usd_clamps_notional() {
        let mut i = inputs(dec!(1000000), dec!(0.02));
        i.max_position_usd = dec!(5000);
        let sized = size_fixed_fractional(&proposal(dec!(50000), Some(dec!(49000))), &i).unwrap();
        assert!(sized.notional <= dec!(5000));
        assert_eq!(sized.amount, dec!(0.1));
    }

    #[test]
    fn dust_amount_is_denied() {
        let mut i = inputs(dec!(100), dec!(0.0001));
        i.min_amount = dec!(0.01);
        let err = size_fixed_fractional(&proposal(dec!(50000), Some(dec!(49000))), &i).unwrap_err();
        assert_eq!(err.code, DenialCode::RiskLimitExceeded);
    }
}
