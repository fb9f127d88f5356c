use crate::bus::keys;
use crate::domain::entities::StrategyDef;
use crate::domain::ports::Strategy;
use crate::domain::types::{Candle, Frame, OrderSide, Proposal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use ta::indicators::SimpleMovingAverage;
use ta::Next;
use tracing::info;

const FAST_COLUMN: &str = "sma_fast";
const SLOW_COLUMN: &str = "sma_slow";

#[derive(Debug, Clone, Deserialize)]
struct MaParams {
    fast_period: usize,
    slow_period: usize,
    /// Stop distance as a fraction of the signal price.
    #[serde(default = "default_stop_pct")]
    stop_loss_pct: f64,
}

fn default_stop_pct() -> f64 {
    0.02
}

/// Golden/death cross on two simple moving averages of the close.
pub struct MaCrossover {
    exchange: String,
    symbol: String,
    params: MaParams,
}

impl MaCrossover {
    pub fn from_def(def: &StrategyDef) -> Result<Self> {
        let params: MaParams = serde_json::from_value(def.params.clone())
            .context("ma_crossover: bad params")?;
        if params.fast_period == 0 || params.fast_period >= params.slow_period {
            anyhow::bail!(
                "ma_crossover: fast_period must be in 1..slow_period (got {}/{})",
                params.fast_period,
                params.slow_period
            );
        }
        Ok(Self {
            exchange: def.exchange.clone(),
            symbol: def.symbol.clone(),
            params,
        })
    }

    fn sma_column(candles: &[Candle], period: usize) -> Vec<Option<Decimal>> {
        // Recomputed from scratch each call; `ta` indicators are stateful so a
        // fresh instance keeps populate_indicators pure.
        let mut sma = SimpleMovingAverage::new(period).expect("period checked at build");
        candles
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let value = sma.next(c.close.to_f64().unwrap_or(0.0));
                if i + 1 >= period {
                    Decimal::from_f64(value)
                } else {
                    None
                }
            })
            .collect()
    }

    fn stop_loss(&self, price: Decimal, side: OrderSide) -> Decimal {
        let pct = Decimal::from_f64(self.params.stop_loss_pct).unwrap_or(Decimal::new(2, 2));
        match side {
            OrderSide::Buy => price * (Decimal::ONE - pct),
            OrderSide::Sell => price * (Decimal::ONE + pct),
        }
    }
}

#[async_trait]
impl Strategy for MaCrossover {
    fn required_subscriptions(&self) -> Vec<String> {
        vec![keys::market_data(&self.exchange, &self.symbol)]
    }

    fn populate_indicators(&self, frame: &Frame) -> Frame {
        let mut out = frame.clone();
        out.set_indicator(FAST_COLUMN, Self::sma_column(frame.candles(), self.params.fast_period));
        out.set_indicator(SLOW_COLUMN, Self::sma_column(frame.candles(), self.params.slow_period));
        out
    }

    fn on_data(&self, latest: &Candle, frame: &Frame) -> Option<Proposal> {
        let fast = frame.indicator_last(FAST_COLUMN)?;
        let slow = frame.indicator_last(SLOW_COLUMN)?;
        let prev_fast = frame.indicator_back(FAST_COLUMN, 1)?;
        let prev_slow = frame.indicator_back(SLOW_COLUMN, 1)?;

        let crossed_up = prev_fast <= prev_slow && fast > slow;
        let crossed_down = prev_fast >= prev_slow && fast < slow;

        let (side, intent) = if crossed_up {
            (OrderSide::Buy, "ma_cross_long")
        } else if crossed_down {
            (OrderSide::Sell, "ma_cross_exit")
        } else {
            return None;
        };

        Some(Proposal {
            side,
            signal_price: latest.close,
            stop_loss_price: Some(self.stop_loss(latest.close, side)),
            take_profit_price: None,
            intent_tag: intent.to_string(),
            strategy_params: json!({
                "fast_period": self.params.fast_period,
                "slow_period": self.params.slow_period,
            }),
            bar_close_ts: latest.close_ts,
        })
    }

    async fn on_start(&mut self, def: &StrategyDef) -> Result<()> {
        info!(
            "MaCrossover [{}]: starting on {} ({}:{})",
            def.id, def.symbol, self.params.fast_period, self.params.slow_period
        );
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{SizingParams, StrategyKind};
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn def() -> StrategyDef {
        StrategyDef {
            id: "ma-btc".to_string(),
            kind: StrategyKind::MaCrossover,
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            params: json!({"fast_period": 2, "slow_period": 4}),
            sizing: SizingParams::default(),
            active: true,
            portfolio_id: Uuid::new_v4(),
        }
    }

    fn candle(i: i64, close: Decimal) -> Candle {
        Candle {
            symbol: "BTC/USDT".to_string(),
            exchange: "mock".to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_ts: DateTime::from_timestamp_millis(i * 60_000).unwrap(),
        }
    }

    fn run(closes: &[Decimal]) -> (Option<Proposal>, Frame, Candle) {
        let strategy = MaCrossover::from_def(&def()).unwrap();
        let mut frame = Frame::with_capacity(100);
        for (i, close) in closes.iter().enumerate() {
            frame.push(candle(i as i64, *close));
        }
        let latest = frame.last().unwrap().clone();
        let frame = strategy.populate_indicators(&frame);
        let proposal = strategy.on_data(&latest, &frame);
        (proposal, frame, latest)
    }

    #[test]
    fn cross_up_emits_buy() {
        // Downtrend then a sharp recovery: fast SMA crosses above slow.
        let closes = [
            dec!(110), dec!(108), dec!(106), dec!(104), dec!(102), dec!(100),
            dec!(99), dec!(112),
        ];
        let (proposal, _, latest) = run(&closes);
        let proposal = proposal.expect("cross up should propose");
        assert_eq!(proposal.side, OrderSide::Buy);
        assert_eq!(proposal.intent_tag, "ma_cross_long");
        assert_eq!(proposal.signal_price, latest.close);
        let stop = proposal.stop_loss_price.unwrap();
        assert!(stop < latest.close);
    }

    #[test]
    fn no_cross_no_proposal() {
        let closes = [dec!(100), dec!(101), dec!(102), dec!(103), dec!(104), dec!(105)];
        let (proposal, _, _) = run(&closes);
        assert!(proposal.is_none());
    }

    #[test]
    fn on_data_is_deterministic_for_same_frame() {
        let strategy = MaCrossover::from_def(&def()).unwrap();
        let mut frame = Frame::with_capacity(100);
        let closes = [
            dec!(110), dec!(108), dec!(106), dec!(104), dec!(102), dec!(100),
            dec!(99), dec!(112),
        ];
        for (i, close) in closes.iter().enumerate() {
            frame.push(candle(i as i64, *close));
        }
        let latest = frame.last().unwrap().clone();
        let populated = strategy.populate_indicators(&frame);

        let a = strategy.on_data(&latest, &populated);
        let b = strategy.on_data(&latest, &populated);
        assert_eq!(a.is_some(), b.is_some());
        if let (Some(a), Some(b)) = (a, b) {
            assert_eq!(a.intent_tag, b.intent_tag);
            assert_eq!(a.signal_price, b.signal_price);
            assert_eq!(a.bar_close_ts, b.bar_close_ts);
        }
    }

    #[test]
    fn populate_indicators_does_not_mutate_input() {
        let strategy = MaCrossover::from_def(&def()).unwrap();
        let mut frame = Frame::with_capacity(100);
        for i in 0..6 {
            frame.push(candle(i, dec!(100) + Decimal::from(i)));
        }
        assert!(frame.indicator(FAST_COLUMN).is_none());
        let _populated = strategy.populate_indicators(&frame);
        assert!(frame.indicator(FAST_COLUMN).is_none());
    }
}
