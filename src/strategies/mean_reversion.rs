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
use ta::indicators::RelativeStrengthIndex;
use ta::Next;
use tracing::info;

const RSI_COLUMN: &str = "rsi";

#[derive(Debug, Clone, Deserialize)]
struct MrParams {
    rsi_period: usize,
    #[serde(default = "default_oversold")]
    oversold: f64,
    #[serde(default = "default_overbought")]
    overbought: f64,
    #[serde(default = "default_stop_pct")]
    stop_loss_pct: f64,
}

fn default_oversold() -> f64 {
    30.0
}

fn default_overbought() -> f64 {
    70.0
}

fn default_stop_pct() -> f64 {
    0.02
}

/// Buys RSI exhaustion lows, exits on overbought readings.
pub struct MeanReversion {
    exchange: String,
    symbol: String,
    params: MrParams,
}

impl MeanReversion {
    pub fn from_def(def: &StrategyDef) -> Result<Self> {
        let params: MrParams = serde_json::from_value(def.params.clone())
            .context("mean_reversion: bad params")?;
        if params.rsi_period < 2 {
            anyhow::bail!("mean_reversion: rsi_period must be >= 2");
        }
        if params.oversold >= params.overbought {
            anyhow::bail!("mean_reversion: oversold must be below overbought");
        }
        Ok(Self {
            exchange: def.exchange.clone(),
            symbol: def.symbol.clone(),
            params,
        })
    }

    fn rsi_column(candles: &[Candle], period: usize) -> Vec<Option<Decimal>> {
        let mut rsi = RelativeStrengthIndex::new(period).expect("period checked at build");
        candles
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let value = rsi.next(c.close.to_f64().unwrap_or(0.0));
                if i >= period {
                    Decimal::from_f64(value)
                } else {
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Strategy for MeanReversion {
    fn required_subscriptions(&self) -> Vec<String> {
        vec![keys::market_data(&self.exchange, &self.symbol)]
    }

    fn populate_indicators(&self, frame: &Frame) -> Frame {
        let mut out = frame.clone();
        out.set_indicator(RSI_COLUMN, Self::rsi_column(frame.candles(), self.params.rsi_period));
        out
    }

    fn on_data(&self, latest: &Candle, frame: &Frame) -> Option<Proposal> {
        let rsi = frame.indicator_last(RSI_COLUMN)?.to_f64()?;

        let (side, intent) = if rsi <= self.params.oversold {
            (OrderSide::Buy, "mr_oversold_long")
        } else if rsi >= self.params.overbought {
            (OrderSide::Sell, "mr_overbought_exit")
        } else {
            return None;
        };

        let pct = Decimal::from_f64(self.params.stop_loss_pct)?;
        let stop = match side {
            OrderSide::Buy => latest.close * (Decimal::ONE - pct),
            OrderSide::Sell => latest.close * (Decimal::ONE + pct),
        };

        Some(Proposal {
            side,
            signal_price: latest.close,
            stop_loss_price: Some(stop),
            take_profit_price: None,
            intent_tag: intent.to_string(),
            strategy_params: json!({
                "rsi_period": self.params.rsi_period,
                "rsi": rsi,
            }),
            bar_close_ts: latest.close_ts,
        })
    }

    async fn on_start(&mut self, def: &StrategyDef) -> Result<()> {
        info!(
            "MeanReversion [{}]: starting on {} (rsi {})",
            def.id, def.symbol, self.params.rsi_period
        );
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<()> {
        Ok(())
    }
}
