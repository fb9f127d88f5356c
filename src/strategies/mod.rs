//! Concrete strategy kinds. The engine constructs these from a
//! `StrategyDef`; anything else plugs in through the `Strategy` trait
//! directly.

pub mod ma_crossover;
pub mod mean_reversion;

use crate::domain::entities::{StrategyDef, StrategyKind};
use crate::domain::ports::Strategy;
use anyhow::Result;

pub use ma_crossover::MaCrossover;
pub use mean_reversion::MeanReversion;

/// Build the strategy implementation for a definition.
pub fn build(def: &StrategyDef) -> Result<Box<dyn Strategy>> {
    match def.kind {
        StrategyKind::MaCrossover => Ok(Box::new(MaCrossover::from_def(def)?)),
        StrategyKind::MeanReversion => Ok(Box::new(MeanReversion::from_def(def)?)),
    }
}
