//! Capital Manager: validation pipeline, fixed-fractional sizing and the
//! per-portfolio reservation ledger, all behind one single-writer actor.

pub mod manager;
pub mod sizing;
pub mod validation;

pub use manager::{
    attach_bus, AllocationOutcome, CapitalCommand, CapitalHandle, CapitalManager,
    PortfolioSnapshot,
};
pub use sizing::{size_fixed_fractional, SizedOrder, SizingInputs};
pub use validation::{validate_post_size, validate_pre_size, RuleSet, ValidationContext};
