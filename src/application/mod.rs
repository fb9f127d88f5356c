// Agents of the trading pipeline plus their supervisor
pub mod capital;
pub mod connector;
pub mod engine;
pub mod reconciler;
pub mod worker;
