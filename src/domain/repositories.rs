//! Repository traits separating the agents from storage. SQLite
//! implementations live in `infrastructure::persistence`.

use crate::domain::entities::{
    Portfolio, PortfolioRule, Position, StrategyDef, StrategyState, Trade,
};
use crate::domain::types::TradeStatus;
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait PortfolioRepository: Send + Sync {
    async fn save(&self, portfolio: &Portfolio) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Portfolio>>;
    async fn list_active(&self) -> Result<Vec<Portfolio>>;
    /// Persist the capital figures only; the balance is the hot column.
    async fn update_capital(&self, portfolio: &Portfolio) -> Result<()>;
}

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn save(&self, def: &StrategyDef) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<StrategyDef>>;
    async fn list_active(&self) -> Result<Vec<StrategyDef>>;
    async fn set_active(&self, id: &str, active: bool) -> Result<()>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn save(&self, trade: &Trade) -> Result<()>;
    async fn update(&self, trade: &Trade) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Trade>>;
    async fn find_by_correlation(&self, correlation_id: Uuid) -> Result<Option<Trade>>;
    /// Trades whose status is in `statuses`, oldest first.
    async fn find_by_status(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>>;
    /// The non-terminal trade for a fingerprint, if one exists.
    async fn find_open_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Trade>>;
    async fn find_by_strategy(&self, strategy_id: &str, limit: usize) -> Result<Vec<Trade>>;
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn save(&self, position: &Position) -> Result<()>;
    async fn update(&self, position: &Position) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Position>>;
    async fn find_open(&self) -> Result<Vec<Position>>;
    async fn find_open_by_strategy(&self, strategy_id: &str) -> Result<Vec<Position>>;
    async fn find_open_by_symbol(&self, symbol: &str) -> Result<Vec<Position>>;
}

#[async_trait]
pub trait PortfolioRuleRepository: Send + Sync {
    async fn save(&self, rule: &PortfolioRule) -> Result<()>;
    async fn list_for_portfolio(&self, portfolio_id: Uuid) -> Result<Vec<PortfolioRule>>;
}

#[async_trait]
pub trait StrategyStateRepository: Send + Sync {
    async fn store(&self, state: &StrategyState) -> Result<()>;
    async fn load(&self, strategy_id: &str) -> Result<Option<StrategyState>>;
}
