pub mod database;
pub mod repositories;

pub use database::Database;
pub use repositories::{
    SqlitePortfolioRepository, SqlitePortfolioRuleRepository, SqlitePositionRepository,
    SqliteStrategyRepository, SqliteStrategyStateRepository, SqliteTradeRepository,
};
