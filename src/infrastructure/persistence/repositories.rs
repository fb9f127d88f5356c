use crate::domain::entities::{
    Portfolio, PortfolioRule, Position, RuleKind, SizingParams, StrategyDef, StrategyState, Trade,
};
use crate::domain::repositories::{
    PortfolioRepository, PortfolioRuleRepository, PositionRepository, StrategyRepository,
    StrategyStateRepository, TradeRepository,
};
use crate::domain::types::{OrderSide, OrderType, PositionSide, TradeStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

fn dec_col(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let s: String = row.try_get(col)?;
    Decimal::from_str(&s).map_err(|e| anyhow!("bad decimal in column {}: {}", col, e))
}

fn opt_dec_col(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|s| Decimal::from_str(&s).map_err(|e| anyhow!("bad decimal in column {}: {}", col, e)))
        .transpose()
}

fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let s: String = row.try_get(col)?;
    Uuid::parse_str(&s).map_err(|e| anyhow!("bad uuid in column {}: {}", col, e))
}

fn ts_col(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = row.try_get(col)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("bad timestamp in column {}", col))
}

fn opt_ts_col(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.try_get(col)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("bad timestamp in column {}", col))
    })
    .transpose()
}

// ===== Portfolios =====

pub struct SqlitePortfolioRepository {
    pool: SqlitePool,
}

impl SqlitePortfolioRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> Result<Portfolio> {
        Ok(Portfolio {
            id: uuid_col(row, "id")?,
            name: row.try_get("name")?,
            base_currency: row.try_get("base_currency")?,
            total_capital: dec_col(row, "total_capital")?,
            available_capital: dec_col(row, "available_capital")?,
            active: row.try_get::<i64, _>("active")? != 0,
            created_at: ts_col(row, "created_at")?,
            updated_at: ts_col(row, "updated_at")?,
        })
    }
}

#[async_trait]
impl PortfolioRepository for SqlitePortfolioRepository {
    async fn save(&self, portfolio: &Portfolio) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portfolios
                (id, name, base_currency, total_capital, available_capital, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                total_capital = excluded.total_capital,
                available_capital = excluded.available_capital,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(portfolio.id.to_string())
        .bind(&portfolio.name)
        .bind(&portfolio.base_currency)
        .bind(portfolio.total_capital.to_string())
        .bind(portfolio.available_capital.to_string())
        .bind(portfolio.active as i64)
        .bind(portfolio.created_at.timestamp_millis())
        .bind(portfolio.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save portfolio")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Portfolio>> {
        let row = sqlx::query("SELECT * FROM portfolios WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<Portfolio>> {
        let rows = sqlx::query("SELECT * FROM portfolios WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn update_capital(&self, portfolio: &Portfolio) -> Result<()> {
        sqlx::query(
            "UPDATE portfolios SET total_capital = ?, available_capital = ?, updated_at = ? WHERE id = ?",
        )
        .bind(portfolio.total_capital.to_string())
        .bind(portfolio.available_capital.to_string())
        .bind(portfolio.updated_at.timestamp_millis())
        .bind(portfolio.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update portfolio capital")?;
        Ok(())
    }
}

// ===== Strategies =====

pub struct SqliteStrategyRepository {
    pool: SqlitePool,
}

impl SqliteStrategyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> Result<StrategyDef> {
        let kind: String = row.try_get("kind")?;
        let params_json: String = row.try_get("params_json")?;
        let sizing_json: String = row.try_get("sizing_json")?;
        let sizing: SizingParams =
            serde_json::from_str(&sizing_json).context("bad sizing_json")?;
        Ok(StrategyDef {
            id: row.try_get("id")?,
            kind: kind.parse().map_err(|e: String| anyhow!(e))?,
            exchange: row.try_get("exchange")?,
            symbol: row.try_get("symbol")?,
            params: serde_json::from_str(&params_json).context("bad params_json")?,
            sizing,
            active: row.try_get::<i64, _>("active")? != 0,
            portfolio_id: uuid_col(row, "portfolio_id")?,
        })
    }
}

#[async_trait]
impl StrategyRepository for SqliteStrategyRepository {
    async fn save(&self, def: &StrategyDef) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies (id, kind, exchange, symbol, params_json, sizing_json, active, portfolio_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                exchange = excluded.exchange,
                symbol = excluded.symbol,
                params_json = excluded.params_json,
                sizing_json = excluded.sizing_json,
                active = excluded.active,
                portfolio_id = excluded.portfolio_id
            "#,
        )
        .bind(&def.id)
        .bind(def.kind.to_string())
        .bind(&def.exchange)
        .bind(&def.symbol)
        .bind(serde_json::to_string(&def.params)?)
        .bind(serde_json::to_string(&def.sizing)?)
        .bind(def.active as i64)
        .bind(def.portfolio_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to save strategy")?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StrategyDef>> {
        let row = sqlx::query("SELECT * FROM strategies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<StrategyDef>> {
        let rows = sqlx::query("SELECT * FROM strategies WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE strategies SET active = ? WHERE id = ?")
            .bind(active as i64)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update strategy active flag")?;
        Ok(())
    }
}

// ===== Trades =====

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> Result<Trade> {
        let side: String = row.try_get("side")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;
        Ok(Trade {
            id: uuid_col(row, "id")?,
            strategy_id: row.try_get("strategy_id")?,
            exchange: row.try_get("exchange")?,
            symbol: row.try_get("symbol")?,
            side: OrderSide::from_str(&side).map_err(|e| anyhow!(e))?,
            order_type: OrderType::from_str(&order_type).map_err(|e| anyhow!(e))?,
            amount: dec_col(row, "amount")?,
            price: opt_dec_col(row, "price")?,
            cost: dec_col(row, "cost")?,
            fee: dec_col(row, "fee")?,
            status: TradeStatus::from_str(&status).map_err(|e| anyhow!(e))?,
            exchange_order_id: row.try_get("exchange_order_id")?,
            correlation_id: uuid_col(row, "correlation_id")?,
            fingerprint: row.try_get("fingerprint")?,
            reconciled: row.try_get::<i64, _>("reconciled")? != 0,
            created_at: ts_col(row, "created_at")?,
            updated_at: ts_col(row, "updated_at")?,
        })
    }

    fn bind_all<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        trade: &'q Trade,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(trade.id.to_string())
            .bind(&trade.strategy_id)
            .bind(&trade.exchange)
            .bind(&trade.symbol)
            .bind(trade.side.to_string())
            .bind(trade.order_type.to_string())
            .bind(trade.amount.to_string())
            .bind(trade.price.map(|p| p.to_string()))
            .bind(trade.cost.to_string())
            .bind(trade.fee.to_string())
            .bind(trade.status.to_string())
            .bind(trade.exchange_order_id.clone())
            .bind(trade.correlation_id.to_string())
            .bind(trade.fingerprint.clone())
            .bind(trade.reconciled as i64)
            .bind(trade.created_at.timestamp_millis())
            .bind(trade.updated_at.timestamp_millis())
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn save(&self, trade: &Trade) -> Result<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO trades
                (id, strategy_id, exchange, symbol, side, order_type, amount, price, cost, fee,
                 status, exchange_order_id, correlation_id, fingerprint, reconciled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        );
        Self::bind_all(query, trade)
            .execute(&self.pool)
            .await
            .context("Failed to save trade")?;
        Ok(())
    }

    async fn update(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET
                amount = ?, price = ?, cost = ?, fee = ?, status = ?,
                exchange_order_id = ?, reconciled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(trade.amount.to_string())
        .bind(trade.price.map(|p| p.to_string()))
        .bind(trade.cost.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.status.to_string())
        .bind(trade.exchange_order_id.clone())
        .bind(trade.reconciled as i64)
        .bind(trade.updated_at.timestamp_millis())
        .bind(trade.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update trade")?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_correlation(&self, correlation_id: Uuid) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE correlation_id = ?")
            .bind(correlation_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_status(&self, statuses: &[TradeStatus]) -> Result<Vec<Trade>> {
        // Status sets are tiny; build the placeholder list inline.
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM trades WHERE status IN ({}) ORDER BY created_at ASC",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn find_open_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Trade>> {
        let row = sqlx::query(
            "SELECT * FROM trades WHERE fingerprint = ? AND status IN ('pending', 'open') LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_by_strategy(&self, strategy_id: &str, limit: usize) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE strategy_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(strategy_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }
}

// ===== Positions =====

pub struct SqlitePositionRepository {
    pool: SqlitePool,
}

impl SqlitePositionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_row(row: &SqliteRow) -> Result<Position> {
        let side: String = row.try_get("side")?;
        Ok(Position {
            id: uuid_col(row, "id")?,
            strategy_id: row.try_get("strategy_id")?,
            symbol: row.try_get("symbol")?,
            side: PositionSide::from_str(&side).map_err(|e| anyhow!(e))?,
            entry_price: dec_col(row, "entry_price")?,
            size: dec_col(row, "size")?,
            average_entry: dec_col(row, "average_entry")?,
            stop_loss: opt_dec_col(row, "stop_loss")?,
            take_profit: opt_dec_col(row, "take_profit")?,
            unrealized_pnl: dec_col(row, "unrealized_pnl")?,
            realized_pnl: dec_col(row, "realized_pnl")?,
            total_fees: dec_col(row, "total_fees")?,
            open: row.try_get::<i64, _>("open")? != 0,
            opened_at: ts_col(row, "opened_at")?,
            closed_at: opt_ts_col(row, "closed_at")?,
        })
    }

    async fn upsert(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (id, strategy_id, symbol, side, entry_price, size, average_entry, stop_loss,
                 take_profit, unrealized_pnl, realized_pnl, total_fees, open, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                size = excluded.size,
                average_entry = excluded.average_entry,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                unrealized_pnl = excluded.unrealized_pnl,
                realized_pnl = excluded.realized_pnl,
                total_fees = excluded.total_fees,
                open = excluded.open,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(position.id.to_string())
        .bind(&position.strategy_id)
        .bind(&position.symbol)
        .bind(position.side.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.size.to_string())
        .bind(position.average_entry.to_string())
        .bind(position.stop_loss.map(|d| d.to_string()))
        .bind(position.take_profit.map(|d| d.to_string()))
        .bind(position.unrealized_pnl.to_string())
        .bind(position.realized_pnl.to_string())
        .bind(position.total_fees.to_string())
        .bind(position.open as i64)
        .bind(position.opened_at.timestamp_millis())
        .bind(position.closed_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await
        .context("Failed to upsert position")?;
        Ok(())
    }
}

#[async_trait]
impl PositionRepository for SqlitePositionRepository {
    async fn save(&self, position: &Position) -> Result<()> {
        self.upsert(position).await
    }

    async fn update(&self, position: &Position) -> Result<()> {
        self.upsert(position).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_open(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE open = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn find_open_by_strategy(&self, strategy_id: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE open = 1 AND strategy_id = ?")
            .bind(strategy_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn find_open_by_symbol(&self, symbol: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE open = 1 AND symbol = ?")
            .bind(symbol)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::map_row).collect()
    }
}

// ===== Portfolio rules =====

pub struct SqlitePortfolioRuleRepository {
    pool: SqlitePool,
}

impl SqlitePortfolioRuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PortfolioRuleRepository for SqlitePortfolioRuleRepository {
    async fn save(&self, rule: &PortfolioRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_rules (portfolio_id, kind, value)
            VALUES (?, ?, ?)
            ON CONFLICT(portfolio_id, kind, value) DO NOTHING
            "#,
        )
        .bind(rule.portfolio_id.to_string())
        .bind(rule.kind.to_string())
        .bind(&rule.value)
        .execute(&self.pool)
        .await
        .context("Failed to save portfolio rule")?;
        Ok(())
    }

    async fn list_for_portfolio(&self, portfolio_id: Uuid) -> Result<Vec<PortfolioRule>> {
        let rows = sqlx::query("SELECT * FROM portfolio_rules WHERE portfolio_id = ?")
            .bind(portfolio_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                Ok(PortfolioRule {
                    portfolio_id: uuid_col(row, "portfolio_id")?,
                    kind: RuleKind::from_str(&kind).map_err(|e| anyhow!(e))?,
                    value: row.try_get("value")?,
                })
            })
            .collect()
    }
}

// ===== Strategy state =====

pub struct SqliteStrategyStateRepository {
    pool: SqlitePool,
}

impl SqliteStrategyStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StrategyStateRepository for SqliteStrategyStateRepository {
    async fn store(&self, state: &StrategyState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategy_state
                (strategy_id, last_processed_bar_ts, last_fingerprint, open_position_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(strategy_id) DO UPDATE SET
                last_processed_bar_ts = excluded.last_processed_bar_ts,
                last_fingerprint = excluded.last_fingerprint,
                open_position_id = excluded.open_position_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.strategy_id)
        .bind(state.last_processed_bar_ts.map(|t| t.timestamp_millis()))
        .bind(state.last_fingerprint.clone())
        .bind(state.open_position_id.map(|id| id.to_string()))
        .bind(state.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to store strategy state")?;
        Ok(())
    }

    async fn load(&self, strategy_id: &str) -> Result<Option<StrategyState>> {
        let row = sqlx::query("SELECT * FROM strategy_state WHERE strategy_id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let open_position_id: Option<String> = row.try_get("open_position_id")?;
            Ok(StrategyState {
                strategy_id: row.try_get("strategy_id")?,
                last_processed_bar_ts: opt_ts_col(&row, "last_processed_bar_ts")?,
                last_fingerprint: row.try_get("last_fingerprint")?,
                open_position_id: open_position_id
                    .map(|s| Uuid::parse_str(&s))
                    .transpose()
                    .map_err(|e| anyhow!("bad uuid in open_position_id: {}", e))?,
                updated_at: ts_col(&row, "updated_at")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::StrategyKind;
    use crate::infrastructure::persistence::Database;
    use rust_decimal_macros::dec;

    async fn seed(db: &Database) -> (Portfolio, StrategyDef) {
        let portfolios = SqlitePortfolioRepository::new(db.pool.clone());
        let strategies = SqliteStrategyRepository::new(db.pool.clone());

        let portfolio = Portfolio::new("main", "USDT", dec!(10000));
        portfolios.save(&portfolio).await.unwrap();

        let def = StrategyDef {
            id: "ma-btc".to_string(),
            kind: StrategyKind::MaCrossover,
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            params: serde_json::json!({"fast": 3, "slow": 5}),
            sizing: SizingParams::default(),
            active: true,
            portfolio_id: portfolio.id,
        };
        strategies.save(&def).await.unwrap();
        (portfolio, def)
    }

    fn sample_trade(strategy_id: &str) -> Trade {
        let now = Utc::now();
        Trade {
            id: Uuid::new_v4(),
            strategy_id: strategy_id.to_string(),
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            amount: dec!(0.01),
            price: Some(dec!(50000)),
            cost: dec!(500),
            fee: Decimal::ZERO,
            status: TradeStatus::Pending,
            exchange_order_id: None,
            correlation_id: Uuid::new_v4(),
            fingerprint: Some("abc123".to_string()),
            reconciled: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn portfolio_roundtrip_preserves_decimals() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlitePortfolioRepository::new(db.pool.clone());

        let mut p = Portfolio::new("main", "USDT", dec!(10000.12345678));
        p.reserve(dec!(0.00000001)).unwrap();
        repo.save(&p).await.unwrap();

        let loaded = repo.get(p.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_capital, dec!(10000.12345678));
        assert_eq!(loaded.available_capital, dec!(10000.12345677));
    }

    #[tokio::test]
    async fn trade_save_is_insert_once_and_update_works() {
        let db = Database::in_memory().await.unwrap();
        let (_portfolio, def) = seed(&db).await;
        let repo = SqliteTradeRepository::new(db.pool.clone());

        let mut trade = sample_trade(&def.id);
        repo.save(&trade).await.unwrap();
        // Re-saving the same id is a no-op, not a duplicate.
        repo.save(&trade).await.unwrap();

        trade.transition(TradeStatus::Open).unwrap();
        trade.exchange_order_id = Some("mock-1".to_string());
        repo.update(&trade).await.unwrap();

        let loaded = repo.find_by_correlation(trade.correlation_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TradeStatus::Open);
        assert_eq!(loaded.exchange_order_id.as_deref(), Some("mock-1"));

        let open = repo
            .find_by_status(&[TradeStatus::Pending, TradeStatus::Open])
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn fingerprint_lookup_only_sees_non_terminal() {
        let db = Database::in_memory().await.unwrap();
        let (_portfolio, def) = seed(&db).await;
        let repo = SqliteTradeRepository::new(db.pool.clone());

        let mut trade = sample_trade(&def.id);
        repo.save(&trade).await.unwrap();
        assert!(repo.find_open_by_fingerprint("abc123").await.unwrap().is_some());

        trade.transition(TradeStatus::Failed).unwrap();
        repo.update(&trade).await.unwrap();
        assert!(repo.find_open_by_fingerprint("abc123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn position_and_state_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let (_portfolio, def) = seed(&db).await;
        let positions = SqlitePositionRepository::new(db.pool.clone());
        let states = SqliteStrategyStateRepository::new(db.pool.clone());

        let mut pos = Position::open_from_fill(
            &def.id,
            "BTC/USDT",
            PositionSide::Long,
            dec!(0.5),
            dec!(40000),
            dec!(20),
            Utc::now(),
        );
        positions.save(&pos).await.unwrap();
        assert_eq!(positions.find_open_by_symbol("BTC/USDT").await.unwrap().len(), 1);

        pos.reduce(dec!(0.5), dec!(41000), Decimal::ZERO, Utc::now());
        positions.update(&pos).await.unwrap();
        assert!(positions.find_open().await.unwrap().is_empty());

        let state = StrategyState {
            strategy_id: def.id.clone(),
            last_processed_bar_ts: Some(Utc::now()),
            last_fingerprint: Some("abc123".to_string()),
            open_position_id: Some(pos.id),
            updated_at: Utc::now(),
        };
        states.store(&state).await.unwrap();
        let loaded = states.load(&def.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_fingerprint.as_deref(), Some("abc123"));
        assert_eq!(loaded.open_position_id, Some(pos.id));
    }
}
