use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tracing::info;

/// Process-scoped database handle with a bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        // An in-memory database is per-connection; a wider pool would hand
        // out empty databases.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite://:memory:").await
    }

    /// Initialize database schema. Monetary columns are decimal strings;
    /// timestamps are UTC milliseconds.
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolios (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                base_currency TEXT NOT NULL,
                total_capital TEXT NOT NULL,
                available_capital TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolios table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                params_json TEXT NOT NULL,
                sizing_json TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                portfolio_id TEXT NOT NULL REFERENCES portfolios(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategies table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                price TEXT,
                cost TEXT NOT NULL,
                fee TEXT NOT NULL,
                status TEXT NOT NULL,
                exchange_order_id TEXT,
                correlation_id TEXT NOT NULL UNIQUE,
                fingerprint TEXT,
                reconciled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades (status);
            CREATE INDEX IF NOT EXISTS idx_trades_fingerprint ON trades (fingerprint, status);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                average_entry TEXT NOT NULL,
                stop_loss TEXT,
                take_profit TEXT,
                unrealized_pnl TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                open INTEGER NOT NULL DEFAULT 1,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_positions_open ON positions (open, symbol);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_rules (
                portfolio_id TEXT NOT NULL REFERENCES portfolios(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (portfolio_id, kind, value)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create portfolio_rules table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_state (
                strategy_id TEXT PRIMARY KEY REFERENCES strategies(id) ON DELETE CASCADE,
                last_processed_bar_ts INTEGER,
                last_fingerprint TEXT,
                open_position_id TEXT,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create strategy_state table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
