use crate::application::capital::{self, CapitalHandle, CapitalManager, RuleSet};
use crate::application::connector::ExchangeConnector;
use crate::application::reconciler::{ReconcileGate, Reconciler};
use crate::application::worker::StrategyWorker;
use crate::bus::{
    handler, BusClient, BusConfig, BusExchange, HandlerError, MemoryBroker, Subscription,
    SubscriptionHandle,
};
use crate::bus::broker::{
    HEADER_DEATH_COUNT, HEADER_FIRST_DEATH_REASON, HEADER_ORIGINAL_ROUTING_KEY,
};
use crate::config::Config;
use crate::domain::entities::{Portfolio, SizingParams, StrategyDef, StrategyKind};
use crate::domain::events::StrategyHaltedEvent;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::repositories::{
    PortfolioRepository, PortfolioRuleRepository, PositionRepository, StrategyRepository,
    StrategyStateRepository, TradeRepository,
};
use crate::domain::types::validate_symbol;
use crate::infrastructure::exchange::MockExchange;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::{
    Database, SqlitePortfolioRepository, SqlitePortfolioRuleRepository, SqlitePositionRepository,
    SqliteStrategyRepository, SqliteStrategyStateRepository, SqliteTradeRepository,
};
use crate::strategies;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Strategy seed file (TOML), loaded once when the database has no
/// strategies yet.
#[derive(Debug, Deserialize)]
struct SeedFile {
    #[serde(default)]
    strategies: Vec<SeedStrategy>,
}

#[derive(Debug, Deserialize)]
struct SeedStrategy {
    id: String,
    kind: StrategyKind,
    exchange: String,
    symbol: String,
    params: Option<toml::Value>,
    risk_percent: Option<Decimal>,
    lot_step: Option<Decimal>,
    min_amount: Option<Decimal>,
}

/// Builds every service from the config and supervises their lifecycles.
/// Constructed once at startup; components receive handles, never globals.
pub struct CoreEngine {
    cfg: Config,
    broker: Arc<MemoryBroker>,
    adapter: Arc<dyn ExchangeAdapter>,
    mock: Option<Arc<MockExchange>>,
    metrics: Metrics,
    portfolios: Arc<dyn PortfolioRepository>,
    strategies: Arc<dyn StrategyRepository>,
    trades: Arc<dyn TradeRepository>,
    positions: Arc<dyn PositionRepository>,
    rules: Arc<dyn PortfolioRuleRepository>,
    states: Arc<dyn StrategyStateRepository>,
}

/// Running system. Dropping it does not stop anything; call `shutdown`.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<SubscriptionHandle>,
    pub capital: HashMap<Uuid, CapitalHandle>,
    pub broker: Arc<MemoryBroker>,
    pub mock: Option<Arc<MockExchange>>,
}

impl CoreEngine {
    pub async fn build(cfg: Config) -> Result<Self> {
        for symbol in &cfg.symbols {
            validate_symbol(symbol).map_err(|e| anyhow::anyhow!(e))?;
        }

        let db = Database::new(&cfg.database_url).await?;
        let portfolios: Arc<dyn PortfolioRepository> =
            Arc::new(SqlitePortfolioRepository::new(db.pool.clone()));
        let strategies_repo: Arc<dyn StrategyRepository> =
            Arc::new(SqliteStrategyRepository::new(db.pool.clone()));
        let trades: Arc<dyn TradeRepository> =
            Arc::new(SqliteTradeRepository::new(db.pool.clone()));
        let positions: Arc<dyn PositionRepository> =
            Arc::new(SqlitePositionRepository::new(db.pool.clone()));
        let rules: Arc<dyn PortfolioRuleRepository> =
            Arc::new(SqlitePortfolioRuleRepository::new(db.pool.clone()));
        let states: Arc<dyn StrategyStateRepository> =
            Arc::new(SqliteStrategyStateRepository::new(db.pool.clone()));

        let (adapter, mock): (Arc<dyn ExchangeAdapter>, Option<Arc<MockExchange>>) =
            match cfg.exchange_id.as_str() {
                "mock" => {
                    let mock = Arc::new(MockExchange::new());
                    (mock.clone(), Some(mock))
                }
                other => bail!(
                    "unknown exchange '{}'; only 'mock' ships with the core, real \
                     exchanges plug in through the ExchangeAdapter port",
                    other
                ),
            };

        let engine = Self {
            broker: MemoryBroker::new(),
            adapter,
            mock,
            metrics: Metrics::new()?,
            portfolios,
            strategies: strategies_repo,
            trades,
            positions,
            rules,
            states,
            cfg,
        };
        engine.seed().await?;
        Ok(engine)
    }

    /// Ensure a portfolio exists and load strategy definitions on first run.
    async fn seed(&self) -> Result<()> {
        let mut active = self.portfolios.list_active().await?;
        if active.is_empty() {
            let portfolio = Portfolio::new(
                "default",
                &self.cfg.base_currency,
                self.cfg.trading.initial_capital,
            );
            info!(
                "CoreEngine: seeding default portfolio '{}' with {} {}",
                portfolio.name, portfolio.total_capital, portfolio.base_currency
            );
            self.portfolios.save(&portfolio).await?;
            active.push(portfolio);
        }

        if self.strategies.list_active().await?.is_empty()
            && let Some(path) = &self.cfg.strategies_file
        {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read strategies file {}", path))?;
            let seed: SeedFile =
                toml::from_str(&raw).with_context(|| format!("bad strategies file {}", path))?;
            let portfolio_id = active[0].id;
            for entry in seed.strategies {
                validate_symbol(&entry.symbol).map_err(|e| anyhow::anyhow!(e))?;
                let mut sizing = SizingParams::default();
                if let Some(risk) = entry.risk_percent {
                    sizing.risk_percent = risk;
                }
                if let Some(step) = entry.lot_step {
                    sizing.lot_step = step;
                }
                if let Some(min) = entry.min_amount {
                    sizing.min_amount = min;
                }
                let params = entry
                    .params
                    .unwrap_or(toml::Value::Table(toml::map::Map::new()));
                let def = StrategyDef {
                    id: entry.id,
                    kind: entry.kind,
                    exchange: entry.exchange,
                    symbol: entry.symbol,
                    params: serde_json::to_value(params)?,
                    sizing,
                    active: true,
                    portfolio_id,
                };
                info!("CoreEngine: seeding strategy {} ({})", def.id, def.kind);
                self.strategies.save(&def).await?;
            }
        }
        Ok(())
    }

    fn bus_config(&self, source: &str) -> BusConfig {
        let mut cfg = BusConfig::new(source);
        cfg.publish_buffer = self.cfg.bus.publish_buffer;
        cfg.max_retries = self.cfg.bus.max_retries;
        cfg.retry_backoff = self.cfg.bus.retry_backoff();
        cfg.request_timeout = self.cfg.bus.request_timeout();
        cfg
    }

    fn bus_client(&self, source: &str) -> Arc<BusClient> {
        BusClient::new(Arc::clone(&self.broker), self.bus_config(source))
    }

    /// Spawn every component and return the running handle.
    pub async fn start(self) -> Result<EngineHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut subscriptions = Vec::new();

        let engine_bus = self.bus_client("engine");
        tasks.push(engine_bus.spawn_flusher());

        subscriptions.push(self.spawn_dlx_monitor(&engine_bus).await);
        subscriptions.push(self.spawn_system_monitor(&engine_bus).await);

        let active_strategies = self.strategies.list_active().await?;

        // Shared between the Reconciler and every Capital Manager: symbols
        // behind a forced reconciliation are denied until the sweep lands.
        let gate = ReconcileGate::new();

        // One Capital Manager per portfolio: its own serialization domain.
        let mut capital: HashMap<Uuid, CapitalHandle> = HashMap::new();
        for portfolio in self.portfolios.list_active().await? {
            let rule_rows = self.rules.list_for_portfolio(portfolio.id).await?;
            let mut rules = RuleSet::from_config(&self.cfg.trading);
            rules.apply_rules(&rule_rows);

            let (mut manager, handle) = CapitalManager::new(
                portfolio.clone(),
                rules,
                self.cfg.trading.clone(),
                Arc::clone(&self.trades),
                Arc::clone(&self.positions),
                Arc::clone(&self.portfolios),
                Arc::clone(&self.strategies),
                self.metrics.clone(),
                gate.clone(),
            );
            manager.recover().await?;

            let owned: Vec<String> = active_strategies
                .iter()
                .filter(|s| s.portfolio_id == portfolio.id)
                .map(|s| s.id.clone())
                .collect();
            let capital_bus = self.bus_client(&format!("capital.{}", portfolio.name));
            tasks.push(capital_bus.spawn_flusher());
            subscriptions.extend(
                capital::attach_bus(
                    &capital_bus,
                    handle.clone(),
                    &owned,
                    self.cfg.bus.prefetch_commands,
                )
                .await,
            );
            tasks.push(tokio::spawn(manager.run(shutdown_rx.clone())));
            capital.insert(portfolio.id, handle);
        }

        // Exchange Connector.
        let mut symbols: Vec<String> = active_strategies.iter().map(|s| s.symbol.clone()).collect();
        for symbol in &self.cfg.symbols {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
        // Command redelivery at the connector follows the execution retry
        // budget rather than the generic bus default.
        let mut connector_cfg = self.bus_config("connector");
        connector_cfg.max_retries = self.cfg.execution.retry_attempts;
        let connector_bus = BusClient::new(Arc::clone(&self.broker), connector_cfg);
        tasks.push(connector_bus.spawn_flusher());
        let connector = ExchangeConnector::new(
            connector_bus,
            Arc::clone(&self.adapter),
            Arc::clone(&self.trades),
            self.cfg.execution.clone(),
            self.cfg.bus.clone(),
            symbols,
            self.metrics.clone(),
        );
        let connector_handles = connector.start(shutdown_rx.clone()).await?;
        subscriptions.extend(connector_handles.subscriptions);
        tasks.push(connector_handles.stream_task);

        // Reconciler.
        let reconciler = Reconciler::new(
            self.bus_client("reconciler"),
            Arc::clone(&self.adapter),
            Arc::clone(&self.trades),
            Arc::clone(&self.positions),
            Arc::clone(&self.strategies),
            capital.clone(),
            gate.clone(),
            self.cfg.reconcile.clone(),
            self.metrics.clone(),
        );
        tasks.push(tokio::spawn(reconciler.run(shutdown_rx.clone())));

        // One worker per active strategy, restarted a few times on crashes.
        // A clean return (shutdown or self-halt) ends the supervision loop.
        for def in active_strategies {
            if strategies::build(&def).is_err() {
                error!("CoreEngine: cannot build strategy {}, skipping", def.id);
                continue;
            }
            let worker_bus = self.bus_client(&format!("worker.{}", def.id));
            tasks.push(worker_bus.spawn_flusher());

            let states = Arc::clone(&self.states);
            let positions = Arc::clone(&self.positions);
            let worker_cfg = self.cfg.worker.clone();
            let request_timeout = self.cfg.bus.request_timeout();
            let prefetch = self.cfg.bus.prefetch_market_data;
            let rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut restarts = 0u32;
                loop {
                    let strategy = match strategies::build(&def) {
                        Ok(s) => s,
                        Err(e) => {
                            error!("CoreEngine: cannot rebuild strategy {}: {}", def.id, e);
                            break;
                        }
                    };
                    let worker = StrategyWorker::new(
                        def.clone(),
                        strategy,
                        Arc::clone(&worker_bus),
                        Arc::clone(&states),
                        Arc::clone(&positions),
                        worker_cfg.clone(),
                        request_timeout,
                        prefetch,
                    );
                    match worker.run(rx.clone()).await {
                        Ok(()) => break,
                        Err(e) => {
                            restarts += 1;
                            error!(
                                "Worker [{}]: crashed ({}), restart {}/3",
                                def.id, e, restarts
                            );
                            if restarts >= 3 || *rx.borrow() {
                                break;
                            }
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }));
        }

        tasks.push(
            self.metrics
                .spawn_reporter(self.cfg.observability_interval_secs),
        );

        info!("CoreEngine: all components started");
        Ok(EngineHandle {
            shutdown: shutdown_tx,
            tasks,
            subscriptions,
            capital,
            broker: self.broker,
            mock: self.mock,
        })
    }

    /// Dead letters are logged with their diagnostics and mirrored onto
    /// `events.error` for operator surfaces.
    async fn spawn_dlx_monitor(&self, bus: &Arc<BusClient>) -> SubscriptionHandle {
        let publisher = Arc::clone(bus);
        bus.subscribe(
            Subscription::new("dlx.monitor").bind(BusExchange::Dlx, "#"),
            handler(move |delivery| {
                let bus = Arc::clone(&publisher);
                async move {
                    let reason = delivery
                        .headers
                        .get(HEADER_FIRST_DEATH_REASON)
                        .cloned()
                        .unwrap_or_default();
                    error!(
                        "DLQ: message {} from '{}' dead-lettered after {} attempt(s): {}",
                        delivery.envelope.message_id,
                        delivery
                            .headers
                            .get(HEADER_ORIGINAL_ROUTING_KEY)
                            .map(String::as_str)
                            .unwrap_or("?"),
                        delivery
                            .headers
                            .get(HEADER_DEATH_COUNT)
                            .map(String::as_str)
                            .unwrap_or("?"),
                        reason
                    );
                    let payload = serde_json::json!({
                        "message_id": delivery.envelope.message_id,
                        "routing_key": delivery.routing_key,
                        "reason": reason,
                    });
                    let envelope = bus.envelope(delivery.envelope.correlation_id, payload);
                    let _ = bus
                        .publish(BusExchange::Events, crate::bus::keys::ERROR, envelope)
                        .await;
                    Ok(())
                }
            }),
        )
        .await
    }

    /// Watch `events.system.*`: log everything, and mark halted strategies
    /// inactive so the next start does not resurrect them.
    async fn spawn_system_monitor(&self, bus: &Arc<BusClient>) -> SubscriptionHandle {
        let strategies = Arc::clone(&self.strategies);
        bus.subscribe(
            Subscription::new("engine.system").bind(BusExchange::Events, "events.system.#"),
            handler(move |delivery| {
                let strategies = Arc::clone(&strategies);
                async move {
                    info!(
                        "CoreEngine: system event {} from {}",
                        delivery.routing_key, delivery.envelope.source
                    );
                    if delivery.routing_key == "events.system.strategy_halted" {
                        let event: StrategyHaltedEvent = delivery
                            .envelope
                            .parse_payload()
                            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;
                        warn!(
                            "CoreEngine: marking strategy {} inactive ({})",
                            event.strategy_id, event.reason
                        );
                        strategies
                            .set_active(&event.strategy_id, false)
                            .await
                            .map_err(|e| HandlerError::Retry(e.to_string()))?;
                    }
                    Ok(())
                }
            }),
        )
        .await
    }
}

impl EngineHandle {
    /// Coordinated shutdown: signal every component, wait out the drain
    /// deadline, then abort stragglers.
    pub async fn shutdown(self, drain: Duration) {
        info!("CoreEngine: shutdown requested (drain {:?})", drain);
        let _ = self.shutdown.send(true);

        let deadline = tokio::time::Instant::now() + drain;
        for mut task in self.tasks {
            if task.is_finished() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }
        for sub in &self.subscriptions {
            sub.abort();
        }
        info!("CoreEngine: shutdown complete");
    }
}
