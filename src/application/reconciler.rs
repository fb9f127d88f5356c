use crate::application::capital::CapitalHandle;
use crate::bus::{handler, keys, BusClient, BusExchange, HandlerError, Subscription};
use crate::config::ReconcileOptions;
use crate::domain::entities::Trade;
use crate::domain::events::{PositionReconciledEvent, ReconciliationAlertEvent, WsReconnectedEvent};
use crate::domain::ports::ExchangeAdapter;
use crate::domain::repositories::{
    PositionRepository, StrategyRepository, TradeRepository,
};
use crate::domain::types::{
    CancelCommand, ExchangeOrder, ExchangePosition, OrderType, TradeStatus,
};
use crate::infrastructure::observability::Metrics;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Symbols whose proposals are held back until a forced reconciliation
/// sweep completes. Shared between the Reconciler (writer) and the Capital
/// Managers (readers): a market-data gap puts the affected symbols behind
/// the gate, and the next completed sweep lifts it.
#[derive(Clone, Default)]
pub struct ReconcileGate {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ReconcileGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold<I: IntoIterator<Item = String>>(&self, symbols: I) {
        let mut held = self.held.lock().expect("reconcile gate poisoned");
        for symbol in symbols {
            warn!("ReconcileGate: holding proposals for {}", symbol);
            held.insert(symbol);
        }
    }

    pub fn is_held(&self, symbol: &str) -> bool {
        self.held
            .lock()
            .expect("reconcile gate poisoned")
            .contains(symbol)
    }

    pub fn clear(&self) {
        let mut held = self.held.lock().expect("reconcile gate poisoned");
        if !held.is_empty() {
            info!("ReconcileGate: releasing {} held symbol(s)", held.len());
            held.clear();
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().expect("reconcile gate poisoned").len()
    }
}

/// What one sweep found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphan_db_orders: usize,
    pub orphan_exchange_orders: usize,
    pub size_adjustments: usize,
    pub status_drifts: usize,
    pub alerts: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    fn repairs(&self) -> usize {
        self.orphan_db_orders + self.orphan_exchange_orders + self.size_adjustments + self.status_drifts
    }
}

/// Aligns the authoritative database with the exchange's observed state.
/// Exchange state wins for order status and position size; system state wins
/// for intent and capital. All writes go through the owning Capital
/// Manager's command channel so the single-writer invariant holds.
pub struct Reconciler {
    bus: Arc<BusClient>,
    adapter: Arc<dyn ExchangeAdapter>,
    trades: Arc<dyn TradeRepository>,
    positions: Arc<dyn PositionRepository>,
    strategies: Arc<dyn StrategyRepository>,
    capital: HashMap<Uuid, CapitalHandle>,
    gate: ReconcileGate,
    cfg: ReconcileOptions,
    metrics: Metrics,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<BusClient>,
        adapter: Arc<dyn ExchangeAdapter>,
        trades: Arc<dyn TradeRepository>,
        positions: Arc<dyn PositionRepository>,
        strategies: Arc<dyn StrategyRepository>,
        capital: HashMap<Uuid, CapitalHandle>,
        gate: ReconcileGate,
        cfg: ReconcileOptions,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            adapter,
            trades,
            positions,
            strategies,
            capital,
            gate,
            cfg,
            metrics,
        })
    }

    /// Periodic sweeps plus event-driven triggers: stream reconnects with a
    /// large gap, and the explicit operator command.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<&'static str>(8);

        let gap_threshold_ms = self.cfg.interval_ms as i64;
        let tx = trigger_tx.clone();
        let gate = self.gate.clone();
        let strategies = Arc::clone(&self.strategies);
        let _trigger_sub = self
            .bus
            .subscribe(
                Subscription::new("reconciler.triggers")
                    .bind(BusExchange::Events, &keys::system("ws_reconnected"))
                    .bind(BusExchange::Commands, keys::RECONCILE),
                handler(move |delivery| {
                    let tx = tx.clone();
                    let gate = gate.clone();
                    let strategies = Arc::clone(&strategies);
                    async move {
                        let cause = if delivery.routing_key == keys::RECONCILE {
                            Some("operator")
                        } else {
                            match delivery.envelope.parse_payload::<WsReconnectedEvent>() {
                                Ok(event) if event.gap_ms > gap_threshold_ms => {
                                    // Hold the gapped exchange's symbols: no
                                    // new proposals until the forced sweep
                                    // lands.
                                    let defs = strategies
                                        .list_active()
                                        .await
                                        .map_err(|e| HandlerError::Retry(e.to_string()))?;
                                    gate.hold(
                                        defs.into_iter()
                                            .filter(|d| d.exchange == event.exchange)
                                            .map(|d| d.symbol),
                                    );
                                    Some("stream gap")
                                }
                                Ok(_) => None,
                                Err(e) => {
                                    return Err(HandlerError::Fatal(format!(
                                        "schema_violation: {}",
                                        e
                                    )));
                                }
                            }
                        };
                        if let Some(cause) = cause {
                            let _ = tx.send(cause).await;
                        }
                        Ok(())
                    }
                }),
            )
            .await;

        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.cfg.interval_ms.max(100)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup settles first.
        interval.tick().await;

        info!(
            "Reconciler: running every {}ms (tolerance {})",
            self.cfg.interval_ms, self.cfg.size_tolerance
        );

        loop {
            let cause = tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler: shutting down");
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => "interval",
                Some(cause) = trigger_rx.recv() => cause,
            };

            match self.run_once().await {
                Ok(report) if report.is_noop() => {
                    debug!("Reconciler: sweep ({}) found nothing to repair", cause);
                }
                Ok(report) => {
                    info!(
                        "Reconciler: sweep ({}) repaired {} discrepancies ({:?})",
                        cause,
                        report.repairs(),
                        report
                    );
                }
                Err(e) => error!("Reconciler: sweep failed: {}", e),
            }
        }
    }

    /// One full sweep. A no-op exactly when the database agrees with the
    /// exchange within tolerance.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        self.metrics.reconciliation_runs.inc();
        let mut report = ReconcileReport::default();

        let exchange_orders = self.adapter.get_open_orders().await?;
        let exchange_positions = self.adapter.get_positions().await?;
        let balances = self.adapter.get_balance().await?;
        debug!(
            "Reconciler: exchange reports {} open order(s), {} position(s), {} asset balance(s)",
            exchange_orders.len(),
            exchange_positions.len(),
            balances.len()
        );

        self.reconcile_trades(&exchange_orders, &mut report).await?;
        self.reconcile_orphan_exchange_orders(&exchange_orders, &mut report)
            .await?;
        self.reconcile_positions(&exchange_positions, &mut report)
            .await?;

        for _ in 0..report.repairs() {
            self.metrics.reconciliation_repairs.inc();
        }
        // State is aligned again: symbols held since the gap may trade.
        self.gate.clear();
        Ok(report)
    }

    async fn handle_for_strategy(&self, strategy_id: &str) -> Option<&CapitalHandle> {
        let def = self.strategies.get(strategy_id).await.ok().flatten()?;
        self.capital.get(&def.portfolio_id)
    }

    async fn reconcile_trades(
        &self,
        exchange_orders: &[ExchangeOrder],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let now = Utc::now();
        let grace = ChronoDuration::milliseconds(self.cfg.stale_order_grace_ms);
        let open_trades = self
            .trades
            .find_by_status(&[TradeStatus::Pending, TradeStatus::Open])
            .await?;

        for trade in open_trades {
            let on_exchange = exchange_orders.iter().any(|o| {
                o.client_order_id == Some(trade.correlation_id)
                    || trade.exchange_order_id.as_deref() == Some(o.exchange_order_id.as_str())
            });
            if on_exchange {
                continue;
            }
            if now - trade.created_at < grace {
                // Young orders may simply not be visible yet.
                continue;
            }

            let Some(handle) = self.handle_for_strategy(&trade.strategy_id).await else {
                warn!(
                    "Reconciler: trade {} has no capital manager, skipping",
                    trade.correlation_id
                );
                continue;
            };

            match trade.status {
                TradeStatus::Pending => {
                    if handle
                        .mark_failed(trade.correlation_id, "orphan db order")
                        .await?
                    {
                        report.orphan_db_orders += 1;
                        self.publish_reconciled(
                            handle.portfolio_id,
                            &format!("trade {}", trade.correlation_id),
                            "marked failed, reservation released",
                            None,
                        )
                        .await;
                    }
                }
                TradeStatus::Open => {
                    // The exchange no longer lists it; the fills tell whether
                    // it completed or vanished.
                    let fills: Vec<_> = self
                        .adapter
                        .get_trade_history(&trade.symbol, trade.created_at)
                        .await?
                        .into_iter()
                        .filter(|f| f.client_order_id == Some(trade.correlation_id))
                        .collect();

                    if fills.is_empty() {
                        if handle
                            .mark_failed(trade.correlation_id, "orphan db order, no fills")
                            .await?
                        {
                            report.orphan_db_orders += 1;
                            self.publish_reconciled(
                                handle.portfolio_id,
                                &format!("trade {}", trade.correlation_id),
                                "canceled, no fills on exchange",
                                None,
                            )
                            .await;
                        }
                    } else if handle
                        .close_from_fills(trade.correlation_id, fills)
                        .await?
                    {
                        report.status_drifts += 1;
                        self.publish_reconciled(
                            handle.portfolio_id,
                            &format!("trade {}", trade.correlation_id),
                            "closed from exchange fill history",
                            None,
                        )
                        .await;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn reconcile_orphan_exchange_orders(
        &self,
        exchange_orders: &[ExchangeOrder],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let open_trades = self
            .trades
            .find_by_status(&[TradeStatus::Pending, TradeStatus::Open])
            .await?;

        for order in exchange_orders {
            let known = match order.client_order_id {
                Some(id) => self.trades.find_by_correlation(id).await?.is_some(),
                None => false,
            } || open_trades
                .iter()
                .any(|t| t.exchange_order_id.as_deref() == Some(order.exchange_order_id.as_str()));
            if known {
                continue;
            }

            // Intent attribution: the active strategy trading this symbol, if
            // exactly one exists. Anything else is an operator problem.
            let candidates: Vec<_> = self
                .strategies
                .list_active()
                .await?
                .into_iter()
                .filter(|s| s.symbol == order.symbol)
                .collect();

            let Some(strategy) = (candidates.len() == 1).then(|| candidates.into_iter().next().unwrap()) else {
                report.alerts += 1;
                self.publish_alert(
                    Uuid::nil(),
                    &format!(
                        "exchange order {} on {} has no attributable strategy",
                        order.exchange_order_id, order.symbol
                    ),
                )
                .await;
                continue;
            };
            let Some(handle) = self.capital.get(&strategy.portfolio_id) else {
                continue;
            };

            let now = Utc::now();
            let trade = Trade {
                id: Uuid::new_v4(),
                strategy_id: strategy.id.clone(),
                exchange: strategy.exchange.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: OrderType::Limit,
                amount: order.amount,
                price: order.price,
                cost: order.amount * order.price.unwrap_or(Decimal::ZERO),
                fee: Decimal::ZERO,
                status: TradeStatus::Open,
                exchange_order_id: Some(order.exchange_order_id.clone()),
                correlation_id: order.client_order_id.unwrap_or_else(Uuid::new_v4),
                fingerprint: None,
                reconciled: true,
                created_at: now,
                updated_at: now,
            };
            handle.record_reconciled_trade(trade).await?;
            report.orphan_exchange_orders += 1;
            info!(
                "Reconciler: recorded orphan exchange order {} as reconciled trade",
                order.exchange_order_id
            );

            // Never canceled automatically unless the operator opted in.
            if self.cfg.auto_cancel_orphans
                && let Some(client_order_id) = order.client_order_id
            {
                let command = CancelCommand {
                    exchange: strategy.exchange.clone(),
                    symbol: order.symbol.clone(),
                    client_order_id,
                };
                if let Ok(payload) = serde_json::to_value(&command) {
                    let envelope = self.bus.envelope(Some(client_order_id), payload);
                    let _ = self
                        .bus
                        .publish(BusExchange::Commands, keys::CANCEL_ORDER, envelope)
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_positions(
        &self,
        exchange_positions: &[ExchangePosition],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let open_positions = self.positions.find_open().await?;

        // Group DB positions by symbol; the exchange reports one net position
        // per symbol.
        let mut by_symbol: HashMap<&str, Vec<_>> = HashMap::new();
        for position in &open_positions {
            by_symbol.entry(position.symbol.as_str()).or_default().push(position);
        }

        for (symbol, db_positions) in &by_symbol {
            let observed = exchange_positions
                .iter()
                .find(|p| p.symbol == *symbol)
                .map(|p| p.size)
                .unwrap_or(Decimal::ZERO);
            let recorded: Decimal = db_positions.iter().map(|p| p.size).sum();
            let drift = (observed - recorded).abs();
            if drift <= self.cfg.size_tolerance {
                continue;
            }

            if db_positions.len() != 1 {
                report.alerts += 1;
                self.publish_alert(
                    Uuid::nil(),
                    &format!(
                        "{} size drift {} spans {} positions, cannot attribute",
                        symbol,
                        drift,
                        db_positions.len()
                    ),
                )
                .await;
                continue;
            }

            let position = db_positions[0];
            let Some(handle) = self.handle_for_strategy(&position.strategy_id).await else {
                continue;
            };
            handle
                .adjust_position_size(position.id, observed)
                .await?;
            report.size_adjustments += 1;
            self.publish_reconciled(
                handle.portfolio_id,
                &format!("position {} ({})", position.id, symbol),
                "size adjusted to exchange",
                Some(observed - recorded),
            )
            .await;
        }

        // Exchange positions the database does not know at all: left alone,
        // loudly.
        for ex_position in exchange_positions {
            if ex_position.size.abs() <= self.cfg.size_tolerance {
                continue;
            }
            if !by_symbol.contains_key(ex_position.symbol.as_str()) {
                report.alerts += 1;
                self.publish_alert(
                    Uuid::nil(),
                    &format!(
                        "exchange holds unknown {} position of {} (left untouched)",
                        ex_position.symbol, ex_position.size
                    ),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn publish_reconciled(
        &self,
        portfolio_id: Uuid,
        subject: &str,
        action: &str,
        size_delta: Option<Decimal>,
    ) {
        let event = PositionReconciledEvent {
            portfolio_id,
            subject: subject.to_string(),
            action: action.to_string(),
            size_delta,
        };
        if let Ok(payload) = serde_json::to_value(&event) {
            let envelope = self.bus.envelope(None, payload);
            let _ = self
                .bus
                .publish(
                    BusExchange::Events,
                    &keys::system("position_reconciled"),
                    envelope,
                )
                .await;
        }
    }

    async fn publish_alert(&self, portfolio_id: Uuid, detail: &str) {
        warn!("Reconciler: ALERT {}", detail);
        let event = ReconciliationAlertEvent {
            portfolio_id,
            detail: detail.to_string(),
        };
        if let Ok(payload) = serde_json::to_value(&event) {
            let envelope = self.bus.envelope(None, payload);
            let _ = self
                .bus
                .publish(
                    BusExchange::Events,
                    &keys::system("reconciliation_alert"),
                    envelope,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_holds_and_releases_symbols() {
        let gate = ReconcileGate::new();
        assert!(!gate.is_held("BTC/USDT"));

        gate.hold(vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);
        assert!(gate.is_held("BTC/USDT"));
        assert!(gate.is_held("ETH/USDT"));
        assert!(!gate.is_held("SOL/USDT"));
        assert_eq!(gate.held_count(), 2);

        gate.clear();
        assert!(!gate.is_held("BTC/USDT"));
        assert_eq!(gate.held_count(), 0);
    }

    #[test]
    fn gate_clones_share_state() {
        let gate = ReconcileGate::new();
        let reader = gate.clone();
        gate.hold(vec!["BTC/USDT".to_string()]);
        assert!(reader.is_held("BTC/USDT"));
        reader.clear();
        assert_eq!(gate.held_count(), 0);
    }
}
