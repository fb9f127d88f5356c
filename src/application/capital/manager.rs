use crate::application::capital::sizing::{size_fixed_fractional, SizedOrder, SizingInputs};
use crate::application::capital::validation::{
    validate_post_size, validate_pre_size, RuleSet, ValidationContext,
};
use crate::application::reconciler::ReconcileGate;
use crate::bus::{handler, keys, BusClient, BusExchange, HandlerError, Subscription, SubscriptionHandle};
use crate::config::TradingOptions;
use crate::domain::entities::{Portfolio, Position, StrategyDef, Trade};
use crate::domain::errors::{Denial, DenialCode};
use crate::domain::events::TradeExecutedEvent;
use crate::domain::repositories::{
    PortfolioRepository, PositionRepository, StrategyRepository, TradeRepository,
};
use crate::domain::types::{
    AllocationRequest, AllocationResponse, AllocationVerdict, FillRecord, OrderSide, OrderType,
    PortfolioImpact, PositionSide, RiskLevel, TradeCommand, TradeStatus,
};
use crate::infrastructure::observability::Metrics;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_DEPTH: usize = 256;

/// A capital hold against a non-terminal trade, keyed by correlation id.
#[derive(Debug, Clone)]
struct Reservation {
    strategy_id: String,
    symbol: String,
    /// Quote currency held: notional * (1 + fee_buffer).
    reserved: Decimal,
    notional: Decimal,
    risk_amount: Decimal,
    fingerprint: Option<String>,
    /// Protective levels carried from the approval into the opened position.
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    /// Cumulative filled amount seen, for replay-safe delta computation.
    filled_so_far: Decimal,
    /// Cumulative filled notional.
    filled_notional: Decimal,
    /// Set once fills classify this trade as reducing an open position.
    is_exit: bool,
}

/// Result of one allocation decision: the wire response plus, on approval,
/// the command the manager publishes.
#[derive(Debug)]
pub struct AllocationOutcome {
    pub response: AllocationResponse,
    pub command: Option<TradeCommand>,
}

pub enum CapitalCommand {
    Allocate {
        request: AllocationRequest,
        correlation_id: Uuid,
        deadline: Option<DateTime<Utc>>,
        respond_to: oneshot::Sender<AllocationOutcome>,
    },
    /// A fill observed on `events.trade_executed`.
    Fill { event: TradeExecutedEvent },
    /// Reconciler: mark a non-terminal trade failed/canceled and release its
    /// reservation. Replies whether anything changed.
    MarkFailed {
        correlation_id: Uuid,
        reason: String,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// Reconciler: force a position's size to the exchange-observed value.
    AdjustPositionSize {
        position_id: Uuid,
        observed_size: Decimal,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// Reconciler: close an open trade from exchange fill history.
    CloseFromFills {
        correlation_id: Uuid,
        fills: Vec<FillRecord>,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// Reconciler: record a trade the exchange knows but the system does not.
    RecordReconciledTrade {
        trade: Trade,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<PortfolioSnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub portfolio: Portfolio,
    pub reserved_total: Decimal,
    pub open_reservations: usize,
    pub realized_loss_today: Decimal,
}

/// Cloneable sender into one portfolio's serialization domain.
#[derive(Clone)]
pub struct CapitalHandle {
    pub portfolio_id: Uuid,
    tx: mpsc::Sender<CapitalCommand>,
}

impl CapitalHandle {
    pub async fn allocate(
        &self,
        request: AllocationRequest,
        correlation_id: Uuid,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<AllocationOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::Allocate {
                request,
                correlation_id,
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))
    }

    pub async fn fill(&self, event: TradeExecutedEvent) -> Result<()> {
        self.tx
            .send(CapitalCommand::Fill { event })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))
    }

    pub async fn mark_failed(&self, correlation_id: Uuid, reason: &str) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::MarkFailed {
                correlation_id,
                reason: reason.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))?
    }

    pub async fn adjust_position_size(
        &self,
        position_id: Uuid,
        observed_size: Decimal,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::AdjustPositionSize {
                position_id,
                observed_size,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))?
    }

    pub async fn close_from_fills(
        &self,
        correlation_id: Uuid,
        fills: Vec<FillRecord>,
    ) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::CloseFromFills {
                correlation_id,
                fills,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))?
    }

    pub async fn record_reconciled_trade(&self, trade: Trade) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::RecordReconciledTrade {
                trade,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))?
    }

    pub async fn snapshot(&self) -> Result<PortfolioSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CapitalCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| anyhow!("capital manager stopped"))?;
        rx.await.map_err(|_| anyhow!("capital manager dropped request"))
    }
}

/// Rolls the daily loss budget at UTC midnight. A trade straddling midnight
/// accounts against the day its position opened.
struct DailyWindow {
    date: NaiveDate,
    realized_loss: Decimal,
}

impl DailyWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            date: now.date_naive(),
            realized_loss: Decimal::ZERO,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.date {
            self.date = today;
            self.realized_loss = Decimal::ZERO;
        }
    }

    fn book(&mut self, opened_at: DateTime<Utc>, pnl: Decimal, now: DateTime<Utc>) {
        self.roll(now);
        if pnl < Decimal::ZERO && opened_at.date_naive() == self.date {
            self.realized_loss += -pnl;
        }
    }
}

/// The single authority on whether a proposal becomes a trade. One instance
/// per portfolio; its command channel is the portfolio's serialization
/// domain, so validations, reservations and reconciliation writes are
/// linearizable.
pub struct CapitalManager {
    portfolio: Portfolio,
    rules: RuleSet,
    trading: TradingOptions,
    trades: Arc<dyn TradeRepository>,
    positions: Arc<dyn PositionRepository>,
    portfolios: Arc<dyn PortfolioRepository>,
    strategies: Arc<dyn StrategyRepository>,
    metrics: Metrics,
    gate: ReconcileGate,
    reservations: HashMap<Uuid, Reservation>,
    fingerprints: HashMap<String, Uuid>,
    daily: DailyWindow,
    rx: mpsc::Receiver<CapitalCommand>,
}

impl CapitalManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portfolio: Portfolio,
        rules: RuleSet,
        trading: TradingOptions,
        trades: Arc<dyn TradeRepository>,
        positions: Arc<dyn PositionRepository>,
        portfolios: Arc<dyn PortfolioRepository>,
        strategies: Arc<dyn StrategyRepository>,
        metrics: Metrics,
        gate: ReconcileGate,
    ) -> (Self, CapitalHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = CapitalHandle {
            portfolio_id: portfolio.id,
            tx,
        };
        let manager = Self {
            portfolio,
            rules,
            trading,
            trades,
            positions,
            portfolios,
            strategies,
            metrics,
            gate,
            reservations: HashMap::new(),
            fingerprints: HashMap::new(),
            daily: DailyWindow::new(Utc::now()),
            rx,
        };
        (manager, handle)
    }

    /// Rebuild reservation bookkeeping from non-terminal trades after a
    /// restart. The persisted available_capital already reflects the holds;
    /// this only restores the in-memory index.
    pub async fn recover(&mut self) -> Result<()> {
        let open = self
            .trades
            .find_by_status(&[TradeStatus::Pending, TradeStatus::Open])
            .await?;
        for trade in open {
            let Some(strategy) = self.strategies.get(&trade.strategy_id).await? else {
                continue;
            };
            if strategy.portfolio_id != self.portfolio.id {
                continue;
            }
            let reserved = trade.cost * (Decimal::ONE + self.trading.fee_buffer);
            self.reservations.insert(
                trade.correlation_id,
                Reservation {
                    strategy_id: trade.strategy_id.clone(),
                    symbol: trade.symbol.clone(),
                    reserved,
                    notional: trade.cost,
                    risk_amount: Decimal::ZERO,
                    fingerprint: trade.fingerprint.clone(),
                    stop_loss: None,
                    take_profit: None,
                    filled_so_far: Decimal::ZERO,
                    filled_notional: Decimal::ZERO,
                    is_exit: false,
                },
            );
            if let Some(fp) = &trade.fingerprint {
                self.fingerprints.insert(fp.clone(), trade.correlation_id);
            }
        }
        if !self.reservations.is_empty() {
            info!(
                "CapitalManager [{}]: recovered {} open reservation(s)",
                self.portfolio.name,
                self.reservations.len()
            );
        }
        Ok(())
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "CapitalManager [{}]: running (total {}, available {})",
            self.portfolio.name, self.portfolio.total_capital, self.portfolio.available_capital
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("CapitalManager [{}]: shutting down", self.portfolio.name);
                        break;
                    }
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: CapitalCommand) {
        match cmd {
            CapitalCommand::Allocate {
                request,
                correlation_id,
                deadline,
                respond_to,
            } => {
                let outcome = self.handle_allocate(request, correlation_id, deadline).await;
                let _ = respond_to.send(outcome);
            }
            CapitalCommand::Fill { event } => {
                if let Err(e) = self.handle_fill(event).await {
                    error!("CapitalManager [{}]: fill handling failed: {}", self.portfolio.name, e);
                }
            }
            CapitalCommand::MarkFailed {
                correlation_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_mark_failed(correlation_id, &reason).await;
                let _ = respond_to.send(result);
            }
            CapitalCommand::AdjustPositionSize {
                position_id,
                observed_size,
                respond_to,
            } => {
                let result = self.handle_adjust_position(position_id, observed_size).await;
                let _ = respond_to.send(result);
            }
            CapitalCommand::CloseFromFills {
                correlation_id,
                fills,
                respond_to,
            } => {
                let result = self.handle_close_from_fills(correlation_id, fills).await;
                let _ = respond_to.send(result);
            }
            CapitalCommand::RecordReconciledTrade { trade, respond_to } => {
                let result = self.trades.save(&trade).await;
                let _ = respond_to.send(result);
            }
            CapitalCommand::Snapshot { respond_to } => {
                let reserved_total = self.reservations.values().map(|r| r.reserved).sum();
                let _ = respond_to.send(PortfolioSnapshot {
                    portfolio: self.portfolio.clone(),
                    reserved_total,
                    open_reservations: self.reservations.len(),
                    realized_loss_today: self.daily.realized_loss,
                });
            }
        }
    }

    fn denial_outcome(&self, denial: Denial) -> AllocationOutcome {
        self.metrics.proposals_denied.inc();
        let risk_level = match denial.code {
            DenialCode::RiskLimitExceeded | DenialCode::InsufficientCapital => RiskLevel::High,
            _ => RiskLevel::Low,
        };
        AllocationOutcome {
            response: AllocationResponse {
                result: AllocationVerdict::Denied,
                approved_quantity: None,
                risk_level,
                reasons: vec![denial.code.to_string(), denial.detail],
                suggested_stop_loss: None,
                suggested_take_profit: None,
                portfolio_impact: None,
            },
            command: None,
        }
    }

    async fn handle_allocate(
        &mut self,
        request: AllocationRequest,
        correlation_id: Uuid,
        deadline: Option<DateTime<Utc>>,
    ) -> AllocationOutcome {
        let now = Utc::now();
        self.daily.roll(now);

        if let Some(deadline) = deadline
            && now > deadline
        {
            return self.denial_outcome(Denial::new(
                DenialCode::DeadlineExceeded,
                format!("request deadline {} already passed", deadline),
            ));
        }

        // Idempotency under retries: one non-terminal trade per fingerprint.
        if self.fingerprints.contains_key(&request.fingerprint) {
            return self.denial_outcome(Denial::new(
                DenialCode::DuplicateProposal,
                format!("fingerprint {} already in flight", request.fingerprint),
            ));
        }
        match self.trades.find_open_by_fingerprint(&request.fingerprint).await {
            Ok(Some(existing)) => {
                return self.denial_outcome(Denial::new(
                    DenialCode::DuplicateProposal,
                    format!(
                        "fingerprint {} already has trade {}",
                        request.fingerprint, existing.id
                    ),
                ));
            }
            Ok(None) => {}
            Err(e) => {
                return self.denial_outcome(Denial::new(
                    DenialCode::InternalError,
                    format!("fingerprint lookup failed: {}", e),
                ));
            }
        }

        let strategy = match self.strategies.get(&request.strategy_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                return self.denial_outcome(Denial::new(
                    DenialCode::StrategyInactive,
                    format!("unknown strategy {}", request.strategy_id),
                ));
            }
            Err(e) => {
                return self.denial_outcome(Denial::new(
                    DenialCode::InternalError,
                    format!("strategy lookup failed: {}", e),
                ));
            }
        };
        if strategy.portfolio_id != self.portfolio.id {
            return self.denial_outcome(Denial::new(
                DenialCode::InternalError,
                format!(
                    "strategy {} belongs to another portfolio",
                    request.strategy_id
                ),
            ));
        }

        let open_positions = match self.portfolio_positions().await {
            Ok(p) => p,
            Err(e) => {
                return self.denial_outcome(Denial::new(
                    DenialCode::InternalError,
                    format!("position lookup failed: {}", e),
                ));
            }
        };
        let pending_notional: Decimal = self
            .reservations
            .values()
            .map(|r| r.notional - r.filled_notional)
            .sum();
        let positions_on_symbol = open_positions
            .iter()
            .filter(|p| p.symbol == request.symbol)
            .count() as u32
            + self
                .reservations
                .values()
                .filter(|r| r.symbol == request.symbol && !r.is_exit)
                .count() as u32;

        // In-flight risk counts against today's loss budget alongside what is
        // already booked.
        let pending_risk: Decimal = self.reservations.values().map(|r| r.risk_amount).sum();
        let ctx = ValidationContext {
            request: &request,
            strategy: &strategy,
            portfolio: &self.portfolio,
            rules: &self.rules,
            open_positions: &open_positions,
            pending_notional,
            positions_on_symbol,
            realized_loss_today: self.daily.realized_loss + pending_risk,
            symbol_held_for_reconciliation: self.gate.is_held(&request.symbol),
            now,
            freshness_limit_ms: self.trading.proposal_freshness_ms,
        };

        if let Err(denial) = validate_pre_size(&ctx) {
            return self.denial_outcome(denial);
        }

        // A proposal opposing this strategy's open position is an exit: it is
        // sized to the position and skips the entry-risk checks, which only
        // guard new exposure.
        let reducing = open_positions.iter().find(|p| {
            p.strategy_id == request.strategy_id
                && p.symbol == request.symbol
                && matches!(
                    (p.side, request.proposal.side),
                    (PositionSide::Long, OrderSide::Sell) | (PositionSide::Short, OrderSide::Buy)
                )
        });

        let (sized, is_exit) = if let Some(position) = reducing {
            let mut amount = position.size;
            if strategy.sizing.lot_step > Decimal::ZERO {
                amount = (amount / strategy.sizing.lot_step).floor() * strategy.sizing.lot_step;
            }
            (
                SizedOrder {
                    amount,
                    notional: amount * request.proposal.signal_price,
                    stop_loss: request
                        .proposal
                        .stop_loss_price
                        .unwrap_or(request.proposal.signal_price),
                    risk_amount: Decimal::ZERO,
                },
                true,
            )
        } else {
            let mut inputs = SizingInputs::new(self.portfolio.total_capital, &strategy.sizing);
            if inputs.risk_percent <= Decimal::ZERO {
                inputs.risk_percent = self.trading.default_risk_percent;
            }
            inputs.default_stop_percent = self.trading.stop_loss_percent;
            inputs.min_position_usd = self.rules.min_position_size_usd;
            inputs.max_position_usd = self.rules.max_position_size_usd;

            let sized = match size_fixed_fractional(&request.proposal, &inputs) {
                Ok(s) => s,
                Err(denial) => return self.denial_outcome(denial),
            };
            if let Err(denial) = validate_post_size(&ctx, &sized) {
                return self.denial_outcome(denial);
            }
            (sized, false)
        };

        // Reservation: exact-available is allowed, one satoshi more is not.
        let reserve_amount = sized.notional * (Decimal::ONE + self.trading.fee_buffer);
        if reserve_amount > self.portfolio.available_capital {
            return self.denial_outcome(Denial::new(
                DenialCode::InsufficientCapital,
                format!(
                    "need {} (incl. fee buffer), available {}",
                    reserve_amount, self.portfolio.available_capital
                ),
            ));
        }

        match self
            .commit_approval(&request, &strategy, &sized, reserve_amount, correlation_id, is_exit)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                error!(
                    "CapitalManager [{}]: approval commit failed: {}",
                    self.portfolio.name, e
                );
                return self.denial_outcome(Denial::new(
                    DenialCode::InternalError,
                    "approval could not be committed".to_string(),
                ));
            }
        }

        let size_pct = sized.notional / self.portfolio.total_capital * dec!(100);
        let open_notional: Decimal = open_positions.iter().map(|p| p.notional()).sum();
        let exposure_pct = (open_notional + pending_notional + sized.notional)
            / self.portfolio.total_capital
            * dec!(100);
        let risk_level = if size_pct < dec!(3) {
            RiskLevel::Low
        } else if size_pct < dec!(7) {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        };

        self.metrics.proposals_approved.inc();
        info!(
            "CapitalManager [{}]: approved {} {} {} @ {} (qty {}, corr {})",
            self.portfolio.name,
            request.strategy_id,
            request.proposal.side,
            request.symbol,
            request.proposal.signal_price,
            sized.amount,
            correlation_id
        );

        AllocationOutcome {
            response: AllocationResponse {
                result: AllocationVerdict::Approved,
                approved_quantity: Some(sized.amount),
                risk_level,
                reasons: Vec::new(),
                suggested_stop_loss: Some(sized.stop_loss),
                suggested_take_profit: request.proposal.take_profit_price,
                portfolio_impact: Some(PortfolioImpact {
                    position_size_percent: size_pct,
                    new_portfolio_risk_percent: exposure_pct,
                    available_capital_after: self.portfolio.available_capital,
                }),
            },
            command: Some(TradeCommand {
                strategy_id: request.strategy_id.clone(),
                exchange: request.exchange.clone(),
                symbol: request.symbol.clone(),
                side: request.proposal.side,
                order_type: OrderType::Limit,
                amount: sized.amount,
                price: Some(request.proposal.signal_price),
                stop_loss: Some(sized.stop_loss),
                take_profit: request.proposal.take_profit_price,
                client_order_id: correlation_id,
            }),
        }
    }

    /// Persist the trade, hold the capital and index the reservation. Either
    /// everything lands or a compensating release undoes the partial state.
    async fn commit_approval(
        &mut self,
        request: &AllocationRequest,
        strategy: &StrategyDef,
        sized: &SizedOrder,
        reserve_amount: Decimal,
        correlation_id: Uuid,
        is_exit: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let trade = Trade {
            id: Uuid::new_v4(),
            strategy_id: strategy.id.clone(),
            exchange: request.exchange.clone(),
            symbol: request.symbol.clone(),
            side: request.proposal.side,
            order_type: OrderType::Limit,
            amount: sized.amount,
            price: Some(request.proposal.signal_price),
            cost: sized.notional,
            fee: Decimal::ZERO,
            status: TradeStatus::Pending,
            exchange_order_id: None,
            correlation_id,
            fingerprint: Some(request.fingerprint.clone()),
            reconciled: false,
            created_at: now,
            updated_at: now,
        };
        self.trades.save(&trade).await?;

        self.portfolio.reserve(reserve_amount)?;
        if let Err(e) = self.portfolios.update_capital(&self.portfolio).await {
            // Compensate: undo the in-memory hold and poison the trade row.
            self.portfolio.release(reserve_amount);
            let mut failed = trade.clone();
            if failed.transition(TradeStatus::Failed).is_ok() {
                let _ = self.trades.update(&failed).await;
            }
            return Err(e);
        }

        self.reservations.insert(
            correlation_id,
            Reservation {
                strategy_id: strategy.id.clone(),
                symbol: request.symbol.clone(),
                reserved: reserve_amount,
                notional: sized.notional,
                risk_amount: sized.risk_amount,
                fingerprint: Some(request.fingerprint.clone()),
                stop_loss: Some(sized.stop_loss),
                take_profit: request.proposal.take_profit_price,
                filled_so_far: Decimal::ZERO,
                filled_notional: Decimal::ZERO,
                is_exit,
            },
        );
        self.fingerprints
            .insert(request.fingerprint.clone(), correlation_id);
        Ok(())
    }

    async fn portfolio_positions(&self) -> Result<Vec<Position>> {
        let mut owned = Vec::new();
        for def in self.strategies.list_active().await? {
            if def.portfolio_id != self.portfolio.id {
                continue;
            }
            owned.extend(self.positions.find_open_by_strategy(&def.id).await?);
        }
        Ok(owned)
    }

    async fn handle_fill(&mut self, event: TradeExecutedEvent) -> Result<()> {
        let trade = event.trade;
        let fill = event.fill;
        let now = Utc::now();
        self.daily.roll(now);

        // Fills for other portfolios' strategies are not ours to apply.
        let Some(strategy) = self.strategies.get(&trade.strategy_id).await? else {
            return Ok(());
        };
        if strategy.portfolio_id != self.portfolio.id {
            return Ok(());
        }

        let Some(mut reservation) = self.reservations.get(&trade.correlation_id).cloned() else {
            // Replayed terminal event or a trade from before a restart that
            // already settled. With nothing reserved there is nothing to do.
            debug!(
                "CapitalManager [{}]: no reservation for fill {} (replay?)",
                self.portfolio.name, trade.correlation_id
            );
            return Ok(());
        };

        // Apply the unfilled delta; replays deliver the same cumulative
        // amount and produce a zero delta.
        let delta = fill.filled_amount - reservation.filled_so_far;
        if delta > Decimal::ZERO
            && let Some(price) = fill.avg_fill_price
        {
            self.apply_fill_delta(&trade, &mut reservation, delta, price, fill.fee, now)
                .await?;
        }

        if trade.status.is_terminal() {
            let refund = match trade.status {
                TradeStatus::Closed => {
                    if reservation.is_exit {
                        // Exit holds are never spent; the basis and P&L were
                        // returned per fill slice.
                        reservation.reserved
                    } else {
                        (reservation.reserved - reservation.filled_notional).max(Decimal::ZERO)
                    }
                }
                // Canceled/failed: give back everything not consumed by fills.
                _ => (reservation.reserved - reservation.filled_notional).max(Decimal::ZERO),
            };
            if refund > Decimal::ZERO {
                self.portfolio.release(refund);
            }
            if let Some(fp) = &reservation.fingerprint {
                self.fingerprints.remove(fp);
            }
            self.reservations.remove(&trade.correlation_id);
            info!(
                "CapitalManager [{}]: trade {} {} settled, released {} (available {})",
                self.portfolio.name,
                trade.correlation_id,
                trade.status,
                refund,
                self.portfolio.available_capital
            );
        } else {
            self.reservations.insert(trade.correlation_id, reservation);
        }

        self.portfolios.update_capital(&self.portfolio).await?;
        Ok(())
    }

    /// Apply one fill slice to the position book and the capital figures.
    async fn apply_fill_delta(
        &mut self,
        trade: &Trade,
        reservation: &mut Reservation,
        delta: Decimal,
        price: Decimal,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let open = self.positions.find_open_by_strategy(&trade.strategy_id).await?;
        let existing = open.into_iter().find(|p| p.symbol == trade.symbol);

        let reduces = existing.as_ref().is_some_and(|p| {
            matches!(
                (p.side, trade.side),
                (PositionSide::Long, OrderSide::Sell) | (PositionSide::Short, OrderSide::Buy)
            )
        });

        if reduces {
            let mut position = existing.expect("reduces implies a position");
            reservation.is_exit = true;
            let basis = position.average_entry * delta.min(position.size);
            let pnl = position.reduce(delta, price, fee, now);
            self.positions.update(&position).await?;

            // Return the cost basis of the closed slice and book the result.
            self.portfolio.apply_realized(pnl - fee);
            self.portfolio.release(basis);
            self.daily.book(position.opened_at, pnl, now);
            info!(
                "CapitalManager [{}]: reduced {} by {} @ {} (pnl {})",
                self.portfolio.name, trade.symbol, delta, price, pnl
            );
        } else {
            match existing {
                Some(mut position) => {
                    position.add_fill(delta, price, fee);
                    self.positions.update(&position).await?;
                }
                None => {
                    let mut position = Position::open_from_fill(
                        &trade.strategy_id,
                        &trade.symbol,
                        PositionSide::from_entry(trade.side),
                        delta,
                        price,
                        fee,
                        now,
                    );
                    position.stop_loss = reservation.stop_loss;
                    position.take_profit = reservation.take_profit;
                    self.positions.save(&position).await?;
                }
            }
            // Fees are expensed as they occur; the held notional stays out of
            // the available pool until the position closes.
            if fee > Decimal::ZERO {
                self.portfolio.apply_realized(-fee);
            }
        }

        reservation.filled_so_far += delta;
        reservation.filled_notional += delta * price;
        Ok(())
    }

    async fn handle_mark_failed(&mut self, correlation_id: Uuid, reason: &str) -> Result<bool> {
        let Some(mut trade) = self.trades.find_by_correlation(correlation_id).await? else {
            return Ok(false);
        };
        if trade.status.is_terminal() {
            return Ok(false);
        }
        let target = match trade.status {
            TradeStatus::Pending => TradeStatus::Failed,
            _ => TradeStatus::Canceled,
        };
        trade.transition(target)?;
        self.trades.update(&trade).await?;

        if let Some(reservation) = self.reservations.remove(&correlation_id) {
            let refund =
                (reservation.reserved - reservation.filled_notional).max(Decimal::ZERO);
            self.portfolio.release(refund);
            if let Some(fp) = &reservation.fingerprint {
                self.fingerprints.remove(fp);
            }
            self.portfolios.update_capital(&self.portfolio).await?;
        }
        warn!(
            "CapitalManager [{}]: trade {} marked {} ({})",
            self.portfolio.name, correlation_id, target, reason
        );
        Ok(true)
    }

    async fn handle_adjust_position(
        &mut self,
        position_id: Uuid,
        observed_size: Decimal,
    ) -> Result<()> {
        let Some(mut position) = self.positions.get(position_id).await? else {
            return Err(anyhow!("position {} not found", position_id));
        };
        let previous = position.size;
        position.size = observed_size;
        if observed_size <= Decimal::ZERO {
            position.open = false;
            position.closed_at = Some(Utc::now());
            position.unrealized_pnl = Decimal::ZERO;
        }
        self.positions.update(&position).await?;
        warn!(
            "CapitalManager [{}]: position {} size {} -> {} (exchange authoritative)",
            self.portfolio.name, position_id, previous, observed_size
        );
        Ok(())
    }

    async fn handle_close_from_fills(
        &mut self,
        correlation_id: Uuid,
        fills: Vec<FillRecord>,
    ) -> Result<bool> {
        let Some(mut trade) = self.trades.find_by_correlation(correlation_id).await? else {
            return Ok(false);
        };
        if trade.status.is_terminal() || fills.is_empty() {
            return Ok(false);
        }

        let filled: Decimal = fills.iter().map(|f| f.amount).sum();
        let fees: Decimal = fills.iter().map(|f| f.fee).sum();
        let notional: Decimal = fills.iter().map(|f| f.amount * f.price).sum();
        let avg_price = if filled > Decimal::ZERO {
            notional / filled
        } else {
            return Ok(false);
        };

        let mut reservation = self
            .reservations
            .remove(&correlation_id)
            .unwrap_or(Reservation {
                strategy_id: trade.strategy_id.clone(),
                symbol: trade.symbol.clone(),
                reserved: trade.cost * (Decimal::ONE + self.trading.fee_buffer),
                notional: trade.cost,
                risk_amount: Decimal::ZERO,
                fingerprint: trade.fingerprint.clone(),
                stop_loss: None,
                take_profit: None,
                filled_so_far: Decimal::ZERO,
                filled_notional: Decimal::ZERO,
                is_exit: false,
            });

        let now = Utc::now();
        let delta = (filled - reservation.filled_so_far).max(Decimal::ZERO);
        if delta > Decimal::ZERO {
            self.apply_fill_delta(&trade, &mut reservation, delta, avg_price, fees, now)
                .await?;
        }

        if trade.status == TradeStatus::Pending {
            trade.transition(TradeStatus::Open)?;
        }
        trade.transition(TradeStatus::Closed)?;
        trade.fee += fees;
        trade.price = Some(avg_price);
        self.trades.update(&trade).await?;

        let refund = if reservation.is_exit {
            reservation.reserved
        } else {
            (reservation.reserved - reservation.filled_notional).max(Decimal::ZERO)
        };
        if refund > Decimal::ZERO {
            self.portfolio.release(refund);
        }
        if let Some(fp) = &reservation.fingerprint {
            self.fingerprints.remove(fp);
        }
        self.portfolios.update_capital(&self.portfolio).await?;

        info!(
            "CapitalManager [{}]: backfilled {} fills for {} (avg {}, status drift repaired)",
            self.portfolio.name,
            fills.len(),
            correlation_id,
            avg_price
        );
        Ok(true)
    }
}

/// Wire one portfolio's manager to the fabric: an allocation-request consumer
/// (exact key per owned strategy) and a trade-executed consumer feeding the
/// fill path. The actor stays the single writer; these handlers only ferry
/// messages.
pub async fn attach_bus(
    bus: &Arc<BusClient>,
    handle: CapitalHandle,
    strategy_ids: &[String],
    prefetch: usize,
) -> Vec<SubscriptionHandle> {
    let mut spec = Subscription::new(&format!("capital.{}.requests", handle.portfolio_id))
        .prefetch(prefetch);
    for id in strategy_ids {
        spec = spec.bind(BusExchange::Requests, &keys::allocation_request(id));
    }

    let request_bus = Arc::clone(bus);
    let request_handle = handle.clone();
    let requests = bus
        .subscribe(
            spec,
            handler(move |delivery| {
                let bus = Arc::clone(&request_bus);
                let handle = request_handle.clone();
                async move {
                    let request: AllocationRequest = delivery
                        .envelope
                        .parse_payload()
                        .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;
                    let correlation_id = delivery
                        .envelope
                        .correlation_id
                        .unwrap_or_else(Uuid::new_v4);

                    let outcome = handle
                        .allocate(request, correlation_id, delivery.envelope.deadline)
                        .await
                        .map_err(|e| HandlerError::Retry(e.to_string()))?;

                    let payload = serde_json::to_value(&outcome.response)
                        .map_err(|e| HandlerError::Fatal(format!("encode response: {}", e)))?;
                    bus.respond(&delivery, payload)
                        .await
                        .map_err(|e| HandlerError::Retry(e.to_string()))?;

                    if let Some(command) = outcome.command {
                        let payload = serde_json::to_value(&command)
                            .map_err(|e| HandlerError::Fatal(format!("encode command: {}", e)))?;
                        let envelope = bus.envelope(Some(correlation_id), payload);
                        // Buffered publish: during an outage the command waits
                        // in the client buffer and the client_order_id keeps
                        // the eventual delivery idempotent.
                        bus.publish(BusExchange::Commands, keys::EXECUTE_TRADE, envelope)
                            .await
                            .map_err(|e| HandlerError::Retry(e.to_string()))?;
                    }
                    Ok(())
                }
            }),
        )
        .await;

    let fill_handle = handle.clone();
    let fills = bus
        .subscribe(
            Subscription::new(&format!("capital.{}.fills", handle.portfolio_id))
                .bind(BusExchange::Events, keys::TRADE_EXECUTED)
                .prefetch(prefetch),
            handler(move |delivery| {
                let handle = fill_handle.clone();
                async move {
                    let event: TradeExecutedEvent = delivery
                        .envelope
                        .parse_payload()
                        .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;
                    handle
                        .fill(event)
                        .await
                        .map_err(|e| HandlerError::Retry(e.to_string()))
                }
            }),
        )
        .await;

    vec![requests, fills]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{SizingParams, StrategyKind};
    use crate::domain::types::{OrderState, OrderUpdate, Proposal};
    use crate::infrastructure::persistence::{
        Database, SqlitePortfolioRepository, SqlitePositionRepository, SqliteStrategyRepository,
        SqliteTradeRepository,
    };
    use serde_json::json;

    struct Harness {
        handle: CapitalHandle,
        trades: Arc<dyn TradeRepository>,
        positions: Arc<dyn PositionRepository>,
        gate: ReconcileGate,
        _shutdown: watch::Sender<bool>,
    }

    fn trading_options() -> TradingOptions {
        TradingOptions {
            max_position_size_percent: dec!(10),
            max_daily_loss_percent: dec!(5),
            max_portfolio_exposure_percent: dec!(50),
            stop_loss_percent: dec!(2),
            default_risk_percent: dec!(0.02),
            min_position_size_usd: Decimal::ZERO,
            max_position_size_usd: dec!(100000),
            max_positions_per_symbol: 1,
            min_available_capital: Decimal::ZERO,
            fee_buffer: Decimal::ZERO,
            proposal_freshness_ms: 2_000,
            initial_capital: dec!(10000),
        }
    }

    async fn harness(risk_percent: Decimal) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let portfolios: Arc<dyn PortfolioRepository> =
            Arc::new(SqlitePortfolioRepository::new(db.pool.clone()));
        let strategies: Arc<dyn StrategyRepository> =
            Arc::new(SqliteStrategyRepository::new(db.pool.clone()));
        let trades: Arc<dyn TradeRepository> =
            Arc::new(SqliteTradeRepository::new(db.pool.clone()));
        let positions: Arc<dyn PositionRepository> =
            Arc::new(SqlitePositionRepository::new(db.pool.clone()));

        let portfolio = Portfolio::new("main", "USDT", dec!(10000));
        portfolios.save(&portfolio).await.unwrap();

        let def = StrategyDef {
            id: "s1".to_string(),
            kind: StrategyKind::MaCrossover,
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            params: json!({}),
            sizing: SizingParams {
                risk_percent,
                lot_step: dec!(0.0001),
                min_amount: dec!(0.0001),
            },
            active: true,
            portfolio_id: portfolio.id,
        };
        strategies.save(&def).await.unwrap();

        let trading = trading_options();
        let rules = RuleSet::from_config(&trading);
        let gate = ReconcileGate::new();
        let (manager, handle) = CapitalManager::new(
            portfolio,
            rules,
            trading,
            Arc::clone(&trades),
            Arc::clone(&positions),
            portfolios,
            strategies,
            Metrics::new().unwrap(),
            gate.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(manager.run(shutdown_rx));

        Harness {
            handle,
            trades,
            positions,
            gate,
            _shutdown: shutdown_tx,
        }
    }

    fn request(fingerprint: &str, price: Decimal, stop: Decimal) -> AllocationRequest {
        AllocationRequest {
            strategy_id: "s1".to_string(),
            exchange: "mock".to_string(),
            symbol: "BTC/USDT".to_string(),
            fingerprint: fingerprint.to_string(),
            proposal: Proposal {
                side: OrderSide::Buy,
                signal_price: price,
                stop_loss_price: Some(stop),
                take_profit_price: None,
                intent_tag: "test".to_string(),
                strategy_params: json!({}),
                bar_close_ts: Utc::now(),
            },
            requested_at: Utc::now(),
        }
    }

    fn fill_event(trade: Trade, amount: Decimal, price: Decimal, state: OrderState) -> TradeExecutedEvent {
        let fill = OrderUpdate {
            client_order_id: trade.correlation_id,
            exchange_order_id: "mock-1".to_string(),
            symbol: trade.symbol.clone(),
            state,
            filled_amount: amount,
            avg_fill_price: Some(price),
            fee: Decimal::ZERO,
            ts: Utc::now(),
        };
        TradeExecutedEvent { trade, fill }
    }

    #[tokio::test]
    async fn oversized_risk_is_denied_not_resized() {
        // 10_000 * 0.02 / 1_000 = 0.2 BTC, notional 10_000 = 100% of capital.
        let h = harness(dec!(0.02)).await;
        let outcome = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(outcome.response.result, AllocationVerdict::Denied);
        assert!(outcome
            .response
            .reasons
            .contains(&"risk_limit_exceeded".to_string()));
        assert!(outcome.command.is_none());
    }

    #[tokio::test]
    async fn small_risk_is_approved_and_reserved() {
        // 10_000 * 0.001 / 1_000 = 0.01 BTC, notional 500 = 5%.
        let h = harness(dec!(0.001)).await;
        let corr = Uuid::new_v4();
        let outcome = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), corr, None)
            .await
            .unwrap();
        assert_eq!(outcome.response.result, AllocationVerdict::Approved);
        assert_eq!(outcome.response.approved_quantity, Some(dec!(0.01)));

        let command = outcome.command.expect("approval carries a command");
        assert_eq!(command.client_order_id, corr);
        assert_eq!(command.amount, dec!(0.01));

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.portfolio.available_capital, dec!(9500));
        assert_eq!(snapshot.open_reservations, 1);

        let trade = h.trades.find_by_correlation(corr).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.fingerprint.as_deref(), Some("fp1"));
    }

    #[tokio::test]
    async fn held_symbol_is_denied_until_the_gate_lifts() {
        let h = harness(dec!(0.001)).await;
        h.gate.hold(vec!["BTC/USDT".to_string()]);

        let denied = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(denied.response.result, AllocationVerdict::Denied);
        assert!(denied
            .response
            .reasons
            .contains(&"pending_reconciliation".to_string()));
        assert!(denied.command.is_none());

        // The completed sweep lifts the gate and the same intent may trade.
        h.gate.clear();
        let approved = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(approved.response.result, AllocationVerdict::Approved);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_denied() {
        let h = harness(dec!(0.001)).await;
        let first = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(first.response.result, AllocationVerdict::Approved);

        let second = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(second.response.result, AllocationVerdict::Denied);
        assert!(second
            .response
            .reasons
            .contains(&"duplicate_proposal".to_string()));
        assert!(second.command.is_none());
    }

    #[tokio::test]
    async fn full_fill_opens_position_and_keeps_basis_held() {
        let h = harness(dec!(0.001)).await;
        let corr = Uuid::new_v4();
        h.handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), corr, None)
            .await
            .unwrap();

        let mut trade = h.trades.find_by_correlation(corr).await.unwrap().unwrap();
        trade.transition(TradeStatus::Open).unwrap();
        trade.transition(TradeStatus::Closed).unwrap();
        h.trades.update(&trade).await.unwrap();

        h.handle
            .fill(fill_event(trade, dec!(0.01), dec!(50000), OrderState::Filled))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let positions = h.positions.find_open_by_strategy("s1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(0.01));
        assert_eq!(positions[0].average_entry, dec!(50000));

        // Basis stays held; no buffer was configured so nothing refunds.
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.portfolio.available_capital, dec!(9500));
        assert_eq!(snapshot.open_reservations, 0);
    }

    #[tokio::test]
    async fn mark_failed_releases_the_full_reservation() {
        let h = harness(dec!(0.001)).await;
        let corr = Uuid::new_v4();
        h.handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), corr, None)
            .await
            .unwrap();
        assert_eq!(
            h.handle.snapshot().await.unwrap().portfolio.available_capital,
            dec!(9500)
        );

        let changed = h.handle.mark_failed(corr, "orphaned").await.unwrap();
        assert!(changed);

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.portfolio.available_capital, dec!(10000));
        assert_eq!(snapshot.open_reservations, 0);

        let trade = h.trades.find_by_correlation(corr).await.unwrap().unwrap();
        assert_eq!(trade.status, TradeStatus::Failed);

        // Second call is a no-op: terminal trades stay terminal.
        assert!(!h.handle.mark_failed(corr, "again").await.unwrap());

        // The fingerprint frees up for a fresh proposal.
        let retry = h
            .handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert_eq!(retry.response.result, AllocationVerdict::Approved);
    }

    #[tokio::test]
    async fn exit_fill_realizes_pnl_and_returns_capital() {
        let h = harness(dec!(0.001)).await;

        // Open 0.01 @ 50_000.
        let corr = Uuid::new_v4();
        h.handle
            .allocate(request("fp1", dec!(50000), dec!(49000)), corr, None)
            .await
            .unwrap();
        let mut trade = h.trades.find_by_correlation(corr).await.unwrap().unwrap();
        trade.transition(TradeStatus::Open).unwrap();
        trade.transition(TradeStatus::Closed).unwrap();
        h.trades.update(&trade).await.unwrap();
        h.handle
            .fill(fill_event(trade, dec!(0.01), dec!(50000), OrderState::Filled))
            .await
            .unwrap();

        // Sell the same size @ 52_000: pnl = 20.
        let corr2 = Uuid::new_v4();
        let mut sell = request("fp2", dec!(52000), dec!(53040));
        sell.proposal.side = OrderSide::Sell;
        let outcome = h.handle.allocate(sell, corr2, None).await.unwrap();
        assert_eq!(outcome.response.result, AllocationVerdict::Approved);

        let mut exit_trade = h.trades.find_by_correlation(corr2).await.unwrap().unwrap();
        exit_trade.transition(TradeStatus::Open).unwrap();
        exit_trade.transition(TradeStatus::Closed).unwrap();
        h.trades.update(&exit_trade).await.unwrap();
        h.handle
            .fill(fill_event(exit_trade, dec!(0.01), dec!(52000), OrderState::Filled))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(h.positions.find_open_by_strategy("s1").await.unwrap().is_empty());

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.portfolio.total_capital, dec!(10020));
        assert_eq!(snapshot.portfolio.available_capital, dec!(10020));
        assert_eq!(snapshot.open_reservations, 0);
    }
}
