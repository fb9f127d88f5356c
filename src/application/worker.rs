use crate::bus::{
    handler, keys, BusClient, BusError, BusExchange, HandlerError, Subscription,
    SubscriptionHandle,
};
use crate::config::WorkerOptions;
use crate::domain::entities::{StrategyDef, StrategyState};
use crate::domain::events::{StrategyHaltedEvent, TradeExecutedEvent};
use crate::domain::fingerprint::Fingerprint;
use crate::domain::ports::Strategy;
use crate::domain::repositories::{PositionRepository, StrategyStateRepository};
use crate::domain::types::{
    AllocationRequest, AllocationResponse, AllocationVerdict, Candle, Frame, HistoryRequest,
    HistoryResponse, Proposal,
};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const INBOX_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The Capital Manager did not answer in time. The proposal is NOT
    /// silently retried; the strategy re-decides on the next bar.
    #[error("capital request for {strategy_id} timed out after {timeout_ms}ms")]
    CapitalRequestTimeout { strategy_id: String, timeout_ms: u64 },
}

enum WorkerMsg {
    Bar(Candle),
    Executed(TradeExecutedEvent),
}

/// Tracks the at-most-one-in-flight-per-fingerprint guarantee plus the
/// completed-within-TTL suppression window.
struct ProposalDeduper {
    ttl: ChronoDuration,
    in_flight: HashMap<String, DateTime<Utc>>,
    completed: HashMap<String, DateTime<Utc>>,
}

impl ProposalDeduper {
    fn new(ttl_ms: i64) -> Self {
        Self {
            ttl: ChronoDuration::milliseconds(ttl_ms),
            in_flight: HashMap::new(),
            completed: HashMap::new(),
        }
    }

    fn gc(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.completed.retain(|_, at| now - *at < ttl);
        self.in_flight.retain(|fp, at| {
            let keep = now - *at < ttl;
            if !keep {
                warn!("Worker: expiring stuck in-flight proposal {}", fp);
            }
            keep
        });
    }

    fn suppresses(&mut self, fp: &str, now: DateTime<Utc>) -> bool {
        self.gc(now);
        self.in_flight.contains_key(fp) || self.completed.contains_key(fp)
    }

    fn note_in_flight(&mut self, fp: &str, now: DateTime<Utc>) {
        self.in_flight.insert(fp.to_string(), now);
    }

    fn note_resolved(&mut self, fp: &str, now: DateTime<Utc>) {
        self.in_flight.remove(fp);
        self.completed.insert(fp.to_string(), now);
    }

    fn note_abandoned(&mut self, fp: &str) {
        self.in_flight.remove(fp);
    }
}

/// Hosts one strategy: rolling bar window, indicator recompute, proposal
/// emission with fingerprint dedupe, and checkpointing on fills.
pub struct StrategyWorker {
    def: StrategyDef,
    strategy: Box<dyn Strategy>,
    bus: Arc<BusClient>,
    states: Arc<dyn StrategyStateRepository>,
    positions: Arc<dyn PositionRepository>,
    cfg: WorkerOptions,
    request_timeout: Duration,
    market_prefetch: usize,
    frame: Frame,
    deduper: ProposalDeduper,
    last_processed: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl StrategyWorker {
    pub fn new(
        def: StrategyDef,
        strategy: Box<dyn Strategy>,
        bus: Arc<BusClient>,
        states: Arc<dyn StrategyStateRepository>,
        positions: Arc<dyn PositionRepository>,
        cfg: WorkerOptions,
        request_timeout: Duration,
        market_prefetch: usize,
    ) -> Self {
        let frame = Frame::with_capacity(cfg.frame_capacity);
        let deduper = ProposalDeduper::new(cfg.proposal_ttl_ms);
        Self {
            def,
            strategy,
            bus,
            states,
            positions,
            cfg,
            request_timeout,
            market_prefetch,
            frame,
            deduper,
            last_processed: None,
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.strategy.on_start(&self.def).await?;

        if let Some(state) = self.states.load(&self.def.id).await? {
            self.last_processed = state.last_processed_bar_ts;
            if let Some(fp) = state.last_fingerprint {
                self.deduper.note_resolved(&fp, Utc::now());
            }
        }

        // Replay history before accepting live bars; determinism of on_data
        // makes the replay side-effect free.
        self.backfill().await;

        let (tx, mut rx) = mpsc::channel::<WorkerMsg>(INBOX_DEPTH);
        let subscriptions = self.subscribe(&tx).await;

        info!(
            "Worker [{}]: running on {} ({} bars warm)",
            self.def.id,
            self.def.symbol,
            self.frame.len()
        );

        let mut halted = false;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Worker [{}]: shutting down", self.def.id);
                        break;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMsg::Bar(candle)) => {
                            if !self.handle_bar(candle).await {
                                halted = true;
                                break;
                            }
                        }
                        Some(WorkerMsg::Executed(event)) => {
                            self.handle_executed(event).await;
                        }
                        None => break,
                    }
                }
            }
        }

        for sub in &subscriptions {
            sub.abort();
        }
        self.strategy.on_stop().await?;

        if halted {
            self.announce_halt().await;
        }
        Ok(())
    }

    async fn subscribe(&self, tx: &mpsc::Sender<WorkerMsg>) -> Vec<SubscriptionHandle> {
        let mut bars = Subscription::new(&format!("worker.{}.bars", self.def.id))
            .prefetch(self.market_prefetch)
            .drop_oldest();
        for key in self.strategy.required_subscriptions() {
            bars = bars.bind(BusExchange::MarketData, &key);
        }
        let bar_tx = tx.clone();
        let bar_sub = self
            .bus
            .subscribe(
                bars,
                handler(move |delivery| {
                    let tx = bar_tx.clone();
                    async move {
                        let candle: Candle = delivery
                            .envelope
                            .parse_payload()
                            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;
                        tx.send(WorkerMsg::Bar(candle))
                            .await
                            .map_err(|_| HandlerError::Retry("worker inbox closed".to_string()))
                    }
                }),
            )
            .await;

        let strategy_id = self.def.id.clone();
        let fill_tx = tx.clone();
        let fill_sub = self
            .bus
            .subscribe(
                Subscription::new(&format!("worker.{}.fills", self.def.id))
                    .bind(BusExchange::Events, keys::TRADE_EXECUTED),
                handler(move |delivery| {
                    let tx = fill_tx.clone();
                    let strategy_id = strategy_id.clone();
                    async move {
                        let event: TradeExecutedEvent = delivery
                            .envelope
                            .parse_payload()
                            .map_err(|e| HandlerError::Fatal(format!("schema_violation: {}", e)))?;
                        if event.trade.strategy_id != strategy_id {
                            return Ok(());
                        }
                        tx.send(WorkerMsg::Executed(event))
                            .await
                            .map_err(|_| HandlerError::Retry("worker inbox closed".to_string()))
                    }
                }),
            )
            .await;

        vec![bar_sub, fill_sub]
    }

    async fn backfill(&mut self) {
        let request = HistoryRequest {
            symbol: self.def.symbol.clone(),
            timeframe: "1m".to_string(),
            limit: self.cfg.backfill_bars,
        };
        let payload = match serde_json::to_value(&request) {
            Ok(p) => p,
            Err(_) => return,
        };
        match self
            .bus
            .request(
                &keys::history_request(&self.def.id),
                "response.market_data.history",
                payload,
                Some(self.request_timeout),
            )
            .await
        {
            Ok(envelope) => match envelope.parse_payload::<HistoryResponse>() {
                Ok(history) => {
                    let count = history.bars.len();
                    for bar in history.bars {
                        let ts = bar.close_ts;
                        self.frame.push(bar);
                        if self.last_processed.is_none_or(|last| ts > last) {
                            self.last_processed = Some(ts);
                        }
                    }
                    info!("Worker [{}]: backfilled {} bars", self.def.id, count);
                }
                Err(e) => warn!("Worker [{}]: bad history response: {}", self.def.id, e),
            },
            Err(e) => {
                warn!(
                    "Worker [{}]: backfill unavailable ({}), starting cold",
                    self.def.id, e
                );
            }
        }
    }

    /// Process one bar. Returns false when the worker must halt.
    async fn handle_bar(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.last_processed
            && candle.close_ts <= last
        {
            debug!(
                "Worker [{}]: skipping already-processed bar {}",
                self.def.id, candle.close_ts
            );
            return true;
        }

        let bar_ts = candle.close_ts;
        self.frame.push(candle.clone());

        // Strategy code is untrusted at this boundary: a panic costs the tick,
        // not the worker, until the failure budget runs out.
        let decision = catch_unwind(AssertUnwindSafe(|| {
            let populated = self.strategy.populate_indicators(&self.frame);
            self.strategy.on_data(&candle, &populated)
        }));
        self.last_processed = Some(bar_ts);

        let proposal = match decision {
            Ok(p) => {
                self.consecutive_failures = 0;
                p
            }
            Err(_) => {
                self.consecutive_failures += 1;
                error!(
                    "Worker [{}]: strategy panicked on bar {} ({}/{})",
                    self.def.id, bar_ts, self.consecutive_failures, self.cfg.max_consecutive_failures
                );
                return self.consecutive_failures < self.cfg.max_consecutive_failures;
            }
        };

        if let Some(proposal) = proposal {
            self.submit_proposal(proposal).await;
        }
        true
    }

    async fn submit_proposal(&mut self, proposal: Proposal) {
        let now = Utc::now();
        let fp = Fingerprint::compute(
            &self.def.id,
            &self.def.symbol,
            &proposal.intent_tag,
            proposal.bar_close_ts,
        );

        if self.deduper.suppresses(fp.as_str(), now) {
            debug!(
                "Worker [{}]: suppressing duplicate proposal {}",
                self.def.id, fp
            );
            return;
        }
        self.deduper.note_in_flight(fp.as_str(), now);

        let request = AllocationRequest {
            strategy_id: self.def.id.clone(),
            exchange: self.def.exchange.clone(),
            symbol: self.def.symbol.clone(),
            fingerprint: fp.to_string(),
            proposal,
            requested_at: now,
        };
        let payload = match serde_json::to_value(&request) {
            Ok(p) => p,
            Err(e) => {
                error!("Worker [{}]: failed to encode request: {}", self.def.id, e);
                self.deduper.note_abandoned(fp.as_str());
                return;
            }
        };

        match self
            .bus
            .request(
                &keys::allocation_request(&self.def.id),
                "response.capital.allocation",
                payload,
                Some(self.request_timeout),
            )
            .await
        {
            Ok(envelope) => match envelope.parse_payload::<AllocationResponse>() {
                Ok(response) => match response.result {
                    AllocationVerdict::Approved => {
                        info!(
                            "Worker [{}]: proposal approved, qty {:?} (fp {})",
                            self.def.id, response.approved_quantity, fp
                        );
                        // Stays in flight until the fill event resolves it.
                    }
                    AllocationVerdict::Denied => {
                        debug!(
                            "Worker [{}]: proposal denied: {:?}",
                            self.def.id, response.reasons
                        );
                        if response.reasons.iter().any(|r| r == "duplicate_proposal") {
                            self.deduper.note_resolved(fp.as_str(), now);
                        } else {
                            self.deduper.note_abandoned(fp.as_str());
                        }
                    }
                },
                Err(e) => {
                    warn!("Worker [{}]: bad allocation response: {}", self.def.id, e);
                    self.deduper.note_abandoned(fp.as_str());
                }
            },
            Err(BusError::RequestTimeout { timeout_ms, .. }) => {
                let err = WorkerError::CapitalRequestTimeout {
                    strategy_id: self.def.id.clone(),
                    timeout_ms,
                };
                warn!("Worker [{}]: {}; will re-decide on next bar", self.def.id, err);
                self.deduper.note_abandoned(fp.as_str());
            }
            Err(e) => {
                warn!("Worker [{}]: allocation request failed: {}", self.def.id, e);
                self.deduper.note_abandoned(fp.as_str());
            }
        }
    }

    async fn handle_executed(&mut self, event: TradeExecutedEvent) {
        let now = Utc::now();
        if let Some(fp) = &event.trade.fingerprint
            && event.trade.status.is_terminal()
        {
            self.deduper.note_resolved(fp, now);
        }

        let open_position_id = self
            .positions
            .find_open_by_strategy(&self.def.id)
            .await
            .ok()
            .and_then(|positions| positions.first().map(|p| p.id));

        let state = StrategyState {
            strategy_id: self.def.id.clone(),
            last_processed_bar_ts: self.last_processed,
            last_fingerprint: event.trade.fingerprint.clone(),
            open_position_id,
            updated_at: now,
        };
        if let Err(e) = self.states.store(&state).await {
            error!("Worker [{}]: failed to checkpoint state: {}", self.def.id, e);
        }
    }

    async fn announce_halt(&self) {
        error!(
            "Worker [{}]: halting after {} consecutive failures",
            self.def.id, self.consecutive_failures
        );
        let event = StrategyHaltedEvent {
            strategy_id: self.def.id.clone(),
            consecutive_failures: self.consecutive_failures,
            reason: "consecutive strategy failures".to_string(),
        };
        if let Ok(payload) = serde_json::to_value(&event) {
            let envelope = self.bus.envelope(None, payload);
            let _ = self
                .bus
                .publish(
                    BusExchange::Events,
                    &keys::system("strategy_halted"),
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
    fn deduper_enforces_at_most_one_in_flight() {
        let mut d = ProposalDeduper::new(60_000);
        let now = Utc::now();
        assert!(!d.suppresses("fp1", now));
        d.note_in_flight("fp1", now);
        assert!(d.suppresses("fp1", now));
        assert!(!d.suppresses("fp2", now));
    }

    #[test]
    fn resolved_fingerprints_suppress_within_ttl() {
        let mut d = ProposalDeduper::new(60_000);
        let now = Utc::now();
        d.note_in_flight("fp1", now);
        d.note_resolved("fp1", now);
        assert!(d.suppresses("fp1", now));

        // Past the TTL the intent may fire again.
        let later = now + ChronoDuration::milliseconds(61_000);
        assert!(!d.suppresses("fp1", later));
    }

    #[test]
    fn abandoned_fingerprints_may_retry_immediately() {
        let mut d = ProposalDeduper::new(60_000);
        let now = Utc::now();
        d.note_in_flight("fp1", now);
        d.note_abandoned("fp1");
        assert!(!d.suppresses("fp1", now));
    }

    #[test]
    fn stuck_in_flight_entries_expire() {
        let mut d = ProposalDeduper::new(1_000);
        let now = Utc::now();
        d.note_in_flight("fp1", now);
        let later = now + ChronoDuration::milliseconds(1_500);
        assert!(!d.suppresses("fp1", later));
    }
}
