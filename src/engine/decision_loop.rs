//! Decision loop.
//!
//! One cycle:
//!
//! 1. Fetch candidates. Empty → one `SkippedEmptyDiscovery`; feed failure →
//!    one `ErrorDiscovery`. Either ends the cycle.
//! 2. Snapshot account, positions and open orders. Failure →
//!    `ErrorSnapshot`, cycle ends with nothing changed. Reconcile unresolved
//!    submissions against the snapshot and protect naked positions with
//!    trailing stops.
//! 3. Cycle-level risk gate. A refusal skips every candidate with the same
//!    reason.
//! 4. Walk candidates in rank order: grade, already held, position slots,
//!    trade slots, sizing, then submit. A placed entry is counted, persisted
//!    and logged before the next candidate is looked at.
//!
//! A stop request is honoured between candidates, never inside a submission.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::audit::AuditLog;
use super::counter::{CounterStore, TradeCounter, WeeklyTradeCounter};
use super::executor::{OrderExecutor, SubmitOutcome};
use crate::brokerage::{BrokerageGateway, GatewayError};
use crate::config::RiskConfig;
use crate::discovery::CandidateFeed;
use crate::market::{Clock, MarketCalendar};
use crate::strategy::{grade_eligible, GateInputs, PositionSizer, RiskGate, SizerConfig, Verdict};
use crate::types::{
    rank_candidates, BrokerSnapshot, CaimeoError, ConfidenceGrade, DecisionOutcome, DecisionRecord,
    OrderRequest,
};

// ---------------------------------------------------------------------------
// Errors & reports
// ---------------------------------------------------------------------------

/// Conditions that end the run. Everything else is recorded and retried
/// next cycle.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Brokerage credentials rejected; stopping")]
    Unauthorized,

    #[error(transparent)]
    State(#[from] CaimeoError),

    #[error("Day-trade counter could not be persisted: {0}")]
    CounterWrite(String),
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub candidates: usize,
    pub entered: usize,
    pub exits_attached: usize,
    pub skipped: usize,
    pub errors: usize,
    pub trades_used: u32,
    pub cap: u32,
    /// Set when a stop request cut the candidate walk short.
    pub interrupted: bool,
}

impl CycleReport {
    fn count(&mut self, outcome: DecisionOutcome) {
        match outcome {
            DecisionOutcome::Entered => self.entered += 1,
            DecisionOutcome::ExitAttached => self.exits_attached += 1,
            o if o.is_error() => self.errors += 1,
            _ => self.skipped += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop core
// ---------------------------------------------------------------------------

/// Collaborators the loop is built from.
pub struct LoopDeps {
    pub clock: Arc<dyn Clock>,
    pub calendar: MarketCalendar,
    pub feed: Arc<dyn CandidateFeed>,
    pub gateway: Arc<dyn BrokerageGateway>,
    pub counter_store: Box<dyn CounterStore>,
    pub audit: AuditLog,
}

pub struct DecisionLoop {
    risk: RiskConfig,
    min_grade: ConfidenceGrade,
    clock: Arc<dyn Clock>,
    calendar: MarketCalendar,
    feed: Arc<dyn CandidateFeed>,
    gateway: Arc<dyn BrokerageGateway>,
    executor: OrderExecutor,
    counter: TradeCounter,
    sizer: PositionSizer,
    audit: AuditLog,
    call_timeout: Duration,
    cycle: u64,
}

/// Bound a gateway call; an expired bound reads as `Timeout`.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, GatewayError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(GatewayError::Timeout))
}

impl DecisionLoop {
    /// The counter is not read here; call `prepare` before the first cycle.
    pub fn new(deps: LoopDeps, risk: RiskConfig, call_timeout: Duration) -> Result<Self, CaimeoError> {
        let min_grade = risk.min_grade()?;
        let today = deps.calendar.local_date(deps.clock.now());
        let counter = TradeCounter::new(deps.counter_store, risk.max_day_trades_per_week, today);
        let sizer = PositionSizer::new(SizerConfig::from(&risk));
        let executor = OrderExecutor::new(deps.gateway.clone(), call_timeout);

        Ok(Self {
            risk,
            min_grade,
            clock: deps.clock,
            calendar: deps.calendar,
            feed: deps.feed,
            gateway: deps.gateway,
            executor,
            counter,
            sizer,
            audit: deps.audit,
            call_timeout,
            cycle: 0,
        })
    }

    /// Load durable state ahead of a run. Corrupt state refuses the run.
    pub fn prepare(&mut self) -> Result<WeeklyTradeCounter, CaimeoError> {
        let today = self.calendar.local_date(self.clock.now());
        self.counter.reload(today)?;
        Ok(self.counter.snapshot())
    }

    pub fn counter(&self) -> WeeklyTradeCounter {
        self.counter.snapshot()
    }

    pub fn unresolved_symbols(&self) -> Vec<String> {
        self.executor.unresolved_symbols()
    }

    async fn record(
        &self,
        report: &mut CycleReport,
        now: DateTime<Utc>,
        symbol: Option<&str>,
        outcome: DecisionOutcome,
        detail: impl Into<String>,
    ) {
        report.count(outcome);
        self.audit
            .record(DecisionRecord::new(now, self.cycle, symbol, outcome, detail))
            .await;
    }

    async fn fetch_snapshot(&self) -> Result<BrokerSnapshot, GatewayError> {
        let limit = self.call_timeout;
        let gateway = &self.gateway;
        let (account, positions, open_orders) = futures::try_join!(
            bounded(limit, gateway.account()),
            bounded(limit, gateway.positions()),
            bounded(limit, gateway.open_orders()),
        )?;
        Ok(BrokerSnapshot {
            account,
            positions,
            open_orders,
        })
    }

    /// Run one cycle to completion (or until `stop` is raised between
    /// candidates).
    pub async fn run_cycle(&mut self, stop: &watch::Receiver<bool>) -> Result<CycleReport, LoopError> {
        self.cycle += 1;
        let now = self.clock.now();
        let today = self.calendar.local_date(now);
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        debug!(cycle = self.cycle, "Starting cycle");

        // 1. Candidates
        let fetched = match tokio::time::timeout(self.call_timeout, self.feed.fetch_candidates()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("discovery feed timed out")),
        };
        let candidates = match fetched {
            Ok(batch) => rank_candidates(batch.candidates),
            Err(e) => {
                self.record(&mut report, now, None, DecisionOutcome::ErrorDiscovery, format!("{e:#}"))
                    .await;
                return self.finish(report, today);
            }
        };
        report.candidates = candidates.len();
        if candidates.is_empty() {
            self.record(
                &mut report,
                now,
                None,
                DecisionOutcome::SkippedEmptyDiscovery,
                "no candidates from discovery",
            )
            .await;
            return self.finish(report, today);
        }

        // 2. Broker snapshot
        let snapshot = match self.fetch_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                self.record(&mut report, now, None, DecisionOutcome::ErrorSnapshot, e.to_string())
                    .await;
                if e.is_fatal() {
                    return Err(LoopError::Unauthorized);
                }
                return self.finish(report, today);
            }
        };
        self.executor.reconcile(&snapshot, today);

        let window_open = self
            .calendar
            .minutes_since_open(now)
            .is_some_and(|m| m >= i64::from(self.risk.minutes_after_open));
        if self.risk.attach_exits && window_open {
            self.attach_exits(&snapshot, &mut report, now, today).await?;
        }

        // 3. Cycle-level gate
        let counts = self
            .counter
            .current(today)
            .map_err(|e| LoopError::CounterWrite(format!("{e:#}")))?
            .clone();
        let gate = RiskGate::new(&self.risk, &self.calendar);
        let verdict = gate.evaluate(&GateInputs {
            now,
            open_positions: snapshot.positions.len(),
            open_entry_orders: snapshot.open_entry_orders(),
            trades_used: counts.trades_used,
            trades_today: counts.trades_today,
        });

        let (mut position_slots, mut trade_slots) = match verdict {
            Verdict::Permitted {
                position_slots,
                trade_slots,
            } => (position_slots, trade_slots),
            Verdict::Rejected(reason) => {
                let outcome = reason.outcome();
                let detail = reason.to_string();
                for c in &candidates {
                    self.record(&mut report, now, Some(&c.symbol), outcome, detail.clone())
                        .await;
                }
                return self.finish(report, today);
            }
        };

        // 4. Candidates in rank order
        let mut buying_power = snapshot.account.buying_power;
        let mut attempted: HashSet<String> = HashSet::new();

        for (index, candidate) in candidates.iter().enumerate() {
            if *stop.borrow() {
                let left = candidates.len() - index;
                info!(cycle = self.cycle, left, "Stop requested, leaving cycle between candidates");
                report.interrupted = true;
                self.record(
                    &mut report,
                    now,
                    None,
                    DecisionOutcome::SkippedStopRequested,
                    format!("stop requested with {left} candidate(s) not evaluated"),
                )
                .await;
                break;
            }
            let symbol = candidate.symbol.as_str();

            if !attempted.insert(candidate.symbol.clone()) {
                self.record(
                    &mut report,
                    now,
                    Some(symbol),
                    DecisionOutcome::SkippedAlreadyHeld,
                    "already evaluated this cycle",
                )
                .await;
                continue;
            }
            if !grade_eligible(candidate, self.min_grade) {
                self.record(
                    &mut report,
                    now,
                    Some(symbol),
                    DecisionOutcome::SkippedIneligibleGrade,
                    format!("grade {} below {}", candidate.grade, self.min_grade),
                )
                .await;
                continue;
            }
            if snapshot.is_active(symbol) || self.executor.is_unresolved(symbol) {
                let detail = if self.executor.is_unresolved(symbol) {
                    "earlier submission not yet reconciled"
                } else {
                    "position or open order exists"
                };
                self.record(&mut report, now, Some(symbol), DecisionOutcome::SkippedAlreadyHeld, detail)
                    .await;
                continue;
            }
            if position_slots == 0 {
                self.record(
                    &mut report,
                    now,
                    Some(symbol),
                    DecisionOutcome::SkippedPositionCapReached,
                    format!("max positions {} reached", self.risk.max_positions),
                )
                .await;
                continue;
            }
            if trade_slots == 0 {
                self.record(
                    &mut report,
                    now,
                    Some(symbol),
                    DecisionOutcome::SkippedDayTradeCap,
                    "day-trade budget used up this cycle",
                )
                .await;
                continue;
            }

            let sized = match self
                .sizer
                .size(snapshot.account.equity, buying_power, candidate.last_price)
            {
                Ok(s) if s.is_feasible() => s,
                Ok(s) => {
                    let detail = format!(
                        "quantity 0 at limit {} with buying power {}",
                        s.limit_price, buying_power
                    );
                    self.record(&mut report, now, Some(symbol), DecisionOutcome::SkippedSizingFailed, detail)
                        .await;
                    continue;
                }
                Err(e) => {
                    self.record(
                        &mut report,
                        now,
                        Some(symbol),
                        DecisionOutcome::SkippedSizingFailed,
                        e.to_string(),
                    )
                    .await;
                    continue;
                }
            };

            let order = OrderRequest::limit_entry(symbol, sized.quantity, sized.limit_price);
            match self.executor.submit(&order, now, today).await {
                SubmitOutcome::Placed(receipt) => {
                    // The order is live whether or not the count sticks.
                    let counted = self.consume_slot(now).await;
                    self.record(
                        &mut report,
                        now,
                        Some(symbol),
                        DecisionOutcome::Entered,
                        format!("{order} id={}", receipt.order_id),
                    )
                    .await;
                    counted?;
                    position_slots -= 1;
                    trade_slots -= 1;
                    buying_power -= sized.notional;
                }
                SubmitOutcome::Ambiguous(e) => {
                    // Count it as if it went through; it may have.
                    let counted = self.consume_slot(now).await;
                    self.record(
                        &mut report,
                        now,
                        Some(symbol),
                        DecisionOutcome::ErrorSubmitting,
                        format!("{order}: outcome unknown ({e}), held until reconciled"),
                    )
                    .await;
                    counted?;
                    position_slots -= 1;
                    trade_slots -= 1;
                    buying_power -= sized.notional;
                }
                SubmitOutcome::Rejected(e) => {
                    self.record(
                        &mut report,
                        now,
                        Some(symbol),
                        DecisionOutcome::ErrorSubmitting,
                        format!("{order}: {e}"),
                    )
                    .await;
                }
                SubmitOutcome::Fatal(e) => {
                    self.record(
                        &mut report,
                        now,
                        Some(symbol),
                        DecisionOutcome::ErrorSubmitting,
                        format!("{order}: {e}"),
                    )
                    .await;
                    return Err(LoopError::Unauthorized);
                }
            }
        }

        self.finish(report, today)
    }

    /// Place trailing stops on held positions that have no exit working.
    async fn attach_exits(
        &mut self,
        snapshot: &BrokerSnapshot,
        report: &mut CycleReport,
        now: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<(), LoopError> {
        let trail = self.risk.trail_stop_pct;
        for position in &snapshot.positions {
            let symbol = position.symbol.as_str();
            if snapshot.has_exit_order(symbol) || self.executor.exit_unresolved(symbol) {
                continue;
            }
            let quantity = position.quantity.floor().to_u64().unwrap_or(0);
            if quantity == 0 {
                continue;
            }

            let order = OrderRequest::trailing_exit(symbol, quantity, trail);
            match self.executor.submit(&order, now, today).await {
                SubmitOutcome::Placed(receipt) => {
                    self.record(
                        report,
                        now,
                        Some(symbol),
                        DecisionOutcome::ExitAttached,
                        format!("{order} id={}", receipt.order_id),
                    )
                    .await;
                }
                SubmitOutcome::Fatal(e) => {
                    self.record(report, now, Some(symbol), DecisionOutcome::ErrorSubmitting, format!("{order}: {e}"))
                        .await;
                    return Err(LoopError::Unauthorized);
                }
                SubmitOutcome::Rejected(e) | SubmitOutcome::Ambiguous(e) => {
                    self.record(report, now, Some(symbol), DecisionOutcome::ErrorSubmitting, format!("{order}: {e}"))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn consume_slot(&mut self, now: DateTime<Utc>) -> Result<(), LoopError> {
        self.counter
            .record_trade(now, &self.calendar)
            .map(|_| ())
            .map_err(|e| {
                error!(error = %e, "Day-trade counter write failed");
                LoopError::CounterWrite(format!("{e:#}"))
            })
    }

    fn finish(&mut self, mut report: CycleReport, today: NaiveDate) -> Result<CycleReport, LoopError> {
        let counts = self
            .counter
            .current(today)
            .map_err(|e| LoopError::CounterWrite(format!("{e:#}")))?;
        report.trades_used = counts.trades_used;
        report.cap = counts.cap;
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Run cycles every `poll` until `stop` is raised or a cycle fails fatally.
///
/// The core sits behind a mutex that every cycle takes, so two schedulers
/// (an old run winding down and a new one) never run cycles concurrently.
pub async fn run_scheduled(
    core: Arc<Mutex<DecisionLoop>>,
    poll: Duration,
    mut stop: watch::Receiver<bool>,
    on_report: impl Fn(&DecisionLoop, &CycleReport) + Send,
) -> Result<(), LoopError> {
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *stop.borrow() {
                    break;
                }
                let mut core = core.lock().await;
                if *stop.borrow() {
                    break;
                }
                let report = core.run_cycle(&stop).await?;
                info!(
                    cycle = report.cycle,
                    candidates = report.candidates,
                    entered = report.entered,
                    exits = report.exits_attached,
                    skipped = report.skipped,
                    errors = report.errors,
                    trades_used = report.trades_used,
                    cap = report.cap,
                    "Cycle complete"
                );
                on_report(&*core, &report);
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("Decision loop stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
