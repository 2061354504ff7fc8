//! Full-cycle scenarios.
//!
//! Each scenario wires a `DecisionLoop` (or a `LoopController`) to the mock
//! gateway, a static candidate feed, a file-backed counter in the temp dir
//! and an in-memory journal, then checks what was submitted and recorded.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use caimeo::brokerage::{Credentials, GatewayError, SessionValidator};
use caimeo::config::RiskConfig;
use caimeo::discovery::{CandidateBatch, CandidateFeed};
use caimeo::engine::audit::AuditLog;
use caimeo::engine::controller::{LoopController, StartOutcome};
use caimeo::engine::counter::{CounterStore, FileCounterStore, WeeklyTradeCounter};
use caimeo::engine::decision_loop::{DecisionLoop, LoopDeps, LoopError};
use caimeo::market::{ManualClock, MarketCalendar};
use caimeo::storage::journal::MemoryJournal;
use caimeo::types::*;

use crate::mock_gateway::MockGateway;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Feed that serves a fixed candidate list.
struct StaticFeed {
    candidates: Mutex<Vec<Candidate>>,
}

impl StaticFeed {
    fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
        }
    }
}

#[async_trait]
impl CandidateFeed for StaticFeed {
    async fn fetch_candidates(&self) -> Result<CandidateBatch> {
        Ok(CandidateBatch {
            candidates: self.candidates.lock().unwrap().clone(),
            progress: DiscoveryProgress::default(),
            dropped: 0,
        })
    }

    fn progress(&self) -> DiscoveryProgress {
        DiscoveryProgress::default()
    }
}

struct AcceptAll;

#[async_trait]
impl SessionValidator for AcceptAll {
    async fn validate(&self, credentials: &Credentials) -> Result<bool, GatewayError> {
        Ok(!credentials.is_blank())
    }
}

fn temp_counter_path() -> PathBuf {
    std::env::temp_dir().join(format!("caimeo_it_counter_{}.json", uuid::Uuid::new_v4()))
}

// Tue 2026-01-13, EST (UTC-5). Open is 14:30 UTC.
fn mid_session() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 13, 15, 30, 0).unwrap()
}

fn ten_minutes_after_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 13, 14, 40, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn grade_a(symbols: &[&str], price: Decimal) -> Vec<Candidate> {
    symbols
        .iter()
        .map(|s| Candidate::new(s, ConfidenceGrade::A, price))
        .collect()
}

struct Rig {
    core: DecisionLoop,
    gateway: Arc<MockGateway>,
    journal: Arc<MemoryJournal>,
    counter_path: PathBuf,
}

impl Rig {
    async fn cycle(&mut self) -> Result<caimeo::engine::decision_loop::CycleReport, LoopError> {
        let (_tx, rx) = watch::channel(false);
        self.core.run_cycle(&rx).await
    }

    async fn records(&self) -> Vec<DecisionRecord> {
        self.journal.all().await
    }

    async fn outcomes(&self) -> Vec<(Option<String>, DecisionOutcome)> {
        self.records()
            .await
            .into_iter()
            .map(|r| (r.symbol, r.outcome))
            .collect()
    }

    fn stored_counter(&self) -> Option<WeeklyTradeCounter> {
        FileCounterStore::new(self.counter_path.to_string_lossy().to_string())
            .load()
            .unwrap()
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.counter_path);
    }
}

struct RigBuilder {
    candidates: Vec<Candidate>,
    cash: Decimal,
    risk: RiskConfig,
    at: DateTime<Utc>,
    seed: Option<WeeklyTradeCounter>,
}

impl RigBuilder {
    fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            cash: dec!(100000),
            risk: RiskConfig::default(),
            at: mid_session(),
            seed: None,
        }
    }

    fn cash(mut self, cash: Decimal) -> Self {
        self.cash = cash;
        self
    }

    fn risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    fn seed(mut self, counter: WeeklyTradeCounter) -> Self {
        self.seed = Some(counter);
        self
    }

    fn build(self) -> Rig {
        let counter_path = temp_counter_path();
        let path = counter_path.to_string_lossy().to_string();
        if let Some(seed) = &self.seed {
            FileCounterStore::new(path.clone()).save(seed).unwrap();
        }

        let gateway = Arc::new(MockGateway::new(self.cash));
        let journal = Arc::new(MemoryJournal::new());
        let deps = LoopDeps {
            clock: Arc::new(ManualClock::new(self.at)),
            calendar: MarketCalendar::us_equities(),
            feed: Arc::new(StaticFeed::new(self.candidates)),
            gateway: gateway.clone(),
            counter_store: Box::new(FileCounterStore::new(path)),
            audit: AuditLog::new(journal.clone()),
        };
        let mut core = DecisionLoop::new(deps, self.risk, Duration::from_secs(1)).unwrap();
        core.prepare().unwrap();

        Rig {
            core,
            gateway,
            journal,
            counter_path,
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_discovery_records_once_and_submits_nothing() {
    let mut rig = RigBuilder::new(Vec::new()).build();
    rig.cycle().await.unwrap();

    assert_eq!(rig.outcomes().await, vec![(None, DecisionOutcome::SkippedEmptyDiscovery)]);
    assert!(rig.gateway.submissions().is_empty());
}

#[tokio::test]
async fn test_weekly_cap_used_up_skips_everything() {
    let mut seed = WeeklyTradeCounter::new(date(2026, 1, 12), 10);
    for _ in 0..10 {
        seed.increment().unwrap();
    }
    let mut rig = RigBuilder::new(grade_a(&["AAA", "BBB", "CCC"], dec!(50)))
        .seed(seed)
        .build();

    let report = rig.cycle().await.unwrap();

    assert!(rig.gateway.submissions().is_empty());
    let outcomes = rig.outcomes().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|(_, o)| *o == DecisionOutcome::SkippedDayTradeCap));
    assert_eq!(report.trades_used, 10);
}

#[tokio::test]
async fn test_five_grade_a_with_three_slots() {
    let mut rig = RigBuilder::new(grade_a(&["A1", "A2", "A3", "A4", "A5"], dec!(50))).build();
    let report = rig.cycle().await.unwrap();

    let expected = vec![
        (Some("A1".to_string()), DecisionOutcome::Entered),
        (Some("A2".to_string()), DecisionOutcome::Entered),
        (Some("A3".to_string()), DecisionOutcome::Entered),
        (Some("A4".to_string()), DecisionOutcome::SkippedPositionCapReached),
        (Some("A5".to_string()), DecisionOutcome::SkippedPositionCapReached),
    ];
    assert_eq!(rig.outcomes().await, expected);
    assert_eq!(rig.gateway.entry_submissions().len(), 3);
    assert_eq!(report.trades_used, 3);
    assert_eq!(rig.stored_counter().unwrap().trades_used, 3);
}

#[tokio::test]
async fn test_rank_order_beats_feed_order() {
    let candidates = vec![
        Candidate::new("CEE", ConfidenceGrade::C, dec!(20)),
        Candidate::new("BEE", ConfidenceGrade::B, dec!(20)),
        Candidate::new("AYY", ConfidenceGrade::A, dec!(20)),
        Candidate::new("FFF", ConfidenceGrade::F, dec!(20)),
    ];
    let mut rig = RigBuilder::new(candidates).build();
    rig.cycle().await.unwrap();

    let submitted: Vec<String> = rig
        .gateway
        .entry_submissions()
        .into_iter()
        .map(|o| o.symbol)
        .collect();
    assert_eq!(submitted, vec!["AYY", "BEE", "CEE"]);
    let outcomes = rig.outcomes().await;
    assert_eq!(outcomes[3], (Some("FFF".to_string()), DecisionOutcome::SkippedIneligibleGrade));
}

#[tokio::test]
async fn test_price_above_buying_power_is_sizing_failure() {
    let mut rig = RigBuilder::new(grade_a(&["PRICY"], dec!(190)))
        .cash(dec!(150))
        .build();
    rig.cycle().await.unwrap();

    assert_eq!(
        rig.outcomes().await,
        vec![(Some("PRICY".to_string()), DecisionOutcome::SkippedSizingFailed)]
    );
    assert!(rig.gateway.submissions().is_empty());
}

#[tokio::test]
async fn test_nothing_submitted_before_window_opens() {
    let mut rig = RigBuilder::new(grade_a(&["AAA", "BBB"], dec!(50)))
        .at(ten_minutes_after_open())
        .build();
    rig.gateway.add_position("HELD", dec!(10), dec!(20));

    rig.cycle().await.unwrap();

    assert!(rig.gateway.submissions().is_empty());
    let outcomes = rig.outcomes().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, o)| *o == DecisionOutcome::SkippedMarketClosed));
}

#[tokio::test]
async fn test_prior_week_counter_resets_before_increment() {
    let mut seed = WeeklyTradeCounter::new(date(2026, 1, 9), 10);
    for _ in 0..10 {
        seed.increment().unwrap();
    }
    let mut rig = RigBuilder::new(grade_a(&["AAA", "BBB"], dec!(50)))
        .seed(seed)
        .build();

    let report = rig.cycle().await.unwrap();

    assert_eq!(report.entered, 2);
    assert_eq!(report.trades_used, 2);
    let stored = rig.stored_counter().unwrap();
    assert_eq!(stored.week_start, date(2026, 1, 12));
    assert_eq!(stored.trades_used, 2);
}

#[tokio::test]
async fn test_caps_hold_with_many_eligible_candidates() {
    let risk = RiskConfig {
        max_positions: 20,
        risk_per_trade_pct: dec!(0.1),
        ..RiskConfig::default()
    };
    let symbols: Vec<String> = (0..14).map(|i| format!("S{i:02}")).collect();
    let refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
    let mut rig = RigBuilder::new(grade_a(&refs, dec!(25)))
        .risk(risk)
        .build();

    for _ in 0..3 {
        let report = rig.cycle().await.unwrap();
        assert!(report.trades_used <= report.cap);
        assert!(rig.gateway.position_count() + rig.gateway.open_entry_count() <= 20);
    }
    assert_eq!(rig.gateway.entry_submissions().len(), 10);
    assert_eq!(rig.stored_counter().unwrap().trades_used, 10);
}

#[tokio::test]
async fn test_open_entry_orders_count_against_position_cap() {
    let mut rig = RigBuilder::new(grade_a(&["A1", "A2", "A3", "A4"], dec!(50))).build();
    rig.cycle().await.unwrap();
    assert_eq!(rig.gateway.open_entry_count(), 3);

    // Orders still resting: no room for A4 next cycle either
    let report = rig.cycle().await.unwrap();
    assert_eq!(report.entered, 0);
    assert_eq!(rig.gateway.entry_submissions().len(), 3);
}

#[tokio::test]
async fn test_ambiguous_submission_not_resubmitted_until_reconciled() {
    let mut rig = RigBuilder::new(grade_a(&["AAA"], dec!(50))).build();
    rig.gateway.set_submit_error(GatewayError::Timeout);

    let report = rig.cycle().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.trades_used, 1);
    assert_eq!(rig.core.unresolved_symbols(), vec!["AAA".to_string()]);

    // Broker recovers but still shows nothing for AAA
    rig.gateway.clear_errors();
    rig.cycle().await.unwrap();
    assert_eq!(rig.gateway.entry_submissions().len(), 1);
    let last = rig.records().await.pop().unwrap();
    assert_eq!(last.outcome, DecisionOutcome::SkippedAlreadyHeld);

    // The order did land: the fill shows up and clears the marker
    rig.gateway.add_position("AAA", dec!(10), dec!(50));
    rig.cycle().await.unwrap();
    assert!(rig.core.unresolved_symbols().is_empty());
    assert_eq!(rig.gateway.entry_submissions().len(), 1);
}

#[tokio::test]
async fn test_rejected_submission_can_retry_next_cycle() {
    let mut rig = RigBuilder::new(grade_a(&["AAA"], dec!(50))).build();
    rig.gateway
        .set_submit_error(GatewayError::Rejected("symbol not tradable".into()));

    let report = rig.cycle().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.trades_used, 0);
    assert!(rig.core.unresolved_symbols().is_empty());

    rig.gateway.clear_errors();
    let report = rig.cycle().await.unwrap();
    assert_eq!(report.entered, 1);
    assert_eq!(rig.gateway.entry_submissions().len(), 2);
}

#[tokio::test]
async fn test_snapshot_failure_aborts_cycle() {
    let mut rig = RigBuilder::new(grade_a(&["AAA"], dec!(50))).build();
    rig.gateway.set_snapshot_error(GatewayError::Unavailable {
        status: 503,
        body: "maintenance".into(),
    });

    let report = rig.cycle().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(rig.outcomes().await, vec![(None, DecisionOutcome::ErrorSnapshot)]);
    assert!(rig.gateway.submissions().is_empty());
}

#[tokio::test]
async fn test_revoked_credentials_end_the_run() {
    let mut rig = RigBuilder::new(grade_a(&["AAA"], dec!(50))).build();
    rig.gateway.set_snapshot_error(GatewayError::Unauthorized);

    let err = rig.cycle().await.unwrap_err();
    assert!(matches!(err, LoopError::Unauthorized));
}

#[tokio::test]
async fn test_trailing_exit_attached_once() {
    let mut rig = RigBuilder::new(Vec::new()).build();
    rig.gateway.add_position("HELD", dec!(12.5), dec!(40));

    // Empty discovery ends the cycle before the snapshot
    rig.cycle().await.unwrap();
    assert!(rig.gateway.submissions().is_empty());

    let mut rig = RigBuilder::new(grade_a(&["HELD"], dec!(40))).build();
    rig.gateway.add_position("HELD", dec!(12.5), dec!(40));
    let report = rig.cycle().await.unwrap();
    assert_eq!(report.exits_attached, 1);

    let exits: Vec<OrderRequest> = rig
        .gateway
        .submissions()
        .into_iter()
        .filter(|o| o.side == OrderSide::Sell)
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].quantity, 12);
    assert_eq!(exits[0].order_type, OrderType::TrailingStop);
    assert_eq!(exits[0].trail_percent, Some(dec!(6.0)));

    rig.cycle().await.unwrap();
    assert_eq!(rig.gateway.submissions().len(), 1);
}

// ---------------------------------------------------------------------------
// Controller scenarios
// ---------------------------------------------------------------------------

fn controller(counter_path: &PathBuf) -> LoopController {
    let deps = LoopDeps {
        clock: Arc::new(ManualClock::new(mid_session())),
        calendar: MarketCalendar::us_equities(),
        feed: Arc::new(StaticFeed::new(Vec::new())),
        gateway: Arc::new(MockGateway::new(dec!(10000))),
        counter_store: Box::new(FileCounterStore::new(counter_path.to_string_lossy().to_string())),
        audit: AuditLog::new(Arc::new(MemoryJournal::new())),
    };
    LoopController::new(
        deps,
        RiskConfig::default(),
        Arc::new(AcceptAll),
        Duration::from_secs(3600),
        Duration::from_secs(1),
    )
    .unwrap()
}

#[tokio::test]
async fn test_start_twice_runs_one_loop() {
    let path = temp_counter_path();
    let ctl = controller(&path);
    assert!(ctl.authenticate(Credentials::new("PK", "secret")).await.unwrap());

    let (first, second) = tokio::join!(ctl.start(), ctl.start());
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort_by_key(|o| *o == StartOutcome::AlreadyRunning);
    assert_eq!(outcomes, vec![StartOutcome::Started, StartOutcome::AlreadyRunning]);
    assert_eq!(ctl.state().await, LoopState::Running);

    assert_eq!(ctl.stop().await, LoopState::Stopped);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_corrupt_counter_file_refuses_start() {
    let path = temp_counter_path();
    std::fs::write(&path, "{ not json").unwrap();
    let ctl = controller(&path);
    ctl.authenticate(Credentials::new("PK", "secret")).await.unwrap();

    let err = ctl.start().await.unwrap_err();
    assert!(matches!(err, CaimeoError::StateCorrupt { .. }));
    assert_eq!(ctl.state().await, LoopState::Stopped);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_start_refused_without_session() {
    let path = temp_counter_path();
    let ctl = controller(&path);
    assert!(matches!(ctl.start().await, Err(CaimeoError::NotAuthenticated)));
}
