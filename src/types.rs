//! Shared types for the CAIMEO entry loop.
//!
//! These types form the data model used across all modules. Brokerage,
//! discovery, strategy and engine modules depend on them without depending
//! on each other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Confidence grade
// ---------------------------------------------------------------------------

/// Discrete confidence grade attached to a candidate by the discovery
/// pipeline. `A` is the strongest. The grade is opaque to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceGrade {
    A,
    B,
    C,
    D,
    F,
}

impl ConfidenceGrade {
    pub const ALL: &'static [ConfidenceGrade] = &[
        ConfidenceGrade::A,
        ConfidenceGrade::B,
        ConfidenceGrade::C,
        ConfidenceGrade::D,
        ConfidenceGrade::F,
    ];

    /// Position in the ranking, 0 = best.
    pub fn rank(&self) -> u8 {
        match self {
            ConfidenceGrade::A => 0,
            ConfidenceGrade::B => 1,
            ConfidenceGrade::C => 2,
            ConfidenceGrade::D => 3,
            ConfidenceGrade::F => 4,
        }
    }

    /// Only A–C may ever open a position. D and F are informational.
    pub fn is_entry_grade(&self) -> bool {
        self.rank() <= ConfidenceGrade::C.rank()
    }

    /// Whether this grade is at least as strong as `minimum`.
    pub fn meets(&self, minimum: ConfidenceGrade) -> bool {
        self.rank() <= minimum.rank()
    }
}

impl fmt::Display for ConfidenceGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceGrade::A => "A",
            ConfidenceGrade::B => "B",
            ConfidenceGrade::C => "C",
            ConfidenceGrade::D => "D",
            ConfidenceGrade::F => "F",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConfidenceGrade {
    type Err = CaimeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "A" => Ok(ConfidenceGrade::A),
            "B" => Ok(ConfidenceGrade::B),
            "C" => Ok(ConfidenceGrade::C),
            "D" => Ok(ConfidenceGrade::D),
            "F" => Ok(ConfidenceGrade::F),
            other => Err(CaimeoError::Config(format!("unknown confidence grade: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// Fundamental metrics carried along with a candidate. Advisory only; the
/// loop never gates on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetrics {
    pub eps_growth_pct: Option<Decimal>,
    pub revenue_growth_pct: Option<Decimal>,
    pub pe: Option<Decimal>,
    pub growth_pct: Option<Decimal>,
}

/// A symbol proposed for entry by the discovery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub grade: ConfidenceGrade,
    pub last_price: Decimal,
    #[serde(default)]
    pub metrics: CandidateMetrics,
    #[serde(default)]
    pub score: Option<Decimal>,
    #[serde(default)]
    pub strategy: Option<String>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] @ {}", self.symbol, self.grade, self.last_price)
    }
}

impl Candidate {
    pub fn new(symbol: &str, grade: ConfidenceGrade, last_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            grade,
            last_price,
            metrics: CandidateMetrics::default(),
            score: None,
            strategy: None,
        }
    }
}

/// Order candidates by descending grade, keeping feed order within a grade.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    // sort_by_key is stable, which preserves feed order for equal grades
    candidates.sort_by_key(|c| c.grade.rank());
    candidates
}

/// Discovery pipeline progress, passed through to the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    pub eta: String,
    pub status: String,
}

impl Default for DiscoveryProgress {
    fn default() -> Self {
        Self {
            current: 0,
            total: 0,
            percent: 0.0,
            eta: "N/A".to_string(),
            status: "Idle".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// An order the loop wants placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub trail_percent: Option<Decimal>,
    pub time_in_force: TimeInForce,
    /// Idempotency key forwarded to the brokerage.
    pub client_order_id: String,
}

impl OrderRequest {
    /// A day limit buy that opens a new position.
    pub fn limit_entry(symbol: &str, quantity: u64, limit_price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            stop_price: None,
            trail_percent: None,
            time_in_force: TimeInForce::Day,
            client_order_id: new_client_order_id("entry"),
        }
    }

    /// A GTC trailing-stop sell protecting a held position.
    pub fn trailing_exit(symbol: &str, quantity: u64, trail_percent: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            quantity,
            order_type: OrderType::TrailingStop,
            limit_price: None,
            stop_price: None,
            trail_percent: Some(trail_percent),
            time_in_force: TimeInForce::Gtc,
            client_order_id: new_client_order_id("exit"),
        }
    }

    /// Notional value at the limit price (zero for unpriced orders).
    pub fn notional(&self) -> Decimal {
        self.limit_price.unwrap_or(Decimal::ZERO) * Decimal::from(self.quantity)
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.side.to_string().to_uppercase(),
            self.quantity,
            self.symbol,
            self.order_type
        )?;
        if let Some(p) = self.limit_price.or(self.stop_price) {
            write!(f, " @ {p}")?;
        }
        if let Some(t) = self.trail_percent {
            write!(f, " trail={t}%")?;
        }
        Ok(())
    }
}

fn new_client_order_id(prefix: &str) -> String {
    format!("caimeo-{prefix}-{}", uuid::Uuid::new_v4())
}

/// Acknowledgement returned by the brokerage for an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
}

/// An unfilled order as reported by the brokerage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: String,
}

impl OpenOrder {
    /// Buy orders open positions in this long-only system.
    pub fn is_entry(&self) -> bool {
        self.side == OrderSide::Buy
    }
}

// ---------------------------------------------------------------------------
// Positions & account
// ---------------------------------------------------------------------------

/// A held position as reported by the brokerage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub current_price: Decimal,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pnl = self.unrealized_pnl();
        let sign = if pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{} qty={} avg={} last={} ({sign}{pnl:.2})",
            self.symbol, self.quantity, self.avg_price, self.current_price
        )
    }
}

impl Position {
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.avg_price) * self.quantity
    }
}

/// Account balances at the time of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub portfolio_value: Decimal,
}

impl AccountSnapshot {
    pub fn invested(&self) -> Decimal {
        self.portfolio_value - self.cash
    }
}

/// Everything the loop reads from the brokerage in one cycle. Never reused
/// across cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSnapshot {
    pub account: AccountSnapshot,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
}

impl BrokerSnapshot {
    pub fn open_entry_orders(&self) -> usize {
        self.open_orders.iter().filter(|o| o.is_entry()).count()
    }

    /// Positions plus pending entries, the quantity bounded by the position cap.
    pub fn active_count(&self) -> usize {
        self.positions.len() + self.open_entry_orders()
    }

    /// Whether the symbol is held or has any open order.
    pub fn is_active(&self, symbol: &str) -> bool {
        self.positions.iter().any(|p| p.symbol == symbol)
            || self.open_orders.iter().any(|o| o.symbol == symbol)
    }

    pub fn has_exit_order(&self, symbol: &str) -> bool {
        self.open_orders
            .iter()
            .any(|o| o.symbol == symbol && o.side == OrderSide::Sell)
    }
}

// ---------------------------------------------------------------------------
// Loop state & decisions
// ---------------------------------------------------------------------------

/// Run state of the decision loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Stopped,
    Running,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Stopped => write!(f, "Stopped"),
            LoopState::Running => write!(f, "Running"),
        }
    }
}

/// Outcome of evaluating one symbol (or the whole cycle) in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Entered,
    SkippedEmptyDiscovery,
    SkippedDayTradeCap,
    SkippedMarketClosed,
    SkippedPositionCapReached,
    SkippedSizingFailed,
    SkippedIneligibleGrade,
    SkippedAlreadyHeld,
    ErrorSubmitting,
    ErrorDiscovery,
    ErrorSnapshot,
    ExitAttached,
    SkippedStopRequested,
}

impl DecisionOutcome {
    pub const ALL: &'static [DecisionOutcome] = &[
        DecisionOutcome::Entered,
        DecisionOutcome::SkippedEmptyDiscovery,
        DecisionOutcome::SkippedDayTradeCap,
        DecisionOutcome::SkippedMarketClosed,
        DecisionOutcome::SkippedPositionCapReached,
        DecisionOutcome::SkippedSizingFailed,
        DecisionOutcome::SkippedIneligibleGrade,
        DecisionOutcome::SkippedAlreadyHeld,
        DecisionOutcome::ErrorSubmitting,
        DecisionOutcome::ErrorDiscovery,
        DecisionOutcome::ErrorSnapshot,
        DecisionOutcome::ExitAttached,
        DecisionOutcome::SkippedStopRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Entered => "Entered",
            DecisionOutcome::SkippedEmptyDiscovery => "SkippedEmptyDiscovery",
            DecisionOutcome::SkippedDayTradeCap => "SkippedDayTradeCap",
            DecisionOutcome::SkippedMarketClosed => "SkippedMarketClosed",
            DecisionOutcome::SkippedPositionCapReached => "SkippedPositionCapReached",
            DecisionOutcome::SkippedSizingFailed => "SkippedSizingFailed",
            DecisionOutcome::SkippedIneligibleGrade => "SkippedIneligibleGrade",
            DecisionOutcome::SkippedAlreadyHeld => "SkippedAlreadyHeld",
            DecisionOutcome::ErrorSubmitting => "ErrorSubmitting",
            DecisionOutcome::ErrorDiscovery => "ErrorDiscovery",
            DecisionOutcome::ErrorSnapshot => "ErrorSnapshot",
            DecisionOutcome::ExitAttached => "ExitAttached",
            DecisionOutcome::SkippedStopRequested => "SkippedStopRequested",
        }
    }

    /// Stable marker written to the log so operators can grep for it.
    pub fn marker(&self) -> &'static str {
        match self {
            DecisionOutcome::Entered => "ENTERED",
            DecisionOutcome::SkippedEmptyDiscovery => "SKIP_EMPTY_DISCOVERY",
            DecisionOutcome::SkippedDayTradeCap => "SKIP_DAY_TRADE_CAP",
            DecisionOutcome::SkippedMarketClosed => "SKIP_MARKET_CLOSED",
            DecisionOutcome::SkippedPositionCapReached => "SKIP_POSITION_CAP",
            DecisionOutcome::SkippedSizingFailed => "SKIP_SIZING_FAILED",
            DecisionOutcome::SkippedIneligibleGrade => "SKIP_INELIGIBLE_GRADE",
            DecisionOutcome::SkippedAlreadyHeld => "SKIP_ALREADY_HELD",
            DecisionOutcome::ErrorSubmitting => "ERROR_SUBMITTING",
            DecisionOutcome::ErrorDiscovery => "ERROR_DISCOVERY",
            DecisionOutcome::ErrorSnapshot => "ERROR_SNAPSHOT",
            DecisionOutcome::ExitAttached => "EXIT_ATTACHED",
            DecisionOutcome::SkippedStopRequested => "SKIP_STOP_REQUESTED",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DecisionOutcome::ErrorSubmitting
                | DecisionOutcome::ErrorDiscovery
                | DecisionOutcome::ErrorSnapshot
        )
    }

    pub fn is_skip(&self) -> bool {
        self.as_str().starts_with("Skipped")
    }

    /// Records that belong in the trade history.
    pub fn is_trade(&self) -> bool {
        matches!(self, DecisionOutcome::Entered | DecisionOutcome::ExitAttached)
    }
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DecisionOutcome {
    type Err = CaimeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DecisionOutcome::ALL
            .iter()
            .copied()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| CaimeoError::Storage(format!("unknown decision outcome: {s}")))
    }
}

/// One audit journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub symbol: Option<String>,
    pub outcome: DecisionOutcome,
    pub detail: String,
}

impl DecisionRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        cycle: u64,
        symbol: Option<&str>,
        outcome: DecisionOutcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            cycle,
            symbol: symbol.map(str::to_string),
            outcome,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DecisionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] cycle={} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.cycle,
            self.outcome.marker(),
            self.symbol.as_deref().unwrap_or("-"),
            self.detail,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CAIMEO.
#[derive(Debug, thiserror::Error)]
pub enum CaimeoError {
    #[error("No valid brokerage session; authenticate before starting")]
    NotAuthenticated,

    #[error("Durable state at {path} is unreadable: {reason}")]
    StateCorrupt { path: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sizing error: {0}")]
    Sizing(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
