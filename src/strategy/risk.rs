//! Risk gate.
//!
//! Cycle-level permission to open new positions. Three checks, evaluated in
//! order and short-circuiting on the first failure:
//!
//! 1. Day-trade budget: weekly trades used below the cap (and, when a daily
//!    cap is configured, today's trades below it).
//! 2. Market window: market open and at least `minutes_after_open` minutes
//!    past the open.
//! 3. Position cap: held positions plus open entry orders below
//!    `max_positions`.
//!
//! The gate holds no state. Everything it needs is passed in on each call.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::config::RiskConfig;
use crate::market::MarketCalendar;
use crate::types::DecisionOutcome;

// ---------------------------------------------------------------------------
// Rejection reasons
// ---------------------------------------------------------------------------

/// Why the gate refused the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    /// Weekly budget exhausted.
    WeeklyCapReached { used: u32, cap: u32 },
    /// Daily budget exhausted.
    DailyCapReached { used: u32, cap: u32 },
    MarketClosed,
    /// Open, but still inside the opening wait.
    TooSoonAfterOpen { minutes: i64, required: u32 },
    PositionCapReached { active: usize, cap: u32 },
}

impl GateRejection {
    /// The decision outcome recorded for each candidate skipped by this rejection.
    pub fn outcome(&self) -> DecisionOutcome {
        match self {
            GateRejection::WeeklyCapReached { .. } | GateRejection::DailyCapReached { .. } => {
                DecisionOutcome::SkippedDayTradeCap
            }
            GateRejection::MarketClosed | GateRejection::TooSoonAfterOpen { .. } => {
                DecisionOutcome::SkippedMarketClosed
            }
            GateRejection::PositionCapReached { .. } => DecisionOutcome::SkippedPositionCapReached,
        }
    }
}

impl fmt::Display for GateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateRejection::WeeklyCapReached { used, cap } => {
                write!(f, "weekly day-trade cap reached ({used}/{cap})")
            }
            GateRejection::DailyCapReached { used, cap } => {
                write!(f, "daily day-trade cap reached ({used}/{cap})")
            }
            GateRejection::MarketClosed => write!(f, "market closed"),
            GateRejection::TooSoonAfterOpen { minutes, required } => {
                write!(f, "{minutes} min since open, waiting for {required}")
            }
            GateRejection::PositionCapReached { active, cap } => {
                write!(f, "position cap reached ({active}/{cap})")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Counts the gate evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct GateInputs {
    pub now: DateTime<Utc>,
    pub open_positions: usize,
    pub open_entry_orders: usize,
    pub trades_used: u32,
    pub trades_today: u32,
}

/// Result of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Permitted {
        /// New positions that may still be opened this cycle.
        position_slots: usize,
        /// Entries the day-trade budget still allows this cycle.
        trade_slots: usize,
    },
    Rejected(GateRejection),
}

impl Verdict {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Verdict::Permitted { .. })
    }
}

pub struct RiskGate<'a> {
    config: &'a RiskConfig,
    calendar: &'a MarketCalendar,
}

impl<'a> RiskGate<'a> {
    pub fn new(config: &'a RiskConfig, calendar: &'a MarketCalendar) -> Self {
        Self { config, calendar }
    }

    pub fn evaluate(&self, inputs: &GateInputs) -> Verdict {
        let cfg = self.config;

        // 1. Day-trade budget
        let weekly_left = cfg.max_day_trades_per_week.saturating_sub(inputs.trades_used);
        if weekly_left == 0 {
            return Verdict::Rejected(GateRejection::WeeklyCapReached {
                used: inputs.trades_used,
                cap: cfg.max_day_trades_per_week,
            });
        }
        let mut trade_slots = weekly_left;
        if let Some(daily_cap) = cfg.max_day_trades_per_day {
            let daily_left = daily_cap.saturating_sub(inputs.trades_today);
            if daily_left == 0 {
                return Verdict::Rejected(GateRejection::DailyCapReached {
                    used: inputs.trades_today,
                    cap: daily_cap,
                });
            }
            trade_slots = trade_slots.min(daily_left);
        }

        // 2. Market window
        match self.calendar.minutes_since_open(inputs.now) {
            None => return Verdict::Rejected(GateRejection::MarketClosed),
            Some(minutes) if minutes < i64::from(cfg.minutes_after_open) => {
                return Verdict::Rejected(GateRejection::TooSoonAfterOpen {
                    minutes,
                    required: cfg.minutes_after_open,
                });
            }
            Some(_) => {}
        }

        // 3. Position cap
        let active = inputs.open_positions + inputs.open_entry_orders;
        let cap = cfg.max_positions as usize;
        if active >= cap {
            return Verdict::Rejected(GateRejection::PositionCapReached {
                active,
                cap: cfg.max_positions,
            });
        }

        Verdict::Permitted {
            position_slots: cap - active,
            trade_slots: trade_slots as usize,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // Tue 2026-01-13 (EST): open 14:30 UTC
    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 13, h, m, 0).unwrap()
    }

    fn inputs(now: DateTime<Utc>) -> GateInputs {
        GateInputs {
            now,
            open_positions: 0,
            open_entry_orders: 0,
            trades_used: 0,
            trades_today: 0,
        }
    }

    fn gate_verdict(cfg: &RiskConfig, i: &GateInputs) -> Verdict {
        let cal = MarketCalendar::us_equities();
        RiskGate::new(cfg, &cal).evaluate(i)
    }

    #[test]
    fn test_permitted_mid_session() {
        let cfg = RiskConfig::default();
        let v = gate_verdict(&cfg, &inputs(at(16, 0)));
        assert_eq!(
            v,
            Verdict::Permitted {
                position_slots: 3,
                trade_slots: 10
            }
        );
    }

    #[test]
    fn test_weekly_cap_blocks() {
        let cfg = RiskConfig::default();
        let mut i = inputs(at(16, 0));
        i.trades_used = 10;
        let v = gate_verdict(&cfg, &i);
        assert_eq!(
            v,
            Verdict::Rejected(GateRejection::WeeklyCapReached { used: 10, cap: 10 })
        );
    }

    #[test]
    fn test_daily_cap_blocks_and_limits_slots() {
        let cfg = RiskConfig {
            max_day_trades_per_day: Some(2),
            ..RiskConfig::default()
        };
        let mut i = inputs(at(16, 0));
        i.trades_today = 1;
        assert_eq!(
            gate_verdict(&cfg, &i),
            Verdict::Permitted {
                position_slots: 3,
                trade_slots: 1
            }
        );
        i.trades_today = 2;
        assert!(matches!(
            gate_verdict(&cfg, &i),
            Verdict::Rejected(GateRejection::DailyCapReached { .. })
        ));
    }

    #[test]
    fn test_opening_wait() {
        let cfg = RiskConfig::default();
        // 14 minutes after open
        let v = gate_verdict(&cfg, &inputs(at(14, 44)));
        assert_eq!(
            v,
            Verdict::Rejected(GateRejection::TooSoonAfterOpen {
                minutes: 14,
                required: 15
            })
        );
        assert_eq!(
            GateRejection::TooSoonAfterOpen {
                minutes: 14,
                required: 15
            }
            .outcome(),
            DecisionOutcome::SkippedMarketClosed
        );
        // exactly 15 minutes after open
        assert!(gate_verdict(&cfg, &inputs(at(14, 45))).is_permitted());
    }

    #[test]
    fn test_market_closed() {
        let cfg = RiskConfig::default();
        assert_eq!(
            gate_verdict(&cfg, &inputs(at(22, 0))),
            Verdict::Rejected(GateRejection::MarketClosed)
        );
    }

    #[test]
    fn test_position_cap_counts_entry_orders() {
        let cfg = RiskConfig::default();
        let mut i = inputs(at(16, 0));
        i.open_positions = 2;
        i.open_entry_orders = 1;
        assert_eq!(
            gate_verdict(&cfg, &i),
            Verdict::Rejected(GateRejection::PositionCapReached { active: 3, cap: 3 })
        );
        i.open_entry_orders = 0;
        assert_eq!(
            gate_verdict(&cfg, &i),
            Verdict::Permitted {
                position_slots: 1,
                trade_slots: 10
            }
        );
    }

    #[test]
    fn test_check_order_day_trade_first() {
        // Both the budget and the window fail: budget wins.
        let cfg = RiskConfig::default();
        let mut i = inputs(at(22, 0));
        i.trades_used = 10;
        i.open_positions = 5;
        assert_eq!(
            gate_verdict(&cfg, &i),
            Verdict::Rejected(GateRejection::WeeklyCapReached { used: 10, cap: 10 })
        );
    }

    #[test]
    fn test_rejection_outcomes() {
        assert_eq!(
            GateRejection::WeeklyCapReached { used: 1, cap: 1 }.outcome(),
            DecisionOutcome::SkippedDayTradeCap
        );
        assert_eq!(
            GateRejection::PositionCapReached { active: 3, cap: 3 }.outcome(),
            DecisionOutcome::SkippedPositionCapReached
        );
        assert_eq!(
            GateRejection::MarketClosed.to_string(),
            "market closed"
        );
    }
}
