//! Clock and market calendar.
//!
//! The calendar answers two questions for the risk gate: is the regular
//! session open right now, and how many minutes ago did it open. It holds a
//! read-only schedule (session hours, exchange UTC offset, holidays) and no
//! other state. Time itself comes from an injectable [`Clock`] so the loop
//! can be driven deterministically in tests.

use anyhow::{Context, Result};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc, Weekday,
};
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::config::MarketConfig;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// A regular trading session, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

/// Weekday session schedule for a single exchange.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    open: NaiveTime,
    close: NaiveTime,
    standard_offset_hours: i32,
    us_daylight_saving: bool,
    holidays: BTreeSet<NaiveDate>,
}

impl MarketCalendar {
    /// NYSE/Nasdaq regular hours, 09:30–16:00 US Eastern.
    pub fn us_equities() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            standard_offset_hours: -5,
            us_daylight_saving: true,
            holidays: BTreeSet::new(),
        }
    }

    pub fn from_config(cfg: &MarketConfig) -> Result<Self> {
        let open = NaiveTime::parse_from_str(&cfg.open, "%H:%M")
            .with_context(|| format!("Invalid market open time: {}", cfg.open))?;
        let close = NaiveTime::parse_from_str(&cfg.close, "%H:%M")
            .with_context(|| format!("Invalid market close time: {}", cfg.close))?;
        if close <= open {
            anyhow::bail!("Market close {} must be after open {}", cfg.close, cfg.open);
        }
        if !(-12..=14).contains(&cfg.utc_offset_hours) {
            anyhow::bail!("utc_offset_hours out of range: {}", cfg.utc_offset_hours);
        }
        let holidays = cfg
            .holidays
            .iter()
            .map(|d| {
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("Invalid holiday date: {d}"))
            })
            .collect::<Result<BTreeSet<_>>>()?;

        Ok(Self {
            open,
            close,
            standard_offset_hours: cfg.utc_offset_hours,
            us_daylight_saving: cfg.us_daylight_saving,
            holidays,
        })
    }

    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    /// Exchange UTC offset in effect at `at`.
    pub fn offset_at(&self, at: DateTime<Utc>) -> FixedOffset {
        let standard = self.standard_offset_hours * 3600;
        let seconds = if self.us_daylight_saving && in_us_dst(at, standard) {
            standard + 3600
        } else {
            standard
        };
        FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
    }

    /// Exchange-local calendar date of `at`.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset_at(at)).date_naive()
    }

    /// Monday of the week containing `date`.
    pub fn week_start(date: NaiveDate) -> NaiveDate {
        date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// The regular session on `date`, if the exchange trades that day.
    pub fn session(&self, date: NaiveDate) -> Option<Session> {
        if !self.is_trading_day(date) {
            return None;
        }
        Some(Session {
            open: self.local_to_utc(date.and_time(self.open)),
            close: self.local_to_utc(date.and_time(self.close)),
        })
    }

    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        self.session(self.local_date(at))
            .map(|s| at >= s.open && at < s.close)
            .unwrap_or(false)
    }

    /// Whole minutes since today's open, or `None` while the market is closed.
    pub fn minutes_since_open(&self, at: DateTime<Utc>) -> Option<i64> {
        let session = self.session(self.local_date(at))?;
        if at < session.open || at >= session.close {
            return None;
        }
        Some((at - session.open).num_minutes())
    }

    fn local_to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        // Sessions never straddle the 02:00 switch, so the offset at the
        // standard-time interpretation is the one in effect.
        let standard = Duration::seconds(i64::from(self.standard_offset_hours) * 3600);
        let guess = Utc.from_utc_datetime(&(local - standard));
        let offset = self.offset_at(guess);
        Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset.local_minus_utc()))))
    }
}

/// US rule: DST from the second Sunday of March 02:00 local standard time
/// to the first Sunday of November 02:00 local daylight time.
fn in_us_dst(at: DateTime<Utc>, standard_offset_secs: i32) -> bool {
    let local_standard = at.naive_utc() + Duration::seconds(i64::from(standard_offset_secs));
    let year = local_standard.year();
    let (Some(start_day), Some(end_day)) = (
        nth_weekday(year, 3, Weekday::Sun, 2),
        nth_weekday(year, 11, Weekday::Sun, 1),
    ) else {
        return false;
    };
    let two_am = NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN);
    let start = start_day.and_time(two_am);
    // 02:00 daylight time is 01:00 standard time
    let end = end_day.and_time(two_am) - Duration::hours(1);
    local_standard >= start && local_standard < end
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n as u8)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_winter_session_hours() {
        let cal = MarketCalendar::us_equities();
        // Tue 2026-01-13, EST: open 14:30 UTC
        let session = cal.session(NaiveDate::from_ymd_opt(2026, 1, 13).unwrap()).unwrap();
        assert_eq!(session.open, utc(2026, 1, 13, 14, 30));
        assert_eq!(session.close, utc(2026, 1, 13, 21, 0));
    }

    #[test]
    fn test_summer_session_hours() {
        let cal = MarketCalendar::us_equities();
        // Wed 2026-07-15, EDT: open 13:30 UTC
        let session = cal.session(NaiveDate::from_ymd_opt(2026, 7, 15).unwrap()).unwrap();
        assert_eq!(session.open, utc(2026, 7, 15, 13, 30));
        assert_eq!(session.close, utc(2026, 7, 15, 20, 0));
    }

    #[test]
    fn test_dst_boundaries_2026() {
        let cal = MarketCalendar::us_equities();
        // DST starts Sun 2026-03-08, ends Sun 2026-11-01
        assert_eq!(cal.offset_at(utc(2026, 3, 6, 15, 0)).local_minus_utc(), -5 * 3600);
        assert_eq!(cal.offset_at(utc(2026, 3, 9, 15, 0)).local_minus_utc(), -4 * 3600);
        assert_eq!(cal.offset_at(utc(2026, 10, 30, 15, 0)).local_minus_utc(), -4 * 3600);
        assert_eq!(cal.offset_at(utc(2026, 11, 2, 15, 0)).local_minus_utc(), -5 * 3600);
    }

    #[test]
    fn test_is_open_and_minutes_since_open() {
        let cal = MarketCalendar::us_equities();
        let before = utc(2026, 1, 13, 14, 29);
        let at_open = utc(2026, 1, 13, 14, 30);
        let later = utc(2026, 1, 13, 14, 44);
        let after_close = utc(2026, 1, 13, 21, 0);

        assert!(!cal.is_open(before));
        assert_eq!(cal.minutes_since_open(before), None);
        assert!(cal.is_open(at_open));
        assert_eq!(cal.minutes_since_open(at_open), Some(0));
        assert_eq!(cal.minutes_since_open(later), Some(14));
        assert!(!cal.is_open(after_close));
    }

    #[test]
    fn test_weekend_and_holiday_closed() {
        let cal = MarketCalendar::us_equities()
            .with_holiday(NaiveDate::from_ymd_opt(2026, 12, 25).unwrap());
        // Saturday
        assert!(!cal.is_open(utc(2026, 1, 17, 16, 0)));
        // Christmas, a Friday
        assert!(!cal.is_open(utc(2026, 12, 25, 16, 0)));
        assert!(cal.is_open(utc(2026, 12, 24, 16, 0)));
    }

    #[test]
    fn test_local_date_uses_exchange_offset() {
        let cal = MarketCalendar::us_equities();
        // 03:00 UTC Tuesday is still Monday evening in New York
        assert_eq!(
            cal.local_date(utc(2026, 1, 13, 3, 0)),
            NaiveDate::from_ymd_opt(2026, 1, 12).unwrap()
        );
    }

    #[test]
    fn test_week_start_is_monday() {
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let monday = NaiveDate::from_ymd_opt(2026, 10, 12).unwrap();
        assert_eq!(MarketCalendar::week_start(sunday), monday);
        assert_eq!(MarketCalendar::week_start(monday), monday);
    }

    #[test]
    fn test_from_config() {
        let cfg = MarketConfig {
            holidays: vec!["2026-07-03".into()],
            ..MarketConfig::default()
        };
        let cal = MarketCalendar::from_config(&cfg).unwrap();
        assert!(!cal.is_trading_day(NaiveDate::from_ymd_opt(2026, 7, 3).unwrap()));

        let bad = MarketConfig {
            open: "16:00".into(),
            close: "09:30".into(),
            ..MarketConfig::default()
        };
        assert!(MarketCalendar::from_config(&bad).is_err());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc(2026, 1, 13, 14, 30));
        clock.advance(Duration::minutes(20));
        assert_eq!(clock.now(), utc(2026, 1, 13, 14, 50));
        clock.set(utc(2026, 2, 1, 0, 0));
        assert_eq!(clock.now(), utc(2026, 2, 1, 0, 0));
    }
}
