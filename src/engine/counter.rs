//! Weekly day-trade counter.
//!
//! Counts entries per exchange-local week (Monday start), and per day when a
//! daily cap is in force. Rollover is applied before every read and every
//! increment, so a stale week is never counted against the new one.
//!
//! Every mutation is written through to the store before it is reported as
//! done. A store that can't be read or written is fatal to the loop.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::market::MarketCalendar;
use crate::storage;
use crate::types::CaimeoError;

// ---------------------------------------------------------------------------
// Counter state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyTradeCounter {
    pub week_start: NaiveDate,
    pub trades_used: u32,
    pub cap: u32,
    #[serde(default)]
    pub day: Option<NaiveDate>,
    #[serde(default)]
    pub trades_today: u32,
}

impl WeeklyTradeCounter {
    pub fn new(today: NaiveDate, cap: u32) -> Self {
        Self {
            week_start: MarketCalendar::week_start(today),
            trades_used: 0,
            cap,
            day: Some(today),
            trades_today: 0,
        }
    }

    /// Reset counts that belong to an earlier week or day. Returns true if
    /// anything changed.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        let mut changed = false;
        let week = MarketCalendar::week_start(today);
        if week != self.week_start {
            info!(
                previous_week = %self.week_start,
                week = %week,
                trades_used = self.trades_used,
                "New trading week, day-trade counter reset"
            );
            self.week_start = week;
            self.trades_used = 0;
            changed = true;
        }
        if self.day != Some(today) {
            self.day = Some(today);
            self.trades_today = 0;
            changed = true;
        }
        changed
    }

    pub fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.trades_used)
    }

    /// Count one submitted entry. Refuses to go past the cap.
    pub fn increment(&mut self) -> Result<(), CaimeoError> {
        if self.trades_used >= self.cap {
            return Err(CaimeoError::Config(format!(
                "day-trade cap {} already reached",
                self.cap
            )));
        }
        self.trades_used += 1;
        self.trades_today += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Durable home of the counter.
pub trait CounterStore: Send + Sync {
    /// `Ok(None)` for a fresh start. Unreadable state is `StateCorrupt`.
    fn load(&self) -> Result<Option<WeeklyTradeCounter>, CaimeoError>;

    fn save(&self, counter: &WeeklyTradeCounter) -> Result<()>;
}

impl<S: CounterStore + ?Sized> CounterStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<WeeklyTradeCounter>, CaimeoError> {
        (**self).load()
    }

    fn save(&self, counter: &WeeklyTradeCounter) -> Result<()> {
        (**self).save(counter)
    }
}

/// JSON file store.
pub struct FileCounterStore {
    path: String,
}

impl FileCounterStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl CounterStore for FileCounterStore {
    fn load(&self) -> Result<Option<WeeklyTradeCounter>, CaimeoError> {
        storage::load_state(&self.path)
    }

    fn save(&self, counter: &WeeklyTradeCounter) -> Result<()> {
        storage::save_state(counter, &self.path)
    }
}

/// In-memory store, with switches to simulate corruption and write failures.
#[derive(Default)]
pub struct MemoryCounterStore {
    state: Mutex<Option<WeeklyTradeCounter>>,
    corrupt: Mutex<bool>,
    fail_writes: Mutex<bool>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(counter: WeeklyTradeCounter) -> Self {
        let store = Self::default();
        if let Ok(mut s) = store.state.lock() {
            *s = Some(counter);
        }
        store
    }

    pub fn set_corrupt(&self, corrupt: bool) {
        if let Ok(mut c) = self.corrupt.lock() {
            *c = corrupt;
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut f) = self.fail_writes.lock() {
            *f = fail;
        }
    }

    pub fn stored(&self) -> Option<WeeklyTradeCounter> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

impl CounterStore for MemoryCounterStore {
    fn load(&self) -> Result<Option<WeeklyTradeCounter>, CaimeoError> {
        if self.corrupt.lock().map(|c| *c).unwrap_or(false) {
            return Err(CaimeoError::StateCorrupt {
                path: "memory".into(),
                reason: "simulated corruption".into(),
            });
        }
        Ok(self.stored())
    }

    fn save(&self, counter: &WeeklyTradeCounter) -> Result<()> {
        if self.fail_writes.lock().map(|f| *f).unwrap_or(false) {
            anyhow::bail!("simulated write failure");
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory counter store poisoned"))?;
        *state = Some(counter.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trade counter
// ---------------------------------------------------------------------------

/// The loop's handle on the counter: loaded state plus its store.
pub struct TradeCounter {
    counter: WeeklyTradeCounter,
    store: Box<dyn CounterStore>,
}

impl TradeCounter {
    /// A counter that has not read its store yet. Call `reload` before use.
    pub fn new(store: Box<dyn CounterStore>, cap: u32, today: NaiveDate) -> Self {
        Self {
            counter: WeeklyTradeCounter::new(today, cap),
            store,
        }
    }

    /// Load from the store, or start a new week if there is nothing stored.
    pub fn load(
        store: Box<dyn CounterStore>,
        cap: u32,
        today: NaiveDate,
    ) -> Result<Self, CaimeoError> {
        let mut counter = Self::new(store, cap, today);
        counter.reload(today)?;
        Ok(counter)
    }

    /// Re-read state from the store. Never assumes zero when state exists.
    ///
    /// The configured cap always wins over a stored one. Counts held in
    /// memory for the same week are never lowered: a write that failed
    /// earlier is written again here, and a failure to do so is an error.
    pub fn reload(&mut self, today: NaiveDate) -> Result<(), CaimeoError> {
        let cap = self.counter.cap;
        let (merged, behind) = match self.store.load()? {
            Some(mut stored) => {
                if stored.cap != cap {
                    warn!(
                        stored_cap = stored.cap,
                        cap, "Configured day-trade cap differs from stored; using configured"
                    );
                    stored.cap = cap;
                }
                let behind = merge_unsaved(&mut stored, &self.counter);
                info!(
                    week_start = %stored.week_start,
                    trades_used = stored.trades_used,
                    cap,
                    "Day-trade counter loaded"
                );
                (stored, behind)
            }
            None => {
                let mut fresh = WeeklyTradeCounter::new(today, cap);
                let behind = merge_unsaved(&mut fresh, &self.counter);
                (fresh, behind)
            }
        };
        self.counter = merged;

        if behind {
            warn!(
                trades_used = self.counter.trades_used,
                "Stored day-trade counter was behind; writing it again"
            );
            self.store.save(&self.counter).map_err(|e| {
                CaimeoError::Storage(format!("counter write failed: {e:#}"))
            })?;
        }
        Ok(())
    }

    /// Current counts for `today`, applying and persisting any rollover.
    pub fn current(&mut self, today: NaiveDate) -> Result<&WeeklyTradeCounter> {
        if self.counter.roll_over(today) {
            self.persist()?;
        }
        Ok(&self.counter)
    }

    /// Count one submitted entry at `now` and write it through.
    pub fn record_trade(&mut self, now: DateTime<Utc>, calendar: &MarketCalendar) -> Result<u32> {
        let today = calendar.local_date(now);
        self.counter.roll_over(today);
        self.counter.increment()?;
        self.persist()?;
        info!(
            trades_used = self.counter.trades_used,
            cap = self.counter.cap,
            trades_today = self.counter.trades_today,
            "Day trade recorded"
        );
        Ok(self.counter.trades_used)
    }

    pub fn snapshot(&self) -> WeeklyTradeCounter {
        self.counter.clone()
    }

    fn persist(&self) -> Result<()> {
        self.store.save(&self.counter).map_err(|e| {
            anyhow::Error::new(CaimeoError::Storage(format!("counter write failed: {e:#}")))
        })
    }
}

/// Raise `stored` to the counts held in memory for the same or a later week.
/// Returns true if `stored` was behind.
fn merge_unsaved(stored: &mut WeeklyTradeCounter, held: &WeeklyTradeCounter) -> bool {
    if held.week_start > stored.week_start && held.trades_used > 0 {
        *stored = held.clone();
        return true;
    }
    if stored.week_start != held.week_start {
        return false;
    }
    let mut behind = false;
    if held.trades_used > stored.trades_used {
        stored.trades_used = held.trades_used;
        behind = true;
    }
    if stored.day == held.day && held.trades_today > stored.trades_today {
        stored.trades_today = held.trades_today;
        behind = true;
    }
    behind
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
