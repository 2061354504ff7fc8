//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` (every field has a default, so the file is optional)
//! and then applies the environment-level knobs operators are used to
//! setting directly: `MAX_DAY_TRADES_PER_WEEK`, `MAX_POSITIONS`,
//! `MINUTES_AFTER_OPEN`, `TRADE_POLL_SEC` and friends. Secrets are
//! referenced by env-var name and resolved at runtime.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::types::{CaimeoError, ConfidenceGrade};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub risk: RiskConfig,
    pub market: MarketConfig,
    pub brokerage: BrokerageConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Seconds between cycles.
    pub poll_interval_secs: u64,
    /// Route orders to the in-memory paper brokerage instead of Alpaca.
    pub dry_run: bool,
    /// Starting equity for the paper brokerage.
    pub paper_equity: Decimal,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "CAIMEO".to_string(),
            poll_interval_secs: 60,
            dry_run: true,
            paper_equity: dec!(100000),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    pub max_day_trades_per_week: u32,
    /// Optional per-day entry cap on top of the weekly one.
    pub max_day_trades_per_day: Option<u32>,
    pub max_positions: u32,
    pub minutes_after_open: u32,
    /// Percent of equity risked per trade.
    pub risk_per_trade_pct: Decimal,
    /// Stop distance used for sizing, percent of price.
    pub stop_loss_pct: Decimal,
    /// Limit price offset above last, percent.
    pub entry_slippage_pct: Decimal,
    /// Weakest grade allowed to enter. Never looser than C.
    pub min_confidence: String,
    pub attach_exits: bool,
    pub trail_stop_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_day_trades_per_week: 10,
            max_day_trades_per_day: None,
            max_positions: 3,
            minutes_after_open: 15,
            risk_per_trade_pct: dec!(1.0),
            stop_loss_pct: dec!(3.0),
            entry_slippage_pct: dec!(0.3),
            min_confidence: "C".to_string(),
            attach_exits: true,
            trail_stop_pct: dec!(6.0),
        }
    }
}

impl RiskConfig {
    pub fn min_grade(&self) -> Result<ConfidenceGrade, CaimeoError> {
        ConfidenceGrade::from_str(&self.min_confidence)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    /// Regular session open, exchange local time ("HH:MM").
    pub open: String,
    /// Regular session close, exchange local time ("HH:MM").
    pub close: String,
    /// Standard-time UTC offset of the exchange, in hours.
    pub utc_offset_hours: i32,
    /// Apply the US daylight-saving rule on top of `utc_offset_hours`.
    pub us_daylight_saving: bool,
    /// Full-day closures ("YYYY-MM-DD").
    pub holidays: Vec<String>,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            open: "09:30".to_string(),
            close: "16:00".to_string(),
            utc_offset_hours: -5,
            us_daylight_saving: true,
            holidays: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerageConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub api_secret_env: String,
    /// Upper bound on any single brokerage call.
    pub timeout_secs: u64,
}

impl Default for BrokerageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://paper-api.alpaca.markets".to_string(),
            api_key_env: "APCA_API_KEY_ID".to_string(),
            api_secret_env: "APCA_API_SECRET_KEY".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// JSON file written by the discovery pipeline.
    pub file: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            file: "discovered_full.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Weekly trade counter state file.
    pub counter_file: String,
    /// SQLite decision journal.
    pub journal_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            counter_file: "caimeo_counter.json".to_string(),
            journal_url: "sqlite://caimeo_journal.db".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8000,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load the file if present, fall back to defaults otherwise, then
    /// apply environment overrides and validate.
    pub fn load_or_default(path: &str) -> Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// `load_or_default` with the environment lookup supplied by the caller.
    pub fn load_with<F>(path: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if Path::new(path).exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-level overrides. `lookup` is injectable so tests
    /// don't have to mutate the process environment.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let risk = &mut self.risk;
        override_parsed(&lookup, "MAX_DAY_TRADES_PER_WEEK", &mut risk.max_day_trades_per_week)?;
        if let Some(raw) = lookup("MAX_DAY_TRADES_PER_DAY") {
            let value: u32 = parse_env("MAX_DAY_TRADES_PER_DAY", &raw)?;
            risk.max_day_trades_per_day = Some(value);
        }
        override_parsed(&lookup, "MAX_POSITIONS", &mut risk.max_positions)?;
        override_parsed(&lookup, "MINUTES_AFTER_OPEN", &mut risk.minutes_after_open)?;
        override_parsed(&lookup, "RISK_PER_TRADE_PCT", &mut risk.risk_per_trade_pct)?;
        override_parsed(&lookup, "STOP_LOSS_PCT", &mut risk.stop_loss_pct)?;
        override_parsed(&lookup, "ENTRY_SLIPPAGE_PCT", &mut risk.entry_slippage_pct)?;
        override_parsed(&lookup, "TRAIL_STOP_PCT", &mut risk.trail_stop_pct)?;
        if let Some(raw) = lookup("MIN_TRADE_CONFIDENCE") {
            risk.min_confidence = raw.trim().to_uppercase();
        }

        override_parsed(&lookup, "TRADE_POLL_SEC", &mut self.agent.poll_interval_secs)?;
        if let Some(raw) = lookup("DRY_RUN") {
            self.agent.dry_run = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup("DISCOVERED_FILE") {
            self.discovery.file = raw;
        }
        if let Some(raw) = lookup("APCA_API_BASE_URL") {
            self.brokerage.base_url = raw;
        }
        Ok(())
    }

    /// Reject configurations the loop cannot run safely with.
    pub fn validate(&self) -> Result<(), CaimeoError> {
        let risk = &self.risk;
        if risk.max_day_trades_per_week == 0 {
            return Err(CaimeoError::Config("max_day_trades_per_week must be > 0".into()));
        }
        if risk.max_day_trades_per_day == Some(0) {
            return Err(CaimeoError::Config("max_day_trades_per_day must be > 0 when set".into()));
        }
        if risk.max_positions == 0 {
            return Err(CaimeoError::Config("max_positions must be > 0".into()));
        }
        for (name, value) in [
            ("risk_per_trade_pct", risk.risk_per_trade_pct),
            ("stop_loss_pct", risk.stop_loss_pct),
            ("trail_stop_pct", risk.trail_stop_pct),
        ] {
            if value <= Decimal::ZERO || value > dec!(100) {
                return Err(CaimeoError::Config(format!("{name} must be in (0, 100], got {value}")));
            }
        }
        if risk.entry_slippage_pct < Decimal::ZERO || risk.entry_slippage_pct > dec!(10) {
            return Err(CaimeoError::Config(format!(
                "entry_slippage_pct must be in [0, 10], got {}",
                risk.entry_slippage_pct
            )));
        }
        if !risk.min_grade()?.is_entry_grade() {
            return Err(CaimeoError::Config(format!(
                "min_confidence {} would admit D/F candidates",
                risk.min_confidence
            )));
        }
        if self.agent.poll_interval_secs == 0 {
            return Err(CaimeoError::Config("poll_interval_secs must be > 0".into()));
        }
        if self.brokerage.timeout_secs == 0 {
            return Err(CaimeoError::Config("brokerage.timeout_secs must be > 0".into()));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value for {name}={raw:?}: {e}"))
}

fn override_parsed<T, F>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = parse_env(name, &raw)?;
    }
    Ok(())
}
