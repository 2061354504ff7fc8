//! Position sizing.
//!
//! Risk-per-trade sizing with a fixed stop distance:
//!
//! ```text
//! risk_dollars = equity × risk_pct
//! stop_dist    = last_price × stop_loss_pct
//! limit_price  = round2(last_price × (1 + slippage_pct))
//! quantity     = floor(min(risk_dollars / stop_dist, buying_power / limit_price))
//! ```
//!
//! A zero quantity means the entry is infeasible. Invalid inputs are an
//! error for that candidate and are never clamped into an order.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::debug;

use crate::config::RiskConfig;
use crate::types::CaimeoError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sizing parameters, as fractions (0.01 = 1%).
#[derive(Debug, Clone)]
pub struct SizerConfig {
    pub risk_per_trade: Decimal,
    pub stop_loss: Decimal,
    pub entry_slippage: Decimal,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.01),
            stop_loss: dec!(0.03),
            entry_slippage: dec!(0.003),
        }
    }
}

impl From<&RiskConfig> for SizerConfig {
    fn from(cfg: &RiskConfig) -> Self {
        Self {
            risk_per_trade: cfg.risk_per_trade_pct / dec!(100),
            stop_loss: cfg.stop_loss_pct / dec!(100),
            entry_slippage: cfg.entry_slippage_pct / dec!(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

/// Sized entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedEntry {
    pub quantity: u64,
    pub limit_price: Decimal,
    pub notional: Decimal,
}

impl SizedEntry {
    pub fn is_feasible(&self) -> bool {
        self.quantity > 0
    }
}

pub struct PositionSizer {
    config: SizerConfig,
}

impl PositionSizer {
    pub fn new(config: SizerConfig) -> Self {
        Self { config }
    }

    /// Limit price for an entry at `last_price`, rounded to cents.
    pub fn limit_price(&self, last_price: Decimal) -> Decimal {
        (last_price * (Decimal::ONE + self.config.entry_slippage))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn size(
        &self,
        equity: Decimal,
        buying_power: Decimal,
        last_price: Decimal,
    ) -> Result<SizedEntry, CaimeoError> {
        if last_price <= Decimal::ZERO {
            return Err(CaimeoError::Sizing(format!("non-positive price {last_price}")));
        }
        if buying_power < Decimal::ZERO {
            return Err(CaimeoError::Sizing(format!("negative buying power {buying_power}")));
        }
        if equity < Decimal::ZERO {
            return Err(CaimeoError::Sizing(format!("negative equity {equity}")));
        }
        if self.config.stop_loss <= Decimal::ZERO {
            return Err(CaimeoError::Sizing("stop loss must be positive".into()));
        }

        let limit_price = self.limit_price(last_price);
        if limit_price <= Decimal::ZERO {
            return Err(CaimeoError::Sizing(format!("limit price rounds to {limit_price}")));
        }

        let risk_dollars = equity * self.config.risk_per_trade;
        let stop_dist = last_price * self.config.stop_loss;
        let by_risk = risk_dollars / stop_dist;
        let by_cash = buying_power / limit_price;

        let quantity = by_risk.min(by_cash).floor().to_u64().unwrap_or(0);

        debug!(
            last_price = %last_price,
            limit_price = %limit_price,
            by_risk = %by_risk.round_dp(2),
            by_cash = %by_cash.round_dp(2),
            quantity,
            "Position sized"
        );

        Ok(SizedEntry {
            quantity,
            limit_price,
            notional: limit_price * Decimal::from(quantity),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
