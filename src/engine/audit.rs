//! Audit log.
//!
//! Every decision the loop makes becomes one `DecisionRecord`. The record is
//! rendered to the tracing log with its stable marker (`ENTERED`,
//! `SKIP_POSITION_CAP`, ...) and appended to the durable journal.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::storage::journal::DecisionJournal;
use crate::types::DecisionRecord;

#[derive(Clone)]
pub struct AuditLog {
    journal: Arc<dyn DecisionJournal>,
}

impl AuditLog {
    pub fn new(journal: Arc<dyn DecisionJournal>) -> Self {
        Self { journal }
    }

    /// Log and persist one record.
    ///
    /// A journal failure is logged but does not stop the loop; the tracing
    /// line has already been written by then.
    pub async fn record(&self, record: DecisionRecord) {
        let symbol = record.symbol.as_deref().unwrap_or("-");
        let marker = record.outcome.marker();
        if record.outcome.is_error() {
            warn!(
                cycle = record.cycle,
                marker,
                symbol,
                detail = %record.detail,
                "{record}"
            );
        } else {
            info!(
                cycle = record.cycle,
                marker,
                symbol,
                detail = %record.detail,
                "{record}"
            );
        }

        if let Err(e) = self.journal.append(&record).await {
            error!(error = %e, marker, symbol, "Failed to append decision to journal");
        }
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.journal.recent(limit).await
    }

    pub async fn trade_history(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.journal.trades(limit).await
    }
}
