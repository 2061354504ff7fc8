//! Decision journal.
//!
//! Append-only store for `DecisionRecord`s. The SQLite implementation keeps
//! one `decisions` table; the memory implementation backs tests and runs
//! without a database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::info;

use crate::types::{DecisionOutcome, DecisionRecord};

#[async_trait]
pub trait DecisionJournal: Send + Sync {
    async fn append(&self, record: &DecisionRecord) -> Result<()>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>>;

    /// Newest first, restricted to outcomes that placed orders.
    async fn trades(&self, limit: usize) -> Result<Vec<DecisionRecord>>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

pub struct SqliteJournal {
    pool: SqlitePool,
}

impl SqliteJournal {
    /// Open (creating if missing) the journal at `url`, e.g.
    /// `sqlite://caimeo_journal.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid journal url: {url}"))?
            .create_if_missing(true);

        // A single connection keeps `:memory:` databases shared and writes serial.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open journal {url}"))?;

        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS decisions(
                    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
                    timestamp TEXT NOT NULL,
                    cycle INTEGER NOT NULL,
                    symbol TEXT,
                    outcome TEXT NOT NULL,
                    detail TEXT NOT NULL
                );
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create decisions table")?;

        info!(url, "Decision journal ready");
        Ok(Self { pool })
    }

    async fn select(&self, trades_only: bool, limit: usize) -> Result<Vec<DecisionRecord>> {
        let result = if trades_only {
            let trade_outcomes: Vec<&str> = DecisionOutcome::ALL
                .iter()
                .filter(|o| o.is_trade())
                .map(|o| o.as_str())
                .collect();
            let placeholders = vec!["?"; trade_outcomes.len()].join(", ");
            let sql = format!(
                "SELECT timestamp, cycle, symbol, outcome, detail FROM decisions \
                 WHERE outcome IN ({placeholders}) ORDER BY id DESC LIMIT ?"
            );
            let mut query = sqlx::query(&sql);
            for outcome in trade_outcomes {
                query = query.bind(outcome);
            }
            query.bind(limit as i64).fetch_all(&self.pool).await
        } else {
            sqlx::query(
                "SELECT timestamp, cycle, symbol, outcome, detail FROM decisions \
                 ORDER BY id DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        };
        let rows = result.context("Failed to query decisions")?;

        rows.iter()
            .map(|row| -> Result<DecisionRecord> {
                let timestamp: String = row.try_get("timestamp")?;
                let cycle: i64 = row.try_get("cycle")?;
                let outcome: String = row.try_get("outcome")?;
                Ok(DecisionRecord {
                    timestamp: DateTime::parse_from_rfc3339(&timestamp)
                        .with_context(|| format!("Bad journal timestamp {timestamp}"))?
                        .with_timezone(&Utc),
                    cycle: u64::try_from(cycle).unwrap_or(0),
                    symbol: row.try_get("symbol")?,
                    outcome: outcome.parse()?,
                    detail: row.try_get("detail")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DecisionJournal for SqliteJournal {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO decisions (timestamp, cycle, symbol, outcome, detail) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(i64::try_from(record.cycle).unwrap_or(i64::MAX))
        .bind(record.symbol.as_deref())
        .bind(record.outcome.as_str())
        .bind(&record.detail)
        .execute(&self.pool)
        .await
        .context("Failed to append decision")?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.select(false, limit).await
    }

    async fn trades(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        self.select(true, limit).await
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, oldest first.
    pub async fn all(&self) -> Vec<DecisionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DecisionJournal for MemoryJournal {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    async fn trades(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.outcome.is_trade())
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
