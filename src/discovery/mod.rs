//! Candidate feed.
//!
//! The discovery pipeline runs out of process and writes its ranked output to
//! a JSON file. This module reads that file each cycle and turns it into
//! `Candidate`s. Accepted shapes:
//!
//! ```json
//! {"symbols": [{"symbol": "AAPL", "confidence": "A", "last_price": 190.0}],
//!  "progress": {"current": 40, "total": 40, "percent": 100.0, "eta": "0s", "status": "Complete"}}
//! ```
//!
//! or a bare list of rows. `last` is accepted in place of `last_price`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{Candidate, CandidateMetrics, ConfidenceGrade, DiscoveryProgress};

// ---------------------------------------------------------------------------
// Feed contract
// ---------------------------------------------------------------------------

/// One read of the discovery output.
#[derive(Debug, Clone, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    pub progress: DiscoveryProgress,
    /// Rows dropped for a missing symbol, missing price or unknown grade.
    pub dropped: usize,
}

/// Source of ranked candidates for the decision loop.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CandidateFeed: Send + Sync {
    /// An empty batch is a valid answer; `Err` means the feed itself failed.
    async fn fetch_candidates(&self) -> Result<CandidateBatch>;

    /// Last known pipeline progress.
    fn progress(&self) -> DiscoveryProgress;
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DiscoveryFile {
    Bare(Vec<serde_json::Value>),
    Wrapped {
        #[serde(default)]
        symbols: Vec<serde_json::Value>,
        #[serde(default)]
        progress: Option<DiscoveryProgress>,
    },
}

#[derive(Debug, Deserialize)]
struct DiscoveryRow {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default, alias = "grade")]
    confidence: Option<String>,
    #[serde(default, alias = "last")]
    last_price: Option<f64>,
    #[serde(default)]
    eps_growth: Option<f64>,
    #[serde(default)]
    revenue_growth: Option<f64>,
    #[serde(default)]
    pe: Option<f64>,
    #[serde(default)]
    growth: Option<f64>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    strategy: Option<String>,
}

fn to_decimal(v: Option<f64>) -> Option<Decimal> {
    v.and_then(|f| Decimal::try_from(f).ok())
}

impl DiscoveryRow {
    fn into_candidate(self) -> Option<Candidate> {
        let symbol = self.symbol?.trim().to_uppercase();
        if symbol.is_empty() {
            return None;
        }
        let grade = ConfidenceGrade::from_str(self.confidence.as_deref()?).ok()?;
        let last_price = to_decimal(self.last_price)?;

        Some(Candidate {
            symbol,
            grade,
            last_price,
            metrics: CandidateMetrics {
                eps_growth_pct: to_decimal(self.eps_growth),
                revenue_growth_pct: to_decimal(self.revenue_growth),
                pe: to_decimal(self.pe),
                growth_pct: to_decimal(self.growth),
            },
            score: to_decimal(self.score),
            strategy: self.strategy,
        })
    }
}

/// Parse discovery output. Rows that don't yield a candidate are counted,
/// not fatal; a document that is not JSON at all is an error.
pub fn parse_discovery(json: &str) -> Result<CandidateBatch> {
    let file: DiscoveryFile =
        serde_json::from_str(json).context("Failed to parse discovery output")?;

    let (rows, progress) = match file {
        DiscoveryFile::Wrapped { symbols, progress } => (symbols, progress),
        DiscoveryFile::Bare(rows) => (rows, None),
    };

    let total = rows.len();
    let candidates: Vec<Candidate> = rows
        .into_iter()
        .filter_map(|v| serde_json::from_value::<DiscoveryRow>(v).ok())
        .filter_map(DiscoveryRow::into_candidate)
        .collect();
    let dropped = total - candidates.len();

    let progress = progress.unwrap_or_else(|| DiscoveryProgress {
        current: total as u64,
        total: total as u64,
        percent: 100.0,
        eta: "0s".to_string(),
        status: "Complete".to_string(),
    });

    Ok(CandidateBatch {
        candidates,
        progress,
        dropped,
    })
}

// ---------------------------------------------------------------------------
// File-backed feed
// ---------------------------------------------------------------------------

/// Reads the discovery file on every fetch.
pub struct FileCandidateFeed {
    path: PathBuf,
    last_progress: Mutex<DiscoveryProgress>,
}

impl FileCandidateFeed {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_progress: Mutex::new(DiscoveryProgress::default()),
        }
    }

    fn remember(&self, progress: &DiscoveryProgress) {
        if let Ok(mut last) = self.last_progress.lock() {
            *last = progress.clone();
        }
    }
}

#[async_trait]
impl CandidateFeed for FileCandidateFeed {
    async fn fetch_candidates(&self) -> Result<CandidateBatch> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Pipeline hasn't produced anything yet.
                debug!(path = %self.path.display(), "Discovery file not found");
                let batch = CandidateBatch::default();
                self.remember(&batch.progress);
                return Ok(batch);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read discovery file {}", self.path.display())
                })
            }
        };

        let batch = parse_discovery(&json)
            .with_context(|| format!("Bad discovery file {}", self.path.display()))?;

        if batch.dropped > 0 {
            warn!(
                path = %self.path.display(),
                dropped = batch.dropped,
                "Discovery rows without symbol, price or a known grade were ignored"
            );
        }
        info!(
            candidates = batch.candidates.len(),
            status = %batch.progress.status,
            "Discovery candidates loaded"
        );

        self.remember(&batch.progress);
        Ok(batch)
    }

    fn progress(&self) -> DiscoveryProgress {
        self.last_progress
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
