//! Persistence layer.
//!
//! Two stores:
//! - small JSON state files (the weekly trade counter), written atomically
//!   via a temp file and rename so a crash never leaves a half-written file;
//! - the SQLite decision journal (`journal`).

pub mod journal;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::types::CaimeoError;

/// Save state to a JSON file, replacing any previous contents atomically.
pub fn save_state<T: Serialize>(state: &T, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to serialise state")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("Failed to write state to {tmp}"))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move state into place at {path}"))?;

    debug!(path, "State saved");
    Ok(())
}

/// Load state from a JSON file.
///
/// Returns `None` if the file doesn't exist (fresh start). A file that exists
/// but can't be read or parsed is `StateCorrupt`; callers must not treat it
/// as a fresh start.
pub fn load_state<T: DeserializeOwned>(path: &str) -> Result<Option<T>, CaimeoError> {
    if !Path::new(path).exists() {
        info!(path, "No saved state found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).map_err(|e| CaimeoError::StateCorrupt {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    let state = serde_json::from_str(&json).map_err(|e| CaimeoError::StateCorrupt {
        path: path.to_string(),
        reason: e.to_string(),
    })?;

    info!(path, "State loaded from disk");
    Ok(Some(state))
}

/// Delete the state file (for testing or reset).
pub fn delete_state(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to delete state file {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
