use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted between runs: `in/state.json` on the way in, `out/state.json` on the way out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, u64>,
}

impl RunState {
    /// A missing or unreadable file yields the default state.
    pub fn load(path: &Path) -> RunState {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return RunState::default(),
            Err(err) => {
                warn!(target = "extractor.state", path = %path.display(), error = %err, "state unreadable, starting fresh");
                return RunState::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(target = "extractor.state", path = %path.display(), error = %err, "state malformed, starting fresh");
                RunState::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!(target = "extractor.state", path = %path.display(), "state written");
        Ok(())
    }
}
