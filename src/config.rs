//! Tunables for list synchronization and background task orchestration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::diff_cache::InvalidationPolicy;


/// Tunable settings, loadable from a JSON file.
///
/// Every field has a default, so a partial (or empty) JSON object is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a rebuild trigger must be quiet before a full rebuild happens.
    pub rebuild_debounce_ms: u64,
    /// How long the environment must stay unfavourable before a running
    /// background activity is actually stopped.
    pub stop_grace_period_ms: u64,
    /// Whether a newly-launched task starts its activity once right away,
    /// even if the environment signals say it shouldn't be running.
    pub initial_start: bool,
    pub invalidation: InvalidationPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rebuild_debounce_ms: 300,
            stop_grace_period_ms: 5_000,
            initial_start: true,
            invalidation: InvalidationPolicy::Exact,
        }
    }
}

impl SyncConfig {
    pub fn rebuild_debounce(&self) -> Duration {
        Duration::from_millis(self.rebuild_debounce_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Loads the config from the given JSON file.
    ///
    /// A missing file is not an error: the default config is returned instead.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let file_bytes = match tokio::fs::read(path).await {
            Ok(fb) => fb,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No sync config found, using default.");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&file_bytes) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded sync config.");
                Ok(config)
            }
            Err(e) => {
                error!(path = %path.display(), "Failed to deserialize sync config: {e}");
                Err(e.into())
            }
        }
    }
}
