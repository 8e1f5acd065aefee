//! The persisted key set: which resources were cached when the process last saved its state.
//!
//! Only keys are persisted, never the resources themselves. After a cold start,
//! each key is restored through the resource cache's regular restore path.

use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{error, info};

use crate::errors::PersistenceError;

/// The current version of the persisted key set format.
pub const PERSISTED_KEYS_VERSION: u32 = 1;

/// A versioned set of keys, serialized as `{"version":1,"keys":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedKeys<K> {
    pub version: u32,
    pub keys: Vec<K>,
}

/// Used to check the version before trying to understand the rest of the blob.
#[derive(Deserialize)]
struct VersionOnly {
    version: u32,
}

impl<K> PersistedKeys<K> {
    pub fn new(keys: Vec<K>) -> Self {
        Self { version: PERSISTED_KEYS_VERSION, keys }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError>
    where
        K: Serialize,
    {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(blob: &str) -> Result<Self, PersistenceError>
    where
        K: DeserializeOwned,
    {
        let VersionOnly { version } = serde_json::from_str(blob)?;
        if version != PERSISTED_KEYS_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: version,
                expected: PERSISTED_KEYS_VERSION,
            });
        }
        Ok(serde_json::from_str(blob)?)
    }
}

/// Saves the given key set to `path`, replacing any previous file atomically.
pub async fn save_keys_to_file<K: Serialize>(
    path: &Path,
    keys: &PersistedKeys<K>,
) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, keys.to_json()?).await?;
    tokio::fs::rename(&temp_path, path).await?;
    info!(path = %path.display(), count = keys.keys.len(), "Saved persisted key set.");
    Ok(())
}

/// Loads the key set from `path`.
///
/// A missing file yields an empty key set. An unreadable one is moved aside to
/// a `.json.bak` file (so that it isn't lost, but doesn't fail every future start either)
/// and an empty key set is returned.
pub async fn load_keys_from_file<K: DeserializeOwned>(
    path: &Path,
) -> Result<PersistedKeys<K>, PersistenceError> {
    let blob = match tokio::fs::read_to_string(path).await {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No persisted key set found, starting empty.");
            return Ok(PersistedKeys::new(Vec::new()));
        }
        Err(e) => return Err(e.into()),
    };
    match PersistedKeys::from_json(&blob) {
        Ok(keys) => {
            info!(path = %path.display(), count = keys.keys.len(), "Loaded persisted key set.");
            Ok(keys)
        }
        Err(e) => {
            error!(path = %path.display(), "Failed to read persisted key set: {e}");
            let backup_path = path.with_extension("json.bak");
            if let Err(backup_err) = tokio::fs::rename(path, &backup_path).await {
                error!("Failed to back up unreadable key set file: {backup_err}");
            } else {
                info!(path = %backup_path.display(), "Backed up unreadable key set file.");
            }
            Ok(PersistedKeys::new(Vec::new()))
        }
    }
}
