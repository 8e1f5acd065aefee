//! Error types for list synchronization, the keyed resource cache, and key persistence.

use thiserror::Error;

use crate::diff::DiffOp;

/// An invariant violation while applying a [`DiffOp`] to a cache.
///
/// These are never expected during correct operation: the producer of the
/// operations and the cache disagree about the list's shape.
/// The current update is aborted rather than skipping the bad operation,
/// because skipping would leave the cache permanently out of step with its source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("diff op {op:?} index {index} is out of bounds for list of length {len}")]
    IndexOutOfBounds {
        op: DiffOp,
        index: usize,
        len: usize,
    },
    #[error("diff op {op:?} cannot be applied to an empty list")]
    EmptyList { op: DiffOp },
    #[error("diff op {op:?} would grow list of length {len} to {requested}")]
    InvalidLength {
        op: DiffOp,
        len: usize,
        requested: usize,
    },
    #[error("source list has length {source_len} but cache has length {cache_len}")]
    LengthMismatch {
        source_len: usize,
        cache_len: usize,
    },
}

/// Errors returned by a [`ListSyncEngine`](crate::list_sync::ListSyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Diff(#[from] DiffError),
    /// A previous update failed, so the engine's cache can no longer be trusted.
    /// The engine must be recreated from scratch.
    #[error("list sync engine `{name}` failed earlier and must be recreated")]
    Failed { name: String },
}

/// Errors returned by the [`KeyedResourceCache`](crate::resource_cache::KeyedResourceCache).
///
/// This is `Clone` so that every caller waiting on the same in-flight restore
/// observes the very same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to restore resource for key {key}: {reason}")]
    RestoreFailed {
        key: String,
        reason: String,
    },
}

/// Errors from saving or loading the persisted key set.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on persisted key set: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed persisted key set: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("persisted key set has unsupported version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}
