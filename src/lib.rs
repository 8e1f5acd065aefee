//! Incremental synchronization of materialized lists, plus a keyed cache of
//! per-session resources whose background activity follows the app's environment.
//!
//! * [`diff`]: positional diff ops and the keyed diff that produces them.
//! * [`diff_cache`]: a positional cache of derived items, kept aligned by diff ops.
//! * [`list_sync`]: an engine that feeds remote list updates through a diff cache
//!   and publishes the materialized list to subscribers.
//! * [`resource_cache`]: a single-flight cache of restorable resources.
//! * [`orchestrator`]: starts and stops a resource's background activity
//!   based on environment signals.

pub mod diff;
pub mod diff_cache;
pub mod list_sync;
pub mod triggers;

pub mod resource_cache;
pub mod orchestrator;
pub mod persistence;

pub mod config;
pub mod errors;
pub mod logging;

pub use config::SyncConfig;
pub use diff::DiffOp;
pub use diff_cache::{DiffCache, DiffCacheUpdater, InvalidationPolicy, Slot, SourceItem};
pub use errors::{CacheError, DiffError, EngineError, PersistenceError};
pub use list_sync::{EngineStatus, ListSyncEngine, SourceUpdate};
pub use orchestrator::{
    ActivityState, BackgroundActivity, EnvironmentSignals, OrchestratedTask, SignalSources,
    TaskEvent, TaskState,
};
pub use persistence::PersistedKeys;
pub use resource_cache::KeyedResourceCache;
