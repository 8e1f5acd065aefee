//! A concurrent cache of expensive per-session resources, such as connected clients.
//!
//! There is at most one live resource per key. A missing resource is restored through
//! an injected restore function, which runs at most once per key at a time:
//! concurrent callers for the same key all await the same in-flight restore.
//! Failed restores are never cached, so the next caller retries.
//!
//! Each cached resource may own an [`OrchestratedTask`] (e.g., its sync loop),
//! which is always shut down before the resource is dropped from the cache.

use std::{fmt, future::Future, hash::Hash, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared, join_all},
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::{
    errors::{CacheError, PersistenceError},
    orchestrator::OrchestratedTask,
    persistence::PersistedKeys,
};

type RestoreFn<K, V> = Box<dyn Fn(K) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;
type TaskFactory<K, V> = Box<dyn Fn(&K, &V) -> Option<Arc<OrchestratedTask>> + Send + Sync>;
type SharedRestore<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct CachedEntry<V> {
    value: V,
    task: Option<Arc<OrchestratedTask>>,
}

impl<V> CachedEntry<V> {
    /// Shuts down the entry's task (if any), then hands back the value.
    async fn tear_down(self) -> V {
        if let Some(task) = self.task {
            task.shutdown().await;
        }
        self.value
    }
}

/// See the module-level docs.
pub struct KeyedResourceCache<K, V> {
    entries: DashMap<K, CachedEntry<V>>,
    /// Lock order: an `in_flight` guard may be held while touching `entries`, never the reverse.
    in_flight: DashMap<K, SharedRestore<V>>,
    restore: RestoreFn<K, V>,
    task_factory: Option<TaskFactory<K, V>>,
}

impl<K: fmt::Debug + Eq + Hash, V> fmt::Debug for KeyedResourceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedResourceCache")
            .field("len", &self.entries.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl<K, V> KeyedResourceCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache that restores missing resources with `restore`.
    ///
    /// `restore` may be called concurrently for different keys.
    pub fn new<F, Fut>(restore: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            restore: Box::new(move |key| restore(key).boxed()),
            task_factory: None,
        }
    }

    /// Sets the factory for the background task that accompanies each newly cached resource.
    ///
    /// The factory runs once per cached resource. Returning `None` means the resource
    /// needs no background task.
    pub fn with_background_task<F>(mut self, factory: F) -> Self
    where
        F: Fn(&K, &V) -> Option<Arc<OrchestratedTask>> + Send + Sync + 'static,
    {
        self.task_factory = Some(Box::new(factory));
        self
    }

    /// Returns the cached resource for `key`, without ever restoring it.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Returns the cached resource for `key`, restoring it first if needed.
    ///
    /// Concurrent calls for the same uncached key share one restore,
    /// and all observe its result. On failure, nothing is cached.
    ///
    /// If the key is removed while its restore is in flight, the restored resource
    /// is returned to the waiting callers but is not cached.
    pub async fn get_or_restore(&self, key: &K) -> Result<V, CacheError> {
        let restore = match self.join_or_begin_restore(key) {
            Ok(value) => return Ok(value),
            Err(restore) => restore,
        };
        let result = restore.clone().await;
        self.finish_restore(key, &restore, &result);
        result
    }

    /// Returns the cached value, or else the in-flight restore for `key`,
    /// beginning a new one if there isn't any.
    fn join_or_begin_restore(&self, key: &K) -> Result<V, SharedRestore<V>> {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(in_flight) => {
                debug!(%key, "Joining in-flight restore");
                Err(in_flight.get().clone())
            }
            Entry::Vacant(slot) => {
                // A restore may have finished between the check above and taking this slot.
                if let Some(value) = self.get(key) {
                    return Ok(value);
                }
                info!(%key, "Restoring resource");
                let key_name = key.to_string();
                let restore_future = (self.restore)(key.clone());
                let restore = async move {
                    restore_future.await.map_err(|e| CacheError::RestoreFailed {
                        key: key_name,
                        reason: format!("{e:#}"),
                    })
                }
                .boxed()
                .shared();
                slot.insert(restore.clone());
                Err(restore)
            }
        }
    }

    /// Caches a successful result, exactly once, and retires the in-flight restore.
    fn finish_restore(&self, key: &K, restore: &SharedRestore<V>, result: &Result<V, CacheError>) {
        let Entry::Occupied(in_flight) = self.in_flight.entry(key.clone()) else {
            return;
        };
        // Another waiter already finished this restore, and a newer one has begun.
        if !in_flight.get().ptr_eq(restore) {
            return;
        }
        match result {
            Ok(value) => {
                let task = self.task_factory.as_ref().and_then(|factory| factory(key, value));
                self.entries.insert(key.clone(), CachedEntry { value: value.clone(), task });
                info!(%key, "Restored and cached resource");
            }
            Err(e) => warn!(%key, "Failed to restore resource, not caching: {e}"),
        }
        in_flight.remove();
    }

    /// Caches `value` for `key` without restoring, e.g., right after a fresh login.
    ///
    /// Any previous resource for `key` is torn down and returned.
    pub async fn insert(&self, key: K, value: V) -> Option<V> {
        self.in_flight.remove(&key);
        let task = self.task_factory.as_ref().and_then(|factory| factory(&key, &value));
        let previous = self.entries.insert(key.clone(), CachedEntry { value, task });
        info!(%key, replaced = previous.is_some(), "Inserted resource");
        match previous {
            Some(previous) => Some(previous.tear_down().await),
            None => None,
        }
    }

    /// Removes the resource for `key`, shutting down its background task first.
    ///
    /// The key is no longer present as soon as this is called,
    /// even though the task shutdown completes asynchronously.
    pub async fn remove(&self, key: &K) -> Option<V> {
        self.in_flight.remove(key);
        let (_, entry) = self.entries.remove(key)?;
        info!(%key, "Removing resource");
        Some(entry.tear_down().await)
    }

    /// Removes every resource, shutting down all their tasks concurrently.
    ///
    /// Returns how many resources were removed.
    pub async fn remove_all(&self) -> usize {
        self.in_flight.clear();
        let keys = self.keys();
        let removed = join_all(keys.iter().map(|key| self.remove(key))).await;
        let count = removed.into_iter().flatten().count();
        info!(count, "Removed all resources");
        count
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the background task of the resource cached for `key`.
    pub fn task(&self, key: &K) -> Option<Arc<OrchestratedTask>> {
        self.entries.get(key).and_then(|entry| entry.task.clone())
    }

    pub fn persisted_keys(&self) -> PersistedKeys<K> {
        PersistedKeys::new(self.keys())
    }

    /// Serializes the set of cached keys, e.g., before the process may be killed.
    pub fn save_keys(&self) -> Result<String, PersistenceError>
    where
        K: Serialize,
    {
        self.persisted_keys().to_json()
    }

    /// Parses a blob from [`save_keys()`](Self::save_keys) and returns
    /// the keys in it that are not currently cached.
    pub fn restore_keys(&self, blob: &str) -> Result<Vec<K>, PersistenceError>
    where
        K: DeserializeOwned,
    {
        Ok(self.uncached_keys(PersistedKeys::from_json(blob)?))
    }

    pub fn uncached_keys(&self, persisted: PersistedKeys<K>) -> Vec<K> {
        persisted.keys.into_iter().filter(|key| !self.contains(key)).collect()
    }

    /// Restores every uncached key from a blob, one at a time, and returns each result.
    ///
    /// Safe to call repeatedly: keys that are already cached are skipped.
    pub async fn restore_all(&self, blob: &str) -> Result<Vec<(K, Result<V, CacheError>)>, PersistenceError>
    where
        K: DeserializeOwned,
    {
        let keys = self.restore_keys(blob)?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let result = self.get_or_restore(&key).await;
            results.push((key, result));
        }
        Ok(results)
    }
}
