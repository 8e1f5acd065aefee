//! Keeps a materialized list of expensive-to-build items in sync with a remote list source.
//!
//! A [`ListSyncEngine`] owns one [`DiffCacheUpdater`] behind a single async lock,
//! such that snapshot diffs, remote diffs and full rebuilds never interleave.
//! Readers never take that lock: they observe the latest fully-applied list
//! through an [`eyeball::SharedObservable`], which always replays its current value
//! to new subscribers.

use std::{fmt, sync::Arc, time::Duration};

use eyeball::{SharedObservable, Subscriber};
use eyeball_im::VectorDiff;
use futures_util::{Stream, StreamExt, pin_mut};
use imbl::Vector;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    diff::DiffOp,
    diff_cache::{DiffCacheUpdater, InvalidationPolicy, SourceItem},
    errors::{DiffError, EngineError},
    triggers,
};

/// One update from a remote list source.
///
/// Sources that only know full lists send snapshots, and the engine computes the diff itself.
/// Sources that already produce diffs (e.g., the Matrix SDK's room list) send those directly.
#[derive(Debug, Clone)]
pub enum SourceUpdate<S: Clone> {
    Snapshot(Vector<S>),
    Diffs(Vec<VectorDiff<S>>),
}

/// The lifecycle of a [`ListSyncEngine`]'s consumption of its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Not consuming any source stream (updates may still be pushed by hand).
    Idle,
    /// Consuming a source stream.
    Running,
    /// The source stream ended or its scope was cancelled.
    Stopped,
    /// An update could not be applied. The last published list is kept,
    /// but the engine rejects all further updates and must be recreated.
    Failed { reason: String },
}

impl EngineStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

type ItemFactory<S, T> = Box<dyn Fn(&S) -> T + Send + Sync>;

struct EngineInner<S: SourceItem, T> {
    name: String,
    updater: Mutex<DiffCacheUpdater<S, T>>,
    factory: ItemFactory<S, T>,
    items: SharedObservable<Vector<T>>,
    status: SharedObservable<EngineStatus>,
}

/// See the module-level docs.
///
/// Cloning an engine is cheap and yields another handle to the same engine.
pub struct ListSyncEngine<S: SourceItem, T> {
    inner: Arc<EngineInner<S, T>>,
}

impl<S: SourceItem, T> Clone for ListSyncEngine<S, T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: SourceItem, T> fmt::Debug for ListSyncEngine<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListSyncEngine")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<S, T> ListSyncEngine<S, T>
where
    S: SourceItem + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Creates an idle engine with an empty list.
    ///
    /// The `factory` builds one cached item from its source item.
    /// It is only invoked for stale slots, while the engine's lock is held.
    pub fn new<F>(name: impl Into<String>, policy: InvalidationPolicy, factory: F) -> Self
    where
        F: Fn(&S) -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(EngineInner {
                name: name.into(),
                updater: Mutex::new(DiffCacheUpdater::new(policy)),
                factory: Box::new(factory),
                items: SharedObservable::new(Vector::new()),
                status: SharedObservable::new(EngineStatus::Idle),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the most recently published list.
    pub fn items(&self) -> Vector<T> {
        self.inner.items.get()
    }

    /// Subscribes to the materialized list.
    ///
    /// The subscriber's current value is the most recently published list.
    pub fn subscribe(&self) -> Subscriber<Vector<T>> {
        self.inner.items.subscribe()
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status.get()
    }

    pub fn subscribe_status(&self) -> Subscriber<EngineStatus> {
        self.inner.status.subscribe()
    }

    /// Diffs `new_source` against the last known source list, applies the result to the cache,
    /// and publishes the re-materialized list if anything changed.
    pub async fn update_source(&self, new_source: Vector<S>) -> Result<(), EngineError> {
        self.apply_under_lock("update_source", |updater| updater.update_with(new_source)).await
    }

    /// Applies a batch of remote diffs, in order, and publishes the re-materialized list
    /// if anything changed.
    pub async fn apply_diffs(&self, diffs: Vec<VectorDiff<S>>) -> Result<(), EngineError> {
        self.apply_under_lock("apply_diffs", |updater| updater.apply_remote(diffs)).await
    }

    /// Rebuilds every cached item from the last known source list, without diffing,
    /// and publishes the result.
    ///
    /// Used when a side signal changed the derived content of every item at once.
    pub async fn force_rebuild_all(&self) -> Result<(), EngineError> {
        let mut updater = self.inner.updater.lock().await;
        self.ensure_not_failed()?;
        let items = updater.rebuild_all(&*self.inner.factory);
        info!(engine = %self.inner.name, len = items.len(), "Rebuilt every list item");
        self.inner.items.set(items);
        Ok(())
    }

    pub async fn apply_update(&self, update: SourceUpdate<S>) -> Result<(), EngineError> {
        match update {
            SourceUpdate::Snapshot(snapshot) => self.update_source(snapshot).await,
            SourceUpdate::Diffs(diffs) => self.apply_diffs(diffs).await,
        }
    }

    async fn apply_under_lock<F>(&self, kind: &'static str, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut DiffCacheUpdater<S, T>) -> Result<Vec<DiffOp>, DiffError>,
    {
        let mut updater = self.inner.updater.lock().await;
        self.ensure_not_failed()?;
        match apply(&mut updater) {
            Ok(ops) if ops.is_empty() => {
                debug!(engine = %self.inner.name, kind, "Update changed nothing, not republishing");
                Ok(())
            }
            Ok(ops) => {
                let items = updater.materialize(&*self.inner.factory);
                debug!(engine = %self.inner.name, kind, ops = ops.len(), len = items.len(), "Publishing updated list");
                self.inner.items.set(items);
                Ok(())
            }
            Err(e) => {
                error!(engine = %self.inner.name, kind, "Failed to apply list update, engine is now stopped: {e}");
                self.inner.status.set(EngineStatus::Failed { reason: e.to_string() });
                Err(e.into())
            }
        }
    }

    fn ensure_not_failed(&self) -> Result<(), EngineError> {
        if self.inner.status.get().is_failed() {
            Err(EngineError::Failed { name: self.inner.name.clone() })
        } else {
            Ok(())
        }
    }

    /// Sets the status, unless the engine has already failed, which is final.
    fn set_status(&self, status: EngineStatus) {
        self.inner.status.update(|current| {
            if !current.is_failed() {
                *current = status;
            }
        });
    }

    /// Spawns a task that applies every update from `updates`, in order, until the stream ends,
    /// `scope` is cancelled, or an update fails.
    ///
    /// Cancellation never interrupts an update halfway: the last published list stays intact.
    ///
    /// Returns `None` without consuming `updates` if the engine is already consuming a stream.
    pub fn start<St>(&self, scope: &CancellationToken, updates: St) -> Option<JoinHandle<()>>
    where
        St: Stream<Item = SourceUpdate<S>> + Send + 'static,
    {
        let mut already_running = false;
        self.inner.status.update(|status| match status {
            EngineStatus::Running => already_running = true,
            EngineStatus::Failed { .. } => {}
            _ => *status = EngineStatus::Running,
        });
        if already_running {
            warn!(engine = %self.inner.name, "Ignoring start, engine is already consuming a list source");
            return None;
        }
        let engine = self.clone();
        let scope = scope.clone();
        let handle = tokio::spawn(async move {
            info!(engine = %engine.inner.name, "Started consuming list source");
            pin_mut!(updates);
            loop {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => {
                        info!(engine = %engine.inner.name, "List source consumption cancelled");
                        break;
                    }
                    update = updates.next() => match update {
                        Some(update) => {
                            if engine.apply_update(update).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(engine = %engine.inner.name, "List source stream ended");
                            break;
                        }
                    }
                }
            }
            engine.set_status(EngineStatus::Stopped);
        });
        Some(handle)
    }

    /// Spawns a task that rebuilds every item once `trigger` has been quiet for `quiet_period`
    /// after emitting, e.g., for a stream of "notification settings changed" events.
    pub fn start_rebuild_trigger<St>(
        &self,
        scope: &CancellationToken,
        trigger: St,
        quiet_period: Duration,
    ) -> JoinHandle<()>
    where
        St: Stream + Send + 'static,
        St::Item: Send,
    {
        let engine = self.clone();
        tokio::spawn(triggers::run_debounced(scope.clone(), trigger, quiet_period, move || {
            let engine = engine.clone();
            async move { engine.force_rebuild_all().await.is_ok() }
        }))
    }

    /// Spawns a task that rebuilds every item whenever the local date changes,
    /// for items that show relative dates like "Today" or "Yesterday".
    pub fn start_day_rollover_trigger(&self, scope: &CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let day_changes = triggers::day_changes();
            pin_mut!(day_changes);
            loop {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => break,
                    Some(()) = day_changes.next() => {
                        debug!(engine = %engine.inner.name, "Local date changed");
                        if engine.force_rebuild_all().await.is_err() {
                            break;
                        }
                    }
                    else => break,
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::stream;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Summary {
        id: &'static str,
        unread: u32,
    }

    impl SourceItem for Summary {
        type Key = &'static str;
        fn key(&self) -> &'static str {
            self.id
        }
    }

    fn summaries(ids: &[&'static str]) -> Vector<Summary> {
        ids.iter().map(|&id| Summary { id, unread: 0 }).collect()
    }

    /// An engine whose items are `"<id>#<build number>"`.
    fn counting_engine() -> (ListSyncEngine<Summary, String>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let engine = ListSyncEngine::new("rooms", InvalidationPolicy::Exact, move |s: &Summary| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            format!("{}#{n}", s.id)
        });
        (engine, builds)
    }

    fn items(engine: &ListSyncEngine<Summary, String>) -> Vec<String> {
        engine.items().into_iter().collect()
    }

    #[tokio::test]
    async fn snapshots_are_diffed_and_published() {
        let (engine, builds) = counting_engine();
        let mut subscriber = engine.subscribe();
        engine.update_source(summaries(&["a", "b", "c"])).await.unwrap();
        assert_eq!(subscriber.next().await.unwrap().len(), 3);

        engine.update_source(summaries(&["c", "a", "d"])).await.unwrap();
        assert_eq!(items(&engine), vec!["c#2", "a#0", "d#3"]);
        assert_eq!(builds.load(Ordering::SeqCst), 4);

        // A late subscriber immediately sees the latest list.
        assert_eq!(engine.subscribe().get().len(), 3);
    }

    #[tokio::test]
    async fn identical_snapshot_is_not_republished() {
        let (engine, builds) = counting_engine();
        engine.update_source(summaries(&["a", "b"])).await.unwrap();
        let mut subscriber = engine.subscribe();
        engine.update_source(summaries(&["a", "b"])).await.unwrap();
        assert_eq!(subscriber.get().len(), 2);
        assert!(futures_util::FutureExt::now_or_never(subscriber.next()).is_none());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remote_diffs_only_rebuild_changed_items() {
        let (engine, builds) = counting_engine();
        engine.apply_diffs(vec![VectorDiff::Reset { values: summaries(&["a", "b"]) }]).await.unwrap();
        engine.apply_diffs(vec![
            VectorDiff::Set { index: 1, value: Summary { id: "b", unread: 3 } },
            VectorDiff::PushBack { value: Summary { id: "c", unread: 0 } },
        ]).await.unwrap();
        assert_eq!(items(&engine), vec!["a#0", "b#2", "c#3"]);
        assert_eq!(builds.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_update_keeps_last_list_and_rejects_further_updates() {
        let (engine, _) = counting_engine();
        engine.update_source(summaries(&["a"])).await.unwrap();
        let err = engine.apply_diffs(vec![VectorDiff::Remove { index: 4 }]).await.unwrap_err();
        assert!(matches!(err, EngineError::Diff(DiffError::IndexOutOfBounds { index: 4, .. })));
        assert!(engine.status().is_failed());
        assert_eq!(items(&engine), vec!["a#0"]);

        let err = engine.update_source(summaries(&["b"])).await.unwrap_err();
        assert_eq!(err, EngineError::Failed { name: "rooms".into() });
        assert!(engine.force_rebuild_all().await.is_err());
        assert_eq!(items(&engine), vec!["a#0"]);
    }

    #[tokio::test]
    async fn force_rebuild_regenerates_everything() {
        let (engine, _) = counting_engine();
        engine.update_source(summaries(&["a", "b"])).await.unwrap();
        engine.force_rebuild_all().await.unwrap();
        assert_eq!(items(&engine), vec!["a#2", "b#3"]);
    }

    #[tokio::test]
    async fn started_engine_consumes_stream_until_it_ends() {
        let (engine, _) = counting_engine();
        let updates = stream::iter(vec![
            SourceUpdate::Snapshot(summaries(&["a", "b"])),
            SourceUpdate::Diffs(vec![VectorDiff::PopFront]),
            SourceUpdate::Snapshot(summaries(&["b", "c"])),
        ]);
        engine.start(&CancellationToken::new(), updates).unwrap().await.unwrap();
        assert_eq!(items(&engine), vec!["b#1", "c#2"]);
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn cancelled_scope_stops_consumption_and_keeps_last_list() {
        let (engine, _) = counting_engine();
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let scope = CancellationToken::new();
        let handle = engine.start(&scope, UnboundedReceiverStream::new(receiver)).unwrap();
        assert_eq!(engine.status(), EngineStatus::Running);

        let mut subscriber = engine.subscribe();
        sender.send(SourceUpdate::Snapshot(summaries(&["a"]))).unwrap();
        assert_eq!(subscriber.next().await.unwrap().len(), 1);

        scope.cancel();
        handle.await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
        assert!(sender.send(SourceUpdate::Snapshot(summaries(&["x", "y"]))).is_err());
        assert_eq!(items(&engine), vec!["a#0"]);
    }

    #[tokio::test]
    async fn second_start_is_refused_while_running() {
        let (engine, _) = counting_engine();
        let scope = CancellationToken::new();
        let (first_sender, first_receiver) = tokio::sync::mpsc::unbounded_channel();
        let handle = engine.start(&scope, UnboundedReceiverStream::new(first_receiver)).unwrap();

        let (second_sender, second_receiver) = tokio::sync::mpsc::unbounded_channel::<SourceUpdate<Summary>>();
        assert!(engine.start(&scope, UnboundedReceiverStream::new(second_receiver)).is_none());
        // The refused stream was dropped without being consumed.
        assert!(second_sender.is_closed());
        assert_eq!(engine.status(), EngineStatus::Running);

        let mut subscriber = engine.subscribe();
        first_sender.send(SourceUpdate::Snapshot(summaries(&["a"]))).unwrap();
        assert_eq!(subscriber.next().await.unwrap().len(), 1);

        // Once the first consumer has stopped, the engine can be started again.
        scope.cancel();
        handle.await.unwrap();
        let updates = stream::iter(vec![SourceUpdate::Snapshot(summaries(&["a", "b"]))]);
        engine.start(&CancellationToken::new(), updates).unwrap().await.unwrap();
        assert_eq!(items(&engine), vec!["a#0", "b#1"]);
    }

    #[tokio::test]
    async fn failing_stream_leaves_engine_failed() {
        let (engine, _) = counting_engine();
        let updates = stream::iter(vec![
            SourceUpdate::Snapshot(summaries(&["a"])),
            SourceUpdate::Diffs(vec![VectorDiff::Set { index: 9, value: Summary { id: "z", unread: 0 } }]),
            SourceUpdate::Snapshot(summaries(&["b"])),
        ]);
        engine.start(&CancellationToken::new(), updates).unwrap().await.unwrap();
        assert!(engine.status().is_failed());
        assert_eq!(items(&engine), vec!["a#0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_trigger_is_debounced() {
        let (engine, builds) = counting_engine();
        engine.update_source(summaries(&["a", "b"])).await.unwrap();

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let scope = CancellationToken::new();
        let handle = engine.start_rebuild_trigger(&scope, UnboundedReceiverStream::new(receiver), Duration::from_millis(300));
        for _ in 0..5 {
            sender.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(builds.load(Ordering::SeqCst), 4);

        scope.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn day_rollover_rebuilds_everything() {
        let (engine, builds) = counting_engine();
        engine.update_source(summaries(&["a"])).await.unwrap();
        let scope = CancellationToken::new();
        let handle = engine.start_day_rollover_trigger(&scope);

        tokio::time::sleep(Duration::from_secs(25 * 60 * 60)).await;
        assert!(builds.load(Ordering::SeqCst) >= 2);

        scope.cancel();
        handle.await.unwrap();
    }
}
