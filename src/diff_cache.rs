//! A positional cache of expensive-to-build items, kept aligned with a source list by diffs.
//!
//! The cache never stores source items, only derived ones, and it addresses them purely
//! by position. Identity is used only when diffing two successive source lists,
//! such that items that merely moved keep their cached value.

use std::{fmt, hash::Hash, ops::Range};

use eyeball_im::VectorDiff;
use imbl::Vector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    diff::{DiffOp, apply_vector_diff, compute_diff_by},
    errors::DiffError,
};

/// Whether to enable verbose logging of every diff op applied to a cache.
const LOG_LIST_DIFFS: bool = cfg!(feature = "log_list_diffs");


/// A remote-provided item with a stable identity.
///
/// `PartialEq` compares *content*: two items with the same key that compare
/// unequal cause their cached projection to be rebuilt.
pub trait SourceItem: Clone + PartialEq {
    type Key: Eq + Hash + Clone + fmt::Debug;

    fn key(&self) -> Self::Key;
}

/// One cache slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Slot<T> {
    /// Must be rebuilt from the current source item on the next read.
    #[default]
    Stale,
    Ready(T),
}

impl<T> Slot<T> {
    pub fn as_ready(&self) -> Option<&T> {
        match self {
            Slot::Ready(value) => Some(value),
            Slot::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Slot::Stale)
    }
}

/// Which slots a structural op invalidates besides the ones it creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Only inserted and content-changed slots become stale.
    #[default]
    Exact,
    /// Additionally, the slots next to every inserted, removed or moved position
    /// become stale, for projections that depend on their neighbours
    /// (e.g., whether a message is the first or last of a group from the same sender).
    WithNeighbours,
}


/// An index-addressable sequence of [`Slot`]s.
#[derive(Debug)]
pub struct DiffCache<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for DiffCache<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> DiffCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache of `len` stale slots.
    pub fn with_len(len: usize) -> Self {
        Self { slots: std::iter::repeat_with(|| Slot::Stale).take(len).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn indices(&self) -> Range<usize> {
        0..self.slots.len()
    }

    /// Returns the cached value at `index`, or `None` if it is stale or out of bounds.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Slot::as_ready)
    }

    pub fn slot(&self, index: usize) -> Option<&Slot<T>> {
        self.slots.get(index)
    }

    /// Stores a freshly built value at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), DiffError> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(index)
            .ok_or(DiffError::IndexOutOfBounds { op: DiffOp::Set { index }, index, len })?;
        *slot = Slot::Ready(value);
        Ok(())
    }

    pub fn insert(&mut self, index: usize, slot: Slot<T>) -> Result<(), DiffError> {
        DiffOp::Insert { index }.resulting_len(self.slots.len())?;
        self.slots.insert(index, slot);
        Ok(())
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Slot<T>, DiffError> {
        DiffOp::Remove { index }.resulting_len(self.slots.len())?;
        Ok(self.slots.remove(index))
    }

    pub fn invalidate(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Slot::Stale;
        }
    }

    pub fn invalidate_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = Slot::Stale);
    }

    pub fn stale_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_stale()).count()
    }

    /// Applies one op, validating it before anything is mutated.
    ///
    /// A moved slot is transferred as-is; it is never cloned or rebuilt.
    pub fn apply(&mut self, op: DiffOp, policy: InvalidationPolicy) -> Result<(), DiffError> {
        let len = self.slots.len();
        op.resulting_len(len)?;
        if LOG_LIST_DIFFS { debug!(?op, len, "diff_cache: applying op"); }

        // Positions whose neighbours changed, expressed in the post-op list.
        let mut inserted_at: Option<usize> = None;
        let mut removed_at: Option<usize> = None;
        match op {
            DiffOp::PushFront => {
                self.slots.insert(0, Slot::Stale);
                inserted_at = Some(0);
            }
            DiffOp::PushBack => {
                self.slots.push(Slot::Stale);
                inserted_at = Some(len);
            }
            DiffOp::Insert { index } => {
                self.slots.insert(index, Slot::Stale);
                inserted_at = Some(index);
            }
            DiffOp::Set { index } => self.slots[index] = Slot::Stale,
            DiffOp::PopFront => {
                self.slots.remove(0);
                removed_at = Some(0);
            }
            DiffOp::PopBack => {
                self.slots.pop();
                removed_at = Some(len - 1);
            }
            DiffOp::Remove { index } => {
                self.slots.remove(index);
                removed_at = Some(index);
            }
            DiffOp::Move { from, to } => {
                let moved = self.slots.remove(from);
                self.slots.insert(to, moved);
                if policy == InvalidationPolicy::WithNeighbours {
                    // The gap left behind closes up at `from` in the list without the moved slot.
                    let gap = if from > to { from + 1 } else { from };
                    self.invalidate_around_gap(gap);
                    self.invalidate(to);
                }
                inserted_at = Some(to);
            }
            DiffOp::Clear => self.slots.clear(),
            DiffOp::Reset { length } => *self = Self::with_len(length),
            DiffOp::Append { count } => {
                self.slots.extend(std::iter::repeat_with(|| Slot::Stale).take(count));
                if count > 0 {
                    inserted_at = Some(len);
                }
            }
            DiffOp::Truncate { length } => {
                self.slots.truncate(length);
                if length < len {
                    removed_at = Some(length);
                }
            }
        }

        if policy == InvalidationPolicy::WithNeighbours {
            if let Some(index) = inserted_at {
                if index > 0 {
                    self.invalidate(index - 1);
                }
                let after = match op {
                    DiffOp::Append { count } => index + count,
                    _ => index + 1,
                };
                self.invalidate(after);
            }
            if let Some(index) = removed_at {
                self.invalidate_around_gap(index);
            }
        }
        Ok(())
    }

    /// Invalidates the two slots that became adjacent when the slot at `index` was removed.
    fn invalidate_around_gap(&mut self, index: usize) {
        if index > 0 {
            self.invalidate(index - 1);
        }
        self.invalidate(index);
    }

    fn slots_mut(&mut self) -> &mut [Slot<T>] {
        &mut self.slots
    }
}


/// Keeps a [`DiffCache`] aligned with successive versions of a source list.
///
/// Invariant: after every successful update, `cache.len() == source.len()`.
pub struct DiffCacheUpdater<S: SourceItem, T> {
    source: Vector<S>,
    cache: DiffCache<T>,
    policy: InvalidationPolicy,
}

impl<S: SourceItem, T> Default for DiffCacheUpdater<S, T> {
    fn default() -> Self {
        Self::new(InvalidationPolicy::default())
    }
}

impl<S: SourceItem, T> DiffCacheUpdater<S, T> {
    pub fn new(policy: InvalidationPolicy) -> Self {
        Self {
            source: Vector::new(),
            cache: DiffCache::new(),
            policy,
        }
    }

    /// The last known source list.
    pub fn source(&self) -> &Vector<S> {
        &self.source
    }

    pub fn cache(&self) -> &DiffCache<T> {
        &self.cache
    }

    /// Diffs `new_source` against the last known source list and applies the resulting ops,
    /// in order, to the cache.
    ///
    /// Returns the ops that were applied. Identical consecutive updates apply none.
    pub fn update_with(&mut self, new_source: Vector<S>) -> Result<Vec<DiffOp>, DiffError> {
        let ops = compute_diff_by(&self.source, &new_source, S::key);
        for op in &ops {
            self.cache.apply(*op, self.policy)?;
        }
        self.source = new_source;
        self.check_aligned()?;
        debug!(ops = ops.len(), len = self.source.len(), stale = self.cache.stale_count(), "Applied source snapshot to diff cache");
        Ok(ops)
    }

    /// Applies a batch of remote diffs, in order, to both the source list and the cache.
    ///
    /// A removal immediately followed by a re-insertion of an item with the same key
    /// is applied as a single [`DiffOp::Move`] (plus a [`DiffOp::Set`] if its content changed),
    /// because remote sources typically reorder lists that way.
    /// A `Set` whose new value is equal to the old one does not invalidate anything.
    ///
    /// Returns the cache ops that were applied.
    pub fn apply_remote(&mut self, diffs: Vec<VectorDiff<S>>) -> Result<Vec<DiffOp>, DiffError> {
        let mut applied = Vec::with_capacity(diffs.len());
        let mut peekable_diffs = diffs.into_iter().peekable();
        while let Some(diff) = peekable_diffs.next() {
            let removed_index = match &diff {
                VectorDiff::PopFront if !self.source.is_empty() => Some(0),
                VectorDiff::PopBack if !self.source.is_empty() => Some(self.source.len() - 1),
                VectorDiff::Remove { index } if *index < self.source.len() => Some(*index),
                _ => None,
            };
            if let Some(from) = removed_index
                && let Some(next) = peekable_diffs.peek()
                && let Some((to, value)) = reinsertion_of(next, self.source.len() - 1)
                && self.source.get(from).is_some_and(|old| old.key() == value.key())
            {
                let op = DiffOp::Move { from, to };
                if LOG_LIST_DIFFS { debug!(?op, "diff_cache: optimizing remove + insert into move"); }
                let content_changed = self.source.get(from).is_some_and(|old| old != value);
                let value = value.clone();
                self.cache.apply(op, self.policy)?;
                self.source.remove(from);
                self.source.insert(to, value);
                applied.push(op);
                if content_changed {
                    self.cache.apply(DiffOp::Set { index: to }, self.policy)?;
                    applied.push(DiffOp::Set { index: to });
                }
                peekable_diffs.next(); // consume the re-insertion
                continue;
            }

            let op = match &diff {
                VectorDiff::Set { index, value } if self.source.get(*index) == Some(value) => None,
                other => Some(DiffOp::from_vector_diff(other)),
            };
            apply_vector_diff(&mut self.source, diff)?;
            if let Some(op) = op {
                self.cache.apply(op, self.policy)?;
                applied.push(op);
            }
        }
        self.check_aligned()?;
        Ok(applied)
    }

    /// Builds every stale slot from its current source item and returns the full list.
    pub fn materialize<F>(&mut self, factory: F) -> Vector<T>
    where
        T: Clone,
        F: Fn(&S) -> T,
    {
        let mut rebuilt = 0usize;
        let items: Vector<T> = self.cache.slots_mut()
            .iter_mut()
            .zip(self.source.iter())
            .map(|(slot, source)| {
                if let Slot::Ready(value) = slot {
                    return value.clone();
                }
                let value = factory(source);
                *slot = Slot::Ready(value.clone());
                rebuilt += 1;
                value
            })
            .collect();
        if rebuilt > 0 {
            debug!(rebuilt, len = items.len(), "Materialized diff cache");
        }
        items
    }

    /// Regenerates every slot from the last known source list, bypassing the diff entirely.
    pub fn rebuild_all<F>(&mut self, factory: F) -> Vector<T>
    where
        T: Clone,
        F: Fn(&S) -> T,
    {
        self.cache.invalidate_all();
        self.materialize(factory)
    }

    fn check_aligned(&self) -> Result<(), DiffError> {
        if self.source.len() == self.cache.len() {
            Ok(())
        } else {
            Err(DiffError::LengthMismatch {
                source_len: self.source.len(),
                cache_len: self.cache.len(),
            })
        }
    }
}

/// If `diff` re-inserts a value, returns its insertion index (into a list of
/// `len_after_removal` items) and the value.
fn reinsertion_of<S: Clone>(diff: &VectorDiff<S>, len_after_removal: usize) -> Option<(usize, &S)> {
    match diff {
        VectorDiff::Insert { index, value } if *index <= len_after_removal => Some((*index, value)),
        VectorDiff::PushFront { value } => Some((0, value)),
        VectorDiff::PushBack { value } => Some((len_after_removal, value)),
        _ => None,
    }
}
