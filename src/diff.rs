//! Positional diff operations and the keyed diff that produces them.
//!
//! A [`DiffOp`] carries no values, only positions: it describes how the *shape*
//! of a list changes, which is all a [`DiffCache`](crate::diff_cache::DiffCache)
//! needs in order to keep its slots aligned with the source list.
//!
//! Operations must be applied strictly in the order they are produced,
//! because each index is relative to the list state left behind by the
//! operations before it.

use std::hash::Hash;

use eyeball_im::VectorDiff;
use hashbrown::{HashMap, HashSet};
use imbl::Vector;

use crate::errors::DiffError;

/// A single positional mutation of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffOp {
    PushFront,
    PushBack,
    Insert { index: usize },
    /// The item at `index` kept its identity but its content changed.
    Set { index: usize },
    PopFront,
    PopBack,
    Remove { index: usize },
    /// Removes the item at `from`, then re-inserts that same item at `to`
    /// (an index into the list as it is *after* the removal).
    Move { from: usize, to: usize },
    Clear,
    Reset { length: usize },
    Append { count: usize },
    Truncate { length: usize },
}

impl DiffOp {
    /// Returns the value-free operation equivalent to the given remote diff.
    pub fn from_vector_diff<S: Clone>(diff: &VectorDiff<S>) -> Self {
        match diff {
            VectorDiff::Append { values } => DiffOp::Append { count: values.len() },
            VectorDiff::Clear => DiffOp::Clear,
            VectorDiff::PushFront { .. } => DiffOp::PushFront,
            VectorDiff::PushBack { .. } => DiffOp::PushBack,
            VectorDiff::PopFront => DiffOp::PopFront,
            VectorDiff::PopBack => DiffOp::PopBack,
            VectorDiff::Insert { index, .. } => DiffOp::Insert { index: *index },
            VectorDiff::Set { index, .. } => DiffOp::Set { index: *index },
            VectorDiff::Remove { index } => DiffOp::Remove { index: *index },
            VectorDiff::Truncate { length } => DiffOp::Truncate { length: *length },
            VectorDiff::Reset { values } => DiffOp::Reset { length: values.len() },
        }
    }

    /// Returns the length of a list of length `len` after this op is applied,
    /// or the error describing why this op cannot be applied to it.
    pub fn resulting_len(&self, len: usize) -> Result<usize, DiffError> {
        let op = *self;
        let out_of_bounds = |index: usize| DiffError::IndexOutOfBounds { op, index, len };
        match op {
            DiffOp::PushFront | DiffOp::PushBack => Ok(len + 1),
            DiffOp::Insert { index } if index > len => Err(out_of_bounds(index)),
            DiffOp::Insert { .. } => Ok(len + 1),
            DiffOp::Set { index } if index >= len => Err(out_of_bounds(index)),
            DiffOp::Set { .. } => Ok(len),
            DiffOp::PopFront | DiffOp::PopBack if len == 0 => Err(DiffError::EmptyList { op }),
            DiffOp::PopFront | DiffOp::PopBack => Ok(len - 1),
            DiffOp::Remove { index } if index >= len => Err(out_of_bounds(index)),
            DiffOp::Remove { .. } => Ok(len - 1),
            DiffOp::Move { from, .. } if from >= len => Err(out_of_bounds(from)),
            // After removing `from` there are `len - 1` items, so `to` may be at most that.
            DiffOp::Move { to, .. } if to >= len => Err(out_of_bounds(to)),
            DiffOp::Move { .. } => Ok(len),
            DiffOp::Clear => Ok(0),
            DiffOp::Reset { length } => Ok(length),
            DiffOp::Append { count } => Ok(len + count),
            DiffOp::Truncate { length } if length > len => Err(DiffError::InvalidLength {
                op,
                len,
                requested: length,
            }),
            DiffOp::Truncate { length } => Ok(length),
        }
    }
}

/// Computes the ordered positional ops that turn a list with keys `old`
/// into a list with keys `new`.
///
/// Keys present in both lists are never removed and re-inserted: the largest
/// subset of them that is already in the right relative order stays put,
/// and every other common key gets exactly one [`DiffOp::Move`].
///
/// Keys must be unique within each list. If they are not, this falls back
/// to a single [`DiffOp::Reset`], which is always correct but reuses nothing.
pub fn compute_diff<K: Eq + Hash>(old: &[K], new: &[K]) -> Vec<DiffOp> {
    if old.is_empty() && new.is_empty() {
        return Vec::new();
    }
    let (Some(_), Some(new_positions)) = (key_positions(old), key_positions(new)) else {
        return vec![DiffOp::Reset { length: new.len() }];
    };
    if old.is_empty() {
        return vec![DiffOp::Append { count: new.len() }];
    }
    if new.is_empty() {
        return vec![DiffOp::Clear];
    }

    let mut ops = Vec::new();

    // Removals go from back to front so that each index is still valid
    // once the ones after it have been applied.
    for (index, key) in old.iter().enumerate().rev() {
        if !new_positions.contains_key(key) {
            ops.push(DiffOp::Remove { index });
        }
    }
    let mut current: Vec<&K> = old.iter()
        .filter(|key| new_positions.contains_key(*key))
        .collect();
    let common: HashSet<&K> = current.iter().copied().collect();

    let ranks: Vec<usize> = current.iter().map(|key| new_positions[*key]).collect();
    let anchored: HashSet<usize> = longest_increasing_subsequence(&ranks)
        .into_iter()
        .map(|i| ranks[i])
        .collect();

    for (target, key) in new.iter().enumerate() {
        if anchored.contains(&target) {
            continue;
        }
        // Everything before `target` in the new order has already been placed,
        // so this key goes directly after its predecessor.
        let after_predecessor = match target {
            0 => 0,
            _ => position_of(&current, &new[target - 1]) + 1,
        };
        if common.contains(key) {
            let from = position_of(&current, key);
            let to = if from < after_predecessor { after_predecessor - 1 } else { after_predecessor };
            if from != to {
                ops.push(DiffOp::Move { from, to });
                let moved = current.remove(from);
                current.insert(to, moved);
            }
        } else {
            ops.push(DiffOp::Insert { index: after_predecessor });
            current.insert(after_predecessor, key);
        }
    }
    ops
}

/// Like [`compute_diff`], but over full items: the structural ops are derived
/// from `key`, and a trailing [`DiffOp::Set`] is emitted for every surviving
/// item whose content differs from its previous version.
///
/// A moved item whose content also changed yields a `Move` followed by a `Set`.
pub fn compute_diff_by<S, K, F>(old: &Vector<S>, new: &Vector<S>, key: F) -> Vec<DiffOp>
where
    S: Clone + PartialEq,
    K: Eq + Hash,
    F: Fn(&S) -> K,
{
    let old_keys: Vec<K> = old.iter().map(&key).collect();
    let new_keys: Vec<K> = new.iter().map(&key).collect();
    let mut ops = compute_diff(&old_keys, &new_keys);

    if matches!(ops.as_slice(), [DiffOp::Reset { .. }] | [DiffOp::Append { .. }] | [DiffOp::Clear]) {
        return ops;
    }
    let old_positions: HashMap<&K, usize> = old_keys.iter()
        .enumerate()
        .map(|(index, key)| (key, index))
        .collect();
    for (index, (new_key, new_item)) in new_keys.iter().zip(new.iter()).enumerate() {
        if let Some(&old_index) = old_positions.get(new_key)
            && old.get(old_index).is_some_and(|old_item| old_item != new_item)
        {
            ops.push(DiffOp::Set { index });
        }
    }
    ops
}

/// Applies a remote diff to a source list, checking bounds first.
///
/// The list is left untouched if the diff cannot be applied.
pub fn apply_vector_diff<S: Clone>(list: &mut Vector<S>, diff: VectorDiff<S>) -> Result<(), DiffError> {
    DiffOp::from_vector_diff(&diff).resulting_len(list.len())?;
    match diff {
        VectorDiff::Append { values } => list.append(values),
        VectorDiff::Clear => list.clear(),
        VectorDiff::PushFront { value } => list.push_front(value),
        VectorDiff::PushBack { value } => list.push_back(value),
        VectorDiff::PopFront => { list.pop_front(); }
        VectorDiff::PopBack => { list.pop_back(); }
        VectorDiff::Insert { index, value } => list.insert(index, value),
        VectorDiff::Set { index, value } => { list.set(index, value); }
        VectorDiff::Remove { index } => { list.remove(index); }
        VectorDiff::Truncate { length } => list.truncate(length),
        VectorDiff::Reset { values } => *list = values,
    }
    Ok(())
}

/// Maps each key to its index, or returns `None` if any key is duplicated.
fn key_positions<K: Eq + Hash>(keys: &[K]) -> Option<HashMap<&K, usize>> {
    let mut positions = HashMap::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        if positions.insert(key, index).is_some() {
            return None;
        }
    }
    Some(positions)
}

fn position_of<K: Eq>(list: &[&K], key: &K) -> usize {
    list.iter()
        .position(|k| *k == key)
        .unwrap_or(list.len())
}

/// Returns the indices (into `values`) of one longest strictly increasing subsequence.
fn longest_increasing_subsequence(values: &[usize]) -> Vec<usize> {
    // `tails[k]` is the index of the smallest tail of any increasing run of length `k + 1`.
    let mut tails: Vec<usize> = Vec::new();
    let mut predecessors: Vec<Option<usize>> = vec![None; values.len()];
    for (i, &value) in values.iter().enumerate() {
        let len = tails.partition_point(|&t| values[t] < value);
        if len > 0 {
            predecessors[i] = Some(tails[len - 1]);
        }
        if len == tails.len() {
            tails.push(i);
        } else {
            tails[len] = i;
        }
    }
    let mut subsequence = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        subsequence.push(i);
        cursor = predecessors[i];
    }
    subsequence.reverse();
    subsequence
}
