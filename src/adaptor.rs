//! Array adaptor: the blessed mutation surface for wrapped lists.
//!
//! Rather than intercepting a language-level collection's primitives, a
//! wrapped keypath is mutated through [`ArrayAdaptor`], whose operations
//! compute the old→new index map and hand it to the store's `smart_update`,
//! so that list sections reconcile incrementally instead of re-rendering.

use crate::error::ViewError;
use crate::keypath::Keypath;
use crate::store::Store;
use crate::value::Value;

/// Marker state for a wrapped keypath.
///
/// A wrapped keypath intercepts whole-value `set` calls: when the incoming
/// value is also a list, the reset path computes a merge map and performs a
/// `smart_update` instead of an identity overwrite.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WrappedList;

/// Mutating view over a wrapped list keypath.
///
/// Obtained from [`Store::adaptor`]. Every operation runs one
/// `smart_update`, so dependants see a shuffle rather than a full reset.
///
/// `sort_by` and `reverse` are the deliberate exception: they fall back to
/// a plain identity `set` of the reordered array.
pub struct ArrayAdaptor<'a, D> {
    store: &'a mut Store<D>,
    keypath: Keypath,
}

impl<'a, D> ArrayAdaptor<'a, D>
where
    D: Copy + Eq + std::hash::Hash + std::fmt::Debug,
{
    pub(crate) fn new(store: &'a mut Store<D>, keypath: Keypath) -> Self {
        ArrayAdaptor { store, keypath }
    }

    fn items(&mut self) -> Vec<Value> {
        match self.store.get(&self.keypath) {
            Value::List(items) => items,
            _ => Vec::new(),
        }
    }

    /// Append an element.
    pub fn push(&mut self, value: Value) -> Result<(), ViewError> {
        let mut items = self.items();
        let indices: Vec<isize> = (0..items.len() as isize).collect();
        items.push(value);
        self.store.smart_update(&self.keypath, items, indices)
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Result<Option<Value>, ViewError> {
        let mut items = self.items();
        let Some(last) = items.pop() else {
            return Ok(None);
        };
        let mut indices: Vec<isize> = (0..items.len() as isize).collect();
        indices.push(-1);
        self.store.smart_update(&self.keypath, items, indices)?;
        Ok(Some(last))
    }

    /// Prepend an element.
    pub fn unshift(&mut self, value: Value) -> Result<(), ViewError> {
        let mut items = self.items();
        let indices: Vec<isize> = (1..=items.len() as isize).collect();
        items.insert(0, value);
        self.store.smart_update(&self.keypath, items, indices)
    }

    /// Remove and return the first element.
    pub fn shift(&mut self) -> Result<Option<Value>, ViewError> {
        let mut items = self.items();
        if items.is_empty() {
            return Ok(None);
        }
        let first = items.remove(0);
        let mut indices: Vec<isize> = vec![-1];
        indices.extend(0..items.len() as isize);
        self.store.smart_update(&self.keypath, items, indices)?;
        Ok(Some(first))
    }

    /// Insert an element at `index` (clamped to the list length).
    pub fn insert_at(&mut self, index: usize, value: Value) -> Result<(), ViewError> {
        let mut items = self.items();
        let index = index.min(items.len());
        let indices: Vec<isize> = (0..items.len())
            .map(|i| if i < index { i as isize } else { i as isize + 1 })
            .collect();
        items.insert(index, value);
        self.store.smart_update(&self.keypath, items, indices)
    }

    /// Remove and return the element at `index`.
    pub fn remove_at(&mut self, index: usize) -> Result<Option<Value>, ViewError> {
        let mut items = self.items();
        if index >= items.len() {
            return Ok(None);
        }
        let removed = items.remove(index);
        let indices: Vec<isize> = (0..items.len() + 1)
            .map(|i| match i.cmp(&index) {
                std::cmp::Ordering::Less => i as isize,
                std::cmp::Ordering::Equal => -1,
                std::cmp::Ordering::Greater => i as isize - 1,
            })
            .collect();
        self.store.smart_update(&self.keypath, items, indices)?;
        Ok(Some(removed))
    }

    /// Move `count` elements starting at `from` so they begin at `to`
    /// (interpreted against the list with the range removed).
    pub fn move_range(&mut self, from: usize, count: usize, to: usize) -> Result<(), ViewError> {
        let items = self.items();
        let len = items.len();
        if from >= len || count == 0 {
            return Ok(());
        }
        let count = count.min(len - from);
        let to = to.min(len - count);

        let mut moved: Vec<(usize, Value)> = Vec::with_capacity(len);
        let mut rest: Vec<(usize, Value)> = Vec::with_capacity(len);
        for (i, v) in items.into_iter().enumerate() {
            if i >= from && i < from + count {
                moved.push((i, v));
            } else {
                rest.push((i, v));
            }
        }
        let mut reordered = rest;
        reordered.splice(to..to, moved);

        let mut indices = vec![-1isize; len];
        let mut new_items = Vec::with_capacity(len);
        for (new_index, (old_index, v)) in reordered.into_iter().enumerate() {
            indices[old_index] = new_index as isize;
            new_items.push(v);
        }
        self.store.smart_update(&self.keypath, new_items, indices)
    }

    /// Splice: remove `delete` elements at `start`, inserting `insert` in
    /// their place.
    pub fn splice(
        &mut self,
        start: usize,
        delete: usize,
        insert: Vec<Value>,
    ) -> Result<Vec<Value>, ViewError> {
        let mut items = self.items();
        let start = start.min(items.len());
        let delete = delete.min(items.len() - start);
        let shift = insert.len() as isize - delete as isize;

        let indices: Vec<isize> = (0..items.len())
            .map(|i| {
                if i < start {
                    i as isize
                } else if i < start + delete {
                    -1
                } else {
                    i as isize + shift
                }
            })
            .collect();

        let removed: Vec<Value> = items.splice(start..start + delete, insert).collect();
        self.store.smart_update(&self.keypath, items, indices)?;
        Ok(removed)
    }

    /// Reverse the list.
    ///
    /// Falls back to a plain identity `set` rather than computing a shuffle
    /// map; see DESIGN.md.
    pub fn reverse(&mut self) -> Result<(), ViewError> {
        let mut items = self.items();
        items.reverse();
        self.store.set(&self.keypath, Value::List(items))
    }

    /// Sort the list with a comparator.
    ///
    /// Falls back to a plain identity `set`, like [`reverse`](Self::reverse).
    pub fn sort_by(
        &mut self,
        mut cmp: impl FnMut(&Value, &Value) -> std::cmp::Ordering,
    ) -> Result<(), ViewError> {
        let mut items = self.items();
        items.sort_by(&mut cmp);
        self.store.set(&self.keypath, Value::List(items))
    }
}

/// Greedy old→new index map: each old element is matched to the earliest
/// unused equal position in the new array; unmatched elements map to `-1`.
///
/// `compare` projects each value to its comparison key; identity when
/// `None`.
pub(crate) fn merge_map(
    old: &[Value],
    new: &[Value],
    compare: Option<&dyn Fn(&Value) -> Value>,
) -> Vec<isize> {
    let project = |v: &Value| -> Value {
        match compare {
            Some(f) => f(v),
            None => v.clone(),
        }
    };
    let new_keys: Vec<Value> = new.iter().map(project).collect();
    let mut used = vec![false; new.len()];
    old.iter()
        .map(|value| {
            let key = project(value);
            for (j, candidate) in new_keys.iter().enumerate() {
                if !used[j] && *candidate == key {
                    used[j] = true;
                    return j as isize;
                }
            }
            -1
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_map_matches_earliest_unused() {
        let old = [Value::from("a"), Value::from("b"), Value::from("c")];
        let new = [Value::from("a"), Value::from("c")];
        assert_eq!(merge_map(&old, &new, None), vec![0, -1, 1]);
    }

    #[test]
    fn merge_map_handles_duplicates() {
        let old = [Value::from("x"), Value::from("x")];
        let new = [Value::from("x"), Value::from("x"), Value::from("x")];
        assert_eq!(merge_map(&old, &new, None), vec![0, 1]);
    }

    #[test]
    fn merge_map_with_comparator() {
        let old = [Value::object([("id", Value::from(1))])];
        let new = [
            Value::object([("id", Value::from(2))]),
            Value::object([("id", Value::from(1))]),
        ];
        let by_id: &dyn Fn(&Value) -> Value = &|v| v.child("id").unwrap_or(Value::Undefined);
        assert_eq!(merge_map(&old, &new, Some(by_id)), vec![1]);
    }
}
