//! The keypath-indexed store: cache, dependency maps, computed values and
//! the batch-flush algorithm.
//!
//! The store is generic over the dependant handle type `D`, the same way
//! the dependency-tracking layer is generic over its node key: the store
//! records *who* depends on *what* but never calls into dependants.
//! [`Store::apply_changes`] returns the notification plan for the batch and
//! the scheduler dispatches it, so marks performed during dispatch simply
//! accumulate for the next flush round.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use ahash::{HashMap, HashSet};

use crate::adaptor::{merge_map, ArrayAdaptor, WrappedList};
use crate::computation::{CaptureFrame, Computation, Computed};
use crate::error::ViewError;
use crate::keypath::Keypath;
use crate::tracer::{ComputeResult, NoopTracer, Tracer};
use crate::value::Value;

/// Dependency groups.
///
/// `Computed` is maintained by the store itself: it indexes which keypaths
/// each computation reads. External dependants register in `Default` or
/// `Observers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepsGroup {
    /// View dependants: fragments, sections, bindings.
    Default,
    /// Explicit observers, including pattern observers.
    Observers,
    /// Computation dependency index (store-managed).
    Computed,
}

impl DepsGroup {
    fn index(self) -> usize {
        match self {
            DepsGroup::Default => 0,
            DepsGroup::Observers => 1,
            DepsGroup::Computed => 2,
        }
    }
}

const EXTERNAL_GROUPS: [DepsGroup; 2] = [DepsGroup::Default, DepsGroup::Observers];

/// One registration slot.
enum Registered<D> {
    External { dependant: D, is_static: bool },
    Computation(Keypath),
}

/// Per-group dependency tables.
///
/// `by_keypath` is the registration list; `map` counts, per parent keypath,
/// the direct children that have registrations somewhere beneath them, so
/// downward cascades can skip untracked subtrees in O(1).
struct DepGroup<D> {
    by_keypath: HashMap<Keypath, Vec<Registered<D>>>,
    map: HashMap<Keypath, HashMap<Keypath, usize>>,
}

impl<D> Default for DepGroup<D> {
    fn default() -> Self {
        DepGroup {
            by_keypath: HashMap::default(),
            map: HashMap::default(),
        }
    }
}

/// A cached lookup result.
///
/// `Missing` distinguishes "key absent on the parent" from an ordinary
/// `Undefined`, so scope-chain fallback can be attempted without repeating
/// the parent traversal; it converts back to `Undefined` on return.
#[derive(Clone, Debug, PartialEq)]
enum CacheSlot {
    Value(Value),
    Missing,
}

impl CacheSlot {
    fn to_value(&self) -> Value {
        match self {
            CacheSlot::Value(v) => v.clone(),
            CacheSlot::Missing => Value::Undefined,
        }
    }
}

/// One pending change.
#[derive(Clone, Debug)]
struct Change {
    keypath: Keypath,
    /// Whether observers at and beneath this keypath are notified.
    /// Index slots removed by a shuffle are marked without cascading to
    /// avoid double notification.
    cascade: bool,
}

/// What a dependant should do with a change.
#[derive(Clone, Debug, PartialEq)]
pub enum NotifyAction {
    /// The dependant's own keypath changed; apply the new value.
    Set {
        /// The dependant's keypath.
        keypath: Keypath,
        /// Its current value.
        value: Value,
    },
    /// A descendant of the dependant's keypath changed.
    Upstream {
        /// The dependant's keypath.
        keypath: Keypath,
        /// Its current value.
        value: Value,
        /// The changed keypaths beneath it, for dependants able to refine.
        changed: Vec<Keypath>,
    },
    /// The list at the dependant's keypath was minimally mutated.
    Shuffle {
        /// The list keypath.
        keypath: Keypath,
        /// One entry per old index: the new index, or `-1` if removed.
        indices: Vec<isize>,
        /// The new list value.
        value: Value,
    },
}

/// One queued notification.
#[derive(Clone, Debug)]
pub struct Notification<D> {
    /// The registered dependant handle.
    pub target: D,
    /// What changed.
    pub action: NotifyAction,
}

/// Result of one [`Store::apply_changes`] flush.
pub struct ChangeOutcome<D> {
    /// Notification plan, in dispatch order.
    pub notifications: Vec<Notification<D>>,
    /// `{keypath → new value}` for the batch's changed keypaths.
    pub changes: Vec<(Keypath, Value)>,
}

impl<D> Default for ChangeOutcome<D> {
    fn default() -> Self {
        ChangeOutcome {
            notifications: Vec::new(),
            changes: Vec::new(),
        }
    }
}

impl<D> ChangeOutcome<D> {
    /// Whether the flush produced no work at all.
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.changes.is_empty()
    }
}

/// The keypath-indexed data store.
pub struct Store<D> {
    root: Value,
    cache: HashMap<Keypath, CacheSlot>,
    /// keypath → cached direct-descendant keypaths, for cache invalidation.
    cache_map: HashMap<Keypath, HashSet<Keypath>>,
    groups: [DepGroup<D>; 3],
    computations: HashMap<Keypath, Computation<D>>,
    wrapped: HashMap<Keypath, WrappedList>,
    changes: Vec<Change>,
    changed_set: HashSet<Keypath>,
    /// Keypaths shuffled this batch; their `Default`-group dependants were
    /// already notified through `pending_notifications`.
    shuffled: HashSet<Keypath>,
    /// Notifications produced eagerly (shuffles), dispatched ahead of the
    /// batch's own plan.
    pending_notifications: Vec<Notification<D>>,
    capture_stack: Vec<CaptureFrame>,
    eval_stack: Vec<Keypath>,
    tracer: Arc<dyn Tracer>,
}

impl<D> Store<D>
where
    D: Copy + Eq + Hash + Debug,
{
    /// Create a store over an initial value tree.
    pub fn new(root: Value) -> Self {
        Self::with_tracer(root, Arc::new(NoopTracer))
    }

    /// Create a store with a tracer.
    pub fn with_tracer(root: Value, tracer: Arc<dyn Tracer>) -> Self {
        Store {
            root,
            cache: HashMap::default(),
            cache_map: HashMap::default(),
            groups: [
                DepGroup::default(),
                DepGroup::default(),
                DepGroup::default(),
            ],
            computations: HashMap::default(),
            wrapped: HashMap::default(),
            changes: Vec::new(),
            changed_set: HashSet::default(),
            shuffled: HashSet::default(),
            pending_notifications: Vec::new(),
            capture_stack: Vec::new(),
            eval_stack: Vec::new(),
            tracer,
        }
    }

    /// The root value.
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Whether the root value or computed registry can answer the first
    /// segment of `keypath`. Used by the resolver's root fallback.
    pub fn root_has(&self, keypath: &Keypath) -> bool {
        self.root.has_child(keypath.first_key()) || self.computations.contains_key(keypath)
    }

    /// Whether a computation is installed at `keypath`.
    pub fn has_computation(&self, keypath: &Keypath) -> bool {
        self.computations.contains_key(keypath)
    }

    /// Whether changes or eager notifications are waiting to be flushed.
    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty() || !self.pending_notifications.is_empty()
    }

    // ------------------------------------------------------------------
    // get
    // ------------------------------------------------------------------

    /// Read the value at `keypath`.
    ///
    /// Cached values are returned directly; otherwise the value resolves
    /// via a computation, or by walking up to the parent value and indexing
    /// into it, and the result is cached. Reads during a computation's
    /// evaluation are recorded as that computation's soft dependencies. A
    /// failed lookup returns `Undefined` (never an error).
    pub fn get(&mut self, keypath: &Keypath) -> Value {
        self.record_capture(keypath);
        if keypath.is_root() {
            return self.root.clone();
        }
        if let Some(slot) = self.cache.get(keypath) {
            let is_missing = matches!(slot, CacheSlot::Missing);
            let value = slot.to_value();
            if is_missing {
                self.record_failed(keypath);
            }
            return value;
        }
        let slot = self.lookup(keypath);
        self.cache.insert(keypath.clone(), slot.clone());
        if let Some(parent) = keypath.parent() {
            self.cache_map
                .entry(parent)
                .or_default()
                .insert(keypath.clone());
        }
        if matches!(slot, CacheSlot::Missing) {
            self.record_failed(keypath);
        }
        slot.to_value()
    }

    fn lookup(&mut self, keypath: &Keypath) -> CacheSlot {
        if self.computations.contains_key(keypath) {
            return CacheSlot::Value(self.evaluate_computation(keypath));
        }
        let parent = keypath
            .parent()
            .expect("non-root keypath always has a parent");
        let parent_value = self.get(&parent);
        match parent_value.child(keypath.last_key()) {
            Some(value) => CacheSlot::Value(value),
            None => CacheSlot::Missing,
        }
    }

    fn record_capture(&mut self, keypath: &Keypath) {
        // Root reads happen mechanically on every parent traversal and
        // would subscribe each computation to everything.
        if keypath.is_root() {
            return;
        }
        if let Some(frame) = self.capture_stack.last_mut() {
            frame.reads.insert(keypath.clone());
        }
    }

    fn record_failed(&mut self, keypath: &Keypath) {
        if let Some(frame) = self.capture_stack.last_mut() {
            frame.failed.insert(keypath.clone());
        }
    }

    // ------------------------------------------------------------------
    // computations
    // ------------------------------------------------------------------

    /// Install a computed value at `keypath`.
    ///
    /// Hard dependencies are registered immediately; soft dependencies are
    /// discovered on each evaluation and diffed against the previous set.
    pub fn compute(&mut self, keypath: Keypath, spec: Computed<D>) {
        let hard = spec.deps.clone();
        self.computations.insert(keypath.clone(), Computation::new(spec));
        for dep in hard {
            self.register_computation_dep(&dep, &keypath);
        }
        self.mark(&keypath);
    }

    fn evaluate_computation(&mut self, keypath: &Keypath) -> Value {
        {
            let comp = self
                .computations
                .get(keypath)
                .expect("caller checked computation exists");
            if comp.evaluated && !comp.dirty {
                return comp.value.clone();
            }
        }
        if self.eval_stack.contains(keypath) {
            // Cyclic computation: degrade rather than recurse forever.
            self.tracer.on_compute(
                keypath,
                &ComputeResult::Error {
                    message: "dependency cycle".to_string(),
                },
            );
            return Value::Undefined;
        }

        let getter = self.computations[keypath].getter.clone();
        self.eval_stack.push(keypath.clone());
        self.capture_stack.push(CaptureFrame::default());
        let result = (*getter)(self);
        let frame = self.capture_stack.pop().expect("frame pushed above");
        self.eval_stack.pop();

        let mut errored = false;
        let value = match result {
            Ok(value) => value,
            Err(error) => {
                errored = true;
                self.tracer.on_compute(
                    keypath,
                    &ComputeResult::Error {
                        message: error.to_string(),
                    },
                );
                Value::Undefined
            }
        };

        // Reconcile discovered dependencies with the previous evaluation's.
        let mut new_soft: HashSet<Keypath> = frame.reads;
        for failed in frame.failed {
            new_soft.insert(failed);
        }
        new_soft.remove(keypath);
        let (old_soft, hard, changed) = {
            let comp = self.computations.get_mut(keypath).expect("still installed");
            let changed = !comp.evaluated || comp.value != value;
            let old = std::mem::replace(&mut comp.soft_deps, new_soft.clone());
            comp.value = value.clone();
            comp.evaluated = true;
            comp.dirty = false;
            (old, comp.hard_deps.clone(), changed)
        };
        for removed in old_soft.difference(&new_soft) {
            if !hard.contains(removed) {
                self.unregister_computation_dep(removed, keypath);
            }
        }
        for added in new_soft.difference(&old_soft) {
            if !hard.contains(added) {
                self.register_computation_dep(added, keypath);
            }
        }

        if !errored {
            self.tracer.on_compute(
                keypath,
                if changed {
                    &ComputeResult::Changed
                } else {
                    &ComputeResult::Unchanged
                },
            );
        }
        value
    }

    // ------------------------------------------------------------------
    // set / mark
    // ------------------------------------------------------------------

    /// Write `value` at `keypath` and mark it changed.
    ///
    /// Writing the current value back is a no-op. A wrapped list keypath
    /// receiving another list delegates to the merge/shuffle path. Writing
    /// a computation invokes its setter, or fails if it has none.
    pub fn set(&mut self, keypath: &Keypath, value: Value) -> Result<(), ViewError> {
        self.set_impl(keypath, value, false)
    }

    /// Write without marking; dependants are not notified.
    pub fn set_silent(&mut self, keypath: &Keypath, value: Value) -> Result<(), ViewError> {
        self.set_impl(keypath, value, true)
    }

    fn set_impl(&mut self, keypath: &Keypath, value: Value, silent: bool) -> Result<(), ViewError> {
        if self.computations.contains_key(keypath) {
            let Some(setter) = self.computations[keypath].setter.clone() else {
                return Err(ViewError::ReadOnlyComputation {
                    keypath: keypath.clone(),
                });
            };
            // Setter errors degrade like getter errors.
            if let Err(error) = (*setter)(self, value) {
                self.tracer.on_compute(
                    keypath,
                    &ComputeResult::Error {
                        message: error.to_string(),
                    },
                );
            }
            if !silent {
                self.mark(keypath);
            }
            return Ok(());
        }

        if !silent && self.get(keypath) == value {
            return Ok(());
        }

        // Wrapped list reset: another list arriving becomes a merge.
        if !silent && self.wrapped.contains_key(keypath) {
            if let (Value::List(_), Value::List(new_items)) = (self.get(keypath), &value) {
                return self.merge(keypath, new_items.clone(), None);
            }
        }

        self.write(keypath, value)?;
        if !silent {
            self.mark(keypath);
        } else {
            self.invalidate_cache(keypath);
        }
        Ok(())
    }

    /// Assign into the root tree, creating branches as needed; the branch
    /// shape (list vs object) follows the next key's syntax.
    fn write(&mut self, keypath: &Keypath, value: Value) -> Result<(), ViewError> {
        if keypath.is_root() {
            self.root = value;
            return Ok(());
        }
        let segments: Vec<String> = keypath.keys().map(str::to_string).collect();
        let mut current = &mut self.root;
        let mut walked = Keypath::root();
        for (i, key) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            if last {
                if !current.set_child(key, value) {
                    return Err(ViewError::NotAContainer { keypath: walked });
                }
                return Ok(());
            }
            if current.is_nullish() {
                *current = Value::branch_for_key(key);
            }
            let next_key = &segments[i + 1];
            match current.child(key) {
                Some(child) if !child.is_nullish() => {}
                _ => {
                    if !current.set_child(key, Value::branch_for_key(next_key)) {
                        return Err(ViewError::NotAContainer { keypath: walked });
                    }
                }
            }
            walked = walked.join(key);
            current = match current {
                Value::Object(map) => map.get_mut(key.as_str()).expect("just ensured"),
                Value::List(items) => {
                    let index: usize = key.parse().map_err(|_| ViewError::NotAContainer {
                        keypath: walked.clone(),
                    })?;
                    &mut items[index]
                }
                _ => {
                    return Err(ViewError::NotAContainer { keypath: walked });
                }
            };
        }
        Ok(())
    }

    /// Record `keypath` as changed: invalidate a computation at that exact
    /// keypath, enqueue the change (deduplicated) and clear the cached
    /// value and all cached descendants.
    pub fn mark(&mut self, keypath: &Keypath) {
        self.mark_with(keypath, true);
    }

    pub(crate) fn mark_no_cascade(&mut self, keypath: &Keypath) {
        self.mark_with(keypath, false);
    }

    fn mark_with(&mut self, keypath: &Keypath, cascade: bool) {
        if let Some(comp) = self.computations.get_mut(keypath) {
            comp.dirty = true;
        }
        if self.changed_set.insert(keypath.clone()) {
            self.tracer.on_change(keypath);
            self.changes.push(Change {
                keypath: keypath.clone(),
                cascade,
            });
        } else if cascade {
            // A no-cascade mark upgraded by a later full mark.
            if let Some(change) = self.changes.iter_mut().find(|c| c.keypath == *keypath) {
                change.cascade = true;
            }
        }
        self.invalidate_cache(keypath);
    }

    /// Drop the cached value at `keypath`, every cached descendant, and
    /// the cached ancestor values (cached values are owned clones, so a
    /// stale ancestor would resurrect the old subtree on the next walk).
    fn invalidate_cache(&mut self, keypath: &Keypath) {
        self.clear_cache(keypath);
        for ancestor in keypath.ancestors() {
            self.cache.remove(&ancestor);
        }
    }

    fn clear_cache(&mut self, keypath: &Keypath) {
        self.cache.remove(keypath);
        if let Some(children) = self.cache_map.remove(keypath) {
            for child in children {
                self.clear_cache(&child);
            }
        }
    }

    // ------------------------------------------------------------------
    // registration
    // ------------------------------------------------------------------

    /// Register a dependant at `keypath` (wildcard patterns allowed in the
    /// `Observers` group).
    pub fn register(&mut self, keypath: &Keypath, dependant: D, group: DepsGroup) {
        self.register_entry(
            group,
            keypath,
            Registered::External {
                dependant,
                is_static: false,
            },
        );
    }

    /// Register a one-time (static) dependant; static dependants never
    /// reregister during rebinds.
    pub fn register_static(&mut self, keypath: &Keypath, dependant: D, group: DepsGroup) {
        self.register_entry(
            group,
            keypath,
            Registered::External {
                dependant,
                is_static: true,
            },
        );
    }

    /// Remove a dependant registration.
    pub fn unregister(&mut self, keypath: &Keypath, dependant: D, group: DepsGroup) {
        let slots = &mut self.groups[group.index()];
        let mut emptied = false;
        if let Some(list) = slots.by_keypath.get_mut(keypath) {
            if let Some(pos) = list.iter().position(
                |r| matches!(r, Registered::External { dependant: d, .. } if *d == dependant),
            ) {
                list.remove(pos);
                emptied = list.is_empty();
                self.decrement_deps_map(group, keypath);
            }
        }
        if emptied {
            self.groups[group.index()].by_keypath.remove(keypath);
        }
    }

    fn register_computation_dep(&mut self, keypath: &Keypath, computation: &Keypath) {
        self.register_entry(
            DepsGroup::Computed,
            keypath,
            Registered::Computation(computation.clone()),
        );
    }

    fn unregister_computation_dep(&mut self, keypath: &Keypath, computation: &Keypath) {
        let slots = &mut self.groups[DepsGroup::Computed.index()];
        if let Some(list) = slots.by_keypath.get_mut(keypath) {
            if let Some(pos) = list
                .iter()
                .position(|r| matches!(r, Registered::Computation(c) if c == computation))
            {
                list.remove(pos);
                self.decrement_deps_map(DepsGroup::Computed, keypath);
            }
        }
    }

    fn register_entry(&mut self, group: DepsGroup, keypath: &Keypath, entry: Registered<D>) {
        let slots = &mut self.groups[group.index()];
        slots
            .by_keypath
            .entry(keypath.clone())
            .or_default()
            .push(entry);
        if keypath.is_pattern() {
            return;
        }
        // Count this registration on every (ancestor, child-on-path) edge.
        let mut child = keypath.clone();
        while let Some(parent) = child.parent() {
            *slots
                .map
                .entry(parent.clone())
                .or_default()
                .entry(child)
                .or_insert(0) += 1;
            child = parent;
        }
    }

    fn decrement_deps_map(&mut self, group: DepsGroup, keypath: &Keypath) {
        if keypath.is_pattern() {
            return;
        }
        let slots = &mut self.groups[group.index()];
        let mut child = keypath.clone();
        while let Some(parent) = child.parent() {
            if let Some(children) = slots.map.get_mut(&parent) {
                if let Some(count) = children.get_mut(&child) {
                    *count -= 1;
                    if *count == 0 {
                        children.remove(&child);
                    }
                }
                if children.is_empty() {
                    slots.map.remove(&parent);
                }
            }
            child = parent;
        }
    }

    fn external_deps_at(&self, group: DepsGroup, keypath: &Keypath) -> Vec<D> {
        self.groups[group.index()]
            .by_keypath
            .get(keypath)
            .map(|list| {
                list.iter()
                    .filter_map(|r| match r {
                        Registered::External { dependant, .. } => Some(*dependant),
                        Registered::Computation(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // wrapped lists
    // ------------------------------------------------------------------

    /// Install the list wrapper at `keypath` so whole-value sets merge
    /// instead of resetting.
    pub fn adapt(&mut self, keypath: &Keypath) {
        self.wrapped.insert(keypath.clone(), WrappedList);
    }

    /// Whether `keypath` carries the list wrapper.
    pub fn is_wrapped(&self, keypath: &Keypath) -> bool {
        self.wrapped.contains_key(keypath)
    }

    /// The blessed mutation surface over the list at `keypath`; installs
    /// the wrapper if absent.
    pub fn adaptor(&mut self, keypath: &Keypath) -> ArrayAdaptor<'_, D> {
        self.adapt(keypath);
        ArrayAdaptor::new(self, keypath.clone())
    }

    /// Merge a new list into `keypath`: compute the old→new index map
    /// (greedy earliest-unused matching, optionally through a comparator)
    /// and delegate to [`Store::smart_update`].
    pub fn merge(
        &mut self,
        keypath: &Keypath,
        new_items: Vec<Value>,
        compare: Option<&dyn Fn(&Value) -> Value>,
    ) -> Result<(), ViewError> {
        let old_items = match self.get(keypath) {
            Value::List(items) => items,
            // Nothing list-shaped to merge into: plain set.
            _ => return self.set(keypath, Value::List(new_items)),
        };
        let indices = merge_map(&old_items, &new_items, compare);
        self.smart_update(keypath, new_items, indices)
    }

    /// Apply a minimal list mutation: mark removed slots (without
    /// re-cascading observers there), silently set the new array, hand
    /// `Default`-group dependants a shuffle, and mark `length` and the
    /// newly-added indices.
    pub fn smart_update(
        &mut self,
        keypath: &Keypath,
        new_items: Vec<Value>,
        new_indices: Vec<isize>,
    ) -> Result<(), ViewError> {
        let old_len = new_indices.len();
        let new_len = new_items.len();

        for (old_index, &target) in new_indices.iter().enumerate() {
            if target == -1 {
                self.mark_no_cascade(&keypath.join_index(old_index));
            }
        }

        self.set_silent(keypath, Value::List(new_items.clone()))?;
        self.mark_no_cascade(keypath);
        self.shuffled.insert(keypath.clone());

        let value = Value::List(new_items);
        for dependant in self.external_deps_at(DepsGroup::Default, keypath) {
            self.pending_notifications.push(Notification {
                target: dependant,
                action: NotifyAction::Shuffle {
                    keypath: keypath.clone(),
                    indices: new_indices.clone(),
                    value: value.clone(),
                },
            });
        }

        if new_len != old_len {
            self.mark(&keypath.join("length"));
        }
        for new_index in 0..new_len {
            if !new_indices.contains(&(new_index as isize)) {
                self.mark(&keypath.join_index(new_index));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // flush
    // ------------------------------------------------------------------

    /// Flush the pending change list: cascade computation invalidations,
    /// match pattern observers, and build the notification plan for plain
    /// dependants. Runs once per flush round; the scheduler re-invokes it
    /// until no changes remain.
    pub fn apply_changes(&mut self) -> ChangeOutcome<D> {
        let mut notifications = std::mem::take(&mut self.pending_notifications);
        if self.changes.is_empty() {
            return ChangeOutcome {
                notifications,
                changes: Vec::new(),
            };
        }
        let mut queue = std::mem::take(&mut self.changes);
        self.changed_set.clear();
        let shuffled = std::mem::take(&mut self.shuffled);

        // 1+2. Closure of invalidated computations: a change invalidates
        // computations reading the keypath itself, any ancestor of it, or
        // any descendant of it; each invalidation is itself a change.
        let mut seen: HashSet<Keypath> = queue.iter().map(|c| c.keypath.clone()).collect();
        let mut i = 0;
        while i < queue.len() {
            let kp = queue[i].keypath.clone();
            let mut targets: Vec<Keypath> = Vec::new();
            for at in std::iter::once(kp.clone()).chain(kp.ancestors()) {
                self.collect_computations_at(&at, &mut targets);
            }
            self.collect_computations_below(&kp, &mut targets);
            for comp_kp in targets {
                if !seen.insert(comp_kp.clone()) {
                    continue;
                }
                if let Some(comp) = self.computations.get_mut(&comp_kp) {
                    comp.dirty = true;
                }
                self.clear_cache(&comp_kp);
                queue.push(Change {
                    keypath: comp_kp,
                    cascade: true,
                });
            }
            i += 1;
        }

        // 3. Pattern observers: once per (observer, pattern) per batch.
        let pattern_regs: Vec<(Keypath, Vec<D>)> = self.groups
            [DepsGroup::Observers.index()]
        .by_keypath
        .iter()
        .filter(|(kp, _)| kp.is_pattern())
        .map(|(kp, list)| {
            (
                kp.clone(),
                list.iter()
                    .filter_map(|r| match r {
                        Registered::External { dependant, .. } => Some(*dependant),
                        Registered::Computation(_) => None,
                    })
                    .collect(),
            )
        })
        .collect();
        if !pattern_regs.is_empty() {
            let mut pattern_notified: HashSet<(D, Keypath)> = HashSet::default();
            for change in queue.iter().filter(|c| c.cascade).cloned().collect::<Vec<_>>() {
                if change.keypath.is_special() {
                    continue;
                }
                for (pattern, observers) in &pattern_regs {
                    for concrete in self.concrete_matches(&change.keypath, pattern) {
                        let value = self.get(&concrete);
                        for dependant in observers {
                            if pattern_notified.insert((*dependant, pattern.clone())) {
                                notifications.push(Notification {
                                    target: *dependant,
                                    action: NotifyAction::Set {
                                        keypath: concrete.clone(),
                                        value: value.clone(),
                                    },
                                });
                            }
                        }
                    }
                }
            }
        }

        // 4a. Upstream: ancestors of every change, deepest first, skipping
        // keypaths that changed in their own right.
        let mut upstream: Vec<Keypath> = Vec::new();
        let mut upstream_seen: HashSet<Keypath> = HashSet::default();
        for change in &queue {
            for ancestor in change.keypath.ancestors() {
                if !seen.contains(&ancestor) && upstream_seen.insert(ancestor.clone()) {
                    upstream.push(ancestor);
                }
            }
        }
        upstream.sort_by_key(|kp| std::cmp::Reverse(kp.keys().count()));
        for ancestor in upstream {
            let value = self.get(&ancestor);
            let changed_children: Vec<Keypath> = queue
                .iter()
                .filter(|c| c.keypath.starts_with(&ancestor) && c.keypath != ancestor)
                .map(|c| c.keypath.clone())
                .collect();
            for group in EXTERNAL_GROUPS {
                for dependant in self.external_deps_at(group, &ancestor) {
                    notifications.push(Notification {
                        target: dependant,
                        action: NotifyAction::Upstream {
                            keypath: ancestor.clone(),
                            value: value.clone(),
                            changed: changed_children.clone(),
                        },
                    });
                }
            }
        }

        // 4b. Exact and downstream dependants.
        let mut notified: HashSet<(D, Keypath)> = HashSet::default();
        for change in queue.clone() {
            if shuffled.contains(&change.keypath) {
                // Default-group dependants already received the shuffle;
                // observers still see the new value.
                let value = self.get(&change.keypath);
                for dependant in self.external_deps_at(DepsGroup::Observers, &change.keypath) {
                    if notified.insert((dependant, change.keypath.clone())) {
                        notifications.push(Notification {
                            target: dependant,
                            action: NotifyAction::Set {
                                keypath: change.keypath.clone(),
                                value: value.clone(),
                            },
                        });
                    }
                }
                continue;
            }
            if !change.cascade {
                continue;
            }
            let value = self.get(&change.keypath);
            for group in EXTERNAL_GROUPS {
                for dependant in self.external_deps_at(group, &change.keypath) {
                    if notified.insert((dependant, change.keypath.clone())) {
                        notifications.push(Notification {
                            target: dependant,
                            action: NotifyAction::Set {
                                keypath: change.keypath.clone(),
                                value: value.clone(),
                            },
                        });
                    }
                }
            }
            self.notify_descendants(&change.keypath, &mut notified, &mut notifications);
        }

        let changes_out: Vec<(Keypath, Value)> = queue
            .iter()
            .filter(|c| c.cascade)
            .map(|c| (c.keypath.clone(), self.get(&c.keypath)))
            .collect();

        ChangeOutcome {
            notifications,
            changes: changes_out,
        }
    }

    fn collect_computations_at(&self, keypath: &Keypath, out: &mut Vec<Keypath>) {
        if let Some(list) = self.groups[DepsGroup::Computed.index()]
            .by_keypath
            .get(keypath)
        {
            for entry in list {
                if let Registered::Computation(comp_kp) = entry {
                    out.push(comp_kp.clone());
                }
            }
        }
    }

    /// Computations registered strictly beneath `keypath`, found through
    /// the deps-map counters.
    fn collect_computations_below(&self, keypath: &Keypath, out: &mut Vec<Keypath>) {
        let slots = &self.groups[DepsGroup::Computed.index()];
        let Some(children) = slots.map.get(keypath) else {
            return;
        };
        let children: Vec<Keypath> = children.keys().cloned().collect();
        for child in children {
            self.collect_computations_at(&child, out);
            self.collect_computations_below(&child, out);
        }
    }

    /// Notify dependants at descendant keypaths of a cascading change,
    /// each with its own current value.
    fn notify_descendants(
        &mut self,
        keypath: &Keypath,
        notified: &mut HashSet<(D, Keypath)>,
        notifications: &mut Vec<Notification<D>>,
    ) {
        let mut children: Vec<Keypath> = Vec::new();
        for group in EXTERNAL_GROUPS {
            if let Some(map) = self.groups[group.index()].map.get(keypath) {
                children.extend(map.keys().cloned());
            }
        }
        children.sort();
        children.dedup();
        for child in children {
            let value = self.get(&child);
            for group in EXTERNAL_GROUPS {
                for dependant in self.external_deps_at(group, &child) {
                    if notified.insert((dependant, child.clone())) {
                        notifications.push(Notification {
                            target: dependant,
                            action: NotifyAction::Set {
                                keypath: child.clone(),
                                value: value.clone(),
                            },
                        });
                    }
                }
            }
            self.notify_descendants(&child, notified, notifications);
        }
    }

    /// Concrete keypaths matching `pattern` that are at or beneath the
    /// changed `keypath`.
    fn concrete_matches(&mut self, keypath: &Keypath, pattern: &Keypath) -> Vec<Keypath> {
        if keypath.matches_pattern(pattern) {
            return vec![keypath.clone()];
        }
        let concrete: Vec<String> = keypath.keys().map(str::to_string).collect();
        let parts: Vec<String> = pattern.keys().map(str::to_string).collect();
        if parts.len() <= concrete.len() {
            return Vec::new();
        }
        for (have, want) in concrete.iter().zip(parts.iter()) {
            if want != "*" && want != have {
                return Vec::new();
            }
        }
        // The pattern extends below the changed keypath: expand the
        // remaining segments against the current value.
        let mut frontier = vec![keypath.clone()];
        for part in &parts[concrete.len()..] {
            let mut next = Vec::new();
            for base in &frontier {
                let value = self.get(base);
                if part == "*" {
                    for key in value.child_keys() {
                        next.push(base.join(&key));
                    }
                } else if value.has_child(part) {
                    next.push(base.join(part));
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        frontier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: Value) -> Store<u32> {
        Store::new(root)
    }

    #[test]
    fn get_walks_up_and_caches() {
        let mut s = store(Value::object([(
            "user",
            Value::object([("name", Value::from("ada"))]),
        )]));
        assert_eq!(s.get(&Keypath::from("user.name")), Value::from("ada"));
        // Second read hits the cache.
        assert!(s.cache.contains_key(&Keypath::from("user.name")));
        assert_eq!(s.get(&Keypath::from("user.name")), Value::from("ada"));
    }

    #[test]
    fn failed_lookup_is_cached_and_returns_undefined() {
        let mut s = store(Value::object([("user", Value::object::<&str, _>([]))]));
        assert_eq!(s.get(&Keypath::from("user.missing")), Value::Undefined);
        assert_eq!(
            s.cache.get(&Keypath::from("user.missing")),
            Some(&CacheSlot::Missing)
        );
        // Nullish parents are silent no-ops too.
        assert_eq!(s.get(&Keypath::from("ghost.deep.path")), Value::Undefined);
    }

    #[test]
    fn mark_clears_descendant_cache() {
        let mut s = store(Value::object([(
            "a",
            Value::object([("b", Value::object([("c", Value::from(1))]))]),
        )]));
        s.get(&Keypath::from("a.b.c"));
        assert!(s.cache.contains_key(&Keypath::from("a.b.c")));
        s.mark(&Keypath::from("a"));
        assert!(!s.cache.contains_key(&Keypath::from("a.b")));
        assert!(!s.cache.contains_key(&Keypath::from("a.b.c")));
    }

    #[test]
    fn set_creates_branches_by_key_syntax() {
        let mut s = store(Value::object::<&str, _>([]));
        s.set(&Keypath::from("list.0.name"), Value::from("x")).unwrap();
        assert_eq!(s.root().child("list").unwrap().len(), Some(1));
        s.set(&Keypath::from("obj.key"), Value::from(1)).unwrap();
        assert!(matches!(s.root().child("obj"), Some(Value::Object(_))));
    }

    #[test]
    fn idempotent_set_produces_no_notifications() {
        let mut s = store(Value::object([("x", Value::from(1))]));
        s.register(&Keypath::from("x"), 7, DepsGroup::Default);
        s.set(&Keypath::from("x"), Value::from(1)).unwrap();
        let outcome = s.apply_changes();
        assert!(outcome.notifications.is_empty());
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn set_on_readonly_computation_is_an_error() {
        let mut s = store(Value::object::<&str, _>([]));
        s.compute(
            Keypath::from("c"),
            Computed::new(|_| Ok(Value::from(1))),
        );
        assert!(matches!(
            s.set(&Keypath::from("c"), Value::from(2)),
            Err(ViewError::ReadOnlyComputation { .. })
        ));
    }

    #[test]
    fn computation_error_degrades_to_undefined() {
        let mut s = store(Value::object::<&str, _>([]));
        s.compute(
            Keypath::from("boom"),
            Computed::new(|_| Err(anyhow::anyhow!("nope"))),
        );
        assert_eq!(s.get(&Keypath::from("boom")), Value::Undefined);
    }

    #[test]
    fn soft_deps_are_diffed_between_evaluations() {
        let mut s = store(Value::object([
            ("which", Value::from(true)),
            ("a", Value::from(1)),
            ("b", Value::from(2)),
        ]));
        s.compute(
            Keypath::from("pick"),
            Computed::new(|store| {
                let which = store.get(&Keypath::from("which"));
                Ok(if which.is_truthy() {
                    store.get(&Keypath::from("a"))
                } else {
                    store.get(&Keypath::from("b"))
                })
            }),
        );
        assert_eq!(s.get(&Keypath::from("pick")), Value::from(1));
        let soft = &s.computations[&Keypath::from("pick")].soft_deps;
        assert!(soft.contains(&Keypath::from("a")));
        assert!(!soft.contains(&Keypath::from("b")));

        s.set(&Keypath::from("which"), Value::from(false)).unwrap();
        let _ = s.apply_changes();
        assert_eq!(s.get(&Keypath::from("pick")), Value::from(2));
        let soft = &s.computations[&Keypath::from("pick")].soft_deps;
        assert!(!soft.contains(&Keypath::from("a")));
        assert!(soft.contains(&Keypath::from("b")));
    }

    #[test]
    fn cyclic_computations_degrade() {
        let mut s = store(Value::object::<&str, _>([]));
        s.compute(
            Keypath::from("x"),
            Computed::new(|store| Ok(store.get(&Keypath::from("x")))),
        );
        assert_eq!(s.get(&Keypath::from("x")), Value::Undefined);
    }
}
