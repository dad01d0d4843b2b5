//! The view runtime: instances, dependant dispatch, fragment lifecycle and
//! the flush driver.
//!
//! The runtime owns every arena — instances (each with its own store), the
//! fragment/item tree, the render document and the runloop — and hands out
//! ids. Stores report notification plans; the runtime routes each entry to
//! the item, observer or cross-instance mapping it addresses, re-flushing
//! until the system converges.

use std::sync::Arc;

use ahash::HashMap;
use slab::Slab;

use crate::adaptor::ArrayAdaptor;
use crate::binding::{create_binding, BoundAttribute, ControlInput};
use crate::computation::Computed;
use crate::error::ViewError;
use crate::expression::evaluate;
use crate::fragment::{
    AttributeState, BindingSlot, ElementState, FragmentId, FragmentNode, InterpolatorState,
    ItemId, ItemKind, ItemNode, SectionState, TextState, ViewTree,
};
use crate::keypath::Keypath;
use crate::registry::{Registries, TransitionSpec};
use crate::render::{ControlState, Document, NodeId, NodeKind};
use crate::resolver::{
    resolve_reference, Attempt, ExprResolverState, MemberPartState, MustacheResolver,
    RefResolverState, ResolvedRef, ScopeChain,
};
use crate::runloop::{Frame, PendingTransition, Runloop};
use crate::section::{plan_reevaluate, shuffle_plan, Reeval, SectionMode};
use crate::store::{DepsGroup, Notification, NotifyAction, Store};
use crate::template::{SectionKind, Template, TemplateItem};
use crate::tracer::{FlushId, NoopTracer, ShuffleStats, Tracer};
use crate::value::Value;

/// Handle to an instance.
pub type InstanceId = usize;

/// The store type the runtime instantiates.
pub type ViewStore = Store<Dependant>;

type DeferredTask = Box<dyn FnOnce(&mut ViewRuntime)>;

/// Observer callback type.
pub type ObserverFn = Box<dyn FnMut(&mut ViewRuntime, &Keypath, &Value)>;

/// Safety bound on flush rounds; a non-cyclic graph converges far sooner.
const MAX_FLUSH_ROUNDS: usize = 128;

/// A registered dependant handle, routed by the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Dependant {
    /// A view item (interpolator, section or bound element).
    Item(ItemId),
    /// One member part of an item's reference expression.
    ItemMember {
        /// The owning item.
        item: ItemId,
        /// Flat member index.
        member: u32,
    },
    /// An explicit observer.
    Observer {
        /// Owning instance.
        instance: InstanceId,
        /// Observer id within the instance.
        id: u64,
    },
    /// One side of a cross-instance mapping.
    Mapping {
        /// Owning instance.
        instance: InstanceId,
        /// Mapping id within the instance.
        id: u64,
    },
}

/// Options for [`ViewRuntime::observe`].
#[derive(Debug, Clone, Copy)]
pub struct ObserveOptions {
    /// Call the observer immediately with the current value.
    pub init: bool,
    /// Defer the initial call to the next flush.
    pub defer: bool,
    /// Unregister after the first notification.
    pub once: bool,
}

impl Default for ObserveOptions {
    fn default() -> Self {
        ObserveOptions {
            init: true,
            defer: false,
            once: false,
        }
    }
}

/// Handle for cancelling an observer.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    instance: InstanceId,
    id: u64,
    keypath: Keypath,
}

struct ObserverEntry {
    keypath: Keypath,
    callback: Option<ObserverFn>,
    once: bool,
}

/// One side of a two-way cross-instance binding.
///
/// Echo cycles stop on value equality: propagating an unchanged value is a
/// no-op in the receiving store.
struct Mapping {
    other_instance: InstanceId,
    other_keypath: Keypath,
}

struct Instance {
    store: ViewStore,
    parent: Option<InstanceId>,
    isolated: bool,
    root_fragment: Option<FragmentId>,
    observers: HashMap<u64, ObserverEntry>,
    mappings: HashMap<u64, Mapping>,
    next_id: u64,
    registries: Registries,
    /// Items with unresolved references, retried once per flush round.
    pending: Vec<ItemId>,
}

impl Instance {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Builder for [`ViewRuntime`].
///
/// # Example
///
/// ```ignore
/// let runtime = ViewRuntime::builder()
///     .data(Value::object([("name", Value::from("world"))]))
///     .template(template([TemplateItem::Interpolator(Mustache::Reference("name".into()))]))
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    data: Value,
    template: Template,
    tracer: Arc<dyn Tracer>,
    adapt_arrays: bool,
    globals: Registries,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            data: Value::Object(Default::default()),
            template: Vec::new().into(),
            tracer: Arc::new(NoopTracer),
            adapt_arrays: true,
            globals: Registries::default(),
        }
    }
}

impl RuntimeBuilder {
    /// Set the initial data tree.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Set the root template.
    pub fn template(mut self, template: Template) -> Self {
        self.template = template;
        self
    }

    /// Install a tracer.
    pub fn tracer(mut self, tracer: impl Tracer + 'static) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Whether `set` of a list value installs the array wrapper
    /// automatically.
    pub fn adapt_arrays(mut self, adapt: bool) -> Self {
        self.adapt_arrays = adapt;
        self
    }

    /// Register a global partial.
    pub fn partial(mut self, name: impl Into<String>, template: Template) -> Self {
        self.globals.partials.insert(name, template);
        self
    }

    /// Register a global transition.
    pub fn transition(mut self, name: impl Into<String>, spec: TransitionSpec) -> Self {
        self.globals.transitions.insert(name, spec);
        self
    }

    /// Build and render the runtime.
    pub fn build(self) -> Result<ViewRuntime, ViewError> {
        let mut runtime = ViewRuntime {
            instances: Slab::new(),
            tree: ViewTree::new(),
            doc: Document::new(),
            runloop: Runloop::default(),
            globals: self.globals,
            tracer: self.tracer.clone(),
            adapt_arrays: self.adapt_arrays,
            root: 0,
        };
        let root = runtime.create_instance(None, false, self.data);
        runtime.root = root;
        runtime.start();
        let result = (|| {
            let fragment = runtime.construct_fragment(FragmentSpec::root(root), &self.template)?;
            runtime.instances[root].root_fragment = Some(fragment);
            runtime.render_fragment(fragment, None, None);
            Ok(())
        })();
        runtime.end();
        result?;
        Ok(runtime)
    }
}

/// Construction parameters for a fragment.
struct FragmentSpec {
    instance: InstanceId,
    owner: Option<ItemId>,
    attr_owner: Option<(ItemId, usize)>,
    context: Option<Keypath>,
    index: Option<usize>,
    index_ref: Option<String>,
    key: Option<String>,
}

impl FragmentSpec {
    fn root(instance: InstanceId) -> Self {
        FragmentSpec {
            instance,
            owner: None,
            attr_owner: None,
            context: None,
            index: None,
            index_ref: None,
            key: None,
        }
    }
}

/// Where an expression computation reads each sub-reference from.
enum ExprSource {
    Keypath(Keypath),
    Literal(Value),
}

/// The reactive view runtime.
pub struct ViewRuntime {
    instances: Slab<Instance>,
    tree: ViewTree,
    doc: Document,
    runloop: Runloop<DeferredTask>,
    globals: Registries,
    tracer: Arc<dyn Tracer>,
    adapt_arrays: bool,
    root: InstanceId,
}

impl ViewRuntime {
    /// Build a runtime from a template and data.
    pub fn new(template: Template, data: Value) -> Result<Self, ViewError> {
        Self::builder().template(template).data(data).build()
    }

    /// Start configuring a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    fn create_instance(
        &mut self,
        parent: Option<InstanceId>,
        isolated: bool,
        data: Value,
    ) -> InstanceId {
        self.instances.insert(Instance {
            store: Store::with_tracer(data, self.tracer.clone()),
            parent,
            isolated,
            root_fragment: None,
            observers: HashMap::default(),
            mappings: HashMap::default(),
            next_id: 0,
            registries: Registries::default(),
            pending: Vec::new(),
        })
    }

    /// The root instance's registries, for installing partials and
    /// transitions after construction.
    pub fn registries_mut(&mut self) -> &mut Registries {
        &mut self.instances[self.root].registries
    }

    /// The rendered document.
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// Serialize the rendered document.
    pub fn render_to_string(&self) -> String {
        self.doc.to_markup()
    }

    // ------------------------------------------------------------------
    // Public data API (root instance)
    // ------------------------------------------------------------------

    /// Read a keypath on the root instance.
    pub fn get(&mut self, keypath: &str) -> Value {
        let kp = Keypath::from(keypath);
        self.instances[self.root].store.get(&kp)
    }

    /// Write a keypath on the root instance and flush.
    pub fn set(&mut self, keypath: &str, value: Value) -> Result<(), ViewError> {
        let kp = Keypath::from(keypath);
        if self.adapt_arrays && matches!(value, Value::List(_)) {
            self.instances[self.root].store.adapt(&kp);
        }
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.set(&kp, value)
        })
    }

    /// Mark a keypath as changed (after external mutation) and flush.
    pub fn update(&mut self, keypath: &str) {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.mark(&kp);
        });
    }

    /// Install a computed value on the root instance.
    pub fn compute(&mut self, keypath: &str, spec: Computed<Dependant>) {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.compute(kp, spec);
        });
    }

    /// Observe a keypath (wildcard patterns allowed).
    pub fn observe(
        &mut self,
        keypath: &str,
        callback: impl FnMut(&mut ViewRuntime, &Keypath, &Value) + 'static,
        options: ObserveOptions,
    ) -> ObserverHandle {
        let kp = Keypath::from(keypath);
        let root = self.root;
        let id = self.instances[root].alloc_id();
        self.instances[root].observers.insert(
            id,
            ObserverEntry {
                keypath: kp.clone(),
                callback: Some(Box::new(callback)),
                once: options.once,
            },
        );
        self.instances[root].store.register(
            &kp,
            Dependant::Observer { instance: root, id },
            DepsGroup::Observers,
        );
        if options.init && !kp.is_pattern() {
            if options.defer {
                self.with_frame(|rt| {
                    rt.runloop
                        .defer(Box::new(move |rt| rt.call_observer(root, id, None)));
                });
            } else {
                self.call_observer(root, id, None);
            }
        }
        ObserverHandle {
            instance: root,
            id,
            keypath: kp,
        }
    }

    /// Cancel an observer.
    pub fn unobserve(&mut self, handle: &ObserverHandle) {
        if self.instances[handle.instance]
            .observers
            .remove(&handle.id)
            .is_some()
        {
            self.instances[handle.instance].store.unregister(
                &handle.keypath,
                Dependant::Observer {
                    instance: handle.instance,
                    id: handle.id,
                },
                DepsGroup::Observers,
            );
        }
    }

    fn call_observer(&mut self, instance: InstanceId, id: u64, at: Option<(Keypath, Value)>) {
        let (keypath, mut callback, once) = {
            let Some(entry) = self.instances[instance].observers.get_mut(&id) else {
                return;
            };
            let keypath = match &at {
                Some((kp, _)) => kp.clone(),
                None => entry.keypath.clone(),
            };
            let Some(callback) = entry.callback.take() else {
                return;
            };
            (keypath, callback, entry.once)
        };
        let value = match at {
            Some((_, value)) => value,
            None => self.instances[instance].store.get(&keypath),
        };
        callback(self, &keypath, &value);
        if once {
            let registered = self.instances[instance]
                .observers
                .remove(&id)
                .map(|entry| entry.keypath);
            if let Some(kp) = registered {
                self.instances[instance].store.unregister(
                    &kp,
                    Dependant::Observer { instance, id },
                    DepsGroup::Observers,
                );
            }
        } else if let Some(entry) = self.instances[instance].observers.get_mut(&id) {
            entry.callback = Some(callback);
        }
    }

    /// Merge a new list into a keypath, matching elements (optionally via a
    /// comparator) so unaffected fragments survive.
    pub fn merge(
        &mut self,
        keypath: &str,
        new_items: Vec<Value>,
        compare: Option<&dyn Fn(&Value) -> Value>,
    ) -> Result<(), ViewError> {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.merge(&kp, new_items, compare)
        })
    }

    /// Append to a list keypath through the array adaptor.
    pub fn push(&mut self, keypath: &str, value: Value) -> Result<(), ViewError> {
        self.list_op(keypath, move |a| a.push(value))
    }

    /// Pop the last element of a list keypath.
    pub fn pop(&mut self, keypath: &str) -> Result<Option<Value>, ViewError> {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.adaptor(&kp).pop()
        })
    }

    /// Prepend to a list keypath through the array adaptor.
    pub fn unshift(&mut self, keypath: &str, value: Value) -> Result<(), ViewError> {
        self.list_op(keypath, move |a| a.unshift(value))
    }

    /// Remove the first element of a list keypath.
    pub fn shift(&mut self, keypath: &str) -> Result<Option<Value>, ViewError> {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root].store.adaptor(&kp).shift()
        })
    }

    /// Splice a list keypath: remove `delete` elements at `start`, insert
    /// `insert` in their place.
    pub fn splice(
        &mut self,
        keypath: &str,
        start: usize,
        delete: usize,
        insert: Vec<Value>,
    ) -> Result<Vec<Value>, ViewError> {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            rt.instances[root]
                .store
                .adaptor(&kp)
                .splice(start, delete, insert)
        })
    }

    fn list_op(
        &mut self,
        keypath: &str,
        op: impl FnOnce(&mut ArrayAdaptor<'_, Dependant>) -> Result<(), ViewError>,
    ) -> Result<(), ViewError> {
        let kp = Keypath::from(keypath);
        let root = self.root;
        self.with_frame(|rt| {
            rt.runloop.touch(root);
            let mut adaptor = rt.instances[root].store.adaptor(&kp);
            op(&mut adaptor)
        })
    }

    /// Attach a nested (child) instance; its unresolved references resolve
    /// through the root instance unless `isolated`.
    pub fn attach_child(
        &mut self,
        template: Template,
        data: Value,
        isolated: bool,
    ) -> Result<InstanceId, ViewError> {
        let parent = self.root;
        let child = self.create_instance(Some(parent), isolated, data);
        self.start();
        let result = (|| {
            let fragment = self.construct_fragment(FragmentSpec::root(child), &template)?;
            self.instances[child].root_fragment = Some(fragment);
            self.render_fragment(fragment, None, None);
            Ok(child)
        })();
        self.end();
        result
    }

    /// Read a keypath on a specific instance.
    pub fn get_in(&mut self, instance: InstanceId, keypath: &str) -> Value {
        let kp = Keypath::from(keypath);
        self.instances[instance].store.get(&kp)
    }

    /// Write a keypath on a specific instance and flush.
    pub fn set_in(
        &mut self,
        instance: InstanceId,
        keypath: &str,
        value: Value,
    ) -> Result<(), ViewError> {
        let kp = Keypath::from(keypath);
        self.with_frame(|rt| {
            rt.runloop.touch(instance);
            rt.instances[instance].store.set(&kp, value)
        })
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Open a batch frame; mutations inside are flushed together at the
    /// matching [`end`](Self::end).
    pub fn start(&mut self) {
        self.runloop.start();
    }

    /// Close the current batch frame; closing the outermost frame drives
    /// the flush loop until convergence.
    pub fn end(&mut self) {
        if let Some(frame) = self.runloop.end() {
            self.flush(frame);
        }
    }

    fn with_frame<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.start();
        let result = f(self);
        self.end();
        result
    }

    fn flush(&mut self, frame: Frame<DeferredTask>) {
        let flush_id = FlushId(self.runloop.next_flush_id());
        self.tracer.on_flush_start(flush_id);
        self.runloop.resume(frame);

        let mut rounds = 0;
        loop {
            rounds += 1;
            if rounds > MAX_FLUSH_ROUNDS {
                break;
            }
            let mut progressed = self.retry_pending();

            let ids: Vec<InstanceId> = self.instances.iter().map(|(id, _)| id).collect();
            for iid in ids {
                if self.instances[iid].store.has_pending_changes() {
                    progressed = true;
                    let outcome = self.instances[iid].store.apply_changes();
                    self.dispatch(iid, outcome.notifications);
                }
            }

            let dirty = self.runloop.take_dirty();
            if !dirty.is_empty() {
                progressed = true;
                for item in dirty {
                    self.update_item(item);
                }
            }

            let tasks = self.runloop.take_deferred();
            if !tasks.is_empty() {
                progressed = true;
                for task in tasks {
                    task(self);
                }
            }

            if !progressed {
                break;
            }
        }

        let frame = self.runloop.end().expect("flush frame still active");
        self.finish_frame(frame);
        self.tracer.on_flush_end(flush_id, rounds);
    }

    fn finish_frame(&mut self, frame: Frame<DeferredTask>) {
        let mut transitions = frame.transitions;
        if transitions.is_empty() {
            for node in frame.detach_queue {
                self.doc.detach(node);
            }
        } else {
            // Detachments ride on the longest-running transition.
            let longest = transitions
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.remaining.total_cmp(&b.remaining))
                .map(|(index, _)| index)
                .expect("transitions non-empty");
            transitions[longest]
                .detach_on_complete
                .extend(frame.detach_queue);
            self.runloop.active_transitions.append(&mut transitions);
        }
    }

    /// Advance active transitions by `dt`, detaching nodes whose
    /// transitions completed.
    pub fn advance_transitions(&mut self, dt: f64) {
        for node in self.runloop.advance_transitions(dt) {
            self.doc.detach(node);
        }
    }

    /// Cancel any transition on `node`; its queued detachments do not run.
    pub fn cancel_transition(&mut self, node: NodeId) {
        self.runloop.cancel_transition(node);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, iid: InstanceId, notifications: Vec<Notification<Dependant>>) {
        for notification in notifications {
            match notification.target {
                Dependant::Item(item) => self.notify_item(iid, item, notification.action),
                Dependant::ItemMember { item, member } => {
                    self.notify_member(iid, item, member, notification.action)
                }
                Dependant::Observer { instance, id } => {
                    let at = match notification.action {
                        NotifyAction::Set { keypath, value }
                        | NotifyAction::Upstream { keypath, value, .. }
                        | NotifyAction::Shuffle { keypath, value, .. } => (keypath, value),
                    };
                    self.call_observer(instance, id, Some(at));
                }
                Dependant::Mapping { instance, id } => {
                    let value = match notification.action {
                        NotifyAction::Set { value, .. }
                        | NotifyAction::Upstream { value, .. }
                        | NotifyAction::Shuffle { value, .. } => value,
                    };
                    self.propagate_mapping(instance, id, value);
                }
            }
        }
    }

    fn propagate_mapping(&mut self, instance: InstanceId, id: u64, value: Value) {
        let (other, other_kp) = {
            let Some(mapping) = self.instances[instance].mappings.get(&id) else {
                return;
            };
            (mapping.other_instance, mapping.other_keypath.clone())
        };
        if self.instances[other].store.get(&other_kp) == value {
            return;
        }
        let _ = self.instances[other].store.set(&other_kp, value);
    }

    fn notify_item(&mut self, iid: InstanceId, item: ItemId, action: NotifyAction) {
        if !self.tree.items.contains(item) {
            return;
        }
        enum Target {
            Interpolator(Option<Keypath>),
            Section,
            Element,
            Text,
        }
        let target = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => Target::Interpolator(state.keypath.clone()),
            ItemKind::Section(_) => Target::Section,
            ItemKind::Element(_) => Target::Element,
            ItemKind::Text(_) => Target::Text,
        };
        match target {
            Target::Interpolator(keypath) => {
                let value = match action {
                    NotifyAction::Set { value, .. } | NotifyAction::Shuffle { value, .. } => value,
                    NotifyAction::Upstream { .. } => match keypath {
                        Some(kp) => self.instances[iid].store.get(&kp),
                        None => return,
                    },
                };
                self.apply_interpolator_value(item, value);
            }
            Target::Section => match action {
                NotifyAction::Shuffle { indices, value, .. } => {
                    let _ = self.section_shuffle(iid, item, &indices, value);
                }
                NotifyAction::Set { value, .. } | NotifyAction::Upstream { value, .. } => {
                    let _ = self.section_set_value(iid, item, value);
                }
            },
            Target::Element => {
                let value = match action {
                    NotifyAction::Set { value, .. }
                    | NotifyAction::Upstream { value, .. }
                    | NotifyAction::Shuffle { value, .. } => value,
                };
                self.apply_binding_value(item, value);
            }
            Target::Text => {}
        }
    }

    fn apply_interpolator_value(&mut self, item: ItemId, value: Value) {
        let ItemKind::Interpolator(state) = &mut self.tree.items[item].kind else {
            return;
        };
        if state.value != value {
            state.value = value;
            self.runloop.mark_dirty(item);
        }
    }

    fn apply_binding_value(&mut self, item: ItemId, value: Value) {
        let ItemKind::Element(state) = &mut self.tree.items[item].kind else {
            return;
        };
        let Some(node) = state.node else {
            return;
        };
        let Some(slot) = state.binding.as_mut() else {
            return;
        };
        if slot.locked {
            return;
        }
        slot.binding.render(&mut self.doc, node, &value);
    }

    fn notify_member(&mut self, iid: InstanceId, item: ItemId, member: u32, action: NotifyAction) {
        if !self.tree.items.contains(item) {
            return;
        }
        let value = match action {
            NotifyAction::Set { value, .. }
            | NotifyAction::Upstream { value, .. }
            | NotifyAction::Shuffle { value, .. } => value,
        };
        let (old_composed, new_composed) = {
            let resolver = match &mut self.tree.items[item].kind {
                ItemKind::Interpolator(state) => &mut state.resolver,
                ItemKind::Section(state) => &mut state.resolver,
                _ => return,
            };
            let MustacheResolver::Member(state) = resolver else {
                return;
            };
            let Some(part) = state.parts.get_mut(member as usize) else {
                return;
            };
            match part {
                MemberPartState::Reference { value: slot, .. }
                | MemberPartState::Expression { value: slot, .. } => *slot = Some(value),
            }
            let old = state.composed.clone();
            let new = state.compose();
            state.composed = new.clone();
            (old, new)
        };
        if old_composed == new_composed {
            return;
        }
        // The composed keypath moved: re-register and re-report.
        if let Some(old) = old_composed {
            self.instances[iid]
                .store
                .unregister(&old, Dependant::Item(item), DepsGroup::Default);
        }
        let value = match &new_composed {
            Some(kp) => {
                self.instances[iid]
                    .store
                    .register(kp, Dependant::Item(item), DepsGroup::Default);
                self.instances[iid].store.get(kp)
            }
            None => Value::Undefined,
        };
        let is_section = match &mut self.tree.items[item].kind {
            ItemKind::Interpolator(state) => {
                state.keypath = new_composed;
                false
            }
            ItemKind::Section(state) => {
                state.keypath = new_composed;
                true
            }
            _ => return,
        };
        if is_section {
            let _ = self.section_set_value(iid, item, value);
        } else {
            self.apply_interpolator_value(item, value);
        }
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn retry_pending(&mut self) -> bool {
        let ids: Vec<InstanceId> = self.instances.iter().map(|(id, _)| id).collect();
        let mut progressed = false;
        for iid in ids {
            let pending = std::mem::take(&mut self.instances[iid].pending);
            for item in pending {
                if matches!(self.attempt_bind_item(item), Ok(true)) {
                    progressed = true;
                }
            }
        }
        progressed
    }

    fn queue_pending(&mut self, iid: InstanceId, item: ItemId) {
        let pending = &mut self.instances[iid].pending;
        if !pending.contains(&item) {
            pending.push(item);
        }
    }

    /// Try to resolve and register an item's references. `Ok(true)` means
    /// fully bound; unresolved items go back on the pending list.
    fn attempt_bind_item(&mut self, item: ItemId) -> Result<bool, ViewError> {
        if !self.tree.items.contains(item) {
            return Ok(true);
        }
        let fid = self.tree.items[item].fragment;
        let iid = self.tree.fragments[fid].instance;
        let chain = self.tree.scope_chain(fid);

        let mut resolver = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => state.resolver.clone(),
            ItemKind::Section(state) => state.resolver.clone(),
            _ => return Ok(true),
        };
        let outcome = self.resolve_mustache(item, iid, &chain, &mut resolver);
        match &mut self.tree.items[item].kind {
            ItemKind::Interpolator(state) => state.resolver = resolver,
            ItemKind::Section(state) => state.resolver = resolver,
            _ => {}
        }
        let bound = outcome?;
        if !bound {
            let reference = self.mustache_reference_text(item);
            self.tracer.on_resolution_deferred(&reference);
            self.queue_pending(iid, item);
        }
        Ok(bound)
    }

    fn mustache_reference_text(&self, item: ItemId) -> String {
        let resolver = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => &state.resolver,
            ItemKind::Section(state) => &state.resolver,
            _ => return String::new(),
        };
        match resolver {
            MustacheResolver::Reference(state) => state.reference.clone(),
            MustacheResolver::Expression(state) => state.template.canonical.clone(),
            MustacheResolver::Member(state) => state.base.reference.clone(),
        }
    }

    /// Resolve a plain reference with the cross-instance and implicit-root
    /// fallbacks layered on.
    fn resolve_with_fallback(
        &mut self,
        iid: InstanceId,
        chain: &ScopeChain,
        state: &mut RefResolverState,
    ) -> Result<bool, ViewError> {
        if state.is_resolved() {
            return Ok(true);
        }
        state.attempt(chain, &mut self.instances[iid].store)?;
        if state.is_resolved() {
            if let Some(kp) = state.keypath() {
                self.tracer.on_resolve(&state.reference, kp);
            }
            return Ok(true);
        }
        let parent = self.instances[iid].parent;
        let isolated = self.instances[iid].isolated;
        if isolated {
            return Ok(false);
        }
        if let Some(parent) = parent {
            // Delegate to the enclosing instance; success establishes a
            // two-way mapping between the two stores.
            let attempt = resolve_reference(
                &state.reference,
                &ScopeChain::default(),
                &mut self.instances[parent].store,
            )?;
            if let Attempt::Resolved(ResolvedRef::Keypath(parent_kp)) = attempt {
                let child_kp = Keypath::from(state.reference.as_str());
                self.create_mapping(iid, child_kp.clone(), parent, parent_kp);
                state.resolved = Some(ResolvedRef::Keypath(child_kp.clone()));
                self.tracer.on_resolve(&state.reference, &child_kp);
                return Ok(true);
            }
            return Ok(false);
        }
        if chain.scopes.is_empty() {
            // Orphan at root level: claim the reference as an implicit root
            // keypath so future writes are not lost.
            let kp = Keypath::from(state.reference.as_str());
            state.resolved = Some(ResolvedRef::Keypath(kp.clone()));
            self.tracer.on_resolve(&state.reference, &kp);
            return Ok(true);
        }
        Ok(false)
    }

    fn create_mapping(
        &mut self,
        child: InstanceId,
        child_kp: Keypath,
        parent: InstanceId,
        parent_kp: Keypath,
    ) {
        let child_id = self.instances[child].alloc_id();
        let parent_id = self.instances[parent].alloc_id();
        self.instances[child].mappings.insert(
            child_id,
            Mapping {
                other_instance: parent,
                other_keypath: parent_kp.clone(),
            },
        );
        self.instances[parent].mappings.insert(
            parent_id,
            Mapping {
                other_instance: child,
                other_keypath: child_kp.clone(),
            },
        );
        self.instances[child].store.register(
            &child_kp,
            Dependant::Mapping {
                instance: child,
                id: child_id,
            },
            DepsGroup::Default,
        );
        self.instances[parent].store.register(
            &parent_kp,
            Dependant::Mapping {
                instance: parent,
                id: parent_id,
            },
            DepsGroup::Default,
        );
        // Initial sync runs parent → child.
        let initial = self.instances[parent].store.get(&parent_kp);
        let _ = self.instances[child].store.set(&child_kp, initial);
    }

    fn ensure_expr_computation(
        store: &mut ViewStore,
        state: &ExprResolverState,
        chain: &ScopeChain,
    ) -> Option<Keypath> {
        let key = state.computation_key(chain)?;
        if !store.has_computation(&key) {
            let sources: Vec<ExprSource> = state
                .subs
                .iter()
                .map(|sub| match sub.resolved.as_ref().expect("all subs resolved") {
                    ResolvedRef::Keypath(kp) => ExprSource::Keypath(kp.clone()),
                    ResolvedRef::Index(name) => {
                        ExprSource::Literal(Value::from(chain.index_of(name).unwrap_or(0)))
                    }
                })
                .collect();
            let body = state.template.body.clone();
            store.compute(
                key.clone(),
                Computed::new(move |store| {
                    let values: Vec<Value> = sources
                        .iter()
                        .map(|source| match source {
                            ExprSource::Keypath(kp) => store.get(kp),
                            ExprSource::Literal(value) => value.clone(),
                        })
                        .collect();
                    Ok(evaluate(&body, &values))
                }),
            );
        }
        Some(key)
    }

    fn resolve_mustache(
        &mut self,
        item: ItemId,
        iid: InstanceId,
        chain: &ScopeChain,
        resolver: &mut MustacheResolver,
    ) -> Result<bool, ViewError> {
        match resolver {
            MustacheResolver::Reference(state) => {
                if !self.resolve_with_fallback(iid, chain, state)? {
                    return Ok(false);
                }
                let resolved = state.resolved.clone().expect("just resolved");
                self.bind_item_to(item, iid, chain, resolved)?;
                Ok(true)
            }
            MustacheResolver::Expression(state) => {
                for sub in &mut state.subs {
                    self.resolve_with_fallback(iid, chain, sub)?;
                }
                if !state.all_subs_resolved() {
                    return Ok(false);
                }
                let key =
                    Self::ensure_expr_computation(&mut self.instances[iid].store, state, chain)
                        .expect("all subs resolved");
                state.keypath = Some(key.clone());
                self.bind_item_to(item, iid, chain, ResolvedRef::Keypath(key))?;
                Ok(true)
            }
            MustacheResolver::Member(state) => {
                let mut all = self.resolve_with_fallback(iid, chain, &mut state.base)?;
                for (index, part) in state.parts.iter_mut().enumerate() {
                    match part {
                        MemberPartState::Reference { state: sub, value } => {
                            if self.resolve_with_fallback(iid, chain, sub)? {
                                if value.is_none() {
                                    if let Some(kp) = sub.keypath().cloned() {
                                        self.instances[iid].store.register(
                                            &kp,
                                            Dependant::ItemMember {
                                                item,
                                                member: index as u32,
                                            },
                                            DepsGroup::Default,
                                        );
                                        *value = Some(self.instances[iid].store.get(&kp));
                                    } else if let Some(ResolvedRef::Index(name)) = &sub.resolved {
                                        *value =
                                            Some(Value::from(chain.index_of(name).unwrap_or(0)));
                                    }
                                }
                            } else {
                                all = false;
                            }
                        }
                        MemberPartState::Expression { state: sub, value } => {
                            for inner in &mut sub.subs {
                                self.resolve_with_fallback(iid, chain, inner)?;
                            }
                            if sub.all_subs_resolved() {
                                if value.is_none() {
                                    let key = Self::ensure_expr_computation(
                                        &mut self.instances[iid].store,
                                        sub,
                                        chain,
                                    )
                                    .expect("all subs resolved");
                                    sub.keypath = Some(key.clone());
                                    self.instances[iid].store.register(
                                        &key,
                                        Dependant::ItemMember {
                                            item,
                                            member: index as u32,
                                        },
                                        DepsGroup::Default,
                                    );
                                    *value = Some(self.instances[iid].store.get(&key));
                                }
                            } else {
                                all = false;
                            }
                        }
                    }
                }
                if !all {
                    return Ok(false);
                }
                let composed = state.compose();
                state.composed = composed.clone();
                if let Some(kp) = composed {
                    self.bind_item_to(item, iid, chain, ResolvedRef::Keypath(kp))?;
                }
                // Base and members are registered; a member value arriving
                // later reports through member notifications.
                Ok(true)
            }
        }
    }

    /// Register the item at its resolved location and apply the initial
    /// value.
    fn bind_item_to(
        &mut self,
        item: ItemId,
        iid: InstanceId,
        chain: &ScopeChain,
        resolved: ResolvedRef,
    ) -> Result<(), ViewError> {
        let (keypath, value, bound_index) = match resolved {
            ResolvedRef::Keypath(kp) => {
                self.instances[iid]
                    .store
                    .register(&kp, Dependant::Item(item), DepsGroup::Default);
                let value = self.instances[iid].store.get(&kp);
                (Some(kp), value, None)
            }
            ResolvedRef::Index(name) => {
                let value = Value::from(chain.index_of(&name).unwrap_or(0));
                (None, value, Some(name))
            }
        };
        enum Bound {
            RenderedInterpolator,
            UnrenderedInterpolator,
            Section,
            Other,
        }
        let in_attribute = {
            let fid = self.tree.items[item].fragment;
            self.tree.fragments[fid].attr_owner.is_some()
        };
        let bound = match &mut self.tree.items[item].kind {
            ItemKind::Interpolator(state) => {
                state.keypath = keypath;
                state.bound_index = bound_index;
                // Attribute interpolators have no node of their own but
                // still refresh their element's attribute on update.
                if state.node.is_some() || in_attribute {
                    Bound::RenderedInterpolator
                } else {
                    state.value = value.clone();
                    Bound::UnrenderedInterpolator
                }
            }
            ItemKind::Section(state) => {
                state.keypath = keypath;
                Bound::Section
            }
            _ => Bound::Other,
        };
        match bound {
            Bound::RenderedInterpolator => self.apply_interpolator_value(item, value),
            Bound::Section => self.section_set_value(iid, item, value)?,
            Bound::UnrenderedInterpolator | Bound::Other => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fragment construction
    // ------------------------------------------------------------------

    fn construct_fragment(
        &mut self,
        spec: FragmentSpec,
        template: &Template,
    ) -> Result<FragmentId, ViewError> {
        let fid = self.tree.fragments.insert(FragmentNode {
            instance: spec.instance,
            owner: spec.owner,
            context: spec.context,
            index: spec.index,
            index_ref: spec.index_ref,
            key: spec.key,
            attr_owner: spec.attr_owner,
            items: Vec::new(),
            rendered: false,
        });
        let items: Vec<TemplateItem> = template.iter().cloned().collect();
        for item in &items {
            self.construct_item(fid, item)?;
        }
        Ok(fid)
    }

    fn construct_item(
        &mut self,
        fid: FragmentId,
        template: &TemplateItem,
    ) -> Result<(), ViewError> {
        match template {
            TemplateItem::Text(text) => {
                let item = self.tree.items.insert(ItemNode {
                    fragment: fid,
                    kind: ItemKind::Text(TextState {
                        text: text.clone(),
                        node: None,
                    }),
                });
                self.tree.fragments[fid].items.push(item);
            }
            TemplateItem::Interpolator(mustache) => {
                let item = self.tree.items.insert(ItemNode {
                    fragment: fid,
                    kind: ItemKind::Interpolator(Box::new(InterpolatorState {
                        resolver: MustacheResolver::new(mustache),
                        keypath: None,
                        bound_index: None,
                        value: Value::Undefined,
                        node: None,
                    })),
                });
                self.tree.fragments[fid].items.push(item);
                self.attempt_bind_item(item)?;
            }
            TemplateItem::Section {
                kind,
                binding,
                template,
            } => {
                let item = self.tree.items.insert(ItemNode {
                    fragment: fid,
                    kind: ItemKind::Section(Box::new(SectionState {
                        kind: kind.clone(),
                        template: template.clone(),
                        resolver: MustacheResolver::new(binding),
                        keypath: None,
                        mode: None,
                        fragments: Vec::new(),
                        by_key: HashMap::default(),
                        rendered_order: Vec::new(),
                        pending_creates: Vec::new(),
                        pending_unrenders: Vec::new(),
                        anchor: None,
                    })),
                });
                self.tree.fragments[fid].items.push(item);
                self.attempt_bind_item(item)?;
            }
            TemplateItem::Element {
                name,
                attributes,
                twoway,
                intro,
                outro,
                children,
            } => {
                let item = self.tree.items.insert(ItemNode {
                    fragment: fid,
                    kind: ItemKind::Element(Box::new(ElementState {
                        name: name.clone(),
                        attributes: Vec::new(),
                        twoway: *twoway,
                        binding: None,
                        intro: intro.clone(),
                        outro: outro.clone(),
                        child: None,
                        node: None,
                    })),
                });
                self.tree.fragments[fid].items.push(item);
                let instance = self.tree.fragments[fid].instance;
                let mut attr_states = Vec::new();
                for (index, attr) in attributes.iter().enumerate() {
                    let attr_fragment = self.construct_fragment(
                        FragmentSpec {
                            instance,
                            owner: None,
                            attr_owner: Some((item, index)),
                            context: None,
                            index: None,
                            index_ref: None,
                            key: None,
                        },
                        &attr.value.clone().into(),
                    )?;
                    attr_states.push(AttributeState {
                        name: attr.name.clone(),
                        fragment: attr_fragment,
                    });
                }
                let child = if children.is_empty() {
                    None
                } else {
                    Some(self.construct_fragment(
                        FragmentSpec {
                            instance,
                            owner: Some(item),
                            attr_owner: None,
                            context: None,
                            index: None,
                            index_ref: None,
                            key: None,
                        },
                        children,
                    )?)
                };
                if let ItemKind::Element(state) = &mut self.tree.items[item].kind {
                    state.attributes = attr_states;
                    state.child = child;
                }
            }
            TemplateItem::Partial { name } => {
                let instance = self.tree.fragments[fid].instance;
                if let Some(partial) = self.lookup_partial(instance, name) {
                    let items: Vec<TemplateItem> = partial.iter().cloned().collect();
                    for item in &items {
                        self.construct_item(fid, item)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn lookup_partial(&self, mut instance: InstanceId, name: &str) -> Option<Template> {
        loop {
            if let Some(found) = self.instances[instance].registries.partials.get(name) {
                return Some(found.clone());
            }
            match self.instances[instance].parent {
                Some(parent) => instance = parent,
                None => break,
            }
        }
        self.globals.partials.get(name).cloned()
    }

    fn lookup_transition(&self, mut instance: InstanceId, name: &str) -> Option<TransitionSpec> {
        loop {
            if let Some(found) = self.instances[instance].registries.transitions.get(name) {
                return Some(*found);
            }
            match self.instances[instance].parent {
                Some(parent) => instance = parent,
                None => break,
            }
        }
        self.globals.transitions.get(name).copied()
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    fn render_fragment(&mut self, fid: FragmentId, parent: Option<NodeId>, before: Option<NodeId>) {
        if self.tree.fragments[fid].rendered {
            return;
        }
        let items = self.tree.fragments[fid].items.clone();
        for item in items {
            self.render_item(item, parent, before);
        }
        self.tree.fragments[fid].rendered = true;
    }

    fn render_item(&mut self, item: ItemId, parent: Option<NodeId>, before: Option<NodeId>) {
        let in_attribute = {
            let fid = self.tree.items[item].fragment;
            self.tree.fragments[fid].attr_owner.is_some()
        };
        enum Plan {
            Text(String),
            Interpolator(String),
            Section,
            Element,
            Skip,
        }
        let plan = match &self.tree.items[item].kind {
            ItemKind::Text(state) => {
                if in_attribute {
                    Plan::Skip
                } else {
                    Plan::Text(state.text.clone())
                }
            }
            ItemKind::Interpolator(state) => {
                if in_attribute {
                    Plan::Skip
                } else {
                    Plan::Interpolator(state.value.to_display_string())
                }
            }
            ItemKind::Section(_) => Plan::Section,
            ItemKind::Element(_) => Plan::Element,
        };
        match plan {
            Plan::Skip => {}
            Plan::Text(text) => {
                let node = self.doc.create(NodeKind::Text(text));
                self.doc.insert_before(parent, node, before);
                if let ItemKind::Text(state) = &mut self.tree.items[item].kind {
                    state.node = Some(node);
                }
            }
            Plan::Interpolator(text) => {
                let node = self.doc.create(NodeKind::Text(text));
                self.doc.insert_before(parent, node, before);
                if let ItemKind::Interpolator(state) = &mut self.tree.items[item].kind {
                    state.node = Some(node);
                }
            }
            Plan::Section => {
                let anchor = self.doc.create(NodeKind::Anchor);
                self.doc.insert_before(parent, anchor, before);
                let fragments = match &mut self.tree.items[item].kind {
                    ItemKind::Section(state) => {
                        state.anchor = Some(anchor);
                        state.pending_creates.clear();
                        state.rendered_order = state.fragments.clone();
                        state.fragments.clone()
                    }
                    _ => Vec::new(),
                };
                for fragment in fragments {
                    self.render_fragment(fragment, parent, Some(anchor));
                }
            }
            Plan::Element => self.render_element(item, parent, before),
        }
    }

    fn render_element(&mut self, item: ItemId, parent: Option<NodeId>, before: Option<NodeId>) {
        let (name, attr_list, twoway, intro, child) = match &self.tree.items[item].kind {
            ItemKind::Element(state) => (
                state.name.clone(),
                state
                    .attributes
                    .iter()
                    .map(|a| (a.name.clone(), a.fragment))
                    .collect::<Vec<_>>(),
                state.twoway,
                state.intro.clone(),
                state.child,
            ),
            _ => return,
        };
        let mut rendered_attrs = Vec::new();
        for (attr_name, fragment) in &attr_list {
            rendered_attrs.push((attr_name.clone(), self.attribute_string(*fragment)));
        }
        let contenteditable = attr_list.iter().any(|(n, _)| n == "contenteditable");
        let bindable =
            matches!(name.as_str(), "input" | "select" | "textarea") || contenteditable;
        let node = self.doc.create(NodeKind::Element {
            name: name.clone(),
            attributes: rendered_attrs,
            control: bindable.then(ControlState::default),
        });
        self.doc.insert_before(parent, node, before);
        if let ItemKind::Element(state) = &mut self.tree.items[item].kind {
            state.node = Some(node);
        }
        if let Some(child) = child {
            self.render_fragment(child, Some(node), None);
        }
        if twoway && bindable {
            self.attach_binding(item, node, &name, &attr_list, contenteditable);
        }
        if let Some(intro) = intro {
            let iid = self.tree.fragments[self.tree.items[item].fragment].instance;
            if let Some(spec) = self.lookup_transition(iid, &intro) {
                self.runloop.add_transition(PendingTransition {
                    node,
                    remaining: spec.duration,
                    detach_on_complete: Vec::new(),
                });
            }
        }
    }

    fn attach_binding(
        &mut self,
        item: ItemId,
        node: NodeId,
        element_name: &str,
        attr_list: &[(String, FragmentId)],
        contenteditable: bool,
    ) {
        let type_attr = attr_list
            .iter()
            .find(|(n, _)| n == "type")
            .map(|(_, f)| self.attribute_string(*f));
        let own_value = attr_list
            .iter()
            .find(|(n, _)| n == "value")
            .map(|(_, f)| Value::String(self.attribute_string(*f)))
            .unwrap_or(Value::Undefined);
        let Some((binding, bound_attr)) = create_binding(
            element_name,
            type_attr.as_deref(),
            contenteditable,
            own_value,
        ) else {
            return;
        };
        let bound_attr_name = match bound_attr {
            BoundAttribute::Value => "value",
            BoundAttribute::Name => "name",
        };
        let keypath = attr_list
            .iter()
            .find(|(n, _)| n == bound_attr_name)
            .and_then(|(_, f)| self.single_interpolator_keypath(*f));
        let Some(keypath) = keypath else {
            return;
        };
        let iid = self.tree.fragments[self.tree.items[item].fragment].instance;
        self.instances[iid]
            .store
            .register(&keypath, Dependant::Item(item), DepsGroup::Default);
        let value = self.instances[iid].store.get(&keypath);
        binding.render(&mut self.doc, node, &value);
        if let ItemKind::Element(state) = &mut self.tree.items[item].kind {
            state.binding = Some(BindingSlot {
                binding,
                keypath: Some(keypath),
                locked: false,
            });
        }
    }

    fn single_interpolator_keypath(&self, fragment: FragmentId) -> Option<Keypath> {
        let items = &self.tree.fragments[fragment].items;
        if items.len() != 1 {
            return None;
        }
        match &self.tree.items[items[0]].kind {
            ItemKind::Interpolator(state) => state.keypath.clone(),
            _ => None,
        }
    }

    fn attribute_string(&self, fragment: FragmentId) -> String {
        let mut out = String::new();
        for &item in &self.tree.fragments[fragment].items {
            match &self.tree.items[item].kind {
                ItemKind::Text(state) => out.push_str(&state.text),
                ItemKind::Interpolator(state) => out.push_str(&state.value.to_display_string()),
                _ => {}
            }
        }
        out
    }

    /// Simulate a user edit on a bound control, running the write inside a
    /// batch frame. The binding stays locked for the duration of the flush
    /// so the control is not re-painted with its own value.
    pub fn fire_input(&mut self, item: ItemId, input: ControlInput) -> Result<(), ViewError> {
        let iid = self.tree.fragments[self.tree.items[item].fragment].instance;
        let (node, keypath) = match &self.tree.items[item].kind {
            ItemKind::Element(state) => {
                let node = state.node;
                let keypath = state.binding.as_ref().and_then(|slot| slot.keypath.clone());
                match (node, keypath) {
                    (Some(node), Some(keypath)) => (node, keypath),
                    _ => return Ok(()),
                }
            }
            _ => return Ok(()),
        };
        let current = self.instances[iid].store.get(&keypath);
        let next = {
            let ViewRuntime { tree, doc, .. } = self;
            let ItemKind::Element(state) = &mut tree.items[item].kind else {
                return Ok(());
            };
            let slot = state.binding.as_mut().expect("checked above");
            slot.locked = true;
            slot.binding.handle_change(doc, node, &current, &input)
        };
        let result = self.with_frame(|rt| {
            rt.runloop.touch(iid);
            rt.instances[iid].store.set(&keypath, next)
        });
        if let ItemKind::Element(state) = &mut self.tree.items[item].kind {
            if let Some(slot) = state.binding.as_mut() {
                slot.locked = false;
            }
        }
        result
    }

    /// Items carrying a live two-way binding, for tests and tooling.
    pub fn bound_elements(&self) -> Vec<ItemId> {
        self.tree
            .items
            .iter()
            .filter(|(_, node)| matches!(&node.kind, ItemKind::Element(e) if e.binding.is_some()))
            .map(|(id, _)| id)
            .collect()
    }

    /// The rendered node of an element item, if any.
    pub fn element_node(&self, item: ItemId) -> Option<NodeId> {
        match &self.tree.items[item].kind {
            ItemKind::Element(state) => state.node,
            _ => None,
        }
    }

    /// Section items, in arena order, for tests and tooling.
    pub fn sections(&self) -> Vec<ItemId> {
        self.tree
            .items
            .iter()
            .filter(|(_, node)| matches!(&node.kind, ItemKind::Section(_)))
            .map(|(id, _)| id)
            .collect()
    }

    /// A section's live child fragment ids, in order.
    pub fn section_fragments(&self, item: ItemId) -> Vec<FragmentId> {
        match &self.tree.items[item].kind {
            ItemKind::Section(state) => state.fragments.clone(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Sections
    // ------------------------------------------------------------------

    fn section_set_value(
        &mut self,
        iid: InstanceId,
        item: ItemId,
        value: Value,
    ) -> Result<(), ViewError> {
        let (kind, mode, count, keys, keypath, template, index_ref) =
            match &self.tree.items[item].kind {
                ItemKind::Section(state) => {
                    let keys: Vec<String> = state
                        .fragments
                        .iter()
                        .filter_map(|&f| self.tree.fragments[f].key.clone())
                        .collect();
                    let index_ref = match &state.kind {
                        SectionKind::Each { index_ref } => index_ref.clone(),
                        _ => None,
                    };
                    (
                        state.kind.clone(),
                        state.mode,
                        state.fragments.len(),
                        keys,
                        state.keypath.clone(),
                        state.template.clone(),
                        index_ref,
                    )
                }
                _ => return Ok(()),
            };
        let (new_mode, plan) = plan_reevaluate(&kind, mode, count, &keys, &value);
        if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
            state.mode = Some(new_mode);
        }
        if plan == Reeval::None {
            return Ok(());
        }
        let base = keypath.unwrap_or_else(Keypath::root);
        match plan {
            Reeval::None => {}
            Reeval::EnsureSingle { push_context } => {
                let context = push_context.then(|| base.clone());
                let fragment = self.construct_fragment(
                    FragmentSpec {
                        instance: iid,
                        owner: Some(item),
                        attr_owner: None,
                        context,
                        index: None,
                        index_ref: None,
                        key: None,
                    },
                    &template,
                )?;
                if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                    state.fragments.push(fragment);
                    state.pending_creates.push(fragment);
                }
            }
            Reeval::Clear => {
                let fragments = match &mut self.tree.items[item].kind {
                    ItemKind::Section(state) => {
                        state.by_key.clear();
                        std::mem::take(&mut state.fragments)
                    }
                    _ => return Ok(()),
                };
                for &fragment in &fragments {
                    self.unbind_fragment(fragment);
                }
                if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                    state.pending_unrenders.extend(fragments);
                }
            }
            Reeval::ListGrow { from, to } => {
                let mut created = Vec::new();
                for index in from..to {
                    let fragment = self.construct_fragment(
                        FragmentSpec {
                            instance: iid,
                            owner: Some(item),
                            attr_owner: None,
                            context: Some(base.join_index(index)),
                            index: Some(index),
                            index_ref: index_ref.clone(),
                            key: None,
                        },
                        &template,
                    )?;
                    created.push(fragment);
                }
                if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                    state.fragments.extend(&created);
                    state.pending_creates.extend(created);
                }
            }
            Reeval::ListShrink { to, .. } => {
                let removed = match &mut self.tree.items[item].kind {
                    ItemKind::Section(state) => state.fragments.split_off(to),
                    _ => return Ok(()),
                };
                for &fragment in &removed {
                    self.unbind_fragment(fragment);
                }
                if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                    state.pending_unrenders.extend(removed);
                }
            }
            Reeval::Keyed { removed, added } => {
                for key in &removed {
                    let fragment = match &mut self.tree.items[item].kind {
                        ItemKind::Section(state) => {
                            let fragment = state.by_key.remove(key);
                            if let Some(found) = fragment {
                                state.fragments.retain(|&f| f != found);
                            }
                            fragment
                        }
                        _ => None,
                    };
                    if let Some(fragment) = fragment {
                        self.unbind_fragment(fragment);
                        if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                            state.pending_unrenders.push(fragment);
                        }
                    }
                }
                for key in &added {
                    let fragment = self.construct_fragment(
                        FragmentSpec {
                            instance: iid,
                            owner: Some(item),
                            attr_owner: None,
                            context: Some(base.join(key)),
                            index: None,
                            index_ref: None,
                            key: Some(key.clone()),
                        },
                        &template,
                    )?;
                    if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                        state.fragments.push(fragment);
                        state.by_key.insert(key.clone(), fragment);
                        state.pending_creates.push(fragment);
                    }
                }
            }
            Reeval::Rebuild => {
                let fragments = match &mut self.tree.items[item].kind {
                    ItemKind::Section(state) => {
                        state.by_key.clear();
                        std::mem::take(&mut state.fragments)
                    }
                    _ => return Ok(()),
                };
                for &fragment in &fragments {
                    self.unbind_fragment(fragment);
                }
                if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
                    state.pending_unrenders.extend(fragments);
                    state.mode = None;
                }
                return self.section_set_value(iid, item, value);
            }
        }
        self.runloop.mark_dirty(item);
        Ok(())
    }

    fn section_shuffle(
        &mut self,
        iid: InstanceId,
        item: ItemId,
        indices: &[isize],
        value: Value,
    ) -> Result<(), ViewError> {
        let (keypath, fragments, template, index_ref, mode) = match &self.tree.items[item].kind {
            ItemKind::Section(state) => (
                state.keypath.clone(),
                state.fragments.clone(),
                state.template.clone(),
                match &state.kind {
                    SectionKind::Each { index_ref } => index_ref.clone(),
                    _ => None,
                },
                state.mode,
            ),
            _ => return Ok(()),
        };
        let Some(base) = keypath else {
            return Ok(());
        };
        // Shuffles only apply to an established list section; anything
        // else reevaluates from scratch.
        if mode != Some(SectionMode::List) || fragments.len() != indices.len() {
            return self.section_set_value(iid, item, value);
        }
        let new_len = value.len().unwrap_or(0);
        let plan = shuffle_plan(indices, new_len);

        for &(old, new) in &plan.moved {
            let fragment = fragments[old];
            self.tree.fragments[fragment].index = Some(new);
            self.rebind_fragment(fragment, &base.join_index(old), &base.join_index(new));
        }
        let mut unbound = Vec::new();
        for &old in &plan.removed {
            let fragment = fragments[old];
            self.unbind_fragment(fragment);
            unbound.push(fragment);
        }

        let mut new_order: Vec<Option<FragmentId>> = vec![None; new_len];
        for &old in &plan.kept {
            let target = indices[old] as usize;
            if target < new_len {
                new_order[target] = Some(fragments[old]);
            }
        }
        for &(old, new) in &plan.moved {
            if new < new_len {
                new_order[new] = Some(fragments[old]);
            }
        }
        let mut created = Vec::new();
        for &index in &plan.added {
            let fragment = self.construct_fragment(
                FragmentSpec {
                    instance: iid,
                    owner: Some(item),
                    attr_owner: None,
                    context: Some(base.join_index(index)),
                    index: Some(index),
                    index_ref: index_ref.clone(),
                    key: None,
                },
                &template,
            )?;
            new_order[index] = Some(fragment);
            created.push(fragment);
        }

        let stats = ShuffleStats {
            kept: plan.kept.len(),
            moved: plan.moved.len(),
            removed: plan.removed.len(),
            added: plan.added.len(),
        };
        self.tracer.on_shuffle(&base, stats);

        if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
            state.fragments = new_order.into_iter().flatten().collect();
            state.pending_unrenders.extend(unbound);
            state.pending_creates.extend(created);
        }
        self.runloop.mark_dirty(item);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Render-time update
    // ------------------------------------------------------------------

    fn update_item(&mut self, item: ItemId) {
        if !self.tree.items.contains(item) {
            return;
        }
        match &self.tree.items[item].kind {
            ItemKind::Interpolator(_) => self.update_interpolator(item),
            ItemKind::Section(_) => self.update_section(item),
            _ => {}
        }
    }

    fn update_interpolator(&mut self, item: ItemId) {
        let fid = self.tree.items[item].fragment;
        if let Some((element, _)) = self.tree.fragments[fid].attr_owner {
            self.refresh_attribute(element, fid);
            return;
        }
        let (node, text) = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => (state.node, state.value.to_display_string()),
            _ => return,
        };
        if let Some(node) = node {
            self.doc.set_text(node, &text);
        }
    }

    fn refresh_attribute(&mut self, element: ItemId, attr_fragment: FragmentId) {
        let (node, attr_name) = match &self.tree.items[element].kind {
            ItemKind::Element(state) => {
                let name = state
                    .attributes
                    .iter()
                    .find(|a| a.fragment == attr_fragment)
                    .map(|a| a.name.clone());
                (state.node, name)
            }
            _ => return,
        };
        let (Some(node), Some(attr_name)) = (node, attr_name) else {
            return;
        };
        let value = self.attribute_string(attr_fragment);
        self.doc.set_attribute(node, &attr_name, &value);
    }

    fn update_section(&mut self, item: ItemId) {
        let (unrenders, creates, anchor, desired) = match &mut self.tree.items[item].kind {
            ItemKind::Section(state) => (
                std::mem::take(&mut state.pending_unrenders),
                std::mem::take(&mut state.pending_creates),
                state.anchor,
                state.fragments.clone(),
            ),
            _ => return,
        };
        let Some(anchor) = anchor else {
            // Not rendered yet; nothing to reconcile on screen.
            for fragment in unrenders {
                self.tree.free_fragment(fragment);
            }
            return;
        };
        let parent = self.doc.parent_of(anchor);

        // 1. Unrender: queue nodes for deferred detachment; outgoing
        // transitions keep them attached until completion.
        for fragment in unrenders {
            self.unrender_fragment(fragment);
            self.tree.free_fragment(fragment);
        }

        // 2. Render net-new fragments before the next positioned sibling.
        for fragment in creates {
            let position = desired.iter().position(|&f| f == fragment);
            let before = position
                .and_then(|p| {
                    desired[p + 1..]
                        .iter()
                        .find_map(|&next| self.tree.first_node(next))
                })
                .unwrap_or(anchor);
            self.render_fragment(fragment, parent, Some(before));
        }

        // 3. Minimal moves: walk the desired order backwards and move only
        // fragments whose nodes are out of position, inserting before the
        // nearest already-positioned follower.
        let mut next_positioned = anchor;
        for &fragment in desired.iter().rev() {
            let nodes = self.tree.fragment_nodes(fragment);
            let Some(&first) = nodes.first() else {
                continue;
            };
            let last = *nodes.last().expect("non-empty");
            if !self.doc.is_before(last, next_positioned) {
                for &node in &nodes {
                    self.doc.move_before(node, Some(next_positioned));
                }
            }
            next_positioned = first;
        }

        if let ItemKind::Section(state) = &mut self.tree.items[item].kind {
            state.rendered_order = desired;
        }
    }

    fn unrender_fragment(&mut self, fid: FragmentId) {
        // Bindings release their control state before the nodes go.
        let items = self.tree.fragments[fid].items.clone();
        for item in items {
            let ViewRuntime { tree, doc, .. } = self;
            if let ItemKind::Element(state) = &mut tree.items[item].kind {
                if let (Some(node), Some(slot)) = (state.node, state.binding.as_mut()) {
                    slot.binding.unrender(doc, node);
                }
            }
        }
        let nodes = self.tree.fragment_nodes(fid);
        let outros = self.fragment_outros(fid);
        for node in nodes {
            if let Some(spec) = outros
                .iter()
                .find(|(outro_node, _)| *outro_node == node)
                .map(|(_, spec)| *spec)
            {
                self.runloop.add_transition(PendingTransition {
                    node,
                    remaining: spec.duration,
                    detach_on_complete: vec![node],
                });
            } else {
                self.runloop.queue_detach(node);
            }
        }
    }

    /// Top-level element nodes of a fragment that declare an outro
    /// transition resolvable through the registry chain.
    fn fragment_outros(&self, fid: FragmentId) -> Vec<(NodeId, TransitionSpec)> {
        let iid = self.tree.instance_of(fid);
        let mut out = Vec::new();
        for &item in &self.tree.fragments[fid].items {
            if let ItemKind::Element(state) = &self.tree.items[item].kind {
                if let (Some(node), Some(outro)) = (state.node, state.outro.as_ref()) {
                    if let Some(spec) = self.lookup_transition(iid, outro) {
                        out.push((node, spec));
                    }
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Unbind / rebind
    // ------------------------------------------------------------------

    fn unbind_fragment(&mut self, fid: FragmentId) {
        if !self.tree.fragments.contains(fid) {
            return;
        }
        let iid = self.tree.instance_of(fid);
        let items = self.tree.fragments[fid].items.clone();
        for item in items {
            self.unbind_item(iid, item);
        }
    }

    fn unbind_item(&mut self, iid: InstanceId, item: ItemId) {
        self.instances[iid]
            .pending
            .retain(|&pending| pending != item);
        let mut child_fragments = Vec::new();
        let registered: Vec<(Keypath, Dependant)> = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => {
                self.collect_registrations(item, &state.resolver, &state.keypath)
            }
            ItemKind::Section(state) => {
                child_fragments.extend(state.fragments.iter().copied());
                child_fragments.extend(state.pending_creates.iter().copied());
                self.collect_registrations(item, &state.resolver, &state.keypath)
            }
            ItemKind::Element(state) => {
                child_fragments.extend(state.attributes.iter().map(|a| a.fragment));
                child_fragments.extend(state.child);
                state
                    .binding
                    .as_ref()
                    .and_then(|slot| slot.keypath.clone())
                    .map(|kp| vec![(kp, Dependant::Item(item))])
                    .unwrap_or_default()
            }
            ItemKind::Text(_) => Vec::new(),
        };
        for (keypath, dependant) in registered {
            self.instances[iid]
                .store
                .unregister(&keypath, dependant, DepsGroup::Default);
        }
        for fragment in child_fragments {
            self.unbind_fragment(fragment);
        }
    }

    /// Every (keypath, dependant) pair an item's resolver currently holds
    /// in the store.
    fn collect_registrations(
        &self,
        item: ItemId,
        resolver: &MustacheResolver,
        main: &Option<Keypath>,
    ) -> Vec<(Keypath, Dependant)> {
        let mut out = Vec::new();
        if let Some(kp) = main {
            out.push((kp.clone(), Dependant::Item(item)));
        }
        if let MustacheResolver::Member(state) = resolver {
            for (index, part) in state.parts.iter().enumerate() {
                let source = match part {
                    MemberPartState::Reference { state, value } => {
                        value.as_ref().and_then(|_| state.keypath().cloned())
                    }
                    MemberPartState::Expression { state, value } => {
                        value.as_ref().and_then(|_| state.keypath.clone())
                    }
                };
                if let Some(kp) = source {
                    out.push((
                        kp,
                        Dependant::ItemMember {
                            item,
                            member: index as u32,
                        },
                    ));
                }
            }
        }
        out
    }

    fn rebind_fragment(&mut self, fid: FragmentId, old: &Keypath, new: &Keypath) {
        if let Some(context) = self.tree.fragments[fid].context.clone() {
            if let Some(rewritten) = context.replace_prefix(old, new) {
                self.tree.fragments[fid].context = Some(rewritten);
            }
        }
        let items = self.tree.fragments[fid].items.clone();
        for item in items {
            self.rebind_item(item, old, new);
        }
    }

    fn rebind_item(&mut self, item: ItemId, old: &Keypath, new: &Keypath) {
        let fid = self.tree.items[item].fragment;
        let iid = self.tree.fragments[fid].instance;
        match &self.tree.items[item].kind {
            ItemKind::Text(_) => {}
            ItemKind::Interpolator(_) => {
                self.rebind_mustache(item, iid, old, new);
                let bound_index = match &self.tree.items[item].kind {
                    ItemKind::Interpolator(state) => state.bound_index.clone(),
                    _ => None,
                };
                // Index-bound interpolators re-read their fragment index.
                if let Some(name) = bound_index {
                    let chain = self.tree.scope_chain(fid);
                    let value = Value::from(chain.index_of(&name).unwrap_or(0));
                    self.apply_interpolator_value(item, value);
                }
            }
            ItemKind::Section(_) => {
                self.rebind_mustache(item, iid, old, new);
                let fragments = match &self.tree.items[item].kind {
                    ItemKind::Section(state) => {
                        let mut all = state.fragments.clone();
                        all.extend(state.pending_creates.iter().copied());
                        all
                    }
                    _ => Vec::new(),
                };
                for fragment in fragments {
                    self.rebind_fragment(fragment, old, new);
                }
            }
            ItemKind::Element(_) => {
                let (attr_fragments, child, binding_kp) = match &self.tree.items[item].kind {
                    ItemKind::Element(state) => (
                        state
                            .attributes
                            .iter()
                            .map(|a| a.fragment)
                            .collect::<Vec<_>>(),
                        state.child,
                        state.binding.as_ref().and_then(|slot| slot.keypath.clone()),
                    ),
                    _ => return,
                };
                if let Some(kp) = binding_kp {
                    if let Some(rewritten) = kp.replace_prefix(old, new) {
                        if rewritten != kp {
                            self.instances[iid].store.unregister(
                                &kp,
                                Dependant::Item(item),
                                DepsGroup::Default,
                            );
                            self.instances[iid].store.register(
                                &rewritten,
                                Dependant::Item(item),
                                DepsGroup::Default,
                            );
                            if let ItemKind::Element(state) = &mut self.tree.items[item].kind {
                                if let Some(slot) = state.binding.as_mut() {
                                    slot.keypath = Some(rewritten);
                                }
                            }
                        }
                    }
                }
                for fragment in attr_fragments {
                    self.rebind_fragment(fragment, old, new);
                }
                if let Some(child) = child {
                    self.rebind_fragment(child, old, new);
                }
            }
        }
    }

    /// Rebind an interpolator's or section's resolver, migrating store
    /// registrations from the old keypath prefix to the new one.
    fn rebind_mustache(&mut self, item: ItemId, iid: InstanceId, old: &Keypath, new: &Keypath) {
        let fid = self.tree.items[item].fragment;
        let (old_registrations, mut resolver) = match &self.tree.items[item].kind {
            ItemKind::Interpolator(state) => (
                self.collect_registrations(item, &state.resolver, &state.keypath),
                state.resolver.clone(),
            ),
            ItemKind::Section(state) => (
                self.collect_registrations(item, &state.resolver, &state.keypath),
                state.resolver.clone(),
            ),
            _ => return,
        };

        let chain = self.tree.scope_chain(fid);
        let mut changed = false;
        let new_main: Option<Keypath> = match &mut resolver {
            MustacheResolver::Reference(state) => {
                changed = state.rebind(old, new);
                state.keypath().cloned()
            }
            MustacheResolver::Expression(state) => {
                if state.rebind(old, new) {
                    changed = true;
                    let key = Self::ensure_expr_computation(
                        &mut self.instances[iid].store,
                        state,
                        &chain,
                    );
                    state.keypath = key.clone();
                    key
                } else {
                    state.keypath.clone()
                }
            }
            MustacheResolver::Member(state) => {
                changed |= state.base.rebind(old, new);
                for part in &mut state.parts {
                    match part {
                        MemberPartState::Reference { state: sub, value } => {
                            if sub.rebind(old, new) {
                                changed = true;
                                if let Some(kp) = sub.keypath().cloned() {
                                    *value = Some(self.instances[iid].store.get(&kp));
                                }
                            }
                        }
                        MemberPartState::Expression { state: sub, value } => {
                            if sub.rebind(old, new) {
                                changed = true;
                                let key = Self::ensure_expr_computation(
                                    &mut self.instances[iid].store,
                                    sub,
                                    &chain,
                                );
                                sub.keypath = key.clone();
                                if let Some(kp) = key {
                                    *value = Some(self.instances[iid].store.get(&kp));
                                }
                            }
                        }
                    }
                }
                let composed = state.compose();
                if composed != state.composed {
                    changed = true;
                }
                state.composed = composed.clone();
                composed
            }
        };

        if !changed {
            return;
        }

        // Re-register under the rewritten keypaths.
        for (keypath, dependant) in &old_registrations {
            self.instances[iid]
                .store
                .unregister(keypath, *dependant, DepsGroup::Default);
        }
        let new_registrations = self.collect_registrations(item, &resolver, &new_main);
        for (keypath, dependant) in &new_registrations {
            self.instances[iid]
                .store
                .register(keypath, *dependant, DepsGroup::Default);
        }

        match &mut self.tree.items[item].kind {
            ItemKind::Interpolator(state) => {
                state.resolver = resolver;
                state.keypath = new_main;
            }
            ItemKind::Section(state) => {
                state.resolver = resolver;
                state.keypath = new_main;
            }
            _ => {}
        }
    }
}
