//! Computed values: derived, cached, lazily recomputed.

use std::fmt;
use std::sync::Arc;

use ahash::HashSet;

use crate::keypath::Keypath;
use crate::store::Store;
use crate::value::Value;

/// Getter for a computed value.
///
/// Reads performed through the store during evaluation are recorded as the
/// computation's soft dependencies.
pub type ComputeFn<D> = Arc<dyn Fn(&mut Store<D>) -> Result<Value, anyhow::Error>>;

/// Setter for a computed value: writes the incoming value back through to
/// whatever inputs define the computation.
pub type ComputeSetFn<D> = Arc<dyn Fn(&mut Store<D>, Value) -> Result<(), anyhow::Error>>;

/// Specification of a computed value, passed to [`Store::compute`].
///
/// # Example
///
/// ```ignore
/// store.compute(
///     Keypath::from("total"),
///     Computed::new(|store| {
///         let price = store.get(&Keypath::from("price"));
///         let qty = store.get(&Keypath::from("qty"));
///         Ok(Value::Number(price.as_number() * qty.as_number()))
///     }),
/// );
/// ```
pub struct Computed<D> {
    /// The getter.
    pub get: ComputeFn<D>,
    /// Optional setter; a setter-less computation rejects writes.
    pub set: Option<ComputeSetFn<D>>,
    /// Declared hard dependencies, registered at install time.
    pub deps: Vec<Keypath>,
}

impl<D> Computed<D> {
    /// Build a computation spec from a getter.
    pub fn new(get: impl Fn(&mut Store<D>) -> Result<Value, anyhow::Error> + 'static) -> Self {
        Computed {
            get: Arc::new(get),
            set: None,
            deps: Vec::new(),
        }
    }

    /// Attach a setter.
    pub fn with_set(
        mut self,
        set: impl Fn(&mut Store<D>, Value) -> Result<(), anyhow::Error> + 'static,
    ) -> Self {
        self.set = Some(Arc::new(set));
        self
    }

    /// Declare hard dependencies.
    pub fn with_deps<I: IntoIterator<Item = Keypath>>(mut self, deps: I) -> Self {
        self.deps = deps.into_iter().collect();
        self
    }
}

impl<D> Clone for Computed<D> {
    fn clone(&self) -> Self {
        Computed {
            get: self.get.clone(),
            set: self.set.clone(),
            deps: self.deps.clone(),
        }
    }
}

impl<D> fmt::Debug for Computed<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("deps", &self.deps)
            .field("has_setter", &self.set.is_some())
            .finish()
    }
}

/// A live computation inside the store.
pub(crate) struct Computation<D> {
    pub getter: ComputeFn<D>,
    pub setter: Option<ComputeSetFn<D>>,
    pub hard_deps: Vec<Keypath>,
    /// Discovered dependencies from the last evaluation, diffed each time.
    pub soft_deps: HashSet<Keypath>,
    pub value: Value,
    pub evaluated: bool,
    pub dirty: bool,
}

impl<D> Computation<D> {
    pub fn new(spec: Computed<D>) -> Self {
        Computation {
            getter: spec.get,
            setter: spec.set,
            hard_deps: spec.deps,
            soft_deps: HashSet::default(),
            value: Value::Undefined,
            evaluated: false,
            dirty: true,
        }
    }
}

/// One soft-dependency capture frame; a frame is pushed for the duration of
/// each computation evaluation.
#[derive(Default)]
pub(crate) struct CaptureFrame {
    /// Every keypath read during evaluation.
    pub reads: HashSet<Keypath>,
    /// Reads whose lookup failed on the parent value; the computation is
    /// invalidated once any write lands at or above one of these.
    pub failed: HashSet<Keypath>,
}
