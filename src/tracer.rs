//! Tracer trait for observing runtime activity.
//!
//! The default [`NoopTracer`] costs nothing. A custom tracer can collect
//! events for tests, forward them to a logging backend, or drive an
//! inspector UI.
//!
//! # Example
//!
//! ```ignore
//! use view_flow::{Tracer, ViewRuntime};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_change(&self, keypath: &Keypath) {
//!         println!("changed: {keypath}");
//!     }
//! }
//!
//! let runtime = ViewRuntime::builder().tracer(PrintTracer).build();
//! ```

use serde::{Deserialize, Serialize};

use crate::keypath::Keypath;

/// Unique identifier for one outermost flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlushId(pub u64);

/// Outcome of one computation evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeResult {
    /// The computation produced a new value.
    Changed,
    /// The computation re-evaluated to the same value.
    Unchanged,
    /// The getter failed; the value degraded to `Undefined`.
    Error {
        /// Rendered error message.
        message: String,
    },
}

/// Summary of one list shuffle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShuffleStats {
    /// Fragments kept at their old index.
    pub kept: usize,
    /// Fragments rebound to a new index.
    pub moved: usize,
    /// Fragments unbound and queued for unrender.
    pub removed: usize,
    /// Net-new trailing fragments created.
    pub added: usize,
}

/// Observer of runtime activity.
///
/// All methods have empty default bodies, so implementations override only
/// what they need.
pub trait Tracer {
    /// An outermost batch began flushing.
    fn on_flush_start(&self, flush: FlushId) {
        let _ = flush;
    }

    /// An outermost batch converged after `rounds` flush rounds.
    fn on_flush_end(&self, flush: FlushId, rounds: usize) {
        let _ = (flush, rounds);
    }

    /// A keypath entered the pending change list.
    fn on_change(&self, keypath: &Keypath) {
        let _ = keypath;
    }

    /// A computation evaluated.
    fn on_compute(&self, keypath: &Keypath, result: &ComputeResult) {
        let _ = (keypath, result);
    }

    /// A reference resolved to a keypath.
    fn on_resolve(&self, reference: &str, keypath: &Keypath) {
        let _ = (reference, keypath);
    }

    /// A reference could not be resolved and was queued for retry.
    fn on_resolution_deferred(&self, reference: &str) {
        let _ = reference;
    }

    /// A list section reconciled via the shuffle algorithm.
    fn on_shuffle(&self, keypath: &Keypath, stats: ShuffleStats) {
        let _ = (keypath, stats);
    }
}

/// Tracer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        changes: RefCell<Vec<String>>,
    }

    impl Tracer for Recorder {
        fn on_change(&self, keypath: &Keypath) {
            self.changes.borrow_mut().push(keypath.to_string());
        }
    }

    #[test]
    fn default_methods_are_noops() {
        let tracer = NoopTracer;
        tracer.on_flush_start(FlushId(0));
        tracer.on_change(&Keypath::from("a"));
        tracer.on_flush_end(FlushId(0), 1);
    }

    #[test]
    fn overridden_hooks_fire() {
        let tracer = Recorder::default();
        tracer.on_change(&Keypath::from("items.0"));
        assert_eq!(*tracer.changes.borrow(), vec!["items.0".to_string()]);
    }
}
