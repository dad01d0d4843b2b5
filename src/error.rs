//! Error types for store and resolver operations.

use crate::keypath::Keypath;

/// Fatal configuration errors.
///
/// Recoverable conditions (failed lookups, unresolved references, throwing
/// computation getters) never surface through this type: they degrade to
/// `Undefined` and are retried or logged instead.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// A computation without a setter was written to.
    #[error("computation at {keypath} has no setter")]
    ReadOnlyComputation {
        /// The computation's keypath.
        keypath: Keypath,
    },

    /// A reference used more `../` segments than there are enclosing
    /// contexts.
    #[error("reference {reference:?} pops more contexts than exist")]
    AncestorDepthExceeded {
        /// The offending reference text.
        reference: String,
    },

    /// A member expression's base never resolved while a value was required
    /// synchronously.
    #[error("member reference {reference:?} has an unresolved base")]
    UnresolvedBase {
        /// The offending reference text.
        reference: String,
    },

    /// A `set` tried to write through a scalar that cannot hold children.
    #[error("value at {keypath} cannot contain children")]
    NotAContainer {
        /// The keypath of the scalar.
        keypath: Keypath,
    },
}
