//! View-Flow: a reactive data/view-binding runtime.
//!
//! Given a declarative template description and a mutable data store,
//! view-flow keeps a tree of view nodes continuously consistent with that
//! store, propagates writes to derived (computed) values, supports two-way
//! synchronization between user-editable controls and the store, and
//! performs minimal incremental updates when lists or objects change shape.
//!
//! # Key Features
//!
//! - **Keypath-indexed store**: cached reads, dependency maps, pattern
//!   observers and computed values with automatic soft-dependency capture
//! - **Reference resolution**: textual references (plain, relative,
//!   ancestor, index, expression-based) resolve against a stack of nested
//!   scopes, with automatic retry once missing data appears
//! - **Incremental reconciliation**: list sections remap existing child
//!   fragments to new indices (the shuffle algorithm) instead of
//!   destroying and recreating them
//! - **Converging batch scheduler**: nested transactions flush until the
//!   store/view system reaches a fixed point
//!
//! # Example
//!
//! ```ignore
//! use view_flow::{template, Mustache, TemplateItem, Value, ViewRuntime};
//!
//! let mut view = ViewRuntime::new(
//!     template([
//!         TemplateItem::Text("Hello, ".into()),
//!         TemplateItem::Interpolator(Mustache::Reference("name".into())),
//!     ]),
//!     Value::object([("name", Value::from("world"))]),
//! )?;
//! assert_eq!(view.render_to_string(), "Hello, world");
//!
//! view.set("name", Value::from("view-flow"))?;
//! assert_eq!(view.render_to_string(), "Hello, view-flow");
//! ```

mod adaptor;
mod binding;
mod computation;
mod error;
mod expression;
mod fragment;
mod keypath;
mod registry;
mod render;
mod resolver;
mod runloop;
mod runtime;
mod section;
mod store;
mod template;
pub mod tracer;
mod value;

pub use adaptor::ArrayAdaptor;
pub use binding::{create_binding, Binding, BoundAttribute, ControlInput};
pub use computation::{ComputeFn, ComputeSetFn, Computed};
pub use error::ViewError;
pub use expression::{binary, evaluate, BinaryOp, Expr, UnaryOp};
pub use fragment::{FragmentId, ItemId};
pub use keypath::Keypath;
pub use registry::{Registries, Registry, TransitionSpec};
pub use render::{ControlState, Document, NodeId, NodeKind};
pub use resolver::{resolve_reference, Attempt, ResolvedRef, ScopeChain};
pub use runtime::{
    Dependant, InstanceId, ObserveOptions, ObserverHandle, RuntimeBuilder, ViewRuntime, ViewStore,
};
pub use section::SectionMode;
pub use store::{ChangeOutcome, DepsGroup, Notification, NotifyAction, Store};
pub use template::{
    template, AttributeTemplate, ExprTemplate, MemberPart, Mustache, SectionKind, Template,
    TemplateItem,
};
pub use tracer::{ComputeResult, FlushId, NoopTracer, ShuffleStats, Tracer};
pub use value::{Shape, Value};
