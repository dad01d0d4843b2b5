//! Reference resolution: turning textual references into concrete store
//! keypaths given a stack of nested scopes.
//!
//! Resolver state lives with the owning mustache item; the functions here
//! are pure over `(reference, scope chain, store)`. Cross-instance
//! delegation (a nested view resolving through its parent) is layered on
//! top by the runtime, which owns both stores.

use crate::error::ViewError;
use crate::expression::evaluate;
use crate::keypath::Keypath;
use crate::store::Store;
use crate::template::{ExprTemplate, MemberPart, Mustache};
use crate::value::Value;

/// The scope chain visible from a resolution site.
///
/// `scopes` holds the context keypaths of enclosing `with`/`each`/context
/// sections, innermost first; the instance root is not an entry.
/// `index_refs` holds the index references visible at the site, innermost
/// first.
#[derive(Debug, Clone, Default)]
pub struct ScopeChain {
    /// Context keypaths, innermost first.
    pub scopes: Vec<Keypath>,
    /// Visible `(name, index)` bindings from enclosing list sections.
    pub index_refs: Vec<(String, usize)>,
}

impl ScopeChain {
    /// Look up an index reference by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_refs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, i)| *i)
    }
}

/// What a reference resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedRef {
    /// A concrete store keypath.
    Keypath(Keypath),
    /// An index reference: the value is the owning fragment's index.
    Index(String),
}

/// Outcome of one resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    /// Resolution succeeded.
    Resolved(ResolvedRef),
    /// Nothing matched; the caller may delegate to a parent instance or
    /// queue a retry.
    Unresolved,
}

/// Syntactic class of a reference.
enum RefClass<'a> {
    /// `~/rest`: absolute from the instance root.
    Absolute(&'a str),
    /// `./rest` or `../../rest`: relative to the current context.
    Relative {
        ups: usize,
        rest: &'a str,
    },
    Plain(&'a str),
}

fn classify(reference: &str) -> RefClass<'_> {
    if let Some(rest) = reference.strip_prefix("~/") {
        return RefClass::Absolute(rest);
    }
    let mut ups = 0;
    let mut rest = reference;
    while let Some(tail) = rest.strip_prefix("../") {
        ups += 1;
        rest = tail;
    }
    if ups > 0 {
        return RefClass::Relative { ups, rest };
    }
    if let Some(tail) = reference.strip_prefix("./") {
        return RefClass::Relative { ups: 0, rest: tail };
    }
    if reference == "." {
        return RefClass::Relative { ups: 0, rest: "" };
    }
    RefClass::Plain(reference)
}

/// Resolve a plain reference against a scope chain.
///
/// Implements the textual-reference algorithm: absolute (`~/`) and
/// relative (`.`/`../`) forms short-circuit; otherwise index references are
/// checked, then the scope chain is walked outward looking for a context
/// whose value owns the reference's first segment, then the root data and
/// computed registry. Returns `Unresolved` when nothing matches; exceeding
/// the available ancestor depth is a hard error.
pub fn resolve_reference<D>(
    reference: &str,
    chain: &ScopeChain,
    store: &mut Store<D>,
) -> Result<Attempt, ViewError>
where
    D: Copy + Eq + std::hash::Hash + std::fmt::Debug,
{
    match classify(reference) {
        RefClass::Absolute(rest) => Ok(Attempt::Resolved(ResolvedRef::Keypath(Keypath::from(
            rest,
        )))),
        RefClass::Relative { ups, rest } => {
            let base = if ups == 0 {
                chain.scopes.first().cloned().unwrap_or_else(Keypath::root)
            } else if ups < chain.scopes.len() {
                chain.scopes[ups].clone()
            } else if ups == chain.scopes.len() {
                Keypath::root()
            } else {
                return Err(ViewError::AncestorDepthExceeded {
                    reference: reference.to_string(),
                });
            };
            let keypath = if rest.is_empty() {
                base
            } else {
                base.join(rest)
            };
            Ok(Attempt::Resolved(ResolvedRef::Keypath(keypath)))
        }
        RefClass::Plain(rest) => {
            if chain.index_of(rest).is_some() {
                return Ok(Attempt::Resolved(ResolvedRef::Index(rest.to_string())));
            }
            let first = Keypath::from(rest).first_key().to_string();
            for scope in &chain.scopes {
                let value = store.get(scope);
                if value.has_child(&first) {
                    return Ok(Attempt::Resolved(ResolvedRef::Keypath(scope.join(rest))));
                }
            }
            let as_root = Keypath::from(rest);
            if store.root_has(&as_root) {
                return Ok(Attempt::Resolved(ResolvedRef::Keypath(as_root)));
            }
            Ok(Attempt::Unresolved)
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver state machines
// ---------------------------------------------------------------------------

/// State of one plain-reference resolver.
#[derive(Debug, Clone)]
pub struct RefResolverState {
    /// The reference text.
    pub reference: String,
    /// Resolution, once reached (terminal for plain references).
    pub resolved: Option<ResolvedRef>,
}

impl RefResolverState {
    /// Fresh unresolved state.
    pub fn new(reference: impl Into<String>) -> Self {
        RefResolverState {
            reference: reference.into(),
            resolved: None,
        }
    }

    /// Whether resolution has completed.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// The resolved keypath, if the reference resolved to one.
    pub fn keypath(&self) -> Option<&Keypath> {
        match &self.resolved {
            Some(ResolvedRef::Keypath(kp)) => Some(kp),
            _ => None,
        }
    }

    /// Try to resolve; returns `true` when newly resolved.
    pub fn attempt<D>(
        &mut self,
        chain: &ScopeChain,
        store: &mut Store<D>,
    ) -> Result<bool, ViewError>
    where
        D: Copy + Eq + std::hash::Hash + std::fmt::Debug,
    {
        if self.resolved.is_some() {
            return Ok(false);
        }
        match resolve_reference(&self.reference, chain, store)? {
            Attempt::Resolved(resolved) => {
                self.resolved = Some(resolved);
                Ok(true)
            }
            Attempt::Unresolved => Ok(false),
        }
    }

    /// Rewrite the resolved keypath when an enclosing list section
    /// reindexes. Returns `true` when the keypath changed.
    pub fn rebind(&mut self, old: &Keypath, new: &Keypath) -> bool {
        if let Some(ResolvedRef::Keypath(kp)) = &self.resolved {
            if let Some(rewritten) = kp.replace_prefix(old, new) {
                if rewritten != *kp {
                    self.resolved = Some(ResolvedRef::Keypath(rewritten));
                    return true;
                }
            }
        }
        false
    }
}

/// State of an expression resolver: one child resolver per extracted
/// sub-reference; once all resolve, a computation is built (or reused) and
/// its keypath reported.
#[derive(Debug, Clone)]
pub struct ExprResolverState {
    /// The parsed expression.
    pub template: ExprTemplate,
    /// Child resolvers, one per sub-reference.
    pub subs: Vec<RefResolverState>,
    /// The backing computation's keypath, once all sub-references resolve.
    pub keypath: Option<Keypath>,
}

impl ExprResolverState {
    /// Fresh state with one child resolver per sub-reference.
    pub fn new(template: ExprTemplate) -> Self {
        let subs = template.refs.iter().map(RefResolverState::new).collect();
        ExprResolverState {
            template,
            subs,
            keypath: None,
        }
    }

    /// Whether every sub-reference has resolved.
    pub fn all_subs_resolved(&self) -> bool {
        self.subs.iter().all(|s| s.is_resolved())
    }

    /// The canonical computation keypath for the current sub resolutions.
    ///
    /// Index references contribute their current index as a literal.
    pub fn computation_key(&self, chain: &ScopeChain) -> Option<Keypath> {
        if !self.all_subs_resolved() {
            return None;
        }
        let parts: Vec<String> = self
            .subs
            .iter()
            .map(|sub| match sub.resolved.as_ref().expect("all resolved") {
                ResolvedRef::Keypath(kp) => kp.to_string(),
                ResolvedRef::Index(name) => chain.index_of(name).unwrap_or(0).to_string(),
            })
            .collect();
        Some(Keypath::from(self.template.computation_key(&parts)))
    }

    /// Evaluate the expression directly from sub values.
    pub fn evaluate_with(&self, values: &[Value]) -> Value {
        evaluate(&self.template.body, values)
    }

    /// Rebind sub-references; returns `true` when any keypath changed.
    pub fn rebind(&mut self, old: &Keypath, new: &Keypath) -> bool {
        let mut changed = false;
        for sub in &mut self.subs {
            changed |= sub.rebind(old, new);
        }
        if changed {
            // The canonical key changed with its members; it is re-derived
            // by the owner on the next report.
            self.keypath = None;
        }
        changed
    }
}

/// One member part of a reference expression.
#[derive(Debug, Clone)]
pub enum MemberPartState {
    /// A plain reference member; its current value is one keypath segment.
    Reference {
        /// Resolver for the member reference.
        state: RefResolverState,
        /// Last seen value.
        value: Option<Value>,
    },
    /// An expression member.
    Expression {
        /// Resolver for the member expression.
        state: ExprResolverState,
        /// Last seen value.
        value: Option<Value>,
    },
}

impl MemberPartState {
    /// Build from a template member part.
    pub fn new(part: &MemberPart) -> Self {
        match part {
            MemberPart::Reference(r) => MemberPartState::Reference {
                state: RefResolverState::new(r.clone()),
                value: None,
            },
            MemberPart::Expression(x) => MemberPartState::Expression {
                state: ExprResolverState::new(x.clone()),
                value: None,
            },
        }
    }

    /// The member's current value, if known.
    pub fn value(&self) -> Option<&Value> {
        match self {
            MemberPartState::Reference { value, .. } => value.as_ref(),
            MemberPartState::Expression { value, .. } => value.as_ref(),
        }
    }
}

/// State of a reference-expression (dynamic member access) resolver.
///
/// The composed keypath is defined only once the base has resolved and
/// every member has a defined value; any member value change re-derives it.
#[derive(Debug, Clone)]
pub struct MemberResolverState {
    /// Resolver for the base reference.
    pub base: RefResolverState,
    /// Member part resolvers.
    pub parts: Vec<MemberPartState>,
    /// The current composed keypath.
    pub composed: Option<Keypath>,
}

impl MemberResolverState {
    /// Fresh state from template parts.
    pub fn new(base: impl Into<String>, parts: &[MemberPart]) -> Self {
        MemberResolverState {
            base: RefResolverState::new(base),
            parts: parts.iter().map(MemberPartState::new).collect(),
            composed: None,
        }
    }

    /// Derive the composed keypath from the base resolution and current
    /// member values. Returns `None` while any piece is missing.
    pub fn compose(&self) -> Option<Keypath> {
        let mut keypath = self.base.keypath()?.clone();
        for part in &self.parts {
            let value = part.value()?;
            if value.is_undefined() {
                return None;
            }
            keypath = keypath.join(&value.to_display_string());
        }
        Some(keypath)
    }
}

/// Construct the resolver state for a template mustache.
#[derive(Debug, Clone)]
pub enum MustacheResolver {
    /// A plain reference.
    Reference(RefResolverState),
    /// An expression.
    Expression(ExprResolverState),
    /// A dynamic member access.
    Member(MemberResolverState),
}

impl MustacheResolver {
    /// Build the matching resolver state for a mustache.
    pub fn new(mustache: &Mustache) -> Self {
        match mustache {
            Mustache::Reference(r) => MustacheResolver::Reference(RefResolverState::new(r.clone())),
            Mustache::Expression(x) => {
                MustacheResolver::Expression(ExprResolverState::new(x.clone()))
            }
            Mustache::Member { base, members } => {
                MustacheResolver::Member(MemberResolverState::new(base.clone(), members))
            }
        }
    }
}
