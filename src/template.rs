//! Template AST consumed by fragment construction.
//!
//! This is the boundary contract with the (out-of-scope) template parser: an
//! ordered list of item descriptors, each a closed sum-type variant rather
//! than a numeric kind code. The AST is opaque data to the core — fragments
//! instantiate it, they never rewrite it.

use std::sync::Arc;

use crate::expression::Expr;

/// One parsed template item.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateItem {
    /// A literal text run.
    Text(String),
    /// A value interpolation.
    Interpolator(Mustache),
    /// A section: child-fragment count and content depend on the bound
    /// value's shape.
    Section {
        /// Section subtype from the template syntax.
        kind: SectionKind,
        /// The section's bound reference.
        binding: Mustache,
        /// Template for each child fragment.
        template: Template,
    },
    /// An element with attributes and child items.
    Element {
        /// Element name, e.g. `input`.
        name: String,
        /// Attribute templates; values are text/interpolator runs.
        attributes: Vec<AttributeTemplate>,
        /// Whether a two-way binding should be attached when possible.
        twoway: bool,
        /// Named intro transition, looked up through the registry chain.
        intro: Option<String>,
        /// Named outro transition, looked up through the registry chain.
        outro: Option<String>,
        /// Child template.
        children: Template,
    },
    /// A named partial, resolved through the registry chain at
    /// fragment-construction time.
    Partial {
        /// Registry name of the partial.
        name: String,
    },
}

/// Shared, immutable template slice.
pub type Template = Arc<[TemplateItem]>;

/// Build a [`Template`] from items.
pub fn template<I: IntoIterator<Item = TemplateItem>>(items: I) -> Template {
    items.into_iter().collect::<Vec<_>>().into()
}

/// Section subtype as written in the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionKind {
    /// Render the single child fragment when the value is truthy.
    If,
    /// Render the single child fragment when the value is falsy.
    Unless,
    /// Push the bound keypath as a new context for the single child
    /// fragment.
    With,
    /// Render one child fragment per list element or object entry.
    Each {
        /// Optional index/key reference name bound inside each child.
        index_ref: Option<String>,
    },
    /// Generic mustache section: mode is inferred from the bound value's
    /// shape (list → each, object → with, other → if).
    IfWith,
}

/// An attribute and its (possibly interpolated) value template.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeTemplate {
    /// Attribute name, e.g. `class` or `value`.
    pub name: String,
    /// Value items: `Text` and `Interpolator` entries only.
    pub value: Vec<TemplateItem>,
}

/// A parsed reference position in the template.
#[derive(Debug, Clone, PartialEq)]
pub enum Mustache {
    /// A plain textual reference, resolved against the scope chain.
    Reference(String),
    /// A parsed expression over extracted sub-references.
    Expression(ExprTemplate),
    /// Dynamic member access, e.g. `list[index]`: a base reference plus
    /// member parts whose *values* form the composed keypath.
    Member {
        /// The base reference.
        base: String,
        /// Member parts, each a reference or an expression.
        members: Vec<MemberPart>,
    },
}

/// One member part of a dynamic member access.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberPart {
    /// A plain reference whose value is the member key.
    Reference(String),
    /// An expression whose value is the member key.
    Expression(ExprTemplate),
}

/// A parsed expression plus its referenced-keypath list.
///
/// `body` refers to entries of `refs` by index; `canonical` is the
/// expression source with `_0`, `_1`, … placeholders, used to key reuse of
/// the backing computation once all references resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprTemplate {
    /// Placeholder form of the expression source.
    pub canonical: String,
    /// Extracted sub-references, in placeholder order.
    pub refs: Vec<String>,
    /// The parsed expression body.
    pub body: Expr,
}

impl ExprTemplate {
    /// Canonical computation keypath for this expression given resolved
    /// keypaths for every sub-reference.
    ///
    /// Two expression positions that canonicalize identically share one
    /// computation.
    pub fn computation_key(&self, keypaths: &[String]) -> String {
        let mut out = self.canonical.clone();
        // Substitute in reverse so `_10` is not clobbered by `_1`.
        for (i, kp) in keypaths.iter().enumerate().rev() {
            out = out.replace(&format!("_{}", i), kp);
        }
        format!("${{{}}}", out)
    }
}
