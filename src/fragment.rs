//! The fragment/item tree mirroring the template.
//!
//! Nodes live in slab arenas and refer to each other by id; parent links
//! are plain back-references, never ownership. Items are instantiated once
//! per fragment and never reordered within it — only a section's child
//! *fragments* are reordered.

use ahash::HashMap;
use slab::Slab;

use crate::binding::Binding;
use crate::keypath::Keypath;
use crate::render::NodeId;
use crate::resolver::{MustacheResolver, ScopeChain};
use crate::section::SectionMode;
use crate::template::{SectionKind, Template};
use crate::value::Value;

/// Handle to a fragment.
pub type FragmentId = usize;
/// Handle to an item.
pub type ItemId = usize;

/// One fragment: an ordered run of items sharing a context.
pub struct FragmentNode {
    /// Owning instance.
    pub instance: usize,
    /// Owning item (a section or element), `None` for an instance root.
    pub owner: Option<ItemId>,
    /// Context keypath pushed by this fragment, if any.
    pub context: Option<Keypath>,
    /// Index among sibling fragments of a list section.
    pub index: Option<usize>,
    /// Index reference name bound by the owning list section.
    pub index_ref: Option<String>,
    /// Key among sibling fragments of a keyed-list section.
    pub key: Option<String>,
    /// When this fragment renders an attribute value: the element item and
    /// attribute position it feeds.
    pub attr_owner: Option<(ItemId, usize)>,
    /// Items in template order.
    pub items: Vec<ItemId>,
    /// Whether the fragment's nodes are currently attached.
    pub rendered: bool,
}

/// One item.
pub struct ItemNode {
    /// The fragment owning this item.
    pub fragment: FragmentId,
    /// Kind-specific state.
    pub kind: ItemKind,
}

/// Item payload.
pub enum ItemKind {
    /// Literal text.
    Text(TextState),
    /// A value interpolation.
    Interpolator(Box<InterpolatorState>),
    /// A section.
    Section(Box<SectionState>),
    /// An element.
    Element(Box<ElementState>),
}

/// Literal text item state.
pub struct TextState {
    /// The text run.
    pub text: String,
    /// Rendered node.
    pub node: Option<NodeId>,
}

/// Interpolator state.
pub struct InterpolatorState {
    /// Resolver for the mustache.
    pub resolver: MustacheResolver,
    /// Registered keypath, once bound.
    pub keypath: Option<Keypath>,
    /// Index reference name, when bound to an enclosing list index.
    pub bound_index: Option<String>,
    /// Last applied value.
    pub value: Value,
    /// Rendered node.
    pub node: Option<NodeId>,
}

/// Section state.
pub struct SectionState {
    /// Template subtype.
    pub kind: SectionKind,
    /// Child template.
    pub template: Template,
    /// Resolver for the bound reference.
    pub resolver: MustacheResolver,
    /// Registered keypath, once bound.
    pub keypath: Option<Keypath>,
    /// Inferred mode; pinned after the first `set_value` until the shape
    /// class changes.
    pub mode: Option<SectionMode>,
    /// Live child fragments, in order.
    pub fragments: Vec<FragmentId>,
    /// Key → fragment for keyed-list mode.
    pub by_key: HashMap<String, FragmentId>,
    /// Fragment order as of the last render pass, for minimal moves.
    pub rendered_order: Vec<FragmentId>,
    /// Fragments created but not yet rendered.
    pub pending_creates: Vec<FragmentId>,
    /// Fragments unbound but not yet unrendered.
    pub pending_unrenders: Vec<FragmentId>,
    /// End-of-section marker node.
    pub anchor: Option<NodeId>,
}

/// One attribute of an element; its value is a fragment of text and
/// interpolator items.
pub struct AttributeState {
    /// Attribute name.
    pub name: String,
    /// The value fragment.
    pub fragment: FragmentId,
}

/// A live two-way binding attached to an element.
pub struct BindingSlot {
    /// The control-kind implementation.
    pub binding: Box<dyn Binding>,
    /// The bound keypath.
    pub keypath: Option<Keypath>,
    /// Feedback guard: set while a UI-originated write is flushing.
    pub locked: bool,
}

/// Element state.
pub struct ElementState {
    /// Element name.
    pub name: String,
    /// Attributes in template order.
    pub attributes: Vec<AttributeState>,
    /// Whether a two-way binding was requested.
    pub twoway: bool,
    /// The live binding, once attached.
    pub binding: Option<BindingSlot>,
    /// Named intro transition.
    pub intro: Option<String>,
    /// Named outro transition.
    pub outro: Option<String>,
    /// Child fragment.
    pub child: Option<FragmentId>,
    /// Rendered node.
    pub node: Option<NodeId>,
}

/// Arena of fragments and items.
#[derive(Default)]
pub struct ViewTree {
    /// All fragments.
    pub fragments: Slab<FragmentNode>,
    /// All items.
    pub items: Slab<ItemNode>,
}

impl ViewTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance a fragment belongs to.
    pub fn instance_of(&self, fragment: FragmentId) -> usize {
        self.fragments[fragment].instance
    }

    /// The parent fragment of `fragment`, walking through its owning item.
    pub fn parent_fragment(&self, fragment: FragmentId) -> Option<FragmentId> {
        let frag = &self.fragments[fragment];
        if let Some((item, _)) = frag.attr_owner {
            return Some(self.items[item].fragment);
        }
        frag.owner.map(|item| self.items[item].fragment)
    }

    /// Build the scope chain visible from `fragment`, innermost first.
    pub fn scope_chain(&self, fragment: FragmentId) -> ScopeChain {
        let mut chain = ScopeChain::default();
        let mut current = Some(fragment);
        while let Some(fid) = current {
            let frag = &self.fragments[fid];
            if let Some(context) = &frag.context {
                chain.scopes.push(context.clone());
            }
            if let (Some(index), Some(name)) = (frag.index, &frag.index_ref) {
                chain.index_refs.push((name.clone(), index));
            }
            current = self.parent_fragment(fid);
        }
        chain
    }

    /// The first attached node produced by `fragment`, used as a move
    /// anchor during reconciliation.
    pub fn first_node(&self, fragment: FragmentId) -> Option<NodeId> {
        for &item in &self.fragments[fragment].items {
            if let Some(node) = self.first_node_of_item(item) {
                return Some(node);
            }
        }
        None
    }

    fn first_node_of_item(&self, item: ItemId) -> Option<NodeId> {
        match &self.items[item].kind {
            ItemKind::Text(t) => t.node,
            ItemKind::Interpolator(i) => i.node,
            ItemKind::Element(e) => e.node,
            ItemKind::Section(s) => s
                .fragments
                .iter()
                .find_map(|&f| self.first_node(f))
                .or(s.anchor),
        }
    }

    /// Every top-level node produced by `fragment`, in order. Section
    /// anchors are included so a detached section disappears entirely.
    pub fn fragment_nodes(&self, fragment: FragmentId) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for &item in &self.fragments[fragment].items {
            self.item_nodes(item, &mut nodes);
        }
        nodes
    }

    fn item_nodes(&self, item: ItemId, out: &mut Vec<NodeId>) {
        match &self.items[item].kind {
            ItemKind::Text(t) => out.extend(t.node),
            ItemKind::Interpolator(i) => out.extend(i.node),
            ItemKind::Element(e) => out.extend(e.node),
            ItemKind::Section(s) => {
                for &f in &s.fragments {
                    out.extend(self.fragment_nodes(f));
                }
                for &f in &s.pending_unrenders {
                    out.extend(self.fragment_nodes(f));
                }
                out.extend(s.anchor);
            }
        }
    }

    /// Free a fragment and its whole subtree from the arena. Rendered
    /// nodes are not touched; the caller detaches them.
    pub fn free_fragment(&mut self, fragment: FragmentId) {
        if !self.fragments.contains(fragment) {
            return;
        }
        let items = std::mem::take(&mut self.fragments[fragment].items);
        for item in items {
            self.free_item(item);
        }
        self.fragments.remove(fragment);
    }

    fn free_item(&mut self, item: ItemId) {
        if !self.items.contains(item) {
            return;
        }
        let mut child_fragments: Vec<FragmentId> = Vec::new();
        match &self.items[item].kind {
            ItemKind::Section(s) => {
                child_fragments.extend(&s.fragments);
                child_fragments.extend(&s.pending_creates);
                child_fragments.extend(&s.pending_unrenders);
            }
            ItemKind::Element(e) => {
                child_fragments.extend(e.attributes.iter().map(|a| a.fragment));
                child_fragments.extend(e.child);
            }
            _ => {}
        }
        for f in child_fragments {
            self.free_fragment(f);
        }
        self.items.remove(item);
    }
}
