//! Render target: an owned document model.
//!
//! The core renders into this slab-backed node tree instead of any real
//! UI surface. It supports exactly what the fragment tree needs: ordered
//! insertion, minimal moves, deferred detachment, and per-control state
//! for two-way bindings.

use slab::Slab;

/// Handle to a render node.
pub type NodeId = usize;

/// Mutable state of a user-editable control.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlState {
    /// Current text/value of the control.
    pub value: String,
    /// Checked flag for checkbox/radio controls.
    pub checked: bool,
}

/// Node payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A text run.
    Text(String),
    /// An element with rendered attributes.
    Element {
        /// Element name.
        name: String,
        /// Rendered attribute name/value pairs.
        attributes: Vec<(String, String)>,
        /// Control state, present for bindable elements.
        control: Option<ControlState>,
    },
    /// Zero-width marker delimiting a section's end.
    Anchor,
}

#[derive(Debug)]
struct RenderNode {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// The render target document.
#[derive(Default)]
pub struct Document {
    nodes: Slab<RenderNode>,
    roots: Vec<NodeId>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node without attaching it.
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.insert(RenderNode {
            kind,
            parent: None,
            children: Vec::new(),
        })
    }

    fn child_list(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        match parent {
            Some(p) => &mut self.nodes[p].children,
            None => &mut self.roots,
        }
    }

    /// Attach `node` under `parent` (or at the document root), immediately
    /// before `before`, or at the end when `before` is `None`.
    pub fn insert_before(&mut self, parent: Option<NodeId>, node: NodeId, before: Option<NodeId>) {
        self.nodes[node].parent = parent;
        let list = self.child_list(parent);
        match before.and_then(|b| list.iter().position(|&n| n == b)) {
            Some(pos) => list.insert(pos, node),
            None => list.push(node),
        }
    }

    /// Move an already-attached node so it sits immediately before
    /// `before` under the same parent. No-op when already in place.
    pub fn move_before(&mut self, node: NodeId, before: Option<NodeId>) {
        let parent = self.nodes[node].parent;
        let list = self.child_list(parent);
        let Some(from) = list.iter().position(|&n| n == node) else {
            return;
        };
        let target = match before.and_then(|b| list.iter().position(|&n| n == b)) {
            Some(pos) => pos,
            None => list.len(),
        };
        if from + 1 == target || from == target {
            return;
        }
        list.remove(from);
        let target = if from < target { target - 1 } else { target };
        let list = self.child_list(parent);
        list.insert(target, node);
    }

    /// Detach a node (and its subtree) from the document, freeing it.
    pub fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes.get(node).and_then(|n| n.parent) {
            self.nodes[parent].children.retain(|&c| c != node);
        } else if self.nodes.contains(node) {
            self.roots.retain(|&c| c != node);
        }
        self.free(node);
    }

    fn free(&mut self, node: NodeId) {
        if !self.nodes.contains(node) {
            return;
        }
        let children = std::mem::take(&mut self.nodes[node].children);
        for child in children {
            self.free(child);
        }
        self.nodes.remove(node);
    }

    /// Whether a node is still present.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// The parent of an attached node (`None` for document roots).
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node].parent
    }

    /// Whether `node` precedes `other` among the same parent's children.
    pub fn is_before(&self, node: NodeId, other: NodeId) -> bool {
        let parent = self.nodes[node].parent;
        if parent != self.nodes[other].parent {
            return false;
        }
        let list = match parent {
            Some(p) => &self.nodes[p].children,
            None => &self.roots,
        };
        let a = list.iter().position(|&n| n == node);
        let b = list.iter().position(|&n| n == other);
        matches!((a, b), (Some(a), Some(b)) if a < b)
    }

    /// Replace a text node's content.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let NodeKind::Text(t) = &mut self.nodes[node].kind {
            if t != text {
                *t = text.to_string();
            }
        }
    }

    /// Set or replace a rendered attribute.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let NodeKind::Element { attributes, .. } = &mut self.nodes[node].kind {
            match attributes.iter_mut().find(|(n, _)| n == name) {
                Some((_, v)) => *v = value.to_string(),
                None => attributes.push((name.to_string(), value.to_string())),
            }
        }
    }

    /// Read a rendered attribute.
    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[node].kind {
            NodeKind::Element { attributes, .. } => attributes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Mutable control state of a bindable element.
    pub fn control_mut(&mut self, node: NodeId) -> Option<&mut ControlState> {
        match &mut self.nodes[node].kind {
            NodeKind::Element { control, .. } => control.as_mut(),
            _ => None,
        }
    }

    /// Control state of a bindable element.
    pub fn control(&self, node: NodeId) -> Option<&ControlState> {
        match &self.nodes[node].kind {
            NodeKind::Element { control, .. } => control.as_ref(),
            _ => None,
        }
    }

    /// Serialize the document, for assertions and debugging.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        for &root in &self.roots {
            self.write_node(root, &mut out);
        }
        out
    }

    fn write_node(&self, node: NodeId, out: &mut String) {
        match &self.nodes[node].kind {
            NodeKind::Text(t) => out.push_str(t),
            NodeKind::Anchor => {}
            NodeKind::Element {
                name, attributes, ..
            } => {
                out.push('<');
                out.push_str(name);
                for (attr, value) in attributes {
                    out.push_str(&format!(" {}=\"{}\"", attr, value));
                }
                out.push('>');
                for &child in &self.nodes[node].children {
                    self.write_node(child, out);
                }
                out.push_str(&format!("</{}>", name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_serialize() {
        let mut doc = Document::new();
        let el = doc.create(NodeKind::Element {
            name: "p".to_string(),
            attributes: vec![("class".to_string(), "x".to_string())],
            control: None,
        });
        doc.insert_before(None, el, None);
        let text = doc.create(NodeKind::Text("hi".to_string()));
        doc.insert_before(Some(el), text, None);
        assert_eq!(doc.to_markup(), "<p class=\"x\">hi</p>");
    }

    #[test]
    fn move_before_is_minimal() {
        let mut doc = Document::new();
        let a = doc.create(NodeKind::Text("a".to_string()));
        let b = doc.create(NodeKind::Text("b".to_string()));
        let c = doc.create(NodeKind::Text("c".to_string()));
        for n in [a, b, c] {
            doc.insert_before(None, n, None);
        }
        doc.move_before(c, Some(a));
        assert_eq!(doc.to_markup(), "cab");
        // Already in place: no-op.
        doc.move_before(c, Some(a));
        assert_eq!(doc.to_markup(), "cab");
    }

    #[test]
    fn detach_frees_subtree() {
        let mut doc = Document::new();
        let el = doc.create(NodeKind::Element {
            name: "div".to_string(),
            attributes: vec![],
            control: None,
        });
        doc.insert_before(None, el, None);
        let inner = doc.create(NodeKind::Text("x".to_string()));
        doc.insert_before(Some(el), inner, None);
        doc.detach(el);
        assert!(!doc.contains(el));
        assert!(!doc.contains(inner));
        assert_eq!(doc.to_markup(), "");
    }

    #[test]
    fn anchors_are_invisible() {
        let mut doc = Document::new();
        let anchor = doc.create(NodeKind::Anchor);
        doc.insert_before(None, anchor, None);
        let t = doc.create(NodeKind::Text("x".to_string()));
        doc.insert_before(None, t, Some(anchor));
        assert_eq!(doc.to_markup(), "x");
        assert!(doc.is_before(t, anchor));
    }
}
