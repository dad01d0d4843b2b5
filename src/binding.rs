//! Two-way bindings between user-editable controls and the store.
//!
//! One concrete type per control kind, selected by [`create_binding`] at
//! bind time. Each implementation knows how to push a model value into the
//! control's state and how to turn a user edit into the next model value;
//! the runtime owns the store write and the `locked` feedback guard (a
//! value set in response to a UI event must not be re-applied to that same
//! control during the same flush).

use crate::render::{ControlState, Document, NodeId};
use crate::value::Value;

/// A user edit arriving from a control.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlInput {
    /// New text/value content.
    Text(String),
    /// Checked-state change for checkbox/radio controls.
    Toggle(bool),
}

/// Capability set of a two-way binding.
pub trait Binding {
    /// Apply the model value to the control's rendered state.
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value);

    /// Tear down any control state this binding owns.
    fn unrender(&self, doc: &mut Document, node: NodeId) {
        let _ = (doc, node);
    }

    /// Read the control's state back as a model value.
    fn get_value(&self, doc: &Document, node: NodeId) -> Value;

    /// Fold a user edit into the next model value, applying it to the
    /// control state as a real control would.
    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        current: &Value,
        input: &ControlInput,
    ) -> Value;
}

fn control_mut<'d>(doc: &'d mut Document, node: NodeId) -> &'d mut ControlState {
    doc.control_mut(node).expect("bindable element has control state")
}

// ---------------------------------------------------------------------------
// Generic text (input / textarea)
// ---------------------------------------------------------------------------

/// Plain text control: model value is the control's text.
pub struct TextBinding;

impl Binding for TextBinding {
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value) {
        control_mut(doc, node).value = value.to_display_string();
    }

    fn get_value(&self, doc: &Document, node: NodeId) -> Value {
        Value::String(doc.control(node).map(|c| c.value.clone()).unwrap_or_default())
    }

    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        _current: &Value,
        input: &ControlInput,
    ) -> Value {
        if let ControlInput::Text(text) = input {
            control_mut(doc, node).value = text.clone();
        }
        self.get_value(doc, node)
    }
}

// ---------------------------------------------------------------------------
// Content-editable
// ---------------------------------------------------------------------------

/// Content-editable region: same value model as text, kept separate
/// because render must not clobber an in-progress edit elsewhere.
pub struct ContentEditableBinding;

impl Binding for ContentEditableBinding {
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value) {
        control_mut(doc, node).value = value.to_display_string();
    }

    fn get_value(&self, doc: &Document, node: NodeId) -> Value {
        Value::String(doc.control(node).map(|c| c.value.clone()).unwrap_or_default())
    }

    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        _current: &Value,
        input: &ControlInput,
    ) -> Value {
        if let ControlInput::Text(text) = input {
            control_mut(doc, node).value = text.clone();
        }
        self.get_value(doc, node)
    }
}

// ---------------------------------------------------------------------------
// Select
// ---------------------------------------------------------------------------

/// Single select: model value is the selected option's value.
pub struct SelectBinding;

impl Binding for SelectBinding {
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value) {
        control_mut(doc, node).value = value.to_display_string();
    }

    fn get_value(&self, doc: &Document, node: NodeId) -> Value {
        Value::String(doc.control(node).map(|c| c.value.clone()).unwrap_or_default())
    }

    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        _current: &Value,
        input: &ControlInput,
    ) -> Value {
        if let ControlInput::Text(text) = input {
            control_mut(doc, node).value = text.clone();
        }
        self.get_value(doc, node)
    }
}

// ---------------------------------------------------------------------------
// Checkbox group
// ---------------------------------------------------------------------------

/// Checkbox group member: the model value is the list of checked members'
/// own values.
pub struct CheckboxGroupBinding {
    /// This control's own contribution to the bound list.
    pub own_value: Value,
}

impl Binding for CheckboxGroupBinding {
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value) {
        let checked = match value {
            Value::List(items) => items.contains(&self.own_value),
            other => *other == self.own_value,
        };
        control_mut(doc, node).checked = checked;
    }

    fn get_value(&self, doc: &Document, node: NodeId) -> Value {
        Value::Bool(doc.control(node).map(|c| c.checked).unwrap_or(false))
    }

    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        current: &Value,
        input: &ControlInput,
    ) -> Value {
        let ControlInput::Toggle(checked) = input else {
            return current.clone();
        };
        control_mut(doc, node).checked = *checked;
        let mut items = match current {
            Value::List(items) => items.clone(),
            _ => Vec::new(),
        };
        if *checked {
            if !items.contains(&self.own_value) {
                items.push(self.own_value.clone());
            }
        } else {
            items.retain(|v| *v != self.own_value);
        }
        Value::List(items)
    }
}

// ---------------------------------------------------------------------------
// Radio group
// ---------------------------------------------------------------------------

/// Radio group member: the model value is the checked member's own value.
pub struct RadioGroupBinding {
    /// This control's own value.
    pub own_value: Value,
}

impl Binding for RadioGroupBinding {
    fn render(&self, doc: &mut Document, node: NodeId, value: &Value) {
        control_mut(doc, node).checked = *value == self.own_value;
    }

    fn get_value(&self, doc: &Document, node: NodeId) -> Value {
        if doc.control(node).map(|c| c.checked).unwrap_or(false) {
            self.own_value.clone()
        } else {
            Value::Undefined
        }
    }

    fn handle_change(
        &self,
        doc: &mut Document,
        node: NodeId,
        current: &Value,
        input: &ControlInput,
    ) -> Value {
        let ControlInput::Toggle(checked) = input else {
            return current.clone();
        };
        control_mut(doc, node).checked = *checked;
        if *checked {
            self.own_value.clone()
        } else {
            current.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Which attribute a binding kind reads its keypath from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundAttribute {
    /// The `value` attribute carries the bound reference.
    Value,
    /// The `name` attribute carries the bound reference (checkbox/radio
    /// groups).
    Name,
}

/// Select the binding implementation for an element at bind time.
///
/// `element` is the element name, `type_attr` the static `type` attribute,
/// `contenteditable` whether the attribute is present, and `own_value` the
/// element's static `value` attribute (group members contribute it to the
/// group's model value).
pub fn create_binding(
    element: &str,
    type_attr: Option<&str>,
    contenteditable: bool,
    own_value: Value,
) -> Option<(Box<dyn Binding>, BoundAttribute)> {
    if contenteditable {
        return Some((Box::new(ContentEditableBinding), BoundAttribute::Value));
    }
    match element {
        "select" => Some((Box::new(SelectBinding), BoundAttribute::Value)),
        "textarea" => Some((Box::new(TextBinding), BoundAttribute::Value)),
        "input" => match type_attr {
            Some("checkbox") => Some((
                Box::new(CheckboxGroupBinding { own_value }),
                BoundAttribute::Name,
            )),
            Some("radio") => Some((
                Box::new(RadioGroupBinding { own_value }),
                BoundAttribute::Name,
            )),
            _ => Some((Box::new(TextBinding), BoundAttribute::Value)),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NodeKind;

    fn doc_with_control() -> (Document, NodeId) {
        let mut doc = Document::new();
        let node = doc.create(NodeKind::Element {
            name: "input".to_string(),
            attributes: vec![],
            control: Some(ControlState::default()),
        });
        doc.insert_before(None, node, None);
        (doc, node)
    }

    #[test]
    fn text_binding_roundtrip() {
        let (mut doc, node) = doc_with_control();
        let binding = TextBinding;
        binding.render(&mut doc, node, &Value::from("hello"));
        assert_eq!(binding.get_value(&doc, node), Value::from("hello"));
        let next = binding.handle_change(
            &mut doc,
            node,
            &Value::from("hello"),
            &ControlInput::Text("world".to_string()),
        );
        assert_eq!(next, Value::from("world"));
    }

    #[test]
    fn checkbox_group_adds_and_removes_own_value() {
        let (mut doc, node) = doc_with_control();
        let binding = CheckboxGroupBinding {
            own_value: Value::from("b"),
        };
        let current = Value::list([Value::from("a")]);
        let next = binding.handle_change(&mut doc, node, &current, &ControlInput::Toggle(true));
        assert_eq!(next, Value::list([Value::from("a"), Value::from("b")]));
        let next = binding.handle_change(&mut doc, node, &next, &ControlInput::Toggle(false));
        assert_eq!(next, Value::list([Value::from("a")]));
    }

    #[test]
    fn checkbox_render_reflects_membership() {
        let (mut doc, node) = doc_with_control();
        let binding = CheckboxGroupBinding {
            own_value: Value::from("x"),
        };
        binding.render(&mut doc, node, &Value::list([Value::from("x")]));
        assert!(doc.control(node).unwrap().checked);
        binding.render(&mut doc, node, &Value::list([]));
        assert!(!doc.control(node).unwrap().checked);
    }

    #[test]
    fn radio_group_keeps_current_on_uncheck() {
        let (mut doc, node) = doc_with_control();
        let binding = RadioGroupBinding {
            own_value: Value::from("red"),
        };
        let next = binding.handle_change(
            &mut doc,
            node,
            &Value::from("blue"),
            &ControlInput::Toggle(true),
        );
        assert_eq!(next, Value::from("red"));
        let kept = binding.handle_change(
            &mut doc,
            node,
            &Value::from("red"),
            &ControlInput::Toggle(false),
        );
        assert_eq!(kept, Value::from("red"));
    }

    #[test]
    fn factory_selects_by_control_kind() {
        assert!(matches!(
            create_binding("input", Some("checkbox"), false, Value::from("v")),
            Some((_, BoundAttribute::Name))
        ));
        assert!(matches!(
            create_binding("select", None, false, Value::Undefined),
            Some((_, BoundAttribute::Value))
        ));
        assert!(create_binding("div", None, false, Value::Undefined).is_none());
        assert!(matches!(
            create_binding("div", None, true, Value::Undefined),
            Some((_, BoundAttribute::Value))
        ));
    }
}
