//! Two-way bindings between rendered controls and the store, plus
//! registry-resolved partials.

use view_flow::{
    template, AttributeTemplate, ControlInput, Mustache, TemplateItem, Value, ViewRuntime,
};

fn value_attr(reference: &str) -> AttributeTemplate {
    AttributeTemplate {
        name: "value".to_string(),
        value: vec![TemplateItem::Interpolator(Mustache::Reference(
            reference.to_string(),
        ))],
    }
}

fn static_attr(name: &str, value: &str) -> AttributeTemplate {
    AttributeTemplate {
        name: name.to_string(),
        value: vec![TemplateItem::Text(value.to_string())],
    }
}

fn text_input(reference: &str) -> TemplateItem {
    TemplateItem::Element {
        name: "input".to_string(),
        attributes: vec![value_attr(reference)],
        twoway: true,
        intro: None,
        outro: None,
        children: template([]),
    }
}

fn group_input(kind: &str, group_ref: &str, own_value: &str) -> TemplateItem {
    TemplateItem::Element {
        name: "input".to_string(),
        attributes: vec![
            static_attr("type", kind),
            AttributeTemplate {
                name: "name".to_string(),
                value: vec![TemplateItem::Interpolator(Mustache::Reference(
                    group_ref.to_string(),
                ))],
            },
            static_attr("value", own_value),
        ],
        twoway: true,
        intro: None,
        outro: None,
        children: template([]),
    }
}

// ============================================================================
// Text inputs
// ============================================================================

#[test]
fn text_input_writes_back_to_the_store() {
    let mut view = ViewRuntime::new(
        template([text_input("name")]),
        Value::object([("name", Value::from("ada"))]),
    )
    .unwrap();
    let element = view.bound_elements()[0];
    let node = view.element_node(element).unwrap();
    assert_eq!(view.document().control(node).unwrap().value, "ada");

    view.fire_input(element, ControlInput::Text("grace".to_string()))
        .unwrap();
    assert_eq!(view.get("name"), Value::from("grace"));
    // The rendered value attribute followed the store.
    assert_eq!(view.document().attribute(node, "value"), Some("grace"));
    // The control keeps the user's text: the flush did not repaint it with
    // its own value.
    assert_eq!(view.document().control(node).unwrap().value, "grace");
}

#[test]
fn model_writes_update_the_control() {
    let mut view = ViewRuntime::new(
        template([text_input("name")]),
        Value::object([("name", Value::from("ada"))]),
    )
    .unwrap();
    let element = view.bound_elements()[0];
    let node = view.element_node(element).unwrap();

    view.set("name", Value::from("hopper")).unwrap();
    assert_eq!(view.document().control(node).unwrap().value, "hopper");
}

// ============================================================================
// Checkbox groups
// ============================================================================

#[test]
fn checkbox_group_tracks_membership() {
    let mut view = ViewRuntime::new(
        template([
            group_input("checkbox", "selected", "a"),
            group_input("checkbox", "selected", "b"),
        ]),
        Value::object([("selected", Value::list([Value::from("a")]))]),
    )
    .unwrap();
    let elements = view.bound_elements();
    assert_eq!(elements.len(), 2);
    let node_a = view.element_node(elements[0]).unwrap();
    let node_b = view.element_node(elements[1]).unwrap();
    assert!(view.document().control(node_a).unwrap().checked);
    assert!(!view.document().control(node_b).unwrap().checked);

    view.fire_input(elements[1], ControlInput::Toggle(true))
        .unwrap();
    assert_eq!(
        view.get("selected"),
        Value::list([Value::from("a"), Value::from("b")])
    );

    view.fire_input(elements[0], ControlInput::Toggle(false))
        .unwrap();
    assert_eq!(view.get("selected"), Value::list([Value::from("b")]));
    // The first control was repainted from the store and is unchecked now.
    assert!(!view.document().control(node_a).unwrap().checked);
}

// ============================================================================
// Radio groups
// ============================================================================

#[test]
fn radio_group_selects_one_value() {
    let mut view = ViewRuntime::new(
        template([
            group_input("radio", "choice", "red"),
            group_input("radio", "choice", "blue"),
        ]),
        Value::object([("choice", Value::from("red"))]),
    )
    .unwrap();
    let elements = view.bound_elements();
    let node_red = view.element_node(elements[0]).unwrap();
    let node_blue = view.element_node(elements[1]).unwrap();
    assert!(view.document().control(node_red).unwrap().checked);
    assert!(!view.document().control(node_blue).unwrap().checked);

    view.fire_input(elements[1], ControlInput::Toggle(true))
        .unwrap();
    assert_eq!(view.get("choice"), Value::from("blue"));
    // The store write repainted the other member of the group.
    assert!(!view.document().control(node_red).unwrap().checked);
    assert!(view.document().control(node_blue).unwrap().checked);
}

// ============================================================================
// Select
// ============================================================================

#[test]
fn select_binding_roundtrips() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Element {
            name: "select".to_string(),
            attributes: vec![value_attr("picked")],
            twoway: true,
            intro: None,
            outro: None,
            children: template([]),
        }]),
        Value::object([("picked", Value::from("one"))]),
    )
    .unwrap();
    let element = view.bound_elements()[0];
    let node = view.element_node(element).unwrap();
    assert_eq!(view.document().control(node).unwrap().value, "one");

    view.fire_input(element, ControlInput::Text("two".to_string()))
        .unwrap();
    assert_eq!(view.get("picked"), Value::from("two"));
}

// ============================================================================
// Partials
// ============================================================================

#[test]
fn partials_resolve_through_the_registry_chain() {
    let mut view = ViewRuntime::builder()
        .partial(
            "row",
            template([
                TemplateItem::Text("[".to_string()),
                TemplateItem::Interpolator(Mustache::Reference("label".to_string())),
                TemplateItem::Text("]".to_string()),
            ]),
        )
        .template(template([
            TemplateItem::Partial {
                name: "row".to_string(),
            },
            TemplateItem::Partial {
                name: "row".to_string(),
            },
        ]))
        .data(Value::object([("label", Value::from("x"))]))
        .build()
        .unwrap();
    assert_eq!(view.render_to_string(), "[x][x]");

    view.set("label", Value::from("y")).unwrap();
    assert_eq!(view.render_to_string(), "[y][y]");
}

#[test]
fn unknown_partials_render_nothing() {
    let view = ViewRuntime::new(
        template([TemplateItem::Partial {
            name: "missing".to_string(),
        }]),
        Value::object::<&str, _>([]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "");
}
