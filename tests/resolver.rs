//! Reference resolution through the runtime: scope chains, late-bound
//! references, expressions, dynamic members and cross-instance delegation.

use view_flow::{
    binary, template, BinaryOp, Expr, ExprTemplate, MemberPart, Mustache, SectionKind,
    TemplateItem, Value, ViewError, ViewRuntime,
};

fn interp(reference: &str) -> TemplateItem {
    TemplateItem::Interpolator(Mustache::Reference(reference.to_string()))
}

// ============================================================================
// Scope chains
// ============================================================================

#[test]
fn relative_and_ancestor_references_render() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::With,
            binding: Mustache::Reference("user".to_string()),
            template: template([
                interp("./name"),
                TemplateItem::Text("/".to_string()),
                interp("../title"),
            ]),
        }]),
        Value::object([
            ("user", Value::object([("name", Value::from("ada"))])),
            ("title", Value::from("engineer")),
        ]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "ada/engineer");
}

#[test]
fn plain_references_walk_the_scope_chain_outward() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::Each { index_ref: None },
            binding: Mustache::Reference("items".to_string()),
            template: template([interp("label"), interp("suffix")]),
        }]),
        Value::object([
            (
                "items",
                Value::list([Value::object([("label", Value::from("x"))])]),
            ),
            ("suffix", Value::from("!")),
        ]),
    )
    .unwrap();
    // `label` resolves on the item context, `suffix` falls through to root.
    assert_eq!(view.render_to_string(), "x!");
}

#[test]
fn exceeding_ancestor_depth_is_a_configuration_error() {
    let result = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::With,
            binding: Mustache::Reference("user".to_string()),
            template: template([interp("../../../oops")]),
        }]),
        Value::object([("user", Value::object([("name", Value::from("x"))]))]),
    );
    assert!(matches!(
        result,
        Err(ViewError::AncestorDepthExceeded { .. })
    ));
}

// ============================================================================
// Late-bound references
// ============================================================================

#[test]
fn unresolved_reference_resolves_after_data_appears() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::With,
            binding: Mustache::Reference("wrapper".to_string()),
            template: template([interp("foo.bar")]),
        }]),
        Value::object([("wrapper", Value::object([("x", Value::from(1))]))]),
    )
    .unwrap();
    // Nothing to show yet: the reference is pending, not an error.
    assert_eq!(view.render_to_string(), "");

    view.set("foo", Value::object([("bar", Value::from(5))]))
        .unwrap();
    // The pending-resolution retry ran during that batch's flush.
    assert_eq!(view.render_to_string(), "5");
    assert_eq!(view.get("foo.bar"), Value::from(5));
}

#[test]
fn root_level_orphan_reference_claims_an_implicit_keypath() {
    let mut view = ViewRuntime::new(
        template([interp("ghost")]),
        Value::object::<&str, _>([]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "");

    // The reference bound implicitly, so the write lands where it looks.
    view.set("ghost", Value::from("boo")).unwrap();
    assert_eq!(view.render_to_string(), "boo");
}

// ============================================================================
// Expressions
// ============================================================================

fn product_expression() -> Mustache {
    Mustache::Expression(ExprTemplate {
        canonical: "_0*_1".to_string(),
        refs: vec!["price".to_string(), "qty".to_string()],
        body: binary(BinaryOp::Mul, Expr::Ref(0), Expr::Ref(1)),
    })
}

#[test]
fn expression_interpolator_tracks_its_references() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Interpolator(product_expression())]),
        Value::object([("price", Value::from(3)), ("qty", Value::from(4))]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "12");

    view.set("price", Value::from(5)).unwrap();
    assert_eq!(view.render_to_string(), "20");

    view.set("qty", Value::from(0)).unwrap();
    assert_eq!(view.render_to_string(), "0");
}

#[test]
fn identical_expressions_share_one_computation() {
    let mut view = ViewRuntime::new(
        template([
            TemplateItem::Interpolator(product_expression()),
            TemplateItem::Text("/".to_string()),
            TemplateItem::Interpolator(product_expression()),
        ]),
        Value::object([("price", Value::from(2)), ("qty", Value::from(3))]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "6/6");
    view.set("qty", Value::from(5)).unwrap();
    assert_eq!(view.render_to_string(), "10/10");
}

// ============================================================================
// Dynamic member access
// ============================================================================

#[test]
fn member_expression_recomposes_when_the_member_changes() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Interpolator(Mustache::Member {
            base: "list".to_string(),
            members: vec![MemberPart::Reference("index".to_string())],
        })]),
        Value::object([
            ("list", Value::list([Value::from("a"), Value::from("b")])),
            ("index", Value::from(0)),
        ]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "a");

    view.set("index", Value::from(1)).unwrap();
    assert_eq!(view.render_to_string(), "b");

    // Writes at the composed keypath show through too.
    view.set("list.1", Value::from("z")).unwrap();
    assert_eq!(view.render_to_string(), "z");
}

// ============================================================================
// Cross-instance delegation
// ============================================================================

#[test]
fn child_instance_resolves_through_its_parent() {
    let mut view = ViewRuntime::new(
        template([]),
        Value::object([("shared", Value::from("from-parent"))]),
    )
    .unwrap();
    let child = view
        .attach_child(
            template([interp("shared")]),
            Value::object::<&str, _>([]),
            false,
        )
        .unwrap();
    // Initial sync ran parent → child.
    assert_eq!(view.render_to_string(), "from-parent");
    assert_eq!(view.get_in(child, "shared"), Value::from("from-parent"));

    // Parent writes propagate down.
    view.set("shared", Value::from("updated")).unwrap();
    assert_eq!(view.get_in(child, "shared"), Value::from("updated"));
    assert_eq!(view.render_to_string(), "updated");

    // Child writes propagate up.
    view.set_in(child, "shared", Value::from("from-child"))
        .unwrap();
    assert_eq!(view.get("shared"), Value::from("from-child"));
}

#[test]
fn isolated_child_never_reaches_the_parent() {
    let mut view = ViewRuntime::new(
        template([]),
        Value::object([("shared", Value::from("parent"))]),
    )
    .unwrap();
    let child = view
        .attach_child(
            template([interp("shared")]),
            Value::object::<&str, _>([]),
            true,
        )
        .unwrap();
    assert_eq!(view.render_to_string(), "");
    assert_eq!(view.get_in(child, "shared"), Value::Undefined);
}
