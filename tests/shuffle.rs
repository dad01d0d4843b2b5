//! List-section reconciliation: the shuffle algorithm, keyed lists and
//! fragment identity preservation.

use view_flow::{
    template, Mustache, SectionKind, TemplateItem, Value, ViewRuntime,
};

fn each_template(index_ref: Option<&str>) -> view_flow::Template {
    template([TemplateItem::Section {
        kind: SectionKind::Each {
            index_ref: index_ref.map(str::to_string),
        },
        binding: Mustache::Reference("items".to_string()),
        template: template([TemplateItem::Interpolator(Mustache::Reference(".".to_string()))]),
    }])
}

fn list_view(items: &[&str]) -> ViewRuntime {
    ViewRuntime::new(
        each_template(None),
        Value::object([(
            "items",
            Value::list(items.iter().map(|s| Value::from(*s)).collect::<Vec<_>>()),
        )]),
    )
    .unwrap()
}

// ============================================================================
// Shuffle preservation
// ============================================================================

#[test]
fn removing_a_middle_element_preserves_the_others() {
    let mut view = list_view(&["a", "b", "c"]);
    assert_eq!(view.render_to_string(), "abc");
    let section = view.sections()[0];
    let before = view.section_fragments(section);
    assert_eq!(before.len(), 3);

    view.splice("items", 1, 1, vec![]).unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 2);
    // Fragment previously at index 0 is untouched; the fragment previously
    // at index 2 was rebound to index 1 with the same identity.
    assert_eq!(after[0], before[0]);
    assert_eq!(after[1], before[2]);
    assert_eq!(view.render_to_string(), "ac");
    assert_eq!(view.get("items.1"), Value::from("c"));
}

#[test]
fn push_appends_one_fragment() {
    let mut view = list_view(&["a", "b"]);
    let section = view.sections()[0];
    let before = view.section_fragments(section);

    view.push("items", Value::from("c")).unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 3);
    assert_eq!(&after[..2], &before[..]);
    assert_eq!(view.render_to_string(), "abc");
}

#[test]
fn unshift_rebinds_existing_fragments() {
    let mut view = list_view(&["a", "b"]);
    let section = view.sections()[0];
    let before = view.section_fragments(section);

    view.unshift("items", Value::from("x")).unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 3);
    assert_eq!(after[1], before[0]);
    assert_eq!(after[2], before[1]);
    assert_eq!(view.render_to_string(), "xab");
    assert_eq!(view.get("items.0"), Value::from("x"));
}

#[test]
fn pop_and_shift_trim_from_either_end() {
    let mut view = list_view(&["a", "b", "c"]);
    assert_eq!(view.pop("items").unwrap(), Some(Value::from("c")));
    assert_eq!(view.render_to_string(), "ab");
    assert_eq!(view.shift("items").unwrap(), Some(Value::from("a")));
    assert_eq!(view.render_to_string(), "b");
    assert_eq!(view.get("items.length"), Value::from(1));
}

#[test]
fn reordering_moves_fragments_without_recreating_them() {
    let mut view = list_view(&["a", "b"]);
    let section = view.sections()[0];
    let before = view.section_fragments(section);

    // A wrapped set with the same elements in a new order becomes a merge.
    view.set(
        "items",
        Value::list([Value::from("b"), Value::from("a")]),
    )
    .unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 2);
    assert_eq!(after[0], before[1]);
    assert_eq!(after[1], before[0]);
    assert_eq!(view.render_to_string(), "ba");
}

#[test]
fn merge_with_comparator_matches_by_identity_key() {
    let row = |id: i64, label: &str| {
        Value::object([("id", Value::from(id)), ("label", Value::from(label))])
    };
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::Each { index_ref: None },
            binding: Mustache::Reference("items".to_string()),
            template: template([TemplateItem::Interpolator(Mustache::Reference(
                "label".to_string(),
            ))]),
        }]),
        Value::object([("items", Value::list([row(1, "one"), row(2, "two")]))]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "onetwo");
    let section = view.sections()[0];
    let before = view.section_fragments(section);

    let by_id: &dyn Fn(&Value) -> Value = &|v| v.child("id").unwrap_or(Value::Undefined);
    view.merge("items", vec![row(2, "two"), row(3, "three")], Some(by_id))
        .unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 2);
    // Row 2 survived with its identity, moved from index 1 to 0.
    assert_eq!(after[0], before[1]);
    assert_eq!(view.render_to_string(), "twothree");
}

// ============================================================================
// Index references
// ============================================================================

#[test]
fn index_references_update_after_a_shuffle() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::Each {
                index_ref: Some("i".to_string()),
            },
            binding: Mustache::Reference("items".to_string()),
            template: template([
                TemplateItem::Interpolator(Mustache::Reference("i".to_string())),
                TemplateItem::Interpolator(Mustache::Reference(".".to_string())),
            ]),
        }]),
        Value::object([("items", Value::list([Value::from("a"), Value::from("b")]))]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "0a1b");

    view.shift("items").unwrap();
    assert_eq!(view.render_to_string(), "0b");
}

// ============================================================================
// Keyed lists and shape changes
// ============================================================================

#[test]
fn keyed_section_adds_and_removes_by_key() {
    let mut view = ViewRuntime::new(
        template([TemplateItem::Section {
            kind: SectionKind::Each { index_ref: None },
            binding: Mustache::Reference("scores".to_string()),
            template: template([TemplateItem::Interpolator(Mustache::Reference(
                ".".to_string(),
            ))]),
        }]),
        Value::object([(
            "scores",
            Value::object([("a", Value::from(1)), ("b", Value::from(2))]),
        )]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "12");
    let section = view.sections()[0];
    let before = view.section_fragments(section);

    view.set(
        "scores",
        Value::object([("b", Value::from(2)), ("c", Value::from(3))]),
    )
    .unwrap();

    let after = view.section_fragments(section);
    assert_eq!(after.len(), 2);
    // The `b` fragment survived the reconciliation.
    assert!(after.contains(&before[1]));
    assert!(!after.contains(&before[0]));
    assert_eq!(view.render_to_string(), "23");
}

#[test]
fn shape_flip_rebuilds_the_section() {
    let mut view = ViewRuntime::builder()
        .adapt_arrays(false)
        .template(each_template(None))
        .data(Value::object([(
            "items",
            Value::list([Value::from("a"), Value::from("b")]),
        )]))
        .build()
        .unwrap();
    assert_eq!(view.render_to_string(), "ab");

    view.set("items", Value::object([("k", Value::from("v"))]))
        .unwrap();
    assert_eq!(view.render_to_string(), "v");
}

#[test]
fn plain_set_tracks_length_without_adaptor() {
    let mut view = ViewRuntime::builder()
        .adapt_arrays(false)
        .template(each_template(None))
        .data(Value::object([("items", Value::list([Value::from("a")]))]))
        .build()
        .unwrap();
    assert_eq!(view.render_to_string(), "a");

    view.set(
        "items",
        Value::list([Value::from("a"), Value::from("b"), Value::from("c")]),
    )
    .unwrap();
    assert_eq!(view.render_to_string(), "abc");

    view.set("items", Value::list([Value::from("z")])).unwrap();
    assert_eq!(view.render_to_string(), "z");
}
