//! Scheduler behavior: nested batches, flush convergence, observers and
//! the transition-completion tracker.

use std::cell::Cell;
use std::rc::Rc;

use view_flow::tracer::{FlushId, Tracer};
use view_flow::{
    template, Computed, Mustache, ObserveOptions, SectionKind, TemplateItem, TransitionSpec,
    Value, ViewRuntime,
};

struct FlushCounter(Rc<Cell<usize>>);

impl Tracer for FlushCounter {
    fn on_flush_end(&self, _flush: FlushId, _rounds: usize) {
        self.0.set(self.0.get() + 1);
    }
}

// ============================================================================
// Nested batches
// ============================================================================

#[test]
fn nested_batches_flush_once_at_the_outermost_end() {
    let flushes = Rc::new(Cell::new(0));
    let mut view = ViewRuntime::builder()
        .tracer(FlushCounter(Rc::clone(&flushes)))
        .template(template([TemplateItem::Interpolator(Mustache::Reference(
            "x".to_string(),
        ))]))
        .data(Value::object([("x", Value::from(0))]))
        .build()
        .unwrap();
    let after_build = flushes.get();

    view.start();
    view.start();
    view.set("x", Value::from(1)).unwrap();
    view.set("y", Value::from(2)).unwrap();
    view.end();
    // Still inside the outer batch: no flush yet.
    assert_eq!(flushes.get(), after_build);
    view.end();
    assert_eq!(flushes.get(), after_build + 1);
    assert_eq!(view.render_to_string(), "1");
}

#[test]
fn changes_within_one_batch_coalesce() {
    let calls = Rc::new(Cell::new(0));
    let seen = Rc::new(Cell::new(0.0));
    let mut view = ViewRuntime::new(template([]), Value::object([("x", Value::from(0))])).unwrap();
    let calls_in = Rc::clone(&calls);
    let seen_in = Rc::clone(&seen);
    view.observe(
        "x",
        move |_rt, _kp, value| {
            calls_in.set(calls_in.get() + 1);
            if let Value::Number(n) = value {
                seen_in.set(*n);
            }
        },
        ObserveOptions {
            init: false,
            ..Default::default()
        },
    );

    view.start();
    view.set("x", Value::from(1)).unwrap();
    view.set("x", Value::from(2)).unwrap();
    view.set("x", Value::from(3)).unwrap();
    view.end();

    assert_eq!(calls.get(), 1);
    assert_eq!(seen.get(), 3.0);
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn observer_feedback_converges() {
    let mut view =
        ViewRuntime::new(template([]), Value::object([("a", Value::from(0))])).unwrap();
    view.observe(
        "a",
        |rt, _kp, value| {
            if let Value::Number(n) = value {
                let _ = rt.set("b", Value::Number(n * 10.0));
            }
        },
        ObserveOptions {
            init: false,
            ..Default::default()
        },
    );
    view.observe(
        "b",
        |rt, _kp, value| {
            if let Value::Number(n) = value {
                let _ = rt.set("c", Value::Number(n + 1.0));
            }
        },
        ObserveOptions {
            init: false,
            ..Default::default()
        },
    );

    view.set("a", Value::from(2)).unwrap();
    // Both downstream writes landed before `set` returned.
    assert_eq!(view.get("b"), Value::from(20));
    assert_eq!(view.get("c"), Value::from(21));
}

#[test]
fn computed_chains_settle_in_one_batch() {
    let mut view =
        ViewRuntime::new(template([]), Value::object([("n", Value::from(1))])).unwrap();
    view.compute(
        "double",
        Computed::new(|store| {
            let n = store.get(&"n".into());
            match n {
                Value::Number(n) => Ok(Value::Number(n * 2.0)),
                _ => Ok(Value::Undefined),
            }
        }),
    );
    view.compute(
        "quadruple",
        Computed::new(|store| {
            let d = store.get(&"double".into());
            match d {
                Value::Number(d) => Ok(Value::Number(d * 2.0)),
                _ => Ok(Value::Undefined),
            }
        }),
    );
    assert_eq!(view.get("quadruple"), Value::from(4));

    view.set("n", Value::from(3)).unwrap();
    assert_eq!(view.get("double"), Value::from(6));
    assert_eq!(view.get("quadruple"), Value::from(12));
}

#[test]
fn once_observers_fire_a_single_time() {
    let calls = Rc::new(Cell::new(0));
    let mut view = ViewRuntime::new(template([]), Value::object([("x", Value::from(0))])).unwrap();
    let calls_in = Rc::clone(&calls);
    view.observe(
        "x",
        move |_rt, _kp, _value| {
            calls_in.set(calls_in.get() + 1);
        },
        ObserveOptions {
            init: false,
            once: true,
            ..Default::default()
        },
    );
    view.set("x", Value::from(1)).unwrap();
    view.set("x", Value::from(2)).unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn unobserve_stops_notifications() {
    let calls = Rc::new(Cell::new(0));
    let mut view = ViewRuntime::new(template([]), Value::object([("x", Value::from(0))])).unwrap();
    let calls_in = Rc::clone(&calls);
    let handle = view.observe(
        "x",
        move |_rt, _kp, _value| {
            calls_in.set(calls_in.get() + 1);
        },
        ObserveOptions {
            init: false,
            ..Default::default()
        },
    );
    view.set("x", Value::from(1)).unwrap();
    view.unobserve(&handle);
    view.set("x", Value::from(2)).unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn init_observer_sees_the_current_value() {
    let seen = Rc::new(Cell::new(false));
    let mut view =
        ViewRuntime::new(template([]), Value::object([("x", Value::from(7))])).unwrap();
    let seen_in = Rc::clone(&seen);
    view.observe(
        "x",
        move |_rt, _kp, value| {
            assert_eq!(*value, Value::from(7));
            seen_in.set(true);
        },
        ObserveOptions {
            init: true,
            once: true,
            ..Default::default()
        },
    );
    assert!(seen.get());
}

// ============================================================================
// Transitions and deferred detachment
// ============================================================================

fn toggled_div() -> view_flow::Template {
    template([TemplateItem::Section {
        kind: SectionKind::If,
        binding: Mustache::Reference("show".to_string()),
        template: template([TemplateItem::Element {
            name: "div".to_string(),
            attributes: vec![],
            twoway: false,
            intro: None,
            outro: Some("fade".to_string()),
            children: template([TemplateItem::Text("hi".to_string())]),
        }]),
    }])
}

#[test]
fn outgoing_transition_defers_detachment() {
    let mut view = ViewRuntime::builder()
        .transition("fade", TransitionSpec { duration: 2.0 })
        .template(toggled_div())
        .data(Value::object([("show", Value::from(true))]))
        .build()
        .unwrap();
    assert_eq!(view.render_to_string(), "<div>hi</div>");

    view.set("show", Value::from(false)).unwrap();
    // The node is unbound but stays attached while its outro runs.
    assert_eq!(view.render_to_string(), "<div>hi</div>");

    view.advance_transitions(1.0);
    assert_eq!(view.render_to_string(), "<div>hi</div>");
    view.advance_transitions(1.5);
    assert_eq!(view.render_to_string(), "");
}

#[test]
fn unrender_without_transition_detaches_at_flush_end() {
    let mut view = ViewRuntime::new(
        toggled_div(),
        Value::object([("show", Value::from(true))]),
    )
    .unwrap();
    // No `fade` registration anywhere: detachment happens synchronously.
    view.set("show", Value::from(false)).unwrap();
    assert_eq!(view.render_to_string(), "");
}
