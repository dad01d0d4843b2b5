//! Section reconciliation planning.
//!
//! The planning here is pure: given a section's current shape and its new
//! bound value, decide which fragments to create, remove or remap. The
//! runtime executes the plan against the tree, the store and the render
//! target.

use crate::template::SectionKind;
use crate::value::{Shape, Value};

/// Inferred section behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionMode {
    /// Zero or one child fragment, no context pushed.
    Conditional,
    /// Zero or one child fragment with the section keypath as context.
    Context,
    /// One child fragment per list element.
    List,
    /// One child fragment per object entry, keyed by entry name.
    KeyedList,
}

/// Infer the mode for a section subtype and bound value shape.
pub fn infer_mode(kind: &SectionKind, value: &Value) -> SectionMode {
    match kind {
        SectionKind::If | SectionKind::Unless => SectionMode::Conditional,
        SectionKind::With => SectionMode::Context,
        SectionKind::Each { .. } => match value.shape() {
            Shape::Object => SectionMode::KeyedList,
            _ => SectionMode::List,
        },
        SectionKind::IfWith => match value.shape() {
            Shape::List => SectionMode::List,
            Shape::Object => SectionMode::Context,
            Shape::Scalar => SectionMode::Conditional,
        },
    }
}

/// What a `set_value` reevaluation must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reeval {
    /// Nothing changes (notably: a list whose length is unchanged).
    None,
    /// Ensure exactly one child fragment exists; `push_context` pushes the
    /// section keypath as a new context base.
    EnsureSingle {
        /// Whether the fragment gets the section keypath as context.
        push_context: bool,
    },
    /// Ensure zero child fragments.
    Clear,
    /// Append fragments for trailing indices `from..to`.
    ListGrow {
        /// Current fragment count.
        from: usize,
        /// New list length.
        to: usize,
    },
    /// Remove trailing fragments down to `to`.
    ListShrink {
        /// Current fragment count.
        from: usize,
        /// New list length.
        to: usize,
    },
    /// Keyed reconciliation: drop fragments for `removed` keys, append
    /// fragments for `added` keys in enumeration order.
    Keyed {
        /// Keys no longer present.
        removed: Vec<String>,
        /// New keys, in the value's enumeration order.
        added: Vec<String>,
    },
    /// The shape class changed: tear everything down, then reevaluate in
    /// the new mode.
    Rebuild,
}

/// Plan a reevaluation.
///
/// `mode` is the pinned mode from the previous evaluation (if any);
/// `fragment_count` the live fragment count; `existing_keys` the keyed-list
/// keys currently mounted (in fragment order).
pub fn plan_reevaluate(
    kind: &SectionKind,
    mode: Option<SectionMode>,
    fragment_count: usize,
    existing_keys: &[String],
    value: &Value,
) -> (SectionMode, Reeval) {
    let inferred = infer_mode(kind, value);
    if let Some(previous) = mode {
        if previous != inferred && fragment_count > 0 {
            return (inferred, Reeval::Rebuild);
        }
    }
    let plan = match inferred {
        SectionMode::Conditional | SectionMode::Context => {
            let truthy = value.is_truthy() && !value.is_empty_container();
            let want = match kind {
                SectionKind::Unless => !truthy,
                _ => truthy,
            };
            if want && fragment_count == 0 {
                Reeval::EnsureSingle {
                    push_context: inferred == SectionMode::Context,
                }
            } else if !want && fragment_count > 0 {
                Reeval::Clear
            } else {
                Reeval::None
            }
        }
        SectionMode::List => {
            let len = value.len().unwrap_or(0);
            match len.cmp(&fragment_count) {
                std::cmp::Ordering::Equal => Reeval::None,
                std::cmp::Ordering::Greater => Reeval::ListGrow {
                    from: fragment_count,
                    to: len,
                },
                std::cmp::Ordering::Less => Reeval::ListShrink {
                    from: fragment_count,
                    to: len,
                },
            }
        }
        SectionMode::KeyedList => {
            let new_keys = value.child_keys();
            let removed: Vec<String> = existing_keys
                .iter()
                .filter(|k| !new_keys.contains(k))
                .cloned()
                .collect();
            let added: Vec<String> = new_keys
                .iter()
                .filter(|k| !existing_keys.contains(k))
                .cloned()
                .collect();
            if removed.is_empty() && added.is_empty() {
                Reeval::None
            } else {
                Reeval::Keyed { removed, added }
            }
        }
    };
    (inferred, plan)
}

/// Decomposition of a shuffle's index map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShufflePlan {
    /// Old indices kept in place.
    pub kept: Vec<usize>,
    /// `(old, new)` pairs for fragments that move.
    pub moved: Vec<(usize, usize)>,
    /// Old indices whose fragments are unbound and queued for unrender.
    pub removed: Vec<usize>,
    /// Net-new indices needing fresh fragments.
    pub added: Vec<usize>,
}

/// Decompose `new_indices` (one entry per old index: the new index or `-1`)
/// against the new list length.
pub fn shuffle_plan(new_indices: &[isize], new_len: usize) -> ShufflePlan {
    let mut plan = ShufflePlan::default();
    let mut claimed = vec![false; new_len];
    for (old, &target) in new_indices.iter().enumerate() {
        if target < 0 {
            plan.removed.push(old);
        } else {
            let target = target as usize;
            if target < new_len {
                claimed[target] = true;
            }
            if target == old {
                plan.kept.push(old);
            } else {
                plan.moved.push((old, target));
            }
        }
    }
    for (index, taken) in claimed.into_iter().enumerate() {
        if !taken {
            plan.added.push(index);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_inference() {
        assert_eq!(
            infer_mode(&SectionKind::If, &Value::from(true)),
            SectionMode::Conditional
        );
        assert_eq!(
            infer_mode(&SectionKind::Each { index_ref: None }, &Value::list([])),
            SectionMode::List
        );
        assert_eq!(
            infer_mode(
                &SectionKind::Each { index_ref: None },
                &Value::object([("a", Value::from(1))])
            ),
            SectionMode::KeyedList
        );
        assert_eq!(
            infer_mode(&SectionKind::IfWith, &Value::object([("a", Value::from(1))])),
            SectionMode::Context
        );
        assert_eq!(
            infer_mode(&SectionKind::IfWith, &Value::from(1)),
            SectionMode::Conditional
        );
    }

    #[test]
    fn conditional_planning() {
        let (_, plan) = plan_reevaluate(&SectionKind::If, None, 0, &[], &Value::from(true));
        assert_eq!(
            plan,
            Reeval::EnsureSingle {
                push_context: false
            }
        );
        let (_, plan) = plan_reevaluate(
            &SectionKind::If,
            Some(SectionMode::Conditional),
            1,
            &[],
            &Value::from(false),
        );
        assert_eq!(plan, Reeval::Clear);
        // Empty containers are treated as falsy by conditionals.
        let (_, plan) = plan_reevaluate(&SectionKind::If, None, 0, &[], &Value::list([]));
        assert_eq!(plan, Reeval::None);
    }

    #[test]
    fn unless_inverts() {
        let (_, plan) = plan_reevaluate(&SectionKind::Unless, None, 0, &[], &Value::from(false));
        assert_eq!(
            plan,
            Reeval::EnsureSingle {
                push_context: false
            }
        );
    }

    #[test]
    fn list_length_tracking() {
        let each = SectionKind::Each { index_ref: None };
        let three = Value::list([Value::from(1), Value::from(2), Value::from(3)]);
        let (_, plan) = plan_reevaluate(&each, Some(SectionMode::List), 1, &[], &three);
        assert_eq!(plan, Reeval::ListGrow { from: 1, to: 3 });
        let (_, plan) = plan_reevaluate(&each, Some(SectionMode::List), 3, &[], &three);
        assert_eq!(plan, Reeval::None);
        let (_, plan) = plan_reevaluate(&each, Some(SectionMode::List), 5, &[], &three);
        assert_eq!(plan, Reeval::ListShrink { from: 5, to: 3 });
    }

    #[test]
    fn keyed_diffing_follows_enumeration_order() {
        let each = SectionKind::Each { index_ref: None };
        let value = Value::object([("b", Value::from(2)), ("c", Value::from(3))]);
        let existing = vec!["a".to_string(), "b".to_string()];
        let (_, plan) = plan_reevaluate(&each, Some(SectionMode::KeyedList), 2, &existing, &value);
        assert_eq!(
            plan,
            Reeval::Keyed {
                removed: vec!["a".to_string()],
                added: vec!["c".to_string()],
            }
        );
    }

    #[test]
    fn shape_flip_rebuilds() {
        let (_, plan) = plan_reevaluate(
            &SectionKind::Each { index_ref: None },
            Some(SectionMode::List),
            2,
            &[],
            &Value::object([("k", Value::from(1))]),
        );
        assert_eq!(plan, Reeval::Rebuild);
    }

    #[test]
    fn shuffle_plan_decomposition() {
        // [a, b, c] -> [a, c]: 0 kept, 1 removed, 2 -> 1.
        let plan = shuffle_plan(&[0, -1, 1], 2);
        assert_eq!(plan.kept, vec![0]);
        assert_eq!(plan.removed, vec![1]);
        assert_eq!(plan.moved, vec![(2, 1)]);
        assert!(plan.added.is_empty());
    }

    #[test]
    fn shuffle_plan_detects_additions() {
        // push: [a, b] -> [a, b, c]
        let plan = shuffle_plan(&[0, 1], 3);
        assert_eq!(plan.kept, vec![0, 1]);
        assert_eq!(plan.added, vec![2]);
        // unshift: [a] -> [new, a]
        let plan = shuffle_plan(&[1], 2);
        assert_eq!(plan.moved, vec![(0, 1)]);
        assert_eq!(plan.added, vec![0]);
    }
}
