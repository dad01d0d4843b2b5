//! Keypath type for addressing locations in a nested value tree.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// A dot-separated path addressing a location in a nested value tree.
///
/// The empty keypath addresses the tree root. Keypaths are cheap to clone
/// (interned as `Arc<str>`) and structurally comparable for prefix/ancestor
/// relationships.
///
/// Keypaths beginning with `${` are *special*: they address expression
/// computations, form a single opaque segment, and never walk upward past
/// the root.
///
/// # Example
///
/// ```
/// use view_flow::Keypath;
///
/// let kp = Keypath::from("items.2.name");
/// assert_eq!(kp.parent(), Some(Keypath::from("items.2")));
/// assert_eq!(kp.first_key(), "items");
/// assert_eq!(kp.last_key(), "name");
/// assert!(kp.starts_with(&Keypath::from("items")));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Keypath(Arc<str>);

impl Keypath {
    /// The root keypath (empty string).
    pub fn root() -> Self {
        Keypath(Arc::from(""))
    }

    /// Whether this is the root keypath.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this keypath addresses an expression computation.
    ///
    /// Special keypaths are single-segment and are never split on dots
    /// (the canonical expression string may itself contain keypaths).
    pub fn is_special(&self) -> bool {
        self.0.starts_with("${")
    }

    /// Whether this keypath contains a wildcard segment.
    pub fn is_pattern(&self) -> bool {
        !self.is_special() && self.keys().any(|k| k == "*")
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the segments of this keypath.
    ///
    /// The root keypath has zero segments; a special keypath has exactly one.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        let (special, raw) = (self.is_special(), &*self.0);
        let mut done = raw.is_empty();
        let mut rest = raw;
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            if special {
                done = true;
                return Some(rest);
            }
            match rest.find('.') {
                Some(idx) => {
                    let (head, tail) = rest.split_at(idx);
                    rest = &tail[1..];
                    Some(head)
                }
                None => {
                    done = true;
                    Some(rest)
                }
            }
        })
    }

    /// The first segment, or `""` for the root.
    pub fn first_key(&self) -> &str {
        self.keys().next().unwrap_or("")
    }

    /// The last segment, or `""` for the root.
    pub fn last_key(&self) -> &str {
        if self.is_special() {
            return &self.0;
        }
        match self.0.rfind('.') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The parent keypath, or `None` for the root.
    ///
    /// Special keypaths hang directly off the root.
    pub fn parent(&self) -> Option<Keypath> {
        if self.is_root() {
            return None;
        }
        if self.is_special() {
            return Some(Keypath::root());
        }
        Some(match self.0.rfind('.') {
            Some(idx) => Keypath(Arc::from(&self.0[..idx])),
            None => Keypath::root(),
        })
    }

    /// Append a child segment.
    pub fn join(&self, key: &str) -> Keypath {
        if self.is_root() {
            Keypath(Arc::from(key))
        } else {
            Keypath(Arc::from(format!("{}.{}", self.0, key)))
        }
    }

    /// Append a list index segment.
    pub fn join_index(&self, index: usize) -> Keypath {
        self.join(&index.to_string())
    }

    /// Whether `ancestor` is this keypath or one of its ancestors.
    pub fn starts_with(&self, ancestor: &Keypath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        if self.0.len() == ancestor.0.len() {
            return self.0 == ancestor.0;
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&*ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'.'
    }

    /// Rewrite an `old` prefix to `new`, for list-section reindexing.
    ///
    /// Returns `None` when this keypath is not at or under `old`.
    pub fn replace_prefix(&self, old: &Keypath, new: &Keypath) -> Option<Keypath> {
        if !self.starts_with(old) {
            return None;
        }
        if self.0.len() == old.0.len() {
            return Some(new.clone());
        }
        let suffix = &self.0[old.0.len() + 1..];
        Some(new.join(suffix))
    }

    /// Strict ancestors of this keypath, nearest first, ending at the root.
    ///
    /// The root itself has no ancestors.
    pub fn ancestors(&self) -> Vec<Keypath> {
        let mut out = Vec::new();
        let mut cur = self.parent();
        while let Some(kp) = cur {
            cur = kp.parent();
            out.push(kp);
        }
        out
    }

    /// Whether this concrete keypath matches a wildcard `pattern`.
    ///
    /// A `*` segment in the pattern matches exactly one segment here;
    /// segment counts must agree.
    pub fn matches_pattern(&self, pattern: &Keypath) -> bool {
        let mut mine = self.keys();
        let mut theirs = pattern.keys();
        loop {
            match (mine.next(), theirs.next()) {
                (None, None) => return true,
                (Some(m), Some(p)) => {
                    if p != "*" && p != m {
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    /// Every wildcard pattern this concrete keypath could match.
    ///
    /// For `a.b` that is `a.*`, `*.b` and `*.*`. Used to look up pattern
    /// observer registrations for a concrete change.
    pub fn matching_patterns(&self) -> Vec<Keypath> {
        if self.is_root() || self.is_special() {
            return Vec::new();
        }
        let segments: Vec<&str> = self.keys().collect();
        let n = segments.len();
        let mut out = Vec::with_capacity((1usize << n) - 1);
        // Each bit selects whether that segment is replaced by `*`.
        for mask in 1u32..(1u32 << n) {
            let pattern: Vec<&str> = segments
                .iter()
                .enumerate()
                .map(|(i, seg)| if mask & (1 << i) != 0 { "*" } else { *seg })
                .collect();
            out.push(Keypath::from(pattern.join(".")));
        }
        out
    }
}

impl Default for Keypath {
    fn default() -> Self {
        Keypath::root()
    }
}

impl From<&str> for Keypath {
    fn from(s: &str) -> Self {
        Keypath(Arc::from(s))
    }
}

impl From<String> for Keypath {
    fn from(s: String) -> Self {
        Keypath(Arc::from(s))
    }
}

impl AsRef<str> for Keypath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Keypath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypath({:?})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_segments() {
        let root = Keypath::root();
        assert!(root.is_root());
        assert_eq!(root.keys().count(), 0);
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn join_and_parent_roundtrip() {
        let kp = Keypath::root().join("items").join_index(2).join("name");
        assert_eq!(kp.as_str(), "items.2.name");
        assert_eq!(kp.parent().unwrap().as_str(), "items.2");
        assert_eq!(kp.last_key(), "name");
        assert_eq!(kp.first_key(), "items");
    }

    #[test]
    fn starts_with_requires_segment_boundary() {
        let kp = Keypath::from("items2.name");
        assert!(!kp.starts_with(&Keypath::from("items")));
        assert!(Keypath::from("items.name").starts_with(&Keypath::from("items")));
        assert!(kp.starts_with(&Keypath::root()));
        assert!(kp.starts_with(&kp));
    }

    #[test]
    fn replace_prefix_rewrites_suffix() {
        let kp = Keypath::from("items.2.name");
        let moved = kp
            .replace_prefix(&Keypath::from("items.2"), &Keypath::from("items.1"))
            .unwrap();
        assert_eq!(moved.as_str(), "items.1.name");
        assert!(kp
            .replace_prefix(&Keypath::from("other"), &Keypath::from("x"))
            .is_none());
    }

    #[test]
    fn ancestors_nearest_first() {
        let kp = Keypath::from("a.b.c");
        let up: Vec<String> = kp.ancestors().iter().map(|k| k.to_string()).collect();
        assert_eq!(up, vec!["a.b".to_string(), "a".to_string(), "".to_string()]);
    }

    #[test]
    fn pattern_matching() {
        let kp = Keypath::from("items.3.done");
        assert!(kp.matches_pattern(&Keypath::from("items.*.done")));
        assert!(!kp.matches_pattern(&Keypath::from("items.*.label")));
        assert!(!kp.matches_pattern(&Keypath::from("items.*")));
    }

    #[test]
    fn matching_patterns_enumerates_all_combinations() {
        let kp = Keypath::from("a.b");
        let mut patterns: Vec<String> =
            kp.matching_patterns().iter().map(|p| p.to_string()).collect();
        patterns.sort();
        assert_eq!(patterns, vec!["*.*", "*.b", "a.*"]);
    }

    #[test]
    fn special_keypaths_are_single_segment() {
        let kp = Keypath::from("${a.b+c.d}");
        assert!(kp.is_special());
        assert_eq!(kp.keys().count(), 1);
        assert_eq!(kp.parent(), Some(Keypath::root()));
        assert!(!kp.is_pattern());
    }
}
