//! Dynamic value tree held by the store.

use indexmap::IndexMap;

/// A dynamic value in the store's nested tree.
///
/// `Undefined` is the absent value: it is what a failed lookup returns, and
/// it is distinct from an explicit `Null`. `Object` preserves insertion
/// order, which keyed-list sections rely on when adding fragments for new
/// keys.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// The absent value.
    #[default]
    Undefined,
    /// An explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double-precision number.
    Number(f64),
    /// A string.
    String(String),
    /// An ordered list.
    List(Vec<Value>),
    /// An insertion-ordered map.
    Object(IndexMap<String, Value>),
}

/// Shape classification used by sections to pick their mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Array-like: repeated list section.
    List,
    /// Plain object: context or keyed-list section.
    Object,
    /// Anything else.
    Scalar,
}

impl Value {
    /// Build a list value.
    pub fn list<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::List(items.into_iter().collect())
    }

    /// Build an object value, preserving the given entry order.
    pub fn object<K: Into<String>, I: IntoIterator<Item = (K, Value)>>(entries: I) -> Value {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Whether this value is absent.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether this value is `Undefined` or `Null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// Host-convention truthiness: `Undefined`, `Null`, `false`, `0`, `NaN`
    /// and `""` are falsy; containers are truthy even when empty.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::List(_) | Value::Object(_) => true,
        }
    }

    /// Whether this value is an empty list or empty object.
    pub fn is_empty_container(&self) -> bool {
        match self {
            Value::List(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Shape classification for section-mode inference.
    pub fn shape(&self) -> Shape {
        match self {
            Value::List(_) => Shape::List,
            Value::Object(_) => Shape::Object,
            _ => Shape::Scalar,
        }
    }

    /// Read a child by key.
    ///
    /// Lists are indexed by decimal keys and answer the synthetic `length`
    /// key; objects are indexed by entry name. Returns `None` when the key
    /// is absent or this value cannot contain children.
    pub fn child(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.get(key).cloned(),
            Value::List(items) => {
                if key == "length" {
                    return Some(Value::Number(items.len() as f64));
                }
                key.parse::<usize>().ok().and_then(|i| items.get(i).cloned())
            }
            _ => None,
        }
    }

    /// Whether this value has an own property named `key`.
    ///
    /// Used by the resolver's scope-chain walk.
    pub fn has_child(&self, key: &str) -> bool {
        match self {
            Value::Object(map) => map.contains_key(key),
            Value::List(items) => {
                key == "length"
                    || key
                        .parse::<usize>()
                        .map(|i| i < items.len())
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Write a child by key, growing lists as needed.
    ///
    /// Returns `false` when this value cannot contain children.
    pub fn set_child(&mut self, key: &str, value: Value) -> bool {
        match self {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
                true
            }
            Value::List(items) => {
                let Ok(index) = key.parse::<usize>() else {
                    return false;
                };
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
                true
            }
            _ => false,
        }
    }

    /// Choose the container shape for a branch being created under a key:
    /// a decimal key means the branch is a list.
    pub fn branch_for_key(key: &str) -> Value {
        if key.parse::<usize>().is_ok() {
            Value::List(Vec::new())
        } else {
            Value::Object(IndexMap::new())
        }
    }

    /// Child keys of this value: entry names for objects, decimal indices
    /// for lists, empty otherwise. Used for wildcard pattern expansion and
    /// keyed-list reconciliation.
    pub fn child_keys(&self) -> Vec<String> {
        match self {
            Value::Object(map) => map.keys().cloned().collect(),
            Value::List(items) => (0..items.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of list elements, or `None` for non-lists.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Render this value the way an interpolator does.
    ///
    /// `Undefined` and `Null` render as the empty string.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::List(_) | Value::Object(_) => format!("{:?}", self),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::list([]).is_truthy());
        assert!(Value::list([]).is_empty_container());
    }

    #[test]
    fn child_access_on_lists_and_objects() {
        let v = Value::object([("items", Value::list([Value::from("a"), Value::from("b")]))]);
        let items = v.child("items").unwrap();
        assert_eq!(items.child("0"), Some(Value::from("a")));
        assert_eq!(items.child("length"), Some(Value::from(2)));
        assert_eq!(items.child("7"), None);
        assert_eq!(v.child("missing"), None);
        assert!(!Value::from(1).has_child("x"));
    }

    #[test]
    fn set_child_grows_lists() {
        let mut v = Value::List(Vec::new());
        assert!(v.set_child("2", Value::from("c")));
        assert_eq!(v.len(), Some(3));
        assert_eq!(v.child("0"), Some(Value::Undefined));
        assert!(!v.set_child("name", Value::from("x")));
    }

    #[test]
    fn branch_shape_follows_key_syntax() {
        assert_eq!(Value::branch_for_key("0").shape(), Shape::List);
        assert_eq!(Value::branch_for_key("name").shape(), Shape::Object);
    }

    #[test]
    fn display_string() {
        assert_eq!(Value::Undefined.to_display_string(), "");
        assert_eq!(Value::from(42).to_display_string(), "42");
        assert_eq!(Value::from(1.5).to_display_string(), "1.5");
        assert_eq!(Value::from("hi").to_display_string(), "hi");
    }
}
