//! Attribute values
//!
//! Values are a closed enum. They are totally ordered and hashable so they
//! can serve as secondary index keys in derived caches.
//!
//! A missing attribute and an attribute holding [`Value::Null`] are
//! indistinguishable: stores never keep `Null` entries.

use crate::types::{ObjectId, RevisionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute value of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// No value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Reference to the current state of an object
    Ref(ObjectId),
    /// Reference stabilised at a fixed revision
    HistoricRef(ObjectId, RevisionNumber),
}

/// Shared `Null` for lookups of missing attributes.
pub static NULL: Value = Value::Null;

impl Value {
    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text payload, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Target of a current reference
    pub fn as_ref_id(&self) -> Option<&ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Target of either kind of reference
    pub fn referenced_id(&self) -> Option<&ObjectId> {
        match self {
            Value::Ref(id) | Value::HistoricRef(id, _) => Some(id),
            _ => None,
        }
    }

    /// Whether this is a current reference to `id`
    pub fn refers_to(&self, id: &ObjectId) -> bool {
        matches!(self, Value::Ref(target) if target == id)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Ref(id) => write!(f, "->{}", id),
            Value::HistoricRef(id, r) => write!(f, "->{}@r{}", id, r),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl From<&ObjectId> for Value {
    fn from(id: &ObjectId) -> Self {
        Value::Ref(id.clone())
    }
}

/// Attribute name to value map of one object state
pub type Attributes = BTreeMap<String, Value>;

/// Look up an attribute, treating a missing entry as `Null`
pub fn attribute<'a>(values: &'a Attributes, name: &str) -> &'a Value {
    values.get(name).unwrap_or(&NULL)
}

/// Remove `Null` entries so stored states have a canonical form
pub fn normalize(mut values: Attributes) -> Attributes {
    values.retain(|_, v| !v.is_null());
    values
}

/// Build an attribute map from name/value pairs
///
/// # Example
///
/// ```
/// use chronicle_core::{attrs, Value};
///
/// let values = attrs([("name", Value::from("alice")), ("age", Value::from(42i64))]);
/// assert_eq!(values.len(), 2);
/// ```
pub fn attrs<K, I>(pairs: I) -> Attributes
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjectName;

    #[test]
    fn test_missing_attribute_reads_as_null() {
        let values = attrs([("a", Value::Int(1))]);
        assert_eq!(attribute(&values, "a"), &Value::Int(1));
        assert!(attribute(&values, "b").is_null());
    }

    #[test]
    fn test_normalize_drops_nulls() {
        let values = attrs([("a", Value::Int(1)), ("b", Value::Null)]);
        let normalized = normalize(values);
        assert_eq!(normalized.len(), 1);
        assert!(!normalized.contains_key("b"));
    }

    #[test]
    fn test_values_are_totally_ordered() {
        let mut values = vec![
            Value::Text("b".into()),
            Value::Null,
            Value::Int(3),
            Value::Bool(true),
            Value::Int(-1),
        ];
        values.sort();
        assert_eq!(values[0], Value::Null);
        assert_eq!(values[2], Value::Int(-1));
        assert_eq!(values[4], Value::Text("b".into()));
    }

    #[test]
    fn test_reference_helpers() {
        let id = ObjectId::new("Person", ObjectName::new(1));
        let current = Value::Ref(id.clone());
        let historic = Value::HistoricRef(id.clone(), 4);

        assert!(current.refers_to(&id));
        assert!(!historic.refers_to(&id));
        assert_eq!(historic.referenced_id(), Some(&id));
        assert_eq!(current.as_ref_id(), Some(&id));
        assert_eq!(historic.as_ref_id(), None);
    }

    #[test]
    fn test_value_roundtrips_through_msgpack() {
        let value = Value::HistoricRef(ObjectId::new("Person", ObjectName::new(5)), 9);
        let bytes = rmp_serde::to_vec(&value).unwrap();
        let decoded: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
