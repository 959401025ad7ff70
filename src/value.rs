//! Dynamic value tree used for everything that crosses the host/remote
//! boundary: inventory snapshots, host descriptors, call parameters and
//! result envelopes.
//!
//! A [`Value`] is wire-safe when every leaf is a primitive and every branch
//! is a sequence, set or string-keyed map. Late-binding [`Tag`]s may live in
//! a tree loaded from inventory files but must be resolved before the tree
//! is allowed on the wire; [`Value::to_wire`] walks the tree depth-first and
//! reports the dotted path of the first offending leaf.

use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::tags::Tag;

/// String-keyed, insertion-ordered mapping of values.
pub type ValueMap = IndexMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    /// Serialized as a sequence; element uniqueness is restored after
    /// deserialization and equality ignores ordering.
    Set(Vec<Value>),
    Map(ValueMap),
    /// An unresolved late-binding placeholder. Not wire-safe.
    Tagged(Tag),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("missing key `{0}`")]
    Missing(String),

    #[error("key `{key}` is not a {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("unsupported yaml node: {0}")]
    UnsupportedYaml(String),
}

/// A value that cannot travel: names the dotted path (`a.b.3.key`) of the
/// offending leaf.
#[derive(Debug, thiserror::Error)]
#[error("value at `{path}` is not serializable: {reason}")]
pub struct SerializeError {
    pub path: String,
    pub reason: String,
}

impl Value {
    pub fn map() -> ValueMap {
        ValueMap::new()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Accessor used by deserializers: a missing key or `null` is
    /// `Ok(None)`, a present key is converted with `convert` or reported as
    /// a type error.
    pub fn get_opt<T>(
        &self,
        key: &str,
        expected: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<Option<T>, ValueError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => convert(value)
                .map(Some)
                .ok_or(ValueError::WrongType { key: key.to_owned(), expected }),
        }
    }

    pub fn get_req<T>(
        &self,
        key: &str,
        expected: &'static str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<T, ValueError> {
        self.get_opt(key, expected, convert)?
            .ok_or(ValueError::Missing(key.to_owned()))
    }

    /// Rebuild the tree as a guaranteed wire-safe copy. Pure: the input is
    /// not mutated. Fails on unresolved tags and non-finite floats, naming
    /// the dotted path to the leaf.
    pub fn to_wire(&self) -> Result<Value, SerializeError> {
        let mut path = Vec::new();
        self.to_wire_at(&mut path)
    }

    fn to_wire_at(&self, path: &mut Vec<String>) -> Result<Value, SerializeError> {
        match self {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if f.is_finite() => Ok(Value::Float(*f)),
            Value::Float(_) => Err(SerializeError {
                path: path.join("."),
                reason: "non-finite float".into(),
            }),
            Value::Str(s) => Ok(Value::Str(s.clone())),
            Value::List(items) => Ok(Value::List(Self::seq_to_wire(items, path)?)),
            Value::Set(items) => Ok(Value::Set(Self::seq_to_wire(items, path)?)),
            Value::Map(map) => {
                let mut out = ValueMap::with_capacity(map.len());
                for (key, value) in map {
                    path.push(key.clone());
                    out.insert(key.clone(), value.to_wire_at(path)?);
                    path.pop();
                }
                Ok(Value::Map(out))
            }
            Value::Tagged(tag) => Err(SerializeError {
                path: path.join("."),
                reason: format!("unresolved tag {tag}"),
            }),
        }
    }

    fn seq_to_wire(items: &[Value], path: &mut Vec<String>) -> Result<Vec<Value>, SerializeError> {
        let mut out = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            path.push(idx.to_string());
            out.push(item.to_wire_at(path)?);
            path.pop();
        }
        Ok(out)
    }

    /// Restore invariants that the wire cannot carry, currently only set
    /// element uniqueness.
    pub fn normalize(self) -> Value {
        match self {
            Value::Set(items) => {
                let mut unique: Vec<Value> = Vec::with_capacity(items.len());
                for item in items.into_iter().map(Value::normalize) {
                    if !unique.contains(&item) {
                        unique.push(item);
                    }
                }
                Value::Set(unique)
            }
            Value::List(items) => Value::List(items.into_iter().map(Value::normalize).collect()),
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key, value.normalize()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Convert a parsed inventory node, keeping `!env`-style tags as
    /// [`Value::Tagged`] leaves for late resolution.
    pub fn from_yaml(node: &serde_yaml::Value) -> Result<Value, ValueError> {
        match node {
            serde_yaml::Value::Null => Ok(Value::Null),
            serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(ValueError::UnsupportedYaml(format!("number {n}")))
                }
            }
            serde_yaml::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_yaml::Value::Sequence(items) => Ok(Value::List(
                items.iter().map(Value::from_yaml).collect::<Result<_, _>>()?,
            )),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = ValueMap::with_capacity(mapping.len());
                for (key, value) in mapping {
                    let key = key
                        .as_str()
                        .ok_or_else(|| ValueError::UnsupportedYaml(format!("non-string key {key:?}")))?;
                    map.insert(key.to_owned(), Value::from_yaml(value)?);
                }
                Ok(Value::Map(map))
            }
            serde_yaml::Value::Tagged(tagged) => Ok(Value::Tagged(Tag::from_yaml(tagged)?)),
        }
    }

    /// Convert parsed JSON (subprocess output, mostly) into a value tree.
    pub fn from_json(node: &serde_json::Value) -> Value {
        match node {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(key, value)| (key.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Render for the output formatters. Only called on wire-safe trees;
    /// a leftover tag renders as its placeholder description.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
            Value::List(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Tagged(tag) => serde_json::Value::String(tag.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            // Set order is not preserved across the wire.
            (Value::Set(a), Value::Set(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Tagged(a), Value::Tagged(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
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

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// Projection of a typed structure into a [`Value`] map, the analogue of a
/// hand-written `as_dict`.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Counterpart of [`ToValue`]: rebuild the typed structure from a map that
/// travelled over the wire.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self, ValueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        let mut inner = Value::map();
        inner.insert("key".into(), Value::from("nested"));

        let mut map = Value::map();
        map.insert("a".into(), Value::Int(1));
        map.insert("b".into(), Value::from("test"));
        map.insert("c".into(), Value::Null);
        map.insert(
            "d".into(),
            Value::List(vec![Value::Bool(true), Value::Map(inner)]),
        );
        map.insert(
            "e".into(),
            Value::Set(vec![Value::from("x"), Value::from("y")]),
        );
        Value::Map(map)
    }

    #[test]
    fn wire_round_trip() {
        let value = sample();
        let encoded = bincode::serialize(&value.to_wire().unwrap()).unwrap();
        let decoded: Value = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded.normalize(), value);
    }

    #[test]
    fn set_equality_ignores_order() {
        let a = Value::Set(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::Set(vec![Value::Int(2), Value::Int(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn set_normalize_restores_uniqueness() {
        let wire = Value::Set(vec![Value::Int(1), Value::Int(1), Value::Int(2)]);
        assert_eq!(
            wire.normalize(),
            Value::Set(vec![Value::Int(1), Value::Int(2)])
        );
    }

    #[test]
    fn unresolved_tag_names_path() {
        let mut inner = Value::map();
        inner.insert(
            "password".into(),
            Value::Tagged(Tag::Env { name: "SECRET".into() }),
        );
        let mut map = Value::map();
        map.insert("a".into(), Value::List(vec![Value::Null, Value::Map(inner)]));
        let err = Value::Map(map).to_wire().unwrap_err();
        assert_eq!(err.path, "a.1.password");
    }

    #[test]
    fn yaml_conversion_keeps_tags() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("password: !env SECRET").unwrap();
        let value = Value::from_yaml(&yaml).unwrap();
        assert!(matches!(
            value.get("password"),
            Some(Value::Tagged(Tag::Env { .. }))
        ));
    }
}
