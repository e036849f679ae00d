//! Component Ids
//!
//! A component is addressed either by a plain string id or by a dict id
//! (`{"type": "item", "index": 3}`). Dict ids may hold wildcards in place
//! of concrete values, which turns a dependency into a pattern.
//!
//! Dict ids have a canonical string form, produced by
//! [`ComponentId::stringify`]: keys sorted, compact JSON, wildcards written
//! as `["MATCH"]`. That form is what prop ids (`<id>.<property>`) and the
//! response maps are keyed by, so two dicts with the same entries in a
//! different insertion order stringify identically.

use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::wildcard::Wildcard;

/// A value inside a dict id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdValue {
    Wildcard(Wildcard),
    Value(Value),
}

impl IdValue {
    pub fn as_wildcard(&self) -> Option<Wildcard> {
        match self {
            Self::Wildcard(w) => Some(*w),
            Self::Value(_) => None,
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            Self::Wildcard(w) => w.to_json(),
            Self::Value(v) => v.to_string(),
        }
    }

    fn from_json(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if let [Value::String(name)] = items.as_slice() {
                if let Some(w) = Wildcard::from_name(name) {
                    return Self::Wildcard(w);
                }
            }
        }
        Self::Value(value)
    }
}

impl From<Wildcard> for IdValue {
    fn from(w: Wildcard) -> Self {
        Self::Wildcard(w)
    }
}

impl From<Value> for IdValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<&str> for IdValue {
    fn from(s: &str) -> Self {
        Self::Value(Value::String(s.to_owned()))
    }
}

impl From<String> for IdValue {
    fn from(s: String) -> Self {
        Self::Value(Value::String(s))
    }
}

impl From<i64> for IdValue {
    fn from(n: i64) -> Self {
        Self::Value(Value::from(n))
    }
}

impl From<bool> for IdValue {
    fn from(b: bool) -> Self {
        Self::Value(Value::Bool(b))
    }
}

impl Serialize for IdValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Wildcard(w) => w.serialize(serializer),
            Self::Value(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for IdValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

/// The id of a component: a plain string or a dict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentId {
    Str(String),
    Dict(IndexMap<String, IdValue>),
}

impl ComponentId {
    /// Builds a dict id, keeping the given key order.
    pub fn dict<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<IdValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_dict(&self) -> bool {
        matches!(self, Self::Dict(_))
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, IdValue>> {
        match self {
            Self::Dict(entries) => Some(entries),
            Self::Str(_) => None,
        }
    }

    /// True iff any dict value is a wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.wildcards().next().is_some()
    }

    /// The wildcards used in this id, in key order.
    pub fn wildcards(&self) -> impl Iterator<Item = Wildcard> + '_ {
        self.as_dict()
            .into_iter()
            .flat_map(|entries| entries.values().filter_map(IdValue::as_wildcard))
    }

    /// Canonical string form.
    pub fn stringify(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Dict(entries) => {
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                let parts: Vec<String> = keys
                    .into_iter()
                    .map(|k| format!("{}:{}", Value::String(k.clone()), entries[k.as_str()].to_json()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Reverses [`stringify`](Self::stringify). Strings that do not start
    /// with `{` (or fail to parse as a JSON object) are plain ids.
    pub fn parse(s: &str) -> Self {
        if s.starts_with('{') {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(s) {
                return Self::Dict(
                    map.into_iter()
                        .map(|(k, v)| (k, IdValue::from_json(v)))
                        .collect(),
                );
            }
        }
        Self::Str(s.to_owned())
    }

    /// The id as a JSON value, wildcards in their array form.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Str(s) => Value::String(s.clone()),
            Self::Dict(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            IdValue::Wildcard(w) => Value::Array(vec![Value::String(w.name().into())]),
                            IdValue::Value(v) => v.clone(),
                        };
                        (k.clone(), value)
                    })
                    .collect(),
            ),
        }
    }
}

impl Hash for ComponentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.stringify().hash(state);
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

impl From<&str> for ComponentId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for ComponentId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<IndexMap<String, IdValue>> for ComponentId {
    fn from(entries: IndexMap<String, IdValue>) -> Self {
        Self::Dict(entries)
    }
}

impl Serialize for ComponentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Str(s) => serializer.serialize_str(s),
            Self::Dict(entries) => entries.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ComponentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Self::Str(s)),
            Value::Object(map) => Ok(Self::Dict(
                map.into_iter()
                    .map(|(k, v)| (k, IdValue::from_json(v)))
                    .collect(),
            )),
            other => Err(serde::de::Error::custom(format!(
                "component id must be a string or a dict, got {other}"
            ))),
        }
    }
}
