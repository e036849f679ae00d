//! Grouping Engine
//!
//! Callbacks declare their inputs and outputs as arbitrarily nested lists
//! and dicts of dependencies ("groupings"). On the wire everything travels
//! flat, so the engine constantly converts between the two shapes:
//!
//! - [`Grouping::flatten`] walks a grouping and yields its leaves in order.
//! - [`make_grouping_by_index`] rebuilds a nested shape from a schema and a
//!   flat list of values.
//! - [`Grouping::map`] transforms every leaf while preserving the structure.
//! - [`flatten_grouping`] and [`validate_grouping`] work on untyped JSON
//!   values (callback return values), checking them against a typed schema.
//!
//! # Ordering
//!
//! Mapping groupings are backed by [`IndexMap`], so iteration always follows
//! declaration order. Nothing in this module ever sorts keys.
//!
//! # Leaves versus containers
//!
//! When a JSON value is validated against a schema, only positions where
//! the schema itself nests are treated as containers. An array or object
//! sitting where the schema has a leaf is one opaque value: a callback may
//! legitimately return a list as the `children` of a single output.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ExpectedContainer, GroupingError, GroupingPath, PathSegment, SchemaValidationError};

/// A nested composite of leaves of type `T`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Grouping<T> {
    Scalar(T),
    Sequence(Vec<Grouping<T>>),
    Mapping(IndexMap<String, Grouping<T>>),
}

impl<T> Grouping<T> {
    /// Builds a sequence grouping from an iterator of sub-groupings.
    pub fn sequence<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Grouping<T>>,
    {
        Self::Sequence(items.into_iter().map(Into::into).collect())
    }

    /// Builds a mapping grouping, keeping the iteration order of `entries`.
    pub fn mapping<K, I, G>(entries: I) -> Self
    where
        K: Into<String>,
        G: Into<Grouping<T>>,
        I: IntoIterator<Item = (K, G)>,
    {
        Self::Mapping(
            entries
                .into_iter()
                .map(|(k, g)| (k.into(), g.into()))
                .collect(),
        )
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub fn as_scalar(&self) -> Option<&T> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Grouping<T>]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&IndexMap<String, Grouping<T>>> {
        match self {
            Self::Mapping(entries) => Some(entries),
            _ => None,
        }
    }

    /// Number of scalar leaves (`grouping_len`).
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1,
            Self::Sequence(items) => items.iter().map(Grouping::len).sum(),
            Self::Mapping(entries) => entries.values().map(Grouping::len).sum(),
        }
    }

    /// True when the grouping holds no leaves at all (e.g. an empty list).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// References to the leaves, in order.
    pub fn flatten(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.len());
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Scalar(value) => out.push(value),
            Self::Sequence(items) => items.iter().for_each(|g| g.collect_leaves(out)),
            Self::Mapping(entries) => entries.values().for_each(|g| g.collect_leaves(out)),
        }
    }

    /// Consumes the grouping and returns its leaves, in order.
    pub fn into_flat(self) -> Vec<T> {
        let mut out = Vec::new();
        self.drain_leaves(&mut out);
        out
    }

    fn drain_leaves(self, out: &mut Vec<T>) {
        match self {
            Self::Scalar(value) => out.push(value),
            Self::Sequence(items) => items.into_iter().for_each(|g| g.drain_leaves(out)),
            Self::Mapping(entries) => entries.into_values().for_each(|g| g.drain_leaves(out)),
        }
    }

    /// Structure-preserving map over the leaves (`map_grouping`).
    pub fn map<U, F>(&self, mut f: F) -> Grouping<U>
    where
        F: FnMut(&T) -> U,
    {
        self.map_inner(&mut f)
    }

    fn map_inner<U, F>(&self, f: &mut F) -> Grouping<U>
    where
        F: FnMut(&T) -> U,
    {
        match self {
            Self::Scalar(value) => Grouping::Scalar(f(value)),
            Self::Sequence(items) => Grouping::Sequence(items.iter().map(|g| g.map_inner(f)).collect()),
            Self::Mapping(entries) => Grouping::Mapping(
                entries
                    .iter()
                    .map(|(k, g)| (k.clone(), g.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Fallible variant of [`map`](Self::map); stops at the first error.
    pub fn try_map<U, E, F>(&self, mut f: F) -> Result<Grouping<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U, E, F>(&self, f: &mut F) -> Result<Grouping<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        Ok(match self {
            Self::Scalar(value) => Grouping::Scalar(f(value)?),
            Self::Sequence(items) => Grouping::Sequence(
                items
                    .iter()
                    .map(|g| g.try_map_inner(f))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Mapping(entries) => Grouping::Mapping(
                entries
                    .iter()
                    .map(|(k, g)| Ok((k.clone(), g.try_map_inner(f)?)))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Replaces every leaf with a whole sub-grouping.
    ///
    /// Used where a single declared dependency stands for several concrete
    /// components (an `ALL` wildcard input expands into a list).
    pub fn expand<U, F>(&self, mut f: F) -> Grouping<U>
    where
        F: FnMut(&T) -> Grouping<U>,
    {
        self.expand_inner(&mut f)
    }

    fn expand_inner<U, F>(&self, f: &mut F) -> Grouping<U>
    where
        F: FnMut(&T) -> Grouping<U>,
    {
        match self {
            Self::Scalar(value) => f(value),
            Self::Sequence(items) => Grouping::Sequence(items.iter().map(|g| g.expand_inner(f)).collect()),
            Self::Mapping(entries) => Grouping::Mapping(
                entries
                    .iter()
                    .map(|(k, g)| (k.clone(), g.expand_inner(f)))
                    .collect(),
            ),
        }
    }
}

impl Grouping<Value> {
    /// Reshapes an untyped JSON value according to `schema`.
    ///
    /// The value is validated first; leaves are taken verbatim, even when
    /// they are themselves arrays or objects.
    pub fn from_value<S>(value: Value, schema: &Grouping<S>) -> Result<Self, SchemaValidationError>
    where
        S: fmt::Display,
    {
        validate_grouping(&value, schema)?;
        Ok(reshape(value, schema))
    }

    /// Converts back into a plain JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Scalar(value) => value.clone(),
            Self::Sequence(items) => Value::Array(items.iter().map(Grouping::to_value).collect()),
            Self::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, g)| (k.clone(), g.to_value()))
                    .collect::<Map<_, _>>(),
            ),
        }
    }
}

/// Splits a validated value along the schema. Positions the schema does not
/// nest into are kept whole.
fn reshape<S>(value: Value, schema: &Grouping<S>) -> Grouping<Value> {
    match (schema, value) {
        (Grouping::Sequence(schemas), Value::Array(items)) => Grouping::Sequence(
            items
                .into_iter()
                .zip(schemas)
                .map(|(item, s)| reshape(item, s))
                .collect(),
        ),
        (Grouping::Mapping(schemas), Value::Object(mut entries)) => Grouping::Mapping(
            schemas
                .iter()
                .map(|(k, s)| {
                    let item = entries.remove(k).unwrap_or(Value::Null);
                    (k.clone(), reshape(item, s))
                })
                .collect(),
        ),
        (_, value) => Grouping::Scalar(value),
    }
}

impl<T> From<T> for Grouping<T> {
    fn from(value: T) -> Self {
        Self::Scalar(value)
    }
}

impl<T: fmt::Display> fmt::Display for Grouping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value}"),
            Self::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Mapping(entries) => {
                f.write_str("{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {item}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Number of scalar leaves in a grouping.
pub fn grouping_len<T>(grouping: &Grouping<T>) -> usize {
    grouping.len()
}

/// Structure-preserving map; free-function form of [`Grouping::map`].
pub fn map_grouping<T, U, F>(f: F, grouping: &Grouping<T>) -> Grouping<U>
where
    F: FnMut(&T) -> U,
{
    grouping.map(f)
}


/// Rebuilds the nested shape of `schema` from a flat list of values.
///
/// Fails if the list length differs from `grouping_len(schema)`.
pub fn make_grouping_by_index<S, T>(schema: &Grouping<S>, flat_values: Vec<T>) -> Result<Grouping<T>, GroupingError> {
    let expected = schema.len();
    let received = flat_values.len();
    if received != expected {
        return Err(GroupingError::LengthMismatch { expected, received });
    }

    let mut values = flat_values.into_iter();
    fill(schema, &mut values).ok_or(GroupingError::LengthMismatch { expected, received })
}

fn fill<S, T>(schema: &Grouping<S>, values: &mut impl Iterator<Item = T>) -> Option<Grouping<T>> {
    Some(match schema {
        Grouping::Scalar(_) => Grouping::Scalar(values.next()?),
        Grouping::Sequence(items) => Grouping::Sequence(
            items
                .iter()
                .map(|g| fill(g, values))
                .collect::<Option<_>>()?,
        ),
        Grouping::Mapping(entries) => Grouping::Mapping(
            entries
                .iter()
                .map(|(k, g)| Some((k.clone(), fill(g, values)?)))
                .collect::<Option<_>>()?,
        ),
    })
}

/// Looks every schema leaf up in `source`, substituting `default` for
/// missing keys.
pub fn make_grouping_by_key<K, V>(schema: &Grouping<K>, source: &HashMap<K, V>, default: V) -> Grouping<V>
where
    K: Hash + Eq,
    V: Clone,
{
    schema.map(|key| source.get(key).cloned().unwrap_or_else(|| default.clone()))
}

// ----------------------------------------------------------------------------
// Untyped values against a typed schema
// ----------------------------------------------------------------------------

/// Checks that `value` has the nesting `schema` demands.
///
/// Sequence positions must hold arrays of the same length, mapping positions
/// must hold objects with exactly the same key set. Leaf positions accept
/// anything. The error carries the rendered schema and the path to the
/// first offending position.
pub fn validate_grouping<S: fmt::Display>(value: &Value, schema: &Grouping<S>) -> Result<(), SchemaValidationError> {
    let mut path = GroupingPath::new();
    validate_at(value, schema, schema, &mut path)
}

fn validate_at<S: fmt::Display>(
    value: &Value,
    schema: &Grouping<S>,
    full_schema: &Grouping<S>,
    path: &mut GroupingPath,
) -> Result<(), SchemaValidationError> {
    match schema {
        Grouping::Scalar(_) => Ok(()),
        Grouping::Sequence(schemas) => {
            let Value::Array(items) = value else {
                return Err(SchemaValidationError::Type {
                    schema: full_schema.to_string(),
                    path: path.clone(),
                    expected: ExpectedContainer::Sequence,
                    received: value.clone(),
                });
            };
            if items.len() != schemas.len() {
                return Err(SchemaValidationError::Length {
                    schema: full_schema.to_string(),
                    path: path.clone(),
                    expected: schemas.len(),
                    received: value.clone(),
                });
            }
            for (i, (item, s)) in items.iter().zip(schemas).enumerate() {
                path.push(PathSegment::Index(i));
                validate_at(item, s, full_schema, path)?;
                path.pop();
            }
            Ok(())
        }
        Grouping::Mapping(schemas) => {
            let Value::Object(entries) = value else {
                return Err(SchemaValidationError::Type {
                    schema: full_schema.to_string(),
                    path: path.clone(),
                    expected: ExpectedContainer::Mapping,
                    received: value.clone(),
                });
            };
            let same_keys = entries.len() == schemas.len() && schemas.keys().all(|k| entries.contains_key(k));
            if !same_keys {
                return Err(SchemaValidationError::Keys {
                    schema: full_schema.to_string(),
                    path: path.clone(),
                    expected: schemas.keys().cloned().collect(),
                    received: value.clone(),
                });
            }
            for (key, s) in schemas {
                path.push(PathSegment::Key(key.clone()));
                validate_at(&entries[key.as_str()], s, full_schema, path)?;
                path.pop();
            }
            Ok(())
        }
    }
}

/// Validates `value` against `schema` and returns its leaves in schema
/// order.
pub fn flatten_grouping<S: fmt::Display>(value: &Value, schema: &Grouping<S>) -> Result<Vec<Value>, SchemaValidationError> {
    validate_grouping(value, schema)?;
    let mut out = Vec::with_capacity(schema.len());
    flatten_along(value, schema, &mut out);
    Ok(out)
}

fn flatten_along<S>(value: &Value, schema: &Grouping<S>, out: &mut Vec<Value>) {
    match (schema, value) {
        (Grouping::Sequence(schemas), Value::Array(items)) => {
            for (item, s) in items.iter().zip(schemas) {
                flatten_along(item, s, out);
            }
        }
        (Grouping::Mapping(schemas), Value::Object(entries)) => {
            for (key, s) in schemas {
                if let Some(item) = entries.get(key) {
                    flatten_along(item, s, out);
                }
            }
        }
        _ => out.push(value.clone()),
    }
}

/// Flattens a JSON value using its own shape as the schema: every array and
/// object is descended into.
pub fn flatten_value(value: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    flatten_self(value, &mut out);
    out
}

fn flatten_self(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| flatten_self(v, out)),
        Value::Object(entries) => entries.values().for_each(|v| flatten_self(v, out)),
        scalar => out.push(scalar.clone()),
    }
}
