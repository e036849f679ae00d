//! Dependency Descriptors
//!
//! A dependency names one property of one component (or, with wildcards, of
//! a family of components). Callbacks are declared in terms of three kinds:
//!
//! - **Output**: a property the callback writes.
//! - **Input**: a property whose change triggers the callback.
//! - **State**: a property the callback reads without being triggered by it.
//!
//! # Matching
//!
//! Two dependencies are "equal" when they could refer to the same property
//! of at least one shared component. Plain ids compare literally. Dict ids
//! must have the same key set; per key, equal values match, and wildcards
//! interact as follows:
//!
//! | left \ right | scalar        | `ALL`  | `MATCH` | `ALLSMALLER` |
//! |--------------|---------------|--------|---------|--------------|
//! | scalar       | equal values  | match  | match   | match        |
//! | `ALL`        | match         | match  | match   | match        |
//! | `MATCH`      | match         | match  | match   | **no**       |
//! | `ALLSMALLER` | match         | match  | **no**  | match        |
//!
//! The dependency kind does not take part in matching: an `Output` can be
//! equal to an `Input`, which is exactly what the callback graph relies on.

mod component_id;
mod wildcard;

pub use component_id::{ComponentId, IdValue};
pub use wildcard::{Wildcard, ALL, ALLSMALLER, MATCH};

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use crate::error::RegistrationError;

/// Which slot of a callback a dependency occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    Output,
    Input,
    State,
}

impl DependencyKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Output => "Output",
            Self::Input => "Input",
            Self::State => "State",
        }
    }

    /// Wildcards this kind of dependency may carry.
    pub const fn allowed_wildcards(self) -> &'static [Wildcard] {
        match self {
            Self::Output => &[Wildcard::Match, Wildcard::All],
            Self::Input | Self::State => &[Wildcard::Match, Wildcard::All, Wildcard::AllSmaller],
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A `(component id, property)` pair in one of the three callback slots.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub component_id: ComponentId,
    pub component_property: String,
    /// Only meaningful for outputs: several callbacks may write this output.
    pub allow_duplicate: bool,
}

impl Dependency {
    pub fn new(kind: DependencyKind, component_id: impl Into<ComponentId>, component_property: impl Into<String>) -> Self {
        Self {
            kind,
            component_id: component_id.into(),
            component_property: component_property.into(),
            allow_duplicate: false,
        }
    }

    pub fn is_output(&self) -> bool {
        self.kind == DependencyKind::Output
    }

    pub fn is_input(&self) -> bool {
        self.kind == DependencyKind::Input
    }

    pub fn is_state(&self) -> bool {
        self.kind == DependencyKind::State
    }

    pub fn component_id_str(&self) -> String {
        self.component_id.stringify()
    }

    /// `<id_str>.<property>`, the key used throughout the wire protocol.
    pub fn prop_id(&self) -> String {
        format!("{}.{}", self.component_id_str(), self.component_property)
    }

    pub fn has_wildcard(&self) -> bool {
        self.component_id.has_wildcard()
    }

    /// `{id, property}` as sent in the dependencies listing.
    pub fn to_dict(&self) -> Value {
        json!({
            "id": self.component_id_str(),
            "property": self.component_property,
        })
    }

    /// Wildcard-aware overlap test; see the module docs for the matrix.
    pub fn matches(&self, other: &Dependency) -> bool {
        self.component_property == other.component_property && id_matches(&self.component_id, &other.component_id)
    }

    /// Checks the dependency is well formed for its slot.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.component_property.is_empty() {
            return Err(RegistrationError::EmptyProperty(self.to_string()));
        }

        match &self.component_id {
            ComponentId::Str(id) => {
                let invalid: Vec<String> = [".", "{"]
                    .into_iter()
                    .filter(|c| id.contains(c))
                    .map(String::from)
                    .collect();
                if !invalid.is_empty() {
                    return Err(RegistrationError::InvalidComponentId {
                        id: id.clone(),
                        invalid,
                    });
                }
            }
            ComponentId::Dict(entries) => {
                if entries.keys().any(String::is_empty) {
                    return Err(RegistrationError::EmptyIdKey(self.component_id_str()));
                }
                let allowed = self.kind.allowed_wildcards();
                if let Some(wildcard) = self.component_id.wildcards().find(|w| !allowed.contains(w)) {
                    return Err(RegistrationError::WildcardNotAllowed {
                        dependency: self.to_string(),
                        wildcard,
                        kind: self.kind.name(),
                    });
                }
            }
        }

        trace!(dependency = %self, "validated dependency");
        Ok(())
    }
}

fn id_matches(mine: &ComponentId, other: &ComponentId) -> bool {
    let (mine, other) = match (mine, other) {
        (ComponentId::Str(a), ComponentId::Str(b)) => return a == b,
        (ComponentId::Dict(a), ComponentId::Dict(b)) => (a, b),
        _ => return false,
    };

    if mine.len() != other.len() || !mine.keys().all(|k| other.contains_key(k)) {
        return false;
    }

    for (key, value) in mine {
        let other_value = &other[key.as_str()];
        if value == other_value {
            continue;
        }
        match (value.as_wildcard(), other_value.as_wildcard()) {
            (None, None) => return false,
            (Some(_), None) | (None, Some(_)) => continue,
            (Some(Wildcard::All), _) | (_, Some(Wildcard::All)) => continue,
            (Some(Wildcard::Match), _) | (_, Some(Wildcard::Match)) => return false,
            (Some(_), Some(_)) => continue,
        }
    }
    true
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component_id_str(), self.component_property)
    }
}

/// Constructors for output dependencies.
pub struct Output;

impl Output {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(component_id: impl Into<ComponentId>, component_property: impl Into<String>) -> Dependency {
        Dependency::new(DependencyKind::Output, component_id, component_property)
    }

    /// An output other callbacks may also write.
    pub fn duplicate(component_id: impl Into<ComponentId>, component_property: impl Into<String>) -> Dependency {
        Dependency {
            allow_duplicate: true,
            ..Self::new(component_id, component_property)
        }
    }
}

/// Constructors for input dependencies.
pub struct Input;

impl Input {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(component_id: impl Into<ComponentId>, component_property: impl Into<String>) -> Dependency {
        Dependency::new(DependencyKind::Input, component_id, component_property)
    }
}

/// Constructors for state dependencies.
pub struct State;

impl State {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(component_id: impl Into<ComponentId>, component_property: impl Into<String>) -> Dependency {
        Dependency::new(DependencyKind::State, component_id, component_property)
    }
}

/// Reference to a JavaScript function run in the browser instead of on the
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientsideFunction {
    pub namespace: String,
    pub function_name: String,
}

impl ClientsideFunction {
    pub fn new(namespace: impl Into<String>, function_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            function_name: function_name.into(),
        }
    }
}
