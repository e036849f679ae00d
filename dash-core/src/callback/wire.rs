//! Wire Shapes
//!
//! JSON bodies exchanged with the browser-side renderer. Requests name the
//! callback by its id (`output`) and carry the current values of every
//! input and state; responses map stringified component ids to the props
//! that changed.
//!
//! A pattern-matching dependency with `ALL` (or `ALLSMALLER`) stands for
//! several components at once, so each slot in `inputs`, `state` and
//! `outputs` is either a single object or a list of objects.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::background::JobId;
use crate::dependency::{ComponentId, Dependency};

/// `{id, property}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropRef {
    pub id: ComponentId,
    pub property: String,
}

impl PropRef {
    pub fn new(id: impl Into<ComponentId>, property: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            property: property.into(),
        }
    }

    pub fn prop_id(&self) -> String {
        format!("{}.{}", self.id.stringify(), self.property)
    }

    /// Property name without a duplicate-output suffix (`children@<hash>`).
    pub fn clean_property(&self) -> &str {
        self.property.split('@').next().unwrap_or(&self.property)
    }
}

impl From<&Dependency> for PropRef {
    fn from(dep: &Dependency) -> Self {
        Self {
            id: dep.component_id.clone(),
            property: dep.component_property.clone(),
        }
    }
}

/// `{id, property, value}`. A missing value reads as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropValue {
    pub id: ComponentId,
    pub property: String,
    #[serde(default)]
    pub value: Value,
}

impl PropValue {
    pub fn new(id: impl Into<ComponentId>, property: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            property: property.into(),
            value,
        }
    }

    pub fn prop_id(&self) -> String {
        format!("{}.{}", self.id.stringify(), self.property)
    }
}

/// One declared input or state, resolved against the current layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSlot {
    Single(PropValue),
    /// Every component an `ALL`/`ALLSMALLER` pattern matched.
    Wildcard(Vec<PropValue>),
}

impl InputSlot {
    /// The value handed to the callback: a plain value, or a list of them
    /// for wildcard slots.
    pub fn value(&self) -> Value {
        match self {
            Self::Single(entry) => entry.value.clone(),
            Self::Wildcard(entries) => Value::Array(entries.iter().map(|e| e.value.clone()).collect()),
        }
    }

    pub fn entries(&self) -> &[PropValue] {
        match self {
            Self::Single(entry) => std::slice::from_ref(entry),
            Self::Wildcard(entries) => entries,
        }
    }
}

/// One declared output, resolved against the current layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputSlot {
    Single(PropRef),
    Wildcard(Vec<PropRef>),
}

impl OutputSlot {
    pub fn entries(&self) -> &[PropRef] {
        match self {
            Self::Single(entry) => std::slice::from_ref(entry),
            Self::Wildcard(entries) => entries,
        }
    }
}

/// Body of a callback dispatch request.
///
/// The background-callback fields (`cacheKey`, `job`, `oldJob`,
/// `cancelJob`) travel alongside the body instead of in a query string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Callback id.
    pub output: String,
    /// One slot for single-output callbacks, a list of slots otherwise.
    /// Kept raw until the registration says which it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    #[serde(default)]
    pub state: Vec<InputSlot>,
    #[serde(default)]
    pub changed_prop_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_job: Vec<JobId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel_job: Vec<JobId>,
}

impl DispatchRequest {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn input(mut self, id: impl Into<ComponentId>, property: impl Into<String>, value: Value) -> Self {
        self.inputs.push(InputSlot::Single(PropValue::new(id, property, value)));
        self
    }

    pub fn input_slot(mut self, slot: InputSlot) -> Self {
        self.inputs.push(slot);
        self
    }

    pub fn state(mut self, id: impl Into<ComponentId>, property: impl Into<String>, value: Value) -> Self {
        self.state.push(InputSlot::Single(PropValue::new(id, property, value)));
        self
    }

    pub fn state_slot(mut self, slot: InputSlot) -> Self {
        self.state.push(slot);
        self
    }

    pub fn changed(mut self, prop_id: impl Into<String>) -> Self {
        self.changed_prop_ids.push(prop_id.into());
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn job(mut self, job: JobId) -> Self {
        self.job = Some(job);
        self
    }

    pub fn old_job(mut self, job: JobId) -> Self {
        self.old_job.push(job);
        self
    }

    pub fn cancel_job(mut self, job: JobId) -> Self {
        self.cancel_job.push(job);
        self
    }

    /// Interprets `outputs` for a callback with the given shape. Without
    /// an explicit `outputs` field the declared outputs are used, which
    /// only works when none of them is a pattern.
    pub(crate) fn resolve_outputs(&self, multi: bool, declared: &[Dependency]) -> Result<Vec<OutputSlot>, String> {
        match &self.outputs {
            Some(raw) if multi => serde_json::from_value::<Vec<OutputSlot>>(raw.clone()).map_err(|e| e.to_string()),
            Some(raw) => serde_json::from_value::<OutputSlot>(raw.clone())
                .map(|slot| vec![slot])
                .map_err(|e| e.to_string()),
            None => {
                if let Some(pattern) = declared.iter().find(|d| d.has_wildcard()) {
                    return Err(format!("`outputs` is required for pattern output {pattern}"));
                }
                Ok(declared.iter().map(|d| OutputSlot::Single(PropRef::from(d))).collect())
            }
        }
    }
}

/// Stringified component id to changed props.
pub type PropUpdates = IndexMap<String, Map<String, Value>>;

/// A completed callback's changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackUpdate {
    pub multi: bool,
    pub response: PropUpdates,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_update: Option<PropUpdates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<IndexMap<String, Value>>,
}

/// First reply to a background callback: where to poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub cache_key: String,
    pub job: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_default: Option<IndexMap<String, Value>>,
}

/// Poll reply while a background job is still running.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<IndexMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side_update: Option<PropUpdates>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DispatchResponse {
    Update(CallbackUpdate),
    JobStarted(JobStarted),
    Pending(PendingUpdate),
    /// Nothing changed. Sent as an empty 204.
    NoUpdate,
}

/// Status, headers and body of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: DispatchResponse,
}

impl DispatchReply {
    pub fn no_update() -> Self {
        Self {
            status: 204,
            headers: Vec::new(),
            body: DispatchResponse::NoUpdate,
        }
    }

    pub fn ok(body: DispatchResponse) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    pub fn is_no_update(&self) -> bool {
        matches!(self.body, DispatchResponse::NoUpdate)
    }

    pub fn update(&self) -> Option<&CallbackUpdate> {
        match &self.body {
            DispatchResponse::Update(update) => Some(update),
            _ => None,
        }
    }

    pub fn header<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The JSON body, empty for a 204.
    pub fn body_json(&self) -> Result<String, serde_json::Error> {
        match self.body {
            DispatchResponse::NoUpdate => Ok(String::new()),
            ref body => serde_json::to_string(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{IdValue, Output, MATCH};
    use serde_json::json;

    #[test]
    fn request_parses_renderer_body() {
        let body = json!({
            "output": "..a.children...b.children..",
            "outputs": [{"id": "a", "property": "children"}, {"id": "b", "property": "children"}],
            "inputs": [
                {"id": "x", "property": "value", "value": 3},
                [{"id": {"type": "i", "index": 0}, "property": "value", "value": "p"}]
            ],
            "changedPropIds": ["x.value"]
        });
        let request: DispatchRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.inputs.len(), 2);
        assert_eq!(request.inputs[0].value(), json!(3));
        assert_eq!(request.inputs[1].value(), json!(["p"]));
        assert_eq!(request.changed_prop_ids, vec!["x.value"]);
        assert!(request.state.is_empty());

        let outputs = request.resolve_outputs(true, &[]).unwrap();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn missing_value_reads_as_null() {
        let slot: InputSlot = serde_json::from_value(json!({"id": "x", "property": "value"})).unwrap();
        assert_eq!(slot.value(), Value::Null);
    }

    #[test]
    fn outputs_fall_back_to_declared() {
        let declared = vec![Output::new("out", "children")];
        let request = DispatchRequest::new("out.children");
        let slots = request.resolve_outputs(false, &declared).unwrap();
        assert_eq!(slots, vec![OutputSlot::Single(PropRef::new("out", "children"))]);

        let pattern = vec![Output::new(ComponentId::dict([("i", IdValue::from(MATCH))]), "children")];
        assert!(request.resolve_outputs(false, &pattern).is_err());
    }

    #[test]
    fn duplicate_suffix_is_cleaned() {
        assert_eq!(PropRef::new("a", "children@abc").clean_property(), "children");
        assert_eq!(PropRef::new("a", "children").clean_property(), "children");
    }

    #[test]
    fn update_serializes_camel_case() {
        let mut response = PropUpdates::new();
        response.insert("out".into(), serde_json::from_value(json!({"children": 1})).unwrap());
        let reply = DispatchReply::ok(DispatchResponse::Update(CallbackUpdate {
            multi: true,
            response: response.clone(),
            side_update: Some(response),
            progress: None,
        }));
        let parsed: Value = serde_json::from_str(&reply.body_json().unwrap()).unwrap();
        assert_eq!(
            parsed,
            json!({"multi": true, "response": {"out": {"children": 1}}, "sideUpdate": {"out": {"children": 1}}})
        );
        assert_eq!(DispatchReply::no_update().body_json().unwrap(), "");
    }
}
