//! Error Types
//!
//! Every failure the engine can report, grouped by the phase in which it
//! surfaces:
//!
//! - **Registration**: raised while a callback is being declared, never
//!   deferred to the first dispatch ([`RegistrationError`]).
//! - **Grouping shape**: a concrete value does not fit the declared nesting
//!   ([`GroupingError`], [`SchemaValidationError`]).
//! - **Dispatch**: routing a request or interpreting a callback's return
//!   value failed ([`DispatchError`], [`InvalidCallbackReturnValue`]).
//! - **User callbacks**: what a callback function itself returns on the
//!   error path ([`CallbackError`]). `PreventUpdate` lives here because it
//!   is a signal, not a failure.
//! - **Context access**, **background managers**, **pages** and
//!   **configuration** each get their own enum.

use serde_json::Value;
use smallvec::SmallVec;
use thiserror::Error;

use crate::dependency::Wildcard;

// ----------------------------------------------------------------------------
// Grouping
// ----------------------------------------------------------------------------

/// One step into a nested grouping: a sequence index or a mapping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

/// Location of a leaf (or sub-grouping) inside a grouping.
pub type GroupingPath = SmallVec<[PathSegment; 4]>;

/// Renders a path the way it is shown in validation messages: `(0, "a")`.
pub fn render_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path
        .iter()
        .map(|segment| match segment {
            PathSegment::Index(i) => i.to_string(),
            PathSegment::Key(k) => format!("{k:?}"),
        })
        .collect();

    match parts.len() {
        1 => format!("({},)", parts[0]),
        _ => format!("({})", parts.join(", ")),
    }
}

/// Name of a JSON value's type, for diagnostics.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// The container kind a schema position demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedContainer {
    Sequence,
    Mapping,
}

impl std::fmt::Display for ExpectedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequence => f.write_str("list or tuple"),
            Self::Mapping => f.write_str("dict"),
        }
    }
}

/// A concrete grouping value does not match the schema it was declared
/// against.
///
/// Every variant carries the rendered full schema, the path to the
/// offending position and the value found there, which is enough to point
/// at the bad leaf.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaValidationError {
    #[error(
        "Schema: {schema}\n  Path: {}\n  Expected type: {expected}\n  Received value of type {}:\n    {received}",
        render_path(.path),
        json_type_name(.received)
    )]
    Type {
        schema: String,
        path: GroupingPath,
        expected: ExpectedContainer,
        received: Value,
    },

    #[error(
        "Schema: {schema}\n  Path: {}\n  Expected length: {expected}\n  Received value of length {}:\n    {received}",
        render_path(.path),
        .received.as_array().map(Vec::len).unwrap_or(0)
    )]
    Length {
        schema: String,
        path: GroupingPath,
        expected: usize,
        received: Value,
    },

    #[error(
        "Schema: {schema}\n  Path: {}\n  Expected keys: {expected:?}\n  Received value with keys: {:?}:\n    {received}",
        render_path(.path),
        .received.as_object().map(|o| o.keys().cloned().collect::<Vec<_>>()).unwrap_or_default()
    )]
    Keys {
        schema: String,
        path: GroupingPath,
        expected: Vec<String>,
        received: Value,
    },
}

impl SchemaValidationError {
    /// Path to the position that failed validation.
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Type { path, .. } | Self::Length { path, .. } | Self::Keys { path, .. } => path,
        }
    }

    /// The full schema, rendered.
    pub fn schema(&self) -> &str {
        match self {
            Self::Type { schema, .. }
            | Self::Length { schema, .. }
            | Self::Keys { schema, .. } => schema,
        }
    }

    /// The value found at [`path`](Self::path).
    pub fn received(&self) -> &Value {
        match self {
            Self::Type { received, .. }
            | Self::Length { received, .. }
            | Self::Keys { received, .. } => received,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupingError {
    #[error(
        "The specified grouping pattern requires {expected} elements but received {received}"
    )]
    LengthMismatch { expected: usize, received: usize },
}

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("Invalid value provided where {expected} dependency object was expected: {found}")]
    IncorrectType { expected: &'static str, found: String },

    #[error(
        "Callback arguments must be `Output`, `Input`, or `State` objects, optionally wrapped \
         in a list or tuple. We found (possibly after unwrapping a list or tuple): {0}"
    )]
    UnexpectedArgument(String),

    #[error(
        "In a callback definition, you must provide all Outputs first, then all Inputs, then \
         all States. After this item: {after} we found this item next: {next}"
    )]
    ArgumentOrder { after: String, next: String },

    #[error("The state keyword argument may not be provided without the input keyword argument")]
    StateWithoutInputs,

    #[error(
        "The input argument to a callback was a {inputs}, but the state argument was not.\n\
         input and state arguments must have the same type"
    )]
    MismatchedInputState { inputs: &'static str },

    #[error("The input argument to a callback may be a dict, list, or tuple, but received {0}")]
    InvalidInputGrouping(String),

    #[error("component_property must be a non-empty string, found in {0}")]
    EmptyProperty(String),

    #[error(
        "The element `{id}` contains `{}` in its ID. Characters `.`, `{{` are not allowed in IDs.",
        .invalid.join("`, `")
    )]
    InvalidComponentId { id: String, invalid: Vec<String> },

    #[error("Wildcard ID keys must be non-empty strings, found an empty key in id {0}")]
    EmptyIdKey(String),

    #[error("{dependency} uses the {wildcard} wildcard, which is not allowed in {kind} dependencies")]
    WildcardNotAllowed {
        dependency: String,
        wildcard: Wildcard,
        kind: &'static str,
    },

    #[error("The callback `{0}` was already registered")]
    DuplicateCallback(String),

    #[error(
        "Output {output} is already in use by callback `{existing}`. To allow several \
         callbacks to write it, declare the output with allow_duplicate"
    )]
    DuplicateOutput { output: String, existing: String },

    #[error(
        "allow_duplicate requires prevent_initial_call to be True. The order of the call is \
         not guaranteed to be the same on every page load. To enable duplicate callback with \
         initial call, set prevent_initial_call='initial_duplicate' or globally in the config \
         prevent_initial_callbacks='initial_duplicate'"
    )]
    DuplicateWithoutPreventInitialCall,

    #[error("Callback `{callback}` would create a circular dependency with `{other}`")]
    CircularDependency { callback: String, other: String },

    #[error(
        "Running `background` callbacks requires a manager to be installed. Either provide \
         a manager in the background options or set a default manager on the application."
    )]
    MissingBackgroundManager,

    #[error(transparent)]
    Grouping(#[from] GroupingError),
}

// ----------------------------------------------------------------------------
// Callback execution
// ----------------------------------------------------------------------------

/// Returned by user callback functions on the non-success path.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Nothing changed: do not push new values. Not an error condition.
    #[error("prevent update")]
    PreventUpdate,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl CallbackError {
    /// Wraps any error type as a user failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }
}

/// The value a callback returned does not fit its declared outputs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidCallbackReturnValue {
    #[error(transparent)]
    Schema(#[from] SchemaValidationError),

    #[error(
        "The callback {callback} is a multi-output. Expected the output type to be a list or \
         tuple but got: {received}."
    )]
    NotMulti { callback: String, received: Value },

    #[error("Invalid number of output values for {callback}. Expected {expected}, got {received}")]
    OutputCount {
        callback: String,
        expected: usize,
        received: usize,
    },

    #[error(
        "The callback {callback} output {index} is a wildcard multi-output.\nExpected the \
         output type to be a list or tuple but got:\n{received}."
    )]
    WildcardNotList {
        callback: String,
        index: usize,
        received: Value,
    },

    #[error(
        "Invalid number of output values for {callback} item {index}.\nExpected {expected}, \
         got {received}"
    )]
    WildcardCount {
        callback: String,
        index: usize,
        expected: usize,
        received: usize,
    },

    #[error("No-output callback {callback} received return value: {received}")]
    NoOutputReturnedValue { callback: String, received: Value },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Callback function not found for output '{0}'")]
    CallbackNotFound(String),

    #[error("Callback '{0}' is a clientside callback and cannot be dispatched on the server")]
    ClientsideCallback(String),

    #[error("Malformed dispatch request for '{callback}': {reason}")]
    MalformedRequest { callback: String, reason: String },

    #[error(transparent)]
    InvalidReturn(#[from] InvalidCallbackReturnValue),

    #[error("Callback '{callback}' failed: {source}")]
    Callback {
        callback: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("An error occurred inside a background callback: {msg}\n{traceback}")]
    BackgroundCallback { msg: String, traceback: String },

    #[error(
        "Callback '{0}' is async and a blocking dispatch was requested from inside an async \
         runtime; use dispatch_async instead"
    )]
    AsyncInBlockingDispatch(String),

    #[error("Failed to run callback '{callback}': {reason}")]
    Runtime { callback: String, reason: String },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

// ----------------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("dash.callback_context.{0} is only available from a callback!")]
    MissingCallbackContext(&'static str),

    #[error("Duplicate resource name \"{0}\" found.")]
    DuplicateTiming(String),
}

// ----------------------------------------------------------------------------
// Background managers
// ----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Task queue must be configured with a result backend")]
    MissingResultBackend,

    #[error("No tokio runtime is available to run background tasks: {0}")]
    NoRuntime(String),

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "diskcache")]
    #[error("Failed to encode cache entry: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[cfg(feature = "diskcache")]
    #[error("Failed to decode cache entry: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ----------------------------------------------------------------------------
// Pages and configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PageError {
    #[error(
        "Invalid `path_template`: \"{0}\".  Path segments with variables must be formatted \
         as <variable_name>"
    )]
    InvalidPathTemplate(String),

    #[error("Invalid module name: \"{0}\"")]
    InvalidModuleName(String),

    #[error("Paths that aren't prefixed with a leading / are not supported. You supplied: {0}")]
    UnsupportedRelativePath(String),

    #[error("`use_pages` is not enabled in the application config")]
    PagesDisabled,

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
