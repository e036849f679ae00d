//! Callback Context
//!
//! While a callback runs it can ask which inputs triggered it, what the
//! other inputs and states hold, push props to components outside its
//! declared outputs ([`set_props`]) and attach server timing. That state
//! lives in a [`CallbackContext`], created fresh for every dispatch.
//!
//! # Scoping
//!
//! The context is made ambient for the duration of one invocation only:
//!
//! - Sync callbacks run under a [`ContextGuard`], which pushes the context
//!   onto a thread-local stack and pops it on drop (also on unwind).
//! - Async callbacks run inside a `tokio::task_local!` scope, so the
//!   context follows the task across worker threads.
//!
//! Concurrent dispatches on different threads or tasks therefore never see
//! each other's context. Outside any invocation, [`callback_context`] fails
//! with [`ContextError::MissingCallbackContext`].

use std::cell::RefCell;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::callback::wire::{InputSlot, OutputSlot, PropRef, PropUpdates};
use crate::dependency::ComponentId;
use crate::error::ContextError;
use crate::grouping::Grouping;

// ----------------------------------------------------------------------------
// Triggered inputs
// ----------------------------------------------------------------------------

/// One changed property in the request that caused the dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredInput {
    pub prop_id: String,
    pub value: Value,
}

fn falsy_sentinel() -> &'static [TriggeredInput] {
    static SENTINEL: OnceLock<[TriggeredInput; 1]> = OnceLock::new();
    SENTINEL.get_or_init(|| {
        [TriggeredInput {
            prop_id: ".".to_string(),
            value: Value::Null,
        }]
    })
}

/// The triggered inputs of a dispatch.
///
/// When nothing actually fired (initial load) this is falsy,
/// [`as_bool`](Self::as_bool) returns `false`, yet it still dereferences to
/// one sentinel entry `{"prop_id": ".", "value": null}` so code indexing
/// `[0]` keeps working.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Triggered(Vec<TriggeredInput>);

impl Triggered {
    pub fn new(inputs: Vec<TriggeredInput>) -> Self {
        Self(inputs)
    }

    pub fn as_bool(&self) -> bool {
        !self.0.is_empty()
    }

    /// The real entries, without the sentinel.
    pub fn entries(&self) -> &[TriggeredInput] {
        &self.0
    }
}

impl Deref for Triggered {
    type Target = [TriggeredInput];

    fn deref(&self) -> &Self::Target {
        if self.0.is_empty() {
            falsy_sentinel()
        } else {
            &self.0
        }
    }
}

impl Serialize for Triggered {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.deref().serialize(serializer)
    }
}

// ----------------------------------------------------------------------------
// Groupings exposed to callbacks
// ----------------------------------------------------------------------------

/// Leaf of `args_grouping`: one concrete input or state, with its value and
/// whether it triggered this dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArgLeaf {
    pub id: ComponentId,
    pub property: String,
    pub value: Value,
    pub id_str: String,
    pub triggered: bool,
}

/// A server-timing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimingEntry {
    /// Milliseconds, rounded.
    pub dur: Option<u64>,
    pub desc: Option<String>,
}

/// Status and headers the callback may amend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHandle {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
}

impl ResponseHandle {
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }
}

/// Called on every `set_props` with the new props only; background jobs use
/// it to forward updates to their result store.
pub(crate) type SetPropsHook = Arc<dyn Fn(&str, &Map<String, Value>) + Send + Sync>;

// ----------------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------------

struct ContextState {
    callback_id: String,
    inputs_list: Vec<InputSlot>,
    states_list: Vec<InputSlot>,
    outputs_list: Vec<OutputSlot>,
    input_values: IndexMap<String, Value>,
    state_values: IndexMap<String, Value>,
    triggered_inputs: Vec<TriggeredInput>,
    args_grouping: Grouping<ArgLeaf>,
    using_args_grouping: bool,
    outputs_grouping: Option<Grouping<PropRef>>,
    using_outputs_grouping: bool,
    background: bool,
    updated_props: Mutex<PropUpdates>,
    set_props_hook: Option<SetPropsHook>,
    timing: Mutex<IndexMap<String, TimingEntry>>,
    response: Mutex<ResponseHandle>,
}

/// Per-invocation state, cheap to clone (shared handle).
#[derive(Clone)]
pub struct CallbackContext(Arc<ContextState>);

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("callback_id", &self.0.callback_id)
            .field("triggered", &self.0.triggered_inputs)
            .field("background", &self.0.background)
            .finish_non_exhaustive()
    }
}

fn slots_to_dict(slots: &[InputSlot]) -> IndexMap<String, Value> {
    slots
        .iter()
        .flat_map(InputSlot::entries)
        .map(|entry| (entry.prop_id(), entry.value.clone()))
        .collect()
}

/// A grouping of indices is "trivial" when it is a flat list `[0, 1, ..]`
/// or a lone index; only then can callbacks read their arguments
/// positionally without a grouping.
fn is_nontrivial(indices: &Grouping<usize>) -> bool {
    match indices {
        Grouping::Scalar(_) => false,
        Grouping::Sequence(items) => !items
            .iter()
            .enumerate()
            .all(|(i, item)| item.as_scalar() == Some(&i)),
        Grouping::Mapping(_) => true,
    }
}

/// Builds a [`CallbackContext`] from a request.
pub struct ContextBuilder {
    callback_id: String,
    inputs: Vec<InputSlot>,
    state: Vec<InputSlot>,
    outputs: Vec<OutputSlot>,
    changed: Vec<String>,
    input_state_indices: Option<Grouping<usize>>,
    outputs_indices: Option<Grouping<usize>>,
    background: bool,
}

impl ContextBuilder {
    pub fn inputs(mut self, inputs: Vec<InputSlot>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn state(mut self, state: Vec<InputSlot>) -> Self {
        self.state = state;
        self
    }

    pub fn outputs(mut self, outputs: Vec<OutputSlot>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn changed(mut self, changed: Vec<String>) -> Self {
        self.changed = changed;
        self
    }

    /// Shape of the declared inputs (see `compute_input_state_indices`).
    /// Defaults to a flat list over every input and state slot.
    pub fn input_state_indices(mut self, indices: Grouping<usize>) -> Self {
        self.input_state_indices = Some(indices);
        self
    }

    /// Shape of the declared outputs. Defaults to a flat list.
    pub fn outputs_indices(mut self, indices: Grouping<usize>) -> Self {
        self.outputs_indices = Some(indices);
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Fails when the request's slot counts do not fit the declared shape.
    pub fn build(self) -> Result<CallbackContext, String> {
        let input_values = slots_to_dict(&self.inputs);
        let state_values = slots_to_dict(&self.state);
        let triggered_inputs: Vec<TriggeredInput> = self
            .changed
            .iter()
            .map(|prop_id| TriggeredInput {
                prop_id: prop_id.clone(),
                value: input_values.get(prop_id).cloned().unwrap_or(Value::Null),
            })
            .collect();

        let leaves: Vec<Grouping<ArgLeaf>> = self
            .inputs
            .iter()
            .chain(&self.state)
            .map(|slot| {
                let leaf = |entry: &crate::callback::wire::PropValue| {
                    let id_str = entry.id.stringify();
                    let triggered = self.changed.contains(&format!("{id_str}.{}", entry.property));
                    Grouping::Scalar(ArgLeaf {
                        id: entry.id.clone(),
                        property: entry.property.clone(),
                        value: entry.value.clone(),
                        id_str,
                        triggered,
                    })
                };
                match slot {
                    InputSlot::Single(entry) => leaf(entry),
                    InputSlot::Wildcard(entries) => Grouping::Sequence(entries.iter().map(leaf).collect()),
                }
            })
            .collect();

        let indices = self
            .input_state_indices
            .unwrap_or_else(|| Grouping::Sequence((0..leaves.len()).map(Grouping::Scalar).collect()));
        if indices.len() != leaves.len() {
            return Err(format!(
                "expected {} inputs and states, received {}",
                indices.len(),
                leaves.len()
            ));
        }
        let args_grouping = indices.expand(|&i| leaves[i].clone());
        let using_args_grouping = is_nontrivial(&indices);

        let (outputs_grouping, using_outputs_grouping) = if self.outputs.is_empty() {
            (None, false)
        } else {
            let out_indices = self
                .outputs_indices
                .unwrap_or_else(|| Grouping::Sequence((0..self.outputs.len()).map(Grouping::Scalar).collect()));
            if out_indices.len() != self.outputs.len() {
                return Err(format!(
                    "expected {} outputs, received {}",
                    out_indices.len(),
                    self.outputs.len()
                ));
            }
            let grouping = out_indices.expand(|&i| match &self.outputs[i] {
                OutputSlot::Single(entry) => Grouping::Scalar(entry.clone()),
                OutputSlot::Wildcard(entries) => Grouping::Sequence(entries.iter().cloned().map(Grouping::Scalar).collect()),
            });
            (Some(grouping), is_nontrivial(&out_indices))
        };

        Ok(CallbackContext(Arc::new(ContextState {
            callback_id: self.callback_id,
            inputs_list: self.inputs,
            states_list: self.state,
            outputs_list: self.outputs,
            input_values,
            state_values,
            triggered_inputs,
            args_grouping,
            using_args_grouping,
            outputs_grouping,
            using_outputs_grouping,
            background: self.background,
            updated_props: Mutex::new(PropUpdates::new()),
            set_props_hook: None,
            timing: Mutex::new(IndexMap::new()),
            response: Mutex::new(ResponseHandle::default()),
        })))
    }
}

impl CallbackContext {
    pub fn builder(callback_id: impl Into<String>) -> ContextBuilder {
        ContextBuilder {
            callback_id: callback_id.into(),
            inputs: Vec::new(),
            state: Vec::new(),
            outputs: Vec::new(),
            changed: Vec::new(),
            input_state_indices: None,
            outputs_indices: None,
            background: false,
        }
    }

    /// Copy for a background job: same request data, fresh buffers, and
    /// `set_props` forwarded through `hook`.
    pub(crate) fn fork_for_job(&self, hook: Option<SetPropsHook>) -> Self {
        let s = &self.0;
        Self(Arc::new(ContextState {
            callback_id: s.callback_id.clone(),
            inputs_list: s.inputs_list.clone(),
            states_list: s.states_list.clone(),
            outputs_list: s.outputs_list.clone(),
            input_values: s.input_values.clone(),
            state_values: s.state_values.clone(),
            triggered_inputs: s.triggered_inputs.clone(),
            args_grouping: s.args_grouping.clone(),
            using_args_grouping: s.using_args_grouping,
            outputs_grouping: s.outputs_grouping.clone(),
            using_outputs_grouping: s.using_outputs_grouping,
            background: true,
            updated_props: Mutex::new(PropUpdates::new()),
            set_props_hook: hook,
            timing: Mutex::new(IndexMap::new()),
            response: Mutex::new(ResponseHandle::default()),
        }))
    }

    pub fn callback_id(&self) -> &str {
        &self.0.callback_id
    }

    /// Input values keyed by prop id.
    pub fn inputs(&self) -> &IndexMap<String, Value> {
        &self.0.input_values
    }

    /// State values keyed by prop id.
    pub fn states(&self) -> &IndexMap<String, Value> {
        &self.0.state_values
    }

    pub fn inputs_list(&self) -> &[InputSlot] {
        &self.0.inputs_list
    }

    pub fn states_list(&self) -> &[InputSlot] {
        &self.0.states_list
    }

    pub fn outputs_list(&self) -> &[OutputSlot] {
        &self.0.outputs_list
    }

    pub fn triggered(&self) -> Triggered {
        Triggered(self.0.triggered_inputs.clone())
    }

    /// Triggered prop ids mapped to their component ids; dict ids are
    /// parsed back from their string form.
    pub fn triggered_prop_ids(&self) -> IndexMap<String, ComponentId> {
        self.0
            .triggered_inputs
            .iter()
            .map(|t| {
                let component = t.prop_id.rsplit_once('.').map_or("", |(id, _)| id);
                (t.prop_id.clone(), ComponentId::parse(component))
            })
            .collect()
    }

    /// Id of the first triggered component, if anything triggered.
    pub fn triggered_id(&self) -> Option<ComponentId> {
        self.triggered_prop_ids().into_values().next()
    }

    pub fn args_grouping(&self) -> &Grouping<ArgLeaf> {
        &self.0.args_grouping
    }

    pub fn using_args_grouping(&self) -> bool {
        self.0.using_args_grouping
    }

    /// `None` for callbacks without outputs.
    pub fn outputs_grouping(&self) -> Option<&Grouping<PropRef>> {
        self.0.outputs_grouping.as_ref()
    }

    pub fn using_outputs_grouping(&self) -> bool {
        self.0.using_outputs_grouping
    }

    pub fn is_background(&self) -> bool {
        self.0.background
    }

    /// Sets props on any component, merged with earlier calls for the same
    /// component.
    pub fn set_props(&self, component_id: impl Into<ComponentId>, props: Map<String, Value>) {
        let id = component_id.into().stringify();
        if let Some(hook) = &self.0.set_props_hook {
            hook(&id, &props);
        }
        self.0.updated_props.lock().entry(id).or_default().extend(props);
    }

    pub fn updated_props(&self) -> PropUpdates {
        self.0.updated_props.lock().clone()
    }

    /// Records a server-timing entry. Names must be unique per dispatch.
    pub fn record_timing(&self, name: impl Into<String>, duration: Duration, description: Option<&str>) -> Result<(), ContextError> {
        let name = name.into();
        let mut timing = self.0.timing.lock();
        if timing.contains_key(&name) {
            return Err(ContextError::DuplicateTiming(name));
        }
        timing.insert(
            name,
            TimingEntry {
                dur: Some((duration.as_secs_f64() * 1000.0).round() as u64),
                desc: description.map(str::to_string),
            },
        );
        Ok(())
    }

    pub fn timing_information(&self) -> IndexMap<String, TimingEntry> {
        self.0.timing.lock().clone()
    }

    /// `Server-Timing` header values, one per entry.
    pub fn server_timing_headers(&self) -> Vec<String> {
        self.0
            .timing
            .lock()
            .iter()
            .map(|(name, entry)| {
                let mut value = name.clone();
                if let Some(desc) = &entry.desc {
                    value.push_str(&format!(";desc=\"{desc}\""));
                }
                if let Some(dur) = entry.dur {
                    value.push_str(&format!(";dur={dur}"));
                }
                value
            })
            .collect()
    }

    pub fn response(&self) -> MutexGuard<'_, ResponseHandle> {
        self.0.response.lock()
    }

    /// Runs `fut` with this context installed for the task.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        TASK_CONTEXT.scope(self, fut).await
    }

    fn ptr(&self) -> *const ContextState {
        Arc::as_ptr(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Ambient access
// ----------------------------------------------------------------------------

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<CallbackContext>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_CONTEXT: CallbackContext;
}

/// Installs a context on the current thread until dropped.
pub struct ContextGuard {
    ptr: *const ContextState,
}

impl ContextGuard {
    pub fn enter(context: CallbackContext) -> Self {
        let ptr = context.ptr();
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(context));
        Self { ptr }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            if let Some(context) = popped {
                debug_assert_eq!(
                    context.ptr(),
                    self.ptr,
                    "ContextGuard mismatch: guards must drop in reverse order"
                );
            }
        });
    }
}

/// The context of the callback currently running on this task or thread.
pub fn callback_context() -> Result<CallbackContext, ContextError> {
    current().ok_or(ContextError::MissingCallbackContext("callback_context"))
}

fn current() -> Option<CallbackContext> {
    TASK_CONTEXT
        .try_with(Clone::clone)
        .ok()
        .or_else(|| CONTEXT_STACK.with(|stack| stack.borrow().last().cloned()))
}

/// Sets props on a component from inside a callback.
pub fn set_props(component_id: impl Into<ComponentId>, props: Map<String, Value>) -> Result<(), ContextError> {
    let context = current().ok_or(ContextError::MissingCallbackContext("set_props"))?;
    context.set_props(component_id, props);
    Ok(())
}
