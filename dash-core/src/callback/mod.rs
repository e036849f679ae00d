//! Callbacks
//!
//! A callback is a function from the current values of some component
//! properties (inputs and state) to new values for others (outputs).
//!
//! - [`args`]: declaring what a callback reads and writes
//! - [`registry`]: the registered callbacks, validated at registration
//! - [`dispatch`]: running one callback for one request
//! - [`wire`]: request and response bodies
//!
//! User functions are [`CallbackFn`]s. They take [`Args`] (the input and
//! state values regrouped into the declared shape) and return JSON, or
//! [`CallbackError::PreventUpdate`] to leave every output alone.

pub mod args;
pub mod dispatch;
pub mod registry;
pub mod wire;

pub use args::{callback_id, compute_input_state_indices, dict, list, split_callback_id, Arg, CallbackArgs, CallbackSpec, NormalizedArgs};
pub use dispatch::Dispatcher;
pub use registry::{CallbackHandler, CallbackRegistration, CallbackRegistry};
pub use wire::{
    CallbackUpdate, DispatchReply, DispatchRequest, DispatchResponse, InputSlot, JobStarted, OutputSlot, PendingUpdate,
    PropRef, PropUpdates, PropValue,
};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

use crate::background::{JobScope, ProgressSink};
use crate::context::{CallbackContext, ContextGuard};
use crate::error::CallbackError;
use crate::grouping::Grouping;

/// What a callback function returns.
pub type CallbackResult = Result<Value, CallbackError>;

type SyncFn = dyn Fn(Args) -> CallbackResult + Send + Sync;
type AsyncFn = dyn Fn(Args) -> BoxFuture<'static, CallbackResult> + Send + Sync;

// ----------------------------------------------------------------------------
// No update
// ----------------------------------------------------------------------------

const NO_UPDATE: &str = "_dash_no_update";

/// Placeholder for an output the callback leaves unchanged. Usable for a
/// whole return value or any single leaf of it.
pub fn no_update() -> Value {
    json!({ "_dash_no_update": "_dash_no_update" })
}

pub fn is_no_update(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.len() == 1 && obj.get(NO_UPDATE).and_then(Value::as_str) == Some(NO_UPDATE))
}

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

/// Arguments handed to a callback function.
///
/// Inputs declared positionally (a lone dependency or a list) are read with
/// [`value`](Self::value) / [`get`](Self::get); inputs declared as a dict
/// are read by key with [`kwarg_value`](Self::kwarg_value) /
/// [`get_kw`](Self::get_kw).
#[derive(Clone)]
pub struct Args {
    grouping: Grouping<Value>,
    progress: Option<ProgressSink>,
    job: Option<JobScope>,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("grouping", &self.grouping)
            .field("progress", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

impl Args {
    pub fn new(grouping: Grouping<Value>) -> Self {
        Self {
            grouping,
            progress: None,
            job: None,
        }
    }

    pub(crate) fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub(crate) fn with_job(mut self, scope: JobScope) -> Self {
        self.job = Some(scope);
        self
    }

    pub fn grouping(&self) -> &Grouping<Value> {
        &self.grouping
    }

    pub fn into_grouping(self) -> Grouping<Value> {
        self.grouping
    }

    /// Inputs were declared as a dict.
    pub fn is_keyword(&self) -> bool {
        matches!(self.grouping, Grouping::Mapping(_))
    }

    /// Number of positional or keyword arguments.
    pub fn len(&self) -> usize {
        match &self.grouping {
            Grouping::Scalar(_) => 1,
            Grouping::Sequence(items) => items.len(),
            Grouping::Mapping(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn positional(&self, index: usize) -> Option<&Grouping<Value>> {
        match &self.grouping {
            Grouping::Scalar(_) if index == 0 => Some(&self.grouping),
            Grouping::Sequence(items) => items.get(index),
            _ => None,
        }
    }

    /// The `index`-th positional argument as JSON, `null` when absent.
    pub fn value(&self, index: usize) -> Value {
        self.positional(index).map_or(Value::Null, Grouping::to_value)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Grouping<Value>> {
        self.grouping.as_mapping().and_then(|m| m.get(key))
    }

    pub fn kwarg_value(&self, key: &str) -> Value {
        self.kwarg(key).map_or(Value::Null, Grouping::to_value)
    }

    /// Deserializes the `index`-th positional argument.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, CallbackError> {
        serde_json::from_value(self.value(index))
            .map_err(|e| CallbackError::failed(anyhow::anyhow!("argument {index}: {e}")))
    }

    /// Deserializes the keyword argument `key`.
    pub fn get_kw<T: DeserializeOwned>(&self, key: &str) -> Result<T, CallbackError> {
        serde_json::from_value(self.kwarg_value(key))
            .map_err(|e| CallbackError::failed(anyhow::anyhow!("argument `{key}`: {e}")))
    }

    /// Every argument as one JSON value: a list for positional arguments, an
    /// object for keyword ones.
    pub fn to_value(&self) -> Value {
        match &self.grouping {
            Grouping::Scalar(value) => Value::Array(vec![value.clone()]),
            other => other.to_value(),
        }
    }

    /// Reports progress from a background callback declaring progress
    /// outputs. A non-list value stands for a single progress output.
    pub fn set_progress(&self, value: Value) -> Result<(), CallbackError> {
        match &self.progress {
            Some(sink) => {
                sink(value);
                Ok(())
            }
            None => Err(CallbackError::failed(anyhow::anyhow!(
                "set_progress is only available in background callbacks declaring progress outputs"
            ))),
        }
    }

    /// The running background job, for spawning cancellable child processes.
    pub fn job(&self) -> Option<&JobScope> {
        self.job.as_ref()
    }
}

// ----------------------------------------------------------------------------
// Callback functions
// ----------------------------------------------------------------------------

/// A user callback function, sync or async.
#[derive(Clone)]
pub enum CallbackFn {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl fmt::Debug for CallbackFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("CallbackFn::Sync"),
            Self::Async(_) => f.write_str("CallbackFn::Async"),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum InvokeError {
    #[error("async callback invoked from inside a running tokio runtime")]
    AsyncInRuntime,

    #[error("could not start a runtime for an async callback: {0}")]
    Runtime(#[from] std::io::Error),
}

impl CallbackFn {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Args) -> CallbackResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |args| f(args).boxed()))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    /// Runs the function on the current thread with `context` installed.
    ///
    /// Async functions get a private current-thread runtime, which tokio
    /// refuses to nest: calling this for one from inside a runtime fails
    /// with [`InvokeError::AsyncInRuntime`].
    pub(crate) fn invoke_blocking(&self, args: Args, context: &CallbackContext) -> Result<CallbackResult, InvokeError> {
        match self {
            Self::Sync(f) => {
                let _guard = ContextGuard::enter(context.clone());
                Ok(f(args))
            }
            Self::Async(f) => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    return Err(InvokeError::AsyncInRuntime);
                }
                let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
                Ok(runtime.block_on(context.clone().scope(f(args))))
            }
        }
    }

    /// Runs the function from async code. Sync functions move to the
    /// blocking pool; a panic there comes back as a failure.
    pub(crate) async fn invoke_async(&self, args: Args, context: &CallbackContext) -> CallbackResult {
        match self {
            Self::Sync(f) => {
                let f = Arc::clone(f);
                let context = context.clone();
                tokio::task::spawn_blocking(move || {
                    let _guard = ContextGuard::enter(context);
                    f(args)
                })
                .await
                .unwrap_or_else(|e| Err(CallbackError::failed(anyhow::anyhow!("callback task failed: {e}"))))
            }
            Self::Async(f) => context.clone().scope(f(args)).await,
        }
    }
}
