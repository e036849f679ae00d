//! Dispatcher
//!
//! Runs one callback for one request:
//!
//! 1. look the callback up by id and refuse clientside ones
//! 2. build the [`CallbackContext`] from the request slots
//! 3. regroup the flat input and state values into the declared shape
//! 4. call the function with the context installed
//! 5. validate the return value against the declared outputs and flatten
//!    it into per-component prop updates
//!
//! Background callbacks replace step 4 with launching a job, or with
//! polling a launched one when the request carries a cache key.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::registry::{CallbackHandler, CallbackRegistration, CallbackRegistry};
use super::wire::{
    CallbackUpdate, DispatchReply, DispatchRequest, DispatchResponse, InputSlot, JobStarted, OutputSlot, PendingUpdate,
    PropRef, PropUpdates,
};
use super::{is_no_update, Args, CallbackFn, CallbackResult, InvokeError};
use crate::background::{BackgroundManager, BackgroundOptions, JobId};
use crate::config::AppConfig;
use crate::context::CallbackContext;
use crate::dependency::Dependency;
use crate::error::{CallbackError, ContextError, DispatchError, InvalidCallbackReturnValue};
use crate::grouping::{flatten_grouping, Grouping};

const SERVER_TIMING_TOTAL: &str = "__dash_server";

/// A request resolved against its registration, ready to run.
struct Invocation {
    registration: Arc<CallbackRegistration>,
    context: CallbackContext,
    args: Grouping<Value>,
    started: Instant,
}

/// Routes dispatch requests to registered callbacks.
///
/// Cloning is cheap; clones share the registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<CallbackRegistry>>,
    config: Arc<AppConfig>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RwLock<CallbackRegistry>>, config: Arc<AppConfig>) -> Self {
        Self { registry, config }
    }

    /// Dispatches on the calling thread. Async callbacks get a private
    /// runtime, so this must not be called from inside one for them; use
    /// [`dispatch_async`](Self::dispatch_async) there.
    pub fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReply, DispatchError> {
        let span = debug_span!("dispatch", callback = %request.output);
        let _enter = span.enter();

        let invocation = self.prepare(&request)?;
        let registration = Arc::clone(&invocation.registration);
        let CallbackHandler::Server(function) = &registration.handler else {
            return Err(DispatchError::ClientsideCallback(registration.id.clone()));
        };
        if let Some(options) = &registration.background {
            return self.run_background(&invocation, &request, function, options);
        }

        let result = function
            .invoke_blocking(Args::new(invocation.args.clone()), &invocation.context)
            .map_err(|e| match e {
                InvokeError::AsyncInRuntime => DispatchError::AsyncInBlockingDispatch(registration.id.clone()),
                InvokeError::Runtime(err) => DispatchError::Runtime {
                    callback: registration.id.clone(),
                    reason: err.to_string(),
                },
            })?;
        self.finish(&invocation, result)
    }

    /// Dispatches from async code. Sync callbacks run on the blocking pool.
    pub async fn dispatch_async(&self, request: DispatchRequest) -> Result<DispatchReply, DispatchError> {
        let span = debug_span!("dispatch", callback = %request.output);
        async move {
            let invocation = self.prepare(&request)?;
            let registration = Arc::clone(&invocation.registration);
            let CallbackHandler::Server(function) = &registration.handler else {
                return Err(DispatchError::ClientsideCallback(registration.id.clone()));
            };
            if let Some(options) = &registration.background {
                return self.run_background(&invocation, &request, function, options);
            }

            let result = function
                .invoke_async(Args::new(invocation.args.clone()), &invocation.context)
                .await;
            self.finish(&invocation, result)
        }
        .instrument(span)
        .await
    }

    fn lookup(&self, id: &str) -> Result<Arc<CallbackRegistration>, DispatchError> {
        self.registry
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::CallbackNotFound(id.to_string()))
    }

    fn prepare(&self, request: &DispatchRequest) -> Result<Invocation, DispatchError> {
        let started = Instant::now();
        let registration = self.lookup(&request.output)?;
        let malformed = |reason: String| DispatchError::MalformedRequest {
            callback: registration.id.clone(),
            reason,
        };

        if request.inputs.len() != registration.flat_inputs.len() {
            return Err(malformed(format!(
                "expected {} inputs, received {}",
                registration.flat_inputs.len(),
                request.inputs.len()
            )));
        }
        if request.state.len() != registration.flat_state.len() {
            return Err(malformed(format!(
                "expected {} state values, received {}",
                registration.flat_state.len(),
                request.state.len()
            )));
        }

        let outputs = if registration.no_output {
            Vec::new()
        } else {
            request
                .resolve_outputs(registration.multi, &registration.flat_outputs)
                .map_err(malformed)?
        };

        let values: Vec<Value> = request.inputs.iter().chain(&request.state).map(InputSlot::value).collect();
        let args = registration
            .input_state_indices
            .map(|&i| values.get(i).cloned().unwrap_or(Value::Null));

        let context = CallbackContext::builder(registration.id.clone())
            .inputs(request.inputs.clone())
            .state(request.state.clone())
            .outputs(outputs)
            .changed(request.changed_prop_ids.clone())
            .input_state_indices(registration.input_state_indices.clone())
            .outputs_indices(registration.outputs_indices.clone())
            .build()
            .map_err(malformed)?;

        debug!(
            triggered = ?request.changed_prop_ids,
            background = registration.background.is_some(),
            "dispatching callback"
        );
        Ok(Invocation {
            registration,
            context,
            args,
            started,
        })
    }

    /// Turns what the callback returned into a reply.
    fn finish(&self, invocation: &Invocation, result: CallbackResult) -> Result<DispatchReply, DispatchError> {
        let registration = &invocation.registration;
        let response = match result {
            Ok(value) => build_response(registration, invocation.context.outputs_list(), value)?,
            Err(CallbackError::PreventUpdate) => {
                debug!("callback prevented update");
                PropUpdates::new()
            }
            Err(CallbackError::Failed(source)) => {
                return Err(DispatchError::Callback {
                    callback: registration.id.clone(),
                    source,
                })
            }
        };
        let side_update = invocation.context.updated_props();

        let mut reply = if response.is_empty() && side_update.is_empty() {
            DispatchReply::no_update()
        } else {
            DispatchReply::ok(DispatchResponse::Update(CallbackUpdate {
                multi: registration.multi,
                response,
                side_update: (!side_update.is_empty()).then_some(side_update),
                progress: None,
            }))
        };
        self.apply_response_handle(invocation, &mut reply);
        Ok(reply)
    }

    fn apply_response_handle(&self, invocation: &Invocation, reply: &mut DispatchReply) {
        let context = &invocation.context;
        {
            let handle = context.response();
            if let Some(status) = handle.status {
                reply.status = status;
            }
            reply.headers.extend(handle.headers.iter().cloned());
        }

        if self.config.server_timing {
            match context.record_timing(SERVER_TIMING_TOTAL, invocation.started.elapsed(), None) {
                Ok(()) | Err(ContextError::DuplicateTiming(_)) => {}
                Err(e) => warn!(error = %e, "could not record dispatch timing"),
            }
            reply.headers.extend(
                context
                    .server_timing_headers()
                    .into_iter()
                    .map(|value| ("Server-Timing".to_string(), value)),
            );
        }
    }

    // ------------------------------------------------------------------------
    // Background callbacks
    // ------------------------------------------------------------------------

    fn run_background(
        &self,
        invocation: &Invocation,
        request: &DispatchRequest,
        function: &CallbackFn,
        options: &BackgroundOptions,
    ) -> Result<DispatchReply, DispatchError> {
        let registration = &invocation.registration;
        let Some(manager) = options.manager.as_ref() else {
            return Err(DispatchError::Runtime {
                callback: registration.id.clone(),
                reason: "no background manager is installed".into(),
            });
        };

        if !request.cancel_job.is_empty() {
            for job in &request.cancel_job {
                manager.terminate_job(job);
            }
            debug!(jobs = ?request.cancel_job, "cancelled background jobs");
            return Ok(DispatchReply::no_update());
        }

        for job in &request.old_job {
            manager.terminate_job(job);
        }

        match &request.cache_key {
            Some(key) => self.poll_job(invocation, &**manager, options, key, request.job.as_ref()),
            None => {
                let fn_key = options.cache_key_name.as_deref().unwrap_or(&registration.id);
                let triggered: &[String] = if options.cache_ignore_triggered {
                    &[]
                } else {
                    &request.changed_prop_ids
                };
                let key = manager.build_cache_key(
                    fn_key,
                    &Args::new(invocation.args.clone()).to_value(),
                    &options.cache_args_to_ignore,
                    triggered,
                );
                if manager.cache_by().is_some() && manager.result_ready(&key)? {
                    debug!(key = %key, "reusing cached background result");
                    return self.poll_job(invocation, &**manager, options, &key, None);
                }
                self.launch_job(invocation, &**manager, options, function, key)
            }
        }
    }

    fn launch_job(
        &self,
        invocation: &Invocation,
        manager: &dyn BackgroundManager,
        options: &BackgroundOptions,
        function: &CallbackFn,
        key: String,
    ) -> Result<DispatchReply, DispatchError> {
        let job_fn = manager.make_job_fn(function.clone(), !options.progress.is_empty());
        let job = manager.call_job_fn(&key, job_fn, invocation.args.clone(), invocation.context.clone())?;

        let cancel = (!options.cancel.is_empty()).then(|| options.cancel.iter().map(Dependency::to_dict).collect());
        let progress_default = options.progress_default.as_ref().map(|defaults| {
            options
                .progress
                .iter()
                .map(Dependency::prop_id)
                .zip(defaults.iter().cloned())
                .collect::<IndexMap<_, _>>()
        });

        let mut reply = DispatchReply::ok(DispatchResponse::JobStarted(JobStarted {
            cache_key: key,
            job,
            cancel,
            progress_default,
        }));
        self.apply_response_handle(invocation, &mut reply);
        Ok(reply)
    }

    fn poll_job(
        &self,
        invocation: &Invocation,
        manager: &dyn BackgroundManager,
        options: &BackgroundOptions,
        key: &str,
        job: Option<&JobId>,
    ) -> Result<DispatchReply, DispatchError> {
        let registration = &invocation.registration;
        if let Some(job) = job {
            if manager.terminate_unhealthy_job(job) {
                debug!(job = %job, callback = %registration.id, "reaped finished background job");
            }
        }

        // Progress first: reading the result clears it.
        let progress = if options.progress.is_empty() {
            None
        } else {
            manager.get_progress(key)?.map(|progress| {
                let values = match progress {
                    Value::Array(values) => values,
                    other => vec![other],
                };
                options
                    .progress
                    .iter()
                    .map(Dependency::prop_id)
                    .zip(values)
                    .collect::<IndexMap<_, _>>()
            })
        };

        let mut result = manager.get_result(key, job)?;
        let running = job.is_some_and(|job| manager.job_running(job));
        if result.is_none() && !running {
            // The job may have stored its result between the two reads.
            result = manager.get_result(key, job)?;
        }
        let side_update = manager.get_updated_props(key)?;
        let side_update = (!side_update.is_empty()).then_some(side_update);

        let value = match result {
            Some(value) => {
                if running {
                    if let Some(job) = job {
                        manager.terminate_job(job);
                    }
                }
                value
            }
            None if running => {
                trace!(key, "background job still running");
                let mut reply = DispatchReply::ok(DispatchResponse::Pending(PendingUpdate { progress, side_update }));
                self.apply_response_handle(invocation, &mut reply);
                return Ok(reply);
            }
            None => {
                debug!(key, "background job ended without a result");
                super::no_update()
            }
        };

        if let Some(error) = value.get("long_callback_error") {
            let field = |name: &str| error.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
            return Err(DispatchError::BackgroundCallback {
                msg: field("msg"),
                traceback: field("tb"),
            });
        }

        let response = build_response(registration, invocation.context.outputs_list(), value)?;
        let mut reply = if response.is_empty() && side_update.is_none() && progress.is_none() {
            DispatchReply::no_update()
        } else {
            DispatchReply::ok(DispatchResponse::Update(CallbackUpdate {
                multi: registration.multi,
                response,
                side_update,
                progress,
            }))
        };
        self.apply_response_handle(invocation, &mut reply);
        Ok(reply)
    }
}

// ----------------------------------------------------------------------------
// Return values
// ----------------------------------------------------------------------------

/// Validates a callback's return value against its outputs and flattens it
/// into `{component id: {property: value}}`. No-update leaves are dropped.
pub(crate) fn build_response(
    registration: &CallbackRegistration,
    outputs: &[OutputSlot],
    value: Value,
) -> Result<PropUpdates, InvalidCallbackReturnValue> {
    let callback = &registration.id;
    if registration.no_output {
        if !value.is_null() && !is_no_update(&value) {
            return Err(InvalidCallbackReturnValue::NoOutputReturnedValue {
                callback: callback.clone(),
                received: value,
            });
        }
        return Ok(PropUpdates::new());
    }
    if is_no_update(&value) {
        return Ok(PropUpdates::new());
    }

    let flat = if registration.multi {
        if let Grouping::Sequence(declared) = &registration.outputs {
            match &value {
                Value::Array(items) if items.len() != declared.len() => {
                    return Err(InvalidCallbackReturnValue::OutputCount {
                        callback: callback.clone(),
                        expected: declared.len(),
                        received: items.len(),
                    })
                }
                Value::Array(_) => {}
                _ => {
                    return Err(InvalidCallbackReturnValue::NotMulti {
                        callback: callback.clone(),
                        received: value,
                    })
                }
            }
        }
        flatten_grouping(&value, &registration.outputs)?
    } else {
        vec![value]
    };

    let mut response = PropUpdates::new();
    for (index, (slot, value)) in outputs.iter().zip(flat).enumerate() {
        match slot {
            OutputSlot::Single(prop) => push_update(&mut response, prop, value),
            OutputSlot::Wildcard(props) => {
                if is_no_update(&value) {
                    continue;
                }
                let values = match value {
                    Value::Array(values) => values,
                    other => {
                        return Err(InvalidCallbackReturnValue::WildcardNotList {
                            callback: callback.clone(),
                            index,
                            received: other,
                        })
                    }
                };
                if values.len() != props.len() {
                    return Err(InvalidCallbackReturnValue::WildcardCount {
                        callback: callback.clone(),
                        index,
                        expected: props.len(),
                        received: values.len(),
                    });
                }
                for (prop, value) in props.iter().zip(values) {
                    push_update(&mut response, prop, value);
                }
            }
        }
    }
    Ok(response)
}

fn push_update(response: &mut PropUpdates, prop: &PropRef, value: Value) {
    if is_no_update(&value) {
        return;
    }
    trace!(prop = %prop.prop_id(), "output updated");
    response
        .entry(prop.id.stringify())
        .or_default()
        .insert(prop.clean_property().to_string(), value);
}
