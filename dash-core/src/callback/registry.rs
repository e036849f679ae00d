//! Callback Registry
//!
//! Registered callbacks, keyed by callback id in registration order.
//! Everything that can be checked without a request is checked in
//! [`CallbackRegistry::register`], so a bad declaration fails where it is
//! written and never at first dispatch:
//!
//! 1. argument shape and dependency types ([`CallbackArgs::normalize`])
//! 2. per-dependency validity (wildcards allowed for the slot, id syntax)
//! 3. duplicate callback ids
//! 4. `allow_duplicate` outputs need `prevent_initial_call`
//! 5. outputs already written by another callback
//! 6. cycles between distinct callbacks
//! 7. background callbacks need a manager

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::debug;

use super::args::{callback_id, CallbackArgs, CallbackSpec};
use super::CallbackFn;
use crate::background::BackgroundOptions;
use crate::config::{AppConfig, PreventInitialCall};
use crate::dependency::{ClientsideFunction, Dependency};
use crate::error::RegistrationError;
use crate::graph::{CallbackGraph, NodeKind};
use crate::grouping::{make_grouping_by_index, Grouping};

/// Namespace inline clientside functions are registered under.
pub const INLINE_CLIENTSIDE_NAMESPACE: &str = "_dashprivate_clientside_funcs";

/// What runs when a callback fires.
#[derive(Debug, Clone)]
pub enum CallbackHandler {
    Server(CallbackFn),
    Clientside(ClientsideFunction),
}

/// One registered callback.
#[derive(Debug, Clone)]
pub struct CallbackRegistration {
    pub id: String,
    pub outputs: Grouping<Dependency>,
    pub flat_outputs: Vec<Dependency>,
    pub flat_inputs: Vec<Dependency>,
    pub flat_state: Vec<Dependency>,
    /// Declared input shape; leaves index `flat_inputs ++ flat_state`.
    pub input_state_indices: Grouping<usize>,
    /// Declared output shape; leaves index `flat_outputs`.
    pub outputs_indices: Grouping<usize>,
    pub multi: bool,
    pub no_output: bool,
    pub prevent_initial_call: PreventInitialCall,
    pub handler: CallbackHandler,
    pub background: Option<BackgroundOptions>,
}

impl CallbackRegistration {
    pub fn is_clientside(&self) -> bool {
        matches!(self.handler, CallbackHandler::Clientside(_))
    }

    /// Entry of the dependencies listing the renderer loads.
    pub fn to_dependency_spec(&self, config: &AppConfig) -> Value {
        let join = |deps: &[Dependency]| deps.iter().map(Dependency::to_dict).collect::<Vec<_>>();
        let mut spec = json!({
            "output": self.id,
            "inputs": join(&self.flat_inputs),
            "state": join(&self.flat_state),
            "clientside_function": match &self.handler {
                CallbackHandler::Clientside(f) => json!({"namespace": f.namespace, "function_name": f.function_name}),
                CallbackHandler::Server(_) => Value::Null,
            },
            "prevent_initial_call": self.prevent_initial_call.prevents(),
            "no_output": self.no_output,
        });
        if let Some(background) = &self.background {
            let interval = background
                .interval
                .map_or(config.background_interval_ms, |d| d.as_millis() as u64);
            let mut options = json!({ "interval": interval });
            if !background.progress.is_empty() {
                options["progress"] = json!(background.progress.iter().map(Dependency::prop_id).collect::<Vec<_>>());
            }
            if !background.cancel.is_empty() {
                options["cancel"] = json!(join(&background.cancel));
            }
            spec["background"] = options;
            if !background.running.is_empty() {
                spec["running"] = json!(background
                    .running
                    .iter()
                    .map(|r| json!([r.output.prop_id(), r.during, r.after]))
                    .collect::<Vec<_>>());
            }
        }
        spec
    }
}

/// Every callback of an app.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    callbacks: IndexMap<String, Arc<CallbackRegistration>>,
    graph: CallbackGraph,
    inline_scripts: Vec<String>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<CallbackRegistration>> {
        self.callbacks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CallbackRegistration>> {
        self.callbacks.values()
    }

    pub fn graph(&self) -> &CallbackGraph {
        &self.graph
    }

    /// Validates and stores a callback.
    pub fn register(
        &mut self,
        spec: CallbackSpec,
        handler: CallbackHandler,
        config: &AppConfig,
    ) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        let CallbackSpec { args, background } = spec;
        self.register_args(args, background, handler, config)
    }

    fn register_args(
        &mut self,
        args: CallbackArgs,
        background: Option<BackgroundOptions>,
        handler: CallbackHandler,
        config: &AppConfig,
    ) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        let normalized = args.normalize()?;
        let id = callback_id(&normalized.outputs, &normalized.flat_inputs, normalized.no_output);

        if self.callbacks.contains_key(&id) {
            return Err(RegistrationError::DuplicateCallback(id));
        }

        validate_duplicate_outputs(&normalized.flat_outputs, normalized.prevent_initial_call, config)?;
        self.validate_overlapping_outputs(&id, &normalized.flat_outputs)?;

        if let Some(background) = &background {
            if background.manager.is_none() {
                return Err(RegistrationError::MissingBackgroundManager);
            }
            for dep in background.progress.iter().chain(&background.cancel) {
                dep.validate()?;
            }
        }

        let kind = match (&handler, &background) {
            (CallbackHandler::Clientside(_), _) => NodeKind::Clientside,
            (CallbackHandler::Server(_), Some(_)) => NodeKind::Background,
            (CallbackHandler::Server(_), None) => NodeKind::Server,
        };
        self.graph.add_callback(
            kind,
            id.clone(),
            normalized.flat_outputs.clone(),
            normalized.flat_inputs.clone(),
        );
        if let Some((callback, other)) = self.graph.find_cycle() {
            self.graph.remove_callback(&id);
            return Err(RegistrationError::CircularDependency { callback, other });
        }

        let outputs_indices = make_grouping_by_index(&normalized.outputs, (0..normalized.flat_outputs.len()).collect())?;
        let registration = Arc::new(CallbackRegistration {
            id: id.clone(),
            outputs: normalized.outputs,
            flat_outputs: normalized.flat_outputs,
            flat_inputs: normalized.flat_inputs,
            flat_state: normalized.flat_state,
            input_state_indices: normalized.input_state_indices,
            outputs_indices,
            multi: normalized.multi,
            no_output: normalized.no_output,
            prevent_initial_call: normalized
                .prevent_initial_call
                .unwrap_or(config.prevent_initial_callbacks),
            handler,
            background,
        });
        debug!(
            callback = %id,
            inputs = registration.flat_inputs.len(),
            state = registration.flat_state.len(),
            multi = registration.multi,
            background = registration.background.is_some(),
            "registered callback"
        );
        self.callbacks.insert(id, Arc::clone(&registration));
        Ok(registration)
    }

    fn validate_overlapping_outputs(&self, id: &str, outputs: &[Dependency]) -> Result<(), RegistrationError> {
        // One callback never writes the same prop twice, allow_duplicate or not.
        for (i, output) in outputs.iter().enumerate() {
            if outputs[..i].iter().any(|earlier| earlier.matches(output)) {
                return Err(RegistrationError::DuplicateOutput {
                    output: output.to_string(),
                    existing: id.to_string(),
                });
            }
        }
        for output in outputs {
            for existing in self.callbacks.values() {
                let clash = existing
                    .flat_outputs
                    .iter()
                    .any(|other| other.matches(output) && !(other.allow_duplicate && output.allow_duplicate));
                if clash {
                    return Err(RegistrationError::DuplicateOutput {
                        output: output.to_string(),
                        existing: existing.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Registers inline JavaScript as a clientside callback. The function
    /// is named after the hash of its source.
    pub fn register_inline_clientside(
        &mut self,
        source: &str,
        spec: CallbackSpec,
        config: &AppConfig,
    ) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        let function_name = format!("_{}", blake3::hash(source.as_bytes()).to_hex());
        let function = ClientsideFunction::new(INLINE_CLIENTSIDE_NAMESPACE, function_name.clone());
        let registration = self.register(spec, CallbackHandler::Clientside(function), config)?;
        self.inline_scripts.push(format!(
            "var clientside = window.dash_clientside = window.dash_clientside || {{}};\n\
             var ns = clientside[\"{INLINE_CLIENTSIDE_NAMESPACE}\"] = clientside[\"{INLINE_CLIENTSIDE_NAMESPACE}\"] || {{}};\n\
             ns[\"{function_name}\"] = {source};"
        ));
        Ok(registration)
    }

    pub fn inline_scripts(&self) -> &[String] {
        &self.inline_scripts
    }

    /// The `_dash-dependencies` listing.
    pub fn dependencies(&self, config: &AppConfig) -> Value {
        Value::Array(self.callbacks.values().map(|r| r.to_dependency_spec(config)).collect())
    }
}

fn validate_duplicate_outputs(
    outputs: &[Dependency],
    prevent_initial_call: Option<PreventInitialCall>,
    config: &AppConfig,
) -> Result<(), RegistrationError> {
    let initial_duplicate = PreventInitialCall::InitialDuplicate;
    if prevent_initial_call == Some(initial_duplicate) || config.prevent_initial_callbacks == initial_duplicate {
        return Ok(());
    }
    let prevented = prevent_initial_call.is_some_and(PreventInitialCall::prevents) || config.prevent_initial_callbacks.prevents();
    if !prevented && outputs.iter().any(|o| o.allow_duplicate) {
        return Err(RegistrationError::DuplicateWithoutPreventInitialCall);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{BackgroundManager, MemoryBackend, ResultStore};
    use crate::callback::args::list;
    use crate::dependency::{ComponentId, IdValue, Input, Output, State, ALL, ALLSMALLER, MATCH};

    fn noop() -> CallbackHandler {
        CallbackHandler::Server(CallbackFn::sync(|_| Ok(Value::Null)))
    }

    fn simple(out: &str, input: &str) -> CallbackSpec {
        CallbackSpec::new()
            .output(Output::new(out, "children"))
            .input(Input::new(input, "value"))
    }

    #[test]
    fn registers_in_order() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        registry.register(simple("b", "x"), noop(), &config).unwrap();
        registry.register(simple("a", "x"), noop(), &config).unwrap();
        let ids: Vec<&str> = registry.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b.children", "a.children"]);
        assert!(registry.get("a.children").is_some());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        registry.register(simple("out", "x"), noop(), &config).unwrap();
        let err = registry.register(simple("out", "y"), noop(), &config).unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateCallback("out.children".into()));
    }

    #[test]
    fn overlapping_outputs_are_rejected() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let row = |i: IdValue| ComponentId::dict([("type", IdValue::from("row")), ("index", i)]);
        registry
            .register(
                CallbackSpec::new().output(Output::new(row(ALL.into()), "children")).input(Input::new("x", "value")),
                noop(),
                &config,
            )
            .unwrap();
        let err = registry
            .register(
                CallbackSpec::new()
                    .output(Output::new(row(IdValue::from(1_i64)), "children"))
                    .input(Input::new("y", "value")),
                noop(),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateOutput { .. }));
    }

    #[test]
    fn same_output_twice_in_one_callback_is_rejected() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let err = registry
            .register(
                CallbackSpec::new()
                    .output(Output::new("a", "x"))
                    .output(Output::new("a", "x"))
                    .input(Input::new("in", "value")),
                noop(),
                &config,
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::DuplicateOutput {
                output: "a.x".into(),
                existing: "..a.x...a.x..".into(),
            }
        );
        assert!(registry.get("..a.x...a.x..").is_none());

        // allow_duplicate only covers other callbacks.
        let config = AppConfig {
            prevent_initial_callbacks: PreventInitialCall::InitialDuplicate,
            ..AppConfig::default()
        };
        let err = registry
            .register(
                CallbackSpec::new()
                    .output(Output::duplicate("b", "x"))
                    .output(Output::duplicate("b", "x"))
                    .input(Input::new("in", "value")),
                noop(),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateOutput { .. }));
    }

    #[test]
    fn allow_duplicate_needs_prevent_initial_call() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let dup = |input: &str| {
            CallbackSpec::new()
                .output(Output::duplicate("out", "children"))
                .input(Input::new(input, "value"))
        };
        assert_eq!(
            registry.register(dup("a"), noop(), &config).unwrap_err(),
            RegistrationError::DuplicateWithoutPreventInitialCall
        );
        let first = registry.register(dup("a").prevent_initial_call(true), noop(), &config).unwrap();
        let second = registry
            .register(dup("b").prevent_initial_call(PreventInitialCall::InitialDuplicate), noop(), &config)
            .unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id.starts_with("out.children@"));
    }

    #[test]
    fn config_initial_duplicate_allows_duplicates() {
        let config = AppConfig {
            prevent_initial_callbacks: PreventInitialCall::InitialDuplicate,
            ..AppConfig::default()
        };
        let mut registry = CallbackRegistry::new();
        let spec = CallbackSpec::new()
            .output(Output::duplicate("out", "children"))
            .input(Input::new("a", "value"));
        let registration = registry.register(spec, noop(), &config).unwrap();
        assert_eq!(registration.prevent_initial_call, PreventInitialCall::InitialDuplicate);
    }

    #[test]
    fn cycles_are_rejected() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        registry
            .register(
                CallbackSpec::new().output(Output::new("b", "value")).input(Input::new("a", "value")),
                noop(),
                &config,
            )
            .unwrap();
        let err = registry
            .register(
                CallbackSpec::new().output(Output::new("a", "value")).input(Input::new("b", "value")),
                noop(),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::CircularDependency { .. }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.graph().node_count(), 1);
    }

    #[test]
    fn disallowed_wildcards_fail_at_registration() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let id = ComponentId::dict([("index", IdValue::from(ALLSMALLER))]);
        let err = registry
            .register(
                CallbackSpec::new().output(Output::new(id, "children")).input(Input::new("x", "value")),
                noop(),
                &config,
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::WildcardNotAllowed { .. }));
    }

    #[test]
    fn background_needs_manager() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let err = registry
            .register(simple("out", "x").background(BackgroundOptions::new()), noop(), &config)
            .unwrap_err();
        assert_eq!(err, RegistrationError::MissingBackgroundManager);
    }

    #[test]
    fn dependencies_listing() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let row = ComponentId::dict([("type", IdValue::from("row")), ("index", IdValue::from(MATCH))]);
        registry
            .register(
                CallbackSpec::new()
                    .outputs(list([Output::new("a", "children"), Output::new(row.clone(), "children")]))
                    .input(Input::new(row, "value"))
                    .state(State::new("s", "data"))
                    .prevent_initial_call(true),
                noop(),
                &config,
            )
            .unwrap();
        let listing = registry.dependencies(&config);
        let entry = &listing[0];
        assert_eq!(entry["output"], json!("..a.children...{\"index\":[\"MATCH\"],\"type\":\"row\"}.children.."));
        assert_eq!(entry["inputs"][0]["property"], json!("value"));
        assert_eq!(entry["state"], json!([{"id": "s", "property": "data"}]));
        assert_eq!(entry["prevent_initial_call"], json!(true));
        assert_eq!(entry["clientside_function"], Value::Null);
        assert!(entry.get("background").is_none());
    }

    #[test]
    fn background_listing_carries_interval() {
        #[derive(Debug)]
        struct Idle(Arc<MemoryBackend>, crate::background::ManagerOptions);
        impl BackgroundManager for Idle {
            fn store(&self) -> Arc<dyn ResultStore> {
                self.0.clone()
            }
            fn options(&self) -> &crate::background::ManagerOptions {
                &self.1
            }
            fn call_job_fn(
                &self,
                _: &str,
                _: crate::background::JobFn,
                _: Grouping<Value>,
                _: crate::context::CallbackContext,
            ) -> Result<crate::background::JobId, crate::error::ManagerError> {
                Ok("1".into())
            }
            fn job_running(&self, _: &crate::background::JobId) -> bool {
                false
            }
            fn terminate_job(&self, _: &crate::background::JobId) {}
            fn terminate_unhealthy_job(&self, _: &crate::background::JobId) -> bool {
                false
            }
        }

        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let options = BackgroundOptions::new()
            .manager(Arc::new(Idle(Arc::new(MemoryBackend::new()), Default::default())))
            .progress(Output::new("bar", "value"))
            .running(Output::new("btn", "disabled"), json!(true), json!(false))
            .cancel(Input::new("stop", "n_clicks"));
        registry
            .register(simple("out", "x").background(options), noop(), &config)
            .unwrap();
        let entry = &registry.dependencies(&config)[0];
        assert_eq!(entry["background"]["interval"], json!(1000));
        assert_eq!(entry["background"]["progress"], json!(["bar.value"]));
        assert_eq!(entry["background"]["cancel"], json!([{"id": "stop", "property": "n_clicks"}]));
        assert_eq!(entry["running"], json!([["btn.disabled", true, false]]));
    }

    #[test]
    fn inline_clientside_is_named_by_hash() {
        let config = AppConfig::default();
        let mut registry = CallbackRegistry::new();
        let source = "function(x) { return x; }";
        let registration = registry
            .register_inline_clientside(source, simple("out", "x"), &config)
            .unwrap();
        assert!(registration.is_clientside());
        let expected = format!("_{}", blake3::hash(source.as_bytes()).to_hex());
        let entry = &registry.dependencies(&config)[0];
        assert_eq!(entry["clientside_function"]["namespace"], json!(INLINE_CLIENTSIDE_NAMESPACE));
        assert_eq!(entry["clientside_function"]["function_name"], json!(expected));
        assert_eq!(registry.inline_scripts().len(), 1);
        assert!(registry.inline_scripts()[0].contains(source));
    }
}
