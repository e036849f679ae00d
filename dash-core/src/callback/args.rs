//! Registration Arguments
//!
//! A callback can be declared in several equivalent ways: outputs, inputs
//! and state given positionally (optionally wrapped in lists, the older
//! style), given as keyword groupings, or any nesting of lists and dicts in
//! between. [`CallbackArgs::normalize`] reduces all of them to one shape:
//!
//! - the output grouping (a lone output is unwrapped unless it was
//!   explicitly wrapped in a list),
//! - flat input and state lists,
//! - `input_state_indices`: a grouping shaped like the declared inputs whose
//!   leaves index into `flat_inputs ++ flat_state`.
//!
//! [`CallbackSpec`] is the builder most callers use; it always produces the
//! keyword form.

use std::collections::VecDeque;
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::trace;

use crate::background::BackgroundOptions;
use crate::config::PreventInitialCall;
use crate::dependency::{Dependency, DependencyKind};
use crate::error::RegistrationError;
use crate::grouping::{make_grouping_by_index, Grouping};

/// One leaf of a registration grouping, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Dependency(Dependency),
    /// A bare boolean; trailing position means `prevent_initial_call`.
    Flag(bool),
    /// Anything else. Always rejected, but reported with its value.
    Literal(Value),
}

impl Arg {
    fn dependency(&self) -> Option<&Dependency> {
        match self {
            Self::Dependency(dep) => Some(dep),
            _ => None,
        }
    }

    fn is_kind(&self, kinds: &[DependencyKind]) -> bool {
        self.dependency().is_some_and(|dep| kinds.contains(&dep.kind))
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dependency(dep) => write!(f, "<{} `{}`>", dep.kind, dep),
            Self::Flag(b) => write!(f, "{b}"),
            Self::Literal(v) => write!(f, "{v}"),
        }
    }
}

impl From<Dependency> for Arg {
    fn from(dep: Dependency) -> Self {
        Self::Dependency(dep)
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Self::Flag(b)
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

impl From<Dependency> for Grouping<Arg> {
    fn from(dep: Dependency) -> Self {
        Grouping::Scalar(Arg::Dependency(dep))
    }
}

impl From<bool> for Grouping<Arg> {
    fn from(b: bool) -> Self {
        Grouping::Scalar(Arg::Flag(b))
    }
}

impl From<Grouping<Dependency>> for Grouping<Arg> {
    fn from(g: Grouping<Dependency>) -> Self {
        g.map(|dep| Arg::Dependency(dep.clone()))
    }
}

/// A list grouping of dependencies.
pub fn list<I>(deps: I) -> Grouping<Dependency>
where
    I: IntoIterator,
    I::Item: Into<Grouping<Dependency>>,
{
    Grouping::sequence(deps)
}

/// A dict grouping of dependencies, in the given key order.
pub fn dict<K, G, I>(entries: I) -> Grouping<Dependency>
where
    K: Into<String>,
    G: Into<Grouping<Dependency>>,
    I: IntoIterator<Item = (K, G)>,
{
    Grouping::mapping(entries)
}

fn all_leaves(g: &Grouping<Arg>, kinds: &[DependencyKind]) -> bool {
    g.flatten().into_iter().all(|arg| arg.is_kind(kinds))
}

/// Registration arguments as the caller supplied them.
#[derive(Debug, Clone, Default)]
pub struct CallbackArgs {
    pub positional: Vec<Grouping<Arg>>,
    pub output: Option<Grouping<Arg>>,
    pub inputs: Option<Grouping<Arg>>,
    pub state: Option<Grouping<Arg>>,
    pub prevent_initial_call: Option<PreventInitialCall>,
}

/// Registration arguments reduced to their canonical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedArgs {
    pub outputs: Grouping<Dependency>,
    pub flat_outputs: Vec<Dependency>,
    pub flat_inputs: Vec<Dependency>,
    pub flat_state: Vec<Dependency>,
    pub input_state_indices: Grouping<usize>,
    /// Outputs were declared as a list or dict rather than a lone output.
    pub multi: bool,
    pub no_output: bool,
    pub prevent_initial_call: Option<PreventInitialCall>,
}

impl CallbackArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, arg: impl Into<Grouping<Arg>>) -> Self {
        self.positional.push(arg.into());
        self
    }

    pub fn output_kw(mut self, output: impl Into<Grouping<Arg>>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn inputs_kw(mut self, inputs: impl Into<Grouping<Arg>>) -> Self {
        self.inputs = Some(inputs.into());
        self
    }

    pub fn state_kw(mut self, state: impl Into<Grouping<Arg>>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn prevent_initial_call(mut self, value: impl Into<PreventInitialCall>) -> Self {
        self.prevent_initial_call = Some(value.into());
        self
    }

    pub fn normalize(self) -> Result<NormalizedArgs, RegistrationError> {
        let Self {
            mut positional,
            output,
            inputs,
            state,
            mut prevent_initial_call,
        } = self;

        if prevent_initial_call.is_none() {
            if let Some(Grouping::Scalar(Arg::Flag(flag))) = positional.last() {
                prevent_initial_call = Some((*flag).into());
                positional.pop();
            }
        }

        let first_is_list = matches!(positional.first(), Some(Grouping::Sequence(_)));

        // Positional lists are unwrapped one level, for the older syntax
        // where outputs, inputs and state each came in their own list.
        let mut flat_args: VecDeque<Grouping<Arg>> = VecDeque::new();
        for arg in positional {
            match arg {
                Grouping::Sequence(items) => flat_args.extend(items),
                other => flat_args.push_back(other),
            }
        }

        let (outputs, explicit_list) = match output {
            Some(output) => {
                if let Some(bad) = output.flatten().into_iter().find(|a| !a.is_kind(&[DependencyKind::Output])) {
                    return Err(RegistrationError::IncorrectType {
                        expected: "an Output",
                        found: bad.to_string(),
                    });
                }
                let explicit = matches!(output, Grouping::Sequence(_));
                (output, explicit)
            }
            None => {
                let params = take_while_kinds(&mut flat_args, &[DependencyKind::Output]);
                (Grouping::Sequence(params), first_is_list)
            }
        };

        let outputs = match outputs {
            Grouping::Sequence(mut items) if items.len() == 1 && !explicit_list => items.remove(0),
            other => other,
        };

        let inputs_state = match inputs {
            Some(inputs) => merge_input_state(inputs, state)?,
            None if state.is_some() => return Err(RegistrationError::StateWithoutInputs),
            None => {
                let mut params = take_while_kinds(&mut flat_args, &[DependencyKind::Input, DependencyKind::State]);
                if params.len() == 1 {
                    params.remove(0)
                } else {
                    Grouping::Sequence(params)
                }
            }
        };

        let outputs: Grouping<Dependency> = outputs.try_map(|arg| match arg {
            Arg::Dependency(dep) if dep.is_output() => Ok(dep.clone()),
            other => Err(RegistrationError::IncorrectType {
                expected: "an Output",
                found: other.to_string(),
            }),
        })?;
        let inputs_state: Grouping<Dependency> = inputs_state.try_map(|arg| match arg {
            Arg::Dependency(dep) if !dep.is_output() => Ok(dep.clone()),
            other => Err(RegistrationError::IncorrectType {
                expected: "an Input or State",
                found: other.to_string(),
            }),
        })?;

        let flat_outputs: Vec<Dependency> = outputs.flatten().into_iter().cloned().collect();
        let (flat_inputs, flat_state, input_state_indices) = compute_input_state_indices(&inputs_state)?;

        if let Some(extra) = flat_args.front() {
            if let Grouping::Scalar(Arg::Dependency(_)) = extra {
                let after = flat_outputs
                    .iter()
                    .chain(&flat_inputs)
                    .chain(&flat_state)
                    .last()
                    .map(|dep| format!("<{} `{}`>", dep.kind, dep))
                    .unwrap_or_else(|| "(nothing)".to_string());
                return Err(RegistrationError::ArgumentOrder {
                    after,
                    next: extra.to_string(),
                });
            }
            return Err(RegistrationError::UnexpectedArgument(extra.to_string()));
        }

        for dep in flat_outputs.iter().chain(&flat_inputs).chain(&flat_state) {
            dep.validate()?;
        }

        let multi = !outputs.is_scalar();
        let no_output = multi && outputs.is_empty();
        trace!(
            outputs = flat_outputs.len(),
            inputs = flat_inputs.len(),
            state = flat_state.len(),
            multi,
            "normalized callback arguments"
        );

        Ok(NormalizedArgs {
            outputs,
            flat_outputs,
            flat_inputs,
            flat_state,
            input_state_indices,
            multi,
            no_output,
            prevent_initial_call,
        })
    }
}

fn take_while_kinds(args: &mut VecDeque<Grouping<Arg>>, kinds: &[DependencyKind]) -> Vec<Grouping<Arg>> {
    let mut params = Vec::new();
    while let Some(front) = args.front() {
        if !all_leaves(front, kinds) {
            break;
        }
        if let Some(front) = args.pop_front() {
            params.push(front);
        }
    }
    params
}

/// Treats a lone dependency as a one-element list and empty groupings as
/// absent, the way keyword arguments are read.
fn as_keyword_group(g: Grouping<Arg>) -> Option<Grouping<Arg>> {
    match g {
        Grouping::Scalar(Arg::Dependency(dep)) => Some(Grouping::Sequence(vec![Grouping::Scalar(Arg::Dependency(dep))])),
        Grouping::Sequence(items) if items.is_empty() => None,
        Grouping::Mapping(entries) if entries.is_empty() => None,
        other => Some(other),
    }
}

fn merge_input_state(inputs: Grouping<Arg>, state: Option<Grouping<Arg>>) -> Result<Grouping<Arg>, RegistrationError> {
    let inputs = match inputs {
        Grouping::Scalar(Arg::Dependency(dep)) => Grouping::Sequence(vec![Grouping::Scalar(Arg::Dependency(dep))]),
        other => other,
    };
    let state = state.and_then(as_keyword_group);

    match (inputs, state) {
        (Grouping::Mapping(inputs), None) => Ok(Grouping::Mapping(inputs)),
        (Grouping::Mapping(inputs), Some(Grouping::Mapping(state))) => {
            // State first; inputs override on shared keys.
            let mut merged: IndexMap<String, Grouping<Arg>> = state;
            for (key, value) in inputs {
                merged.insert(key, value);
            }
            Ok(Grouping::Mapping(merged))
        }
        (Grouping::Mapping(_), Some(_)) => Err(RegistrationError::MismatchedInputState { inputs: "dict" }),
        (Grouping::Sequence(inputs), None) => Ok(Grouping::Sequence(inputs)),
        (Grouping::Sequence(mut inputs), Some(Grouping::Sequence(state))) => {
            inputs.extend(state);
            Ok(Grouping::Sequence(inputs))
        }
        (Grouping::Sequence(_), Some(_)) => Err(RegistrationError::MismatchedInputState { inputs: "list" }),
        (scalar, _) => Err(RegistrationError::InvalidInputGrouping(scalar.to_string())),
    }
}

/// Splits a declared input/state grouping into flat inputs, flat state and
/// an index grouping of the same shape.
///
/// Inputs are numbered first, then state: in `[State a, Input b, State c]`
/// the indices are `[1, 0, 2]`.
pub fn compute_input_state_indices(
    grouping: &Grouping<Dependency>,
) -> Result<(Vec<Dependency>, Vec<Dependency>, Grouping<usize>), RegistrationError> {
    let flat = grouping.flatten();
    let flat_inputs: Vec<Dependency> = flat.iter().filter(|d| d.is_input()).map(|d| (*d).clone()).collect();
    let flat_state: Vec<Dependency> = flat.iter().filter(|d| !d.is_input()).map(|d| (*d).clone()).collect();

    let total_inputs = flat_inputs.len();
    let (mut input_count, mut state_count) = (0, 0);
    let indices: Vec<usize> = flat
        .iter()
        .map(|dep| {
            if dep.is_input() {
                input_count += 1;
                input_count - 1
            } else {
                state_count += 1;
                total_inputs + state_count - 1
            }
        })
        .collect();

    let grouping_indices = make_grouping_by_index(grouping, indices)?;
    Ok((flat_inputs, flat_state, grouping_indices))
}

// ----------------------------------------------------------------------------
// Callback ids
// ----------------------------------------------------------------------------

fn hash_inputs(flat_inputs: &[Dependency]) -> String {
    let joined = flat_inputs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}

/// Deterministic id of a callback, derived from its outputs.
///
/// A lone output gives `id.prop`; several give `..id1.prop1...id2.prop2..`.
/// Dots inside ids are escaped. Outputs declared with `allow_duplicate` get
/// `@<hash of inputs>` appended so several callbacks can share them, and a
/// callback without outputs is identified by that hash alone.
pub fn callback_id(outputs: &Grouping<Dependency>, flat_inputs: &[Dependency], no_output: bool) -> String {
    if no_output {
        return hash_inputs(flat_inputs);
    }

    let mut hashed: Option<String> = None;
    let mut concat = |dep: &Dependency| {
        let mut id = format!("{}.{}", dep.component_id_str().replace('.', "\\."), dep.component_property);
        if dep.allow_duplicate {
            let hash = hashed.get_or_insert_with(|| hash_inputs(flat_inputs));
            id.push('@');
            id.push_str(hash);
        }
        id
    };

    match outputs {
        Grouping::Scalar(dep) => concat(dep),
        multi => {
            let parts: Vec<String> = multi.flatten().into_iter().map(&mut concat).collect();
            format!("..{}..", parts.join("..."))
        }
    }
}

/// Splits a multi-output callback id back into its output prop ids.
pub fn split_callback_id(callback_id: &str) -> Vec<String> {
    match callback_id.strip_prefix("..").and_then(|s| s.strip_suffix("..")) {
        Some(inner) => inner.split("...").map(str::to_string).collect(),
        None => vec![callback_id.to_string()],
    }
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for callback registrations.
///
/// ```rust,ignore
/// let spec = CallbackSpec::new()
///     .output(Output::new("out", "children"))
///     .input(Input::new("in", "value"))
///     .state(State::new("store", "data"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CallbackSpec {
    pub(crate) args: CallbackArgs,
    pub(crate) background: Option<BackgroundOptions>,
}

impl CallbackSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one output. A second call turns the outputs into a list.
    pub fn output(mut self, dep: Dependency) -> Self {
        let leaf = Grouping::from(dep);
        self.args.output = Some(match self.args.output.take() {
            None => leaf,
            Some(Grouping::Sequence(mut items)) => {
                items.push(leaf);
                Grouping::Sequence(items)
            }
            Some(first) => Grouping::Sequence(vec![first, leaf]),
        });
        self
    }

    /// Sets the whole output grouping. A list grouping stays a list even
    /// with one element.
    pub fn outputs(mut self, outputs: impl Into<Grouping<Arg>>) -> Self {
        self.args.output = Some(outputs.into());
        self
    }

    pub fn input(mut self, dep: Dependency) -> Self {
        push_list(&mut self.args.inputs, dep);
        self
    }

    pub fn inputs(mut self, inputs: impl Into<Grouping<Arg>>) -> Self {
        self.args.inputs = Some(inputs.into());
        self
    }

    pub fn state(mut self, dep: Dependency) -> Self {
        push_list(&mut self.args.state, dep);
        self
    }

    pub fn states(mut self, state: impl Into<Grouping<Arg>>) -> Self {
        self.args.state = Some(state.into());
        self
    }

    pub fn prevent_initial_call(mut self, value: impl Into<PreventInitialCall>) -> Self {
        self.args.prevent_initial_call = Some(value.into());
        self
    }

    pub fn background(mut self, options: BackgroundOptions) -> Self {
        self.background = Some(options);
        self
    }

    pub fn into_args(self) -> CallbackArgs {
        self.args
    }
}

fn push_list(slot: &mut Option<Grouping<Arg>>, dep: Dependency) {
    let leaf = Grouping::from(dep);
    *slot = Some(match slot.take() {
        Some(Grouping::Sequence(mut items)) => {
            items.push(leaf);
            Grouping::Sequence(items)
        }
        None => Grouping::Sequence(vec![leaf]),
        Some(other) => Grouping::Sequence(vec![other, leaf]),
    });
}

impl From<CallbackArgs> for CallbackSpec {
    fn from(args: CallbackArgs) -> Self {
        Self { args, background: None }
    }
}
