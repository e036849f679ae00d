//! Dash Core
//!
//! This crate provides the callback engine of the Dash web framework.
//! It implements:
//!
//! - Grouping of nested (list / dict / scalar) dependency declarations
//! - Dependency descriptors with pattern-matching component ids
//! - Callback registration, validation and dispatch
//! - Per-invocation execution context
//! - Background (long-running) callbacks behind pluggable managers
//! - A page registry for multi-page apps
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `grouping`: nested shapes and flatten/rebuild over them
//! - `dependency`: `Output`, `Input`, `State`, wildcards and matching
//! - `callback`: registry, dispatcher and wire shapes
//! - `context`: the ambient [`CallbackContext`] of a running callback
//! - `graph`: how callbacks feed each other, cycle detection and ordering
//! - `background`: job managers and result stores
//! - `pages`: URL path to layout routing
//! - `app`: the [`App`] object owning all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use dash_core::{App, AppConfig, CallbackSpec, DispatchRequest, Input, Output};
//! use serde_json::json;
//!
//! let app = App::new(AppConfig::default())?;
//!
//! // Echo the input box into a div
//! app.callback(
//!     CallbackSpec::new()
//!         .output(Output::new("out", "children"))
//!         .input(Input::new("in", "value")),
//!     |args| Ok(args.value(0)),
//! )?;
//!
//! // What the renderer sends when the input changes
//! let reply = app.dispatch(
//!     DispatchRequest::new("out.children")
//!         .input("in", "value", json!("hello"))
//!         .changed("in.value"),
//! )?;
//! // reply.body: {"multi": false, "response": {"out": {"children": "hello"}}}
//! ```

pub mod app;
pub mod background;
pub mod callback;
pub mod config;
pub mod context;
pub mod dependency;
pub mod error;
pub mod graph;
pub mod grouping;
pub mod pages;

pub use app::App;
pub use background::{BackgroundManager, BackgroundOptions, JobId, ManagerOptions, MemoryBackend, ResultStore};
pub use callback::{
    is_no_update, no_update, Args, CallbackFn, CallbackResult, CallbackSpec, DispatchReply, DispatchRequest,
    DispatchResponse, Dispatcher,
};
pub use config::{AppConfig, PreventInitialCall};
pub use context::{callback_context, set_props, CallbackContext};
pub use dependency::{ClientsideFunction, ComponentId, Dependency, IdValue, Input, Output, State, Wildcard, ALL, ALLSMALLER, MATCH};
pub use error::{CallbackError, DispatchError, RegistrationError};
pub use grouping::Grouping;
pub use pages::{PageOptions, PageRegistry, Route};

/// Installs a `tracing` subscriber printing to stderr, filtered by
/// `RUST_LOG` (default `dash_core=info`). Does nothing if a global
/// subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dash_core=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
