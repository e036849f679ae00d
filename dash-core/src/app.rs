//! Application
//!
//! [`App`] owns everything one app instance needs: its configuration, its
//! callback registry, its page registry and the default background manager.
//! Nothing is process-wide, so several apps can live side by side.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::background::BackgroundManager;
use crate::callback::{
    no_update, Args, CallbackFn, CallbackHandler, CallbackRegistration, CallbackRegistry, CallbackResult, CallbackSpec,
    DispatchReply, DispatchRequest, Dispatcher,
};
use crate::config::AppConfig;
use crate::context::set_props;
use crate::dependency::{ClientsideFunction, Input, Output};
use crate::error::{CallbackError, ConfigError, DispatchError, PageError, RegistrationError};
use crate::pages::{Page, PageOptions, PageRegistry, Route};

/// Component id of the location component pages routing listens to.
pub const PAGES_LOCATION_ID: &str = "_pages_location";
/// Component id whose children receive the page layout.
pub const PAGES_CONTENT_ID: &str = "_pages_content";
/// Component id of the store receiving page metadata.
pub const PAGES_STORE_ID: &str = "_pages_store";

/// A Dash application.
///
/// ```rust,ignore
/// let app = App::new(AppConfig::default())?;
/// app.callback(
///     CallbackSpec::new()
///         .output(Output::new("out", "children"))
///         .input(Input::new("in", "value")),
///     |args| Ok(args.value(0)),
/// )?;
/// let reply = app.dispatch(DispatchRequest::new("out.children").input("in", "value", json!("hi")))?;
/// ```
#[derive(Debug)]
pub struct App {
    config: Arc<AppConfig>,
    registry: Arc<RwLock<CallbackRegistry>>,
    dispatcher: Dispatcher,
    pages: PageRegistry,
    background_manager: RwLock<Option<Arc<dyn BackgroundManager>>>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let registry = Arc::new(RwLock::new(CallbackRegistry::new()));
        debug!(title = %config.title, use_pages = config.use_pages, "created app");
        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry), Arc::clone(&config)),
            pages: PageRegistry::new(Arc::clone(&config)),
            config,
            registry,
            background_manager: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Manager used by background callbacks that do not name their own.
    pub fn set_background_manager(&self, manager: Arc<dyn BackgroundManager>) {
        *self.background_manager.write() = Some(manager);
    }

    pub fn with_background_manager(self, manager: Arc<dyn BackgroundManager>) -> Self {
        self.set_background_manager(manager);
        self
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Registers a server-side callback.
    pub fn callback<F>(&self, spec: CallbackSpec, f: F) -> Result<Arc<CallbackRegistration>, RegistrationError>
    where
        F: Fn(Args) -> CallbackResult + Send + Sync + 'static,
    {
        self.register_callback(spec, CallbackFn::sync(f))
    }

    /// Registers an async server-side callback.
    pub fn callback_async<F, Fut>(&self, spec: CallbackSpec, f: F) -> Result<Arc<CallbackRegistration>, RegistrationError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.register_callback(spec, CallbackFn::from_async(f))
    }

    pub fn register_callback(
        &self,
        mut spec: CallbackSpec,
        function: CallbackFn,
    ) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        if let Some(background) = spec.background.as_mut() {
            if background.manager.is_none() {
                background.manager = self.background_manager.read().clone();
            }
        }
        self.registry
            .write()
            .register(spec, CallbackHandler::Server(function), &self.config)
    }

    /// Registers a callback that runs in the browser.
    pub fn clientside_callback(
        &self,
        function: ClientsideFunction,
        spec: CallbackSpec,
    ) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        self.registry
            .write()
            .register(spec, CallbackHandler::Clientside(function), &self.config)
    }

    /// Registers inline JavaScript as a clientside callback.
    pub fn clientside_inline(&self, source: &str, spec: CallbackSpec) -> Result<Arc<CallbackRegistration>, RegistrationError> {
        self.registry
            .write()
            .register_inline_clientside(source, spec, &self.config)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// A handle for dispatching from other threads or tasks.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReply, DispatchError> {
        self.dispatcher.dispatch(request)
    }

    pub async fn dispatch_async(&self, request: DispatchRequest) -> Result<DispatchReply, DispatchError> {
        self.dispatcher.dispatch_async(request).await
    }

    /// The `_dash-dependencies` listing.
    pub fn dependencies(&self) -> Value {
        self.registry.read().dependencies(&self.config)
    }

    pub fn inline_scripts(&self) -> Vec<String> {
        self.registry.read().inline_scripts().to_vec()
    }

    /// Callback ids that run, in order, when `changed` prop ids change.
    pub fn execution_order(&self, changed: &[String]) -> Vec<String> {
        self.registry.read().graph().execution_order(changed)
    }

    pub fn callback_count(&self) -> usize {
        self.registry.read().len()
    }

    // ------------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------------

    pub fn pages(&self) -> &PageRegistry {
        &self.pages
    }

    pub fn register_page(&self, options: PageOptions) -> Result<Page, PageError> {
        if !self.config.use_pages {
            return Err(PageError::PagesDisabled);
        }
        self.pages.register_page(options)
    }

    /// Registers the routing callback: location changes render the matching
    /// page into the content container and its title into the store.
    /// Redirects are pushed back to the location component.
    pub fn enable_pages(&self) -> Result<Arc<CallbackRegistration>, PageError> {
        if !self.config.use_pages {
            return Err(PageError::PagesDisabled);
        }
        let pages = self.pages.clone();
        let spec = CallbackSpec::new()
            .output(Output::new(PAGES_CONTENT_ID, "children"))
            .output(Output::new(PAGES_STORE_ID, "data"))
            .input(Input::new(PAGES_LOCATION_ID, "pathname"))
            .input(Input::new(PAGES_LOCATION_ID, "search"))
            .prevent_initial_call(true);
        let registration = self.callback(spec, move |args| {
            let pathname: Option<String> = args.get(0)?;
            let search: Option<String> = args.get(1)?;
            let route = pages
                .resolve(pathname.as_deref().unwrap_or("/"), search.as_deref().unwrap_or_default())
                .map_err(CallbackError::failed)?;
            match route {
                Route::Page { layout, title, .. } => Ok(json!([layout, { "title": title }])),
                Route::Redirect(location) => {
                    let mut props = Map::new();
                    props.insert("pathname".into(), Value::String(location));
                    set_props(PAGES_LOCATION_ID, props).map_err(CallbackError::failed)?;
                    Ok(json!([no_update(), no_update()]))
                }
            }
        })?;
        debug!(callback = %registration.id, "enabled pages routing");
        Ok(registration)
    }
}
