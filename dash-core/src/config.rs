//! Application Configuration
//!
//! [`AppConfig`] is owned by the [`App`](crate::App) instance; nothing in
//! the crate reads configuration from a global. Values come from, in order
//! of precedence: explicit assignments by the caller, `DASH_*` environment
//! variables ([`AppConfig::from_env`]), then the defaults below.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::error::ConfigError;

/// Whether a callback fires when its inputs first appear in the layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PreventInitialCall {
    #[default]
    No,
    Yes,
    /// Fire on load even though outputs are shared with `allow_duplicate`.
    InitialDuplicate,
}

impl PreventInitialCall {
    /// What goes into the dependencies listing: only `Yes` suppresses the
    /// initial call.
    pub fn prevents(self) -> bool {
        self == Self::Yes
    }

    /// Parses the textual forms accepted in environment variables.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Self::Yes),
            "false" | "0" | "no" => Some(Self::No),
            "initial_duplicate" => Some(Self::InitialDuplicate),
            _ => None,
        }
    }
}

impl From<bool> for PreventInitialCall {
    fn from(b: bool) -> Self {
        if b {
            Self::Yes
        } else {
            Self::No
        }
    }
}

impl Serialize for PreventInitialCall {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::No => serializer.serialize_bool(false),
            Self::Yes => serializer.serialize_bool(true),
            Self::InitialDuplicate => serializer.serialize_str("initial_duplicate"),
        }
    }
}

impl<'de> Deserialize<'de> for PreventInitialCall {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PreventVisitor;

        impl Visitor<'_> for PreventVisitor {
            type Value = PreventInitialCall;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a bool or \"initial_duplicate\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(v.into())
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "initial_duplicate" => Ok(PreventInitialCall::InitialDuplicate),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(PreventVisitor)
    }
}

/// Configuration for an [`App`](crate::App).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default page title.
    pub title: String,
    /// Prefix the browser uses for requests.
    pub requests_pathname_prefix: String,
    /// Prefix the server routes under.
    pub routes_pathname_prefix: String,
    /// Default for callbacks registered without an explicit value.
    pub prevent_initial_callbacks: PreventInitialCall,
    /// Skip layout-dependent validation of callbacks.
    pub suppress_callback_exceptions: bool,
    /// Enable the page registry and the routing callback.
    pub use_pages: bool,
    /// Folder (and module prefix) page modules live in.
    pub pages_folder: String,
    /// Emit `Server-Timing` headers for `record_timing` entries.
    pub server_timing: bool,
    /// Default background callback poll interval, in milliseconds.
    pub background_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Dash".to_string(),
            requests_pathname_prefix: "/".to_string(),
            routes_pathname_prefix: "/".to_string(),
            prevent_initial_callbacks: PreventInitialCall::No,
            suppress_callback_exceptions: false,
            use_pages: false,
            pages_folder: "pages".to_string(),
            server_timing: false,
            background_interval_ms: 1000,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with `DASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(title) = get("DASH_TITLE") {
            config.title = title;
        }
        // The base pathname sets both prefixes; the specific ones win.
        if let Some(base) = get("DASH_URL_BASE_PATHNAME") {
            config.requests_pathname_prefix = base.clone();
            config.routes_pathname_prefix = base;
        }
        if let Some(prefix) = get("DASH_REQUESTS_PATHNAME_PREFIX") {
            config.requests_pathname_prefix = prefix;
        }
        if let Some(prefix) = get("DASH_ROUTES_PATHNAME_PREFIX") {
            config.routes_pathname_prefix = prefix;
        }
        if let Some(value) = get("DASH_PREVENT_INITIAL_CALLBACKS") {
            config.prevent_initial_callbacks = PreventInitialCall::parse(&value).ok_or_else(|| {
                ConfigError::InvalidConfig(format!("DASH_PREVENT_INITIAL_CALLBACKS: unrecognised value {value:?}"))
            })?;
        }
        if let Some(value) = get("DASH_SUPPRESS_CALLBACK_EXCEPTIONS") {
            config.suppress_callback_exceptions = parse_flag("DASH_SUPPRESS_CALLBACK_EXCEPTIONS", &value)?;
        }
        if let Some(value) = get("DASH_USE_PAGES") {
            config.use_pages = parse_flag("DASH_USE_PAGES", &value)?;
        }
        if let Some(folder) = get("DASH_PAGES_FOLDER") {
            config.pages_folder = folder;
        }
        if let Some(value) = get("DASH_SERVER_TIMING") {
            config.server_timing = parse_flag("DASH_SERVER_TIMING", &value)?;
        }
        if let Some(value) = get("DASH_BACKGROUND_INTERVAL_MS") {
            config.background_interval_ms = value.trim().parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("DASH_BACKGROUND_INTERVAL_MS: expected an integer, got {value:?}"))
            })?;
        }

        config.validate()?;
        debug!(?config, "loaded configuration");
        Ok(config)
    }

    /// Checks prefixes are wrapped in `/` and the poll interval is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, prefix) in [
            ("requests_pathname_prefix", &self.requests_pathname_prefix),
            ("routes_pathname_prefix", &self.routes_pathname_prefix),
        ] {
            if !prefix.starts_with('/') || !prefix.ends_with('/') {
                return Err(ConfigError::InvalidConfig(format!(
                    "`{name}` needs to start and end with `/`, got {prefix:?}"
                )));
            }
        }
        if self.background_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "`background_interval_ms` must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidConfig(format!(
            "{name}: expected a boolean, got {value:?}"
        ))),
    }
}
