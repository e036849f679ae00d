//! Background Callbacks
//!
//! A background callback runs outside the request that triggered it. The
//! first request launches a job and returns where to poll; later requests
//! poll until the result lands in a [`ResultStore`].
//!
//! # Keys
//!
//! Everything a job produces lives under its cache key:
//!
//! - `<key>`: the return value, the no-update marker, or an error record
//!   `{"long_callback_error": {"msg", "tb"}}`
//! - `<key>-progress`: the latest `set_progress` value, cleared on read
//! - `<key>-set_props`: props pushed with `set_props`, cleared on read
//!
//! # Backends
//!
//! [`BackgroundManager`] is the capability interface; the store-level
//! operations have default implementations so a backend only decides how
//! jobs run and stop:
//!
//! - [`DiskCacheManager`] (feature `diskcache`): worker threads, results in
//!   a directory of MessagePack files
//! - [`TaskQueueManager`] (feature `task-queue`): tokio tasks, results in
//!   the queue's result backend

#[cfg(feature = "diskcache")]
mod disk;
mod job;
#[cfg(feature = "task-queue")]
mod queue;
mod store;

#[cfg(feature = "diskcache")]
pub use disk::{DiskCache, DiskCacheManager};
pub use job::{JobFn, JobOutcome, JobScope};
#[cfg(feature = "task-queue")]
pub use queue::{TaskQueue, TaskQueueManager, TaskStatus};
pub use store::{MemoryBackend, ResultStore};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::trace;

use crate::callback::wire::PropUpdates;
use crate::context::CallbackContext;
use crate::dependency::Dependency;
use crate::error::ManagerError;
use crate::grouping::Grouping;

/// Zero-argument function whose output becomes part of every cache key.
pub type CacheBy = Arc<dyn Fn() -> Value + Send + Sync>;

/// Receives `set_progress` values inside a job.
pub type ProgressSink = Arc<dyn Fn(Value) + Send + Sync>;

/// Opaque handle of a launched job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Settings shared by every manager backend.
#[derive(Clone, Default)]
pub struct ManagerOptions {
    /// `None` means results are deleted once delivered; `Some` (even empty)
    /// keeps them so identical calls reuse them.
    pub cache_by: Option<Vec<CacheBy>>,
    /// Lifetime of stored entries. `None` keeps them until deleted.
    pub expire: Option<Duration>,
}

impl ManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_by<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.cache_by.get_or_insert_with(Vec::new).push(Arc::new(f));
        self
    }

    /// Keeps results without any key contributor.
    pub fn keep_results(mut self) -> Self {
        self.cache_by.get_or_insert_with(Vec::new);
        self
    }

    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("cache_by", &self.cache_by.as_ref().map(Vec::len))
            .field("expire", &self.expire)
            .finish()
    }
}

fn progress_key(key: &str) -> String {
    format!("{key}-progress")
}

fn set_props_key(key: &str) -> String {
    format!("{key}-set_props")
}

/// Pluggable executor for background callbacks.
pub trait BackgroundManager: Send + Sync + fmt::Debug {
    /// Where results, progress and side updates are kept.
    fn store(&self) -> Arc<dyn ResultStore>;

    fn options(&self) -> &ManagerOptions;

    /// Launches `job_fn` with the regrouped arguments and a context forked
    /// from the triggering request.
    fn call_job_fn(
        &self,
        key: &str,
        job_fn: JobFn,
        args: Grouping<Value>,
        context: CallbackContext,
    ) -> Result<JobId, ManagerError>;

    fn job_running(&self, job: &JobId) -> bool;

    /// Stops a job. Unknown or finished jobs are a no-op.
    fn terminate_job(&self, job: &JobId);

    /// Reaps a job whose worker died without being cleaned up. Returns
    /// whether anything was reaped.
    fn terminate_unhealthy_job(&self, job: &JobId) -> bool;

    fn cache_by(&self) -> Option<&[CacheBy]> {
        self.options().cache_by.as_deref()
    }

    fn expire(&self) -> Option<Duration> {
        self.options().expire
    }

    /// Wraps a callback function into a job.
    fn make_job_fn(&self, callback: crate::callback::CallbackFn, progress: bool) -> JobFn {
        JobFn::new(callback, progress)
    }

    /// Latest progress value, cleared once read.
    fn get_progress(&self, key: &str) -> Result<Option<Value>, ManagerError> {
        let store = self.store();
        let key = progress_key(key);
        let progress = store.get(&key)?;
        if progress.is_some() {
            store.delete(&key)?;
        }
        Ok(progress)
    }

    fn result_ready(&self, key: &str) -> Result<bool, ManagerError> {
        Ok(self.store().get(key)?.is_some())
    }

    /// Takes the stored result. Without `cache_by` the entry is deleted,
    /// otherwise its expiry is refreshed. Pending progress is dropped and
    /// `job`, if given, terminated.
    fn get_result(&self, key: &str, job: Option<&JobId>) -> Result<Option<Value>, ManagerError> {
        let store = self.store();
        let Some(result) = store.get(key)? else {
            return Ok(None);
        };
        if self.cache_by().is_none() {
            self.clear_cache_entry(key)?;
        } else if let Some(expire) = self.expire() {
            store.touch(key, Some(expire))?;
        }
        self.clear_cache_entry(&progress_key(key))?;
        if let Some(job) = job {
            self.terminate_job(job);
        }
        Ok(Some(result))
    }

    /// Props set with `set_props` since the last read.
    fn get_updated_props(&self, key: &str) -> Result<PropUpdates, ManagerError> {
        let store = self.store();
        let key = set_props_key(key);
        let Some(value) = store.get(&key)? else {
            return Ok(PropUpdates::new());
        };
        self.clear_cache_entry(&key)?;
        Ok(match value {
            Value::Object(entries) => entries
                .into_iter()
                .filter_map(|(id, props)| match props {
                    Value::Object(props) => Some((id, props)),
                    _ => None,
                })
                .collect(),
            _ => PropUpdates::new(),
        })
    }

    /// Hash identifying one call: the function key, the arguments minus
    /// ignored ones, the triggered prop ids and every `cache_by` output.
    fn build_cache_key(&self, fn_key: &str, args: &Value, ignore: &[IgnoredArg], triggered: &[String]) -> String {
        let args = match args {
            Value::Object(entries) => Value::Object(
                entries
                    .iter()
                    .filter(|(k, _)| !ignore.iter().any(|i| matches!(i, IgnoredArg::Key(key) if key == *k)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| !ignore.contains(&IgnoredArg::Index(*i)))
                    .map(|(_, v)| v.clone())
                    .collect(),
            ),
            other => other.clone(),
        };

        let mut hash_input = Map::new();
        hash_input.insert("args".into(), args);
        hash_input.insert("fn".into(), json!(fn_key));
        hash_input.insert("triggered".into(), json!(triggered));
        if let Some(cache_by) = self.cache_by() {
            for (i, key_fn) in cache_by.iter().enumerate() {
                hash_input.insert(format!("cache_key_{i}"), key_fn());
            }
        }
        let key = blake3::hash(Value::Object(hash_input).to_string().as_bytes())
            .to_hex()
            .to_string();
        trace!(fn_key, key = %key, "built cache key");
        key
    }

    fn clear_cache_entry(&self, key: &str) -> Result<(), ManagerError> {
        self.store().delete(key)
    }
}

/// An argument left out of the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoredArg {
    /// Positional argument index.
    Index(usize),
    /// Keyword argument name.
    Key(String),
}

/// A prop set while the job runs and reset when it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningProp {
    pub output: Dependency,
    pub during: Value,
    pub after: Value,
}

/// Registration options of a background callback.
#[derive(Debug, Clone)]
pub struct BackgroundOptions {
    /// Falls back to the app's default manager when unset.
    pub manager: Option<Arc<dyn BackgroundManager>>,
    /// Poll interval; the app default when unset.
    pub interval: Option<Duration>,
    pub progress: Vec<Dependency>,
    pub progress_default: Option<Vec<Value>>,
    pub running: Vec<RunningProp>,
    /// Inputs that cancel the running job when they fire.
    pub cancel: Vec<Dependency>,
    pub cache_args_to_ignore: Vec<IgnoredArg>,
    pub cache_ignore_triggered: bool,
    /// Stable function identity for cache keys; the callback id when unset.
    pub cache_key_name: Option<String>,
}

impl Default for BackgroundOptions {
    fn default() -> Self {
        Self {
            manager: None,
            interval: None,
            progress: Vec::new(),
            progress_default: None,
            running: Vec::new(),
            cancel: Vec::new(),
            cache_args_to_ignore: Vec::new(),
            cache_ignore_triggered: true,
            cache_key_name: None,
        }
    }
}

impl BackgroundOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(mut self, manager: Arc<dyn BackgroundManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn progress(mut self, output: Dependency) -> Self {
        self.progress.push(output);
        self
    }

    pub fn progress_default(mut self, values: Vec<Value>) -> Self {
        self.progress_default = Some(values);
        self
    }

    pub fn running(mut self, output: Dependency, during: Value, after: Value) -> Self {
        self.running.push(RunningProp { output, during, after });
        self
    }

    pub fn cancel(mut self, input: Dependency) -> Self {
        self.cancel.push(input);
        self
    }

    pub fn ignore_arg(mut self, arg: IgnoredArg) -> Self {
        self.cache_args_to_ignore.push(arg);
        self
    }

    pub fn cache_ignore_triggered(mut self, ignore: bool) -> Self {
        self.cache_ignore_triggered = ignore;
        self
    }

    pub fn cache_key_name(mut self, name: impl Into<String>) -> Self {
        self.cache_key_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manager that never runs anything, for exercising the defaults.
    #[derive(Debug)]
    struct StoreOnly {
        store: Arc<MemoryBackend>,
        options: ManagerOptions,
    }

    impl StoreOnly {
        fn new(options: ManagerOptions) -> Self {
            Self {
                store: Arc::new(MemoryBackend::new()),
                options,
            }
        }
    }

    impl BackgroundManager for StoreOnly {
        fn store(&self) -> Arc<dyn ResultStore> {
            self.store.clone()
        }

        fn options(&self) -> &ManagerOptions {
            &self.options
        }

        fn call_job_fn(&self, _: &str, _: JobFn, _: Grouping<Value>, _: CallbackContext) -> Result<JobId, ManagerError> {
            Ok(JobId::from("0"))
        }

        fn job_running(&self, _: &JobId) -> bool {
            false
        }

        fn terminate_job(&self, _: &JobId) {}

        fn terminate_unhealthy_job(&self, _: &JobId) -> bool {
            false
        }
    }

    #[test]
    fn cache_key_is_stable_and_sensitive() {
        let manager = StoreOnly::new(ManagerOptions::new());
        let a = manager.build_cache_key("f", &json!([1, 2]), &[], &[]);
        assert_eq!(a, manager.build_cache_key("f", &json!([1, 2]), &[], &[]));
        assert_ne!(a, manager.build_cache_key("g", &json!([1, 2]), &[], &[]));
        assert_ne!(a, manager.build_cache_key("f", &json!([1, 3]), &[], &[]));
        assert_ne!(a, manager.build_cache_key("f", &json!([1, 2]), &[], &["x.value".to_string()]));
    }

    #[test]
    fn ignored_args_do_not_change_the_key() {
        let manager = StoreOnly::new(ManagerOptions::new());
        let ignore = [IgnoredArg::Index(1)];
        assert_eq!(
            manager.build_cache_key("f", &json!([1, "a"]), &ignore, &[]),
            manager.build_cache_key("f", &json!([1, "b"]), &ignore, &[])
        );
        let ignore = [IgnoredArg::Key("n".into())];
        assert_eq!(
            manager.build_cache_key("f", &json!({"x": 1, "n": 1}), &ignore, &[]),
            manager.build_cache_key("f", &json!({"x": 1, "n": 2}), &ignore, &[])
        );
    }

    #[test]
    fn cache_by_contributes_to_key() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = counter.clone();
        let manager = StoreOnly::new(ManagerOptions::new().cache_by(move || json!(seen.load(Ordering::SeqCst))));
        let first = manager.build_cache_key("f", &json!([]), &[], &[]);
        assert_eq!(first, manager.build_cache_key("f", &json!([]), &[], &[]));
        counter.store(1, Ordering::SeqCst);
        assert_ne!(first, manager.build_cache_key("f", &json!([]), &[], &[]));
    }

    #[test]
    fn results_are_deleted_without_cache_by() {
        let manager = StoreOnly::new(ManagerOptions::new());
        manager.store.set("k", json!(1), None).unwrap();
        manager.store.set("k-progress", json!([50]), None).unwrap();
        assert!(manager.result_ready("k").unwrap());
        assert_eq!(manager.get_result("k", None).unwrap(), Some(json!(1)));
        assert!(!manager.result_ready("k").unwrap());
        assert_eq!(manager.get_progress("k").unwrap(), None);
        assert_eq!(manager.get_result("k", None).unwrap(), None);
    }

    #[test]
    fn results_are_kept_with_cache_by() {
        let manager = StoreOnly::new(ManagerOptions::new().keep_results());
        manager.store.set("k", json!("v"), None).unwrap();
        assert_eq!(manager.get_result("k", None).unwrap(), Some(json!("v")));
        assert_eq!(manager.get_result("k", None).unwrap(), Some(json!("v")));
    }

    #[test]
    fn progress_and_props_are_read_once() {
        let manager = StoreOnly::new(ManagerOptions::new());
        manager.store.set("k-progress", json!([10]), None).unwrap();
        assert_eq!(manager.get_progress("k").unwrap(), Some(json!([10])));
        assert_eq!(manager.get_progress("k").unwrap(), None);

        manager
            .store
            .set("k-set_props", json!({"a": {"children": 1}}), None)
            .unwrap();
        let props = manager.get_updated_props("k").unwrap();
        assert_eq!(Value::Object(props["a"].clone()), json!({"children": 1}));
        assert!(manager.get_updated_props("k").unwrap().is_empty());
    }

    #[test]
    fn options_default_ignores_triggered() {
        let options = BackgroundOptions::new().progress(crate::dependency::Output::new("p", "value"));
        assert!(options.cache_ignore_triggered);
        assert_eq!(options.progress.len(), 1);
        assert!(options.manager.is_none());
    }
}
