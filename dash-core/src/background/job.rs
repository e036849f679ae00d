//! Job Wrapper
//!
//! [`JobFn`] runs a user callback as a background job and turns whatever
//! happens into a stored value:
//!
//! | callback outcome          | stored under the cache key        |
//! |---------------------------|-----------------------------------|
//! | returned a value          | the value                         |
//! | `PreventUpdate`           | the no-update marker              |
//! | failed or panicked        | `{"long_callback_error": {..}}`   |
//! | job cancelled meanwhile   | nothing                           |
//!
//! Writing nothing for a cancelled job keeps a later run with the same key
//! from picking up a stale result.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::{progress_key, set_props_key, ProgressSink, ResultStore};
use crate::callback::{no_update, Args, CallbackFn, CallbackResult};
use crate::context::{CallbackContext, SetPropsHook};
use crate::error::CallbackError;
use crate::grouping::Grouping;

// ----------------------------------------------------------------------------
// Job scope
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ScopeInner {
    cancelled: AtomicBool,
    notify: Notify,
    /// Also held across store writes, see [`JobScope::commit`].
    children: Mutex<Vec<Child>>,
}

/// Cancellation handle shared between a job and its manager.
///
/// Jobs check [`is_cancelled`](Self::is_cancelled) between steps (or await
/// [`cancelled`](Self::cancelled)) and start OS processes through
/// [`spawn`](Self::spawn) so cancelling kills them too.
#[derive(Debug, Clone, Default)]
pub struct JobScope(Arc<ScopeInner>);

impl JobScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Starts a child process owned by this job. Returns its pid.
    ///
    /// On unix the child leads a new process group, and cancelling signals
    /// the whole group, so anything it starts goes down with it unless it
    /// moves itself to another group.
    pub fn spawn(&self, command: &mut Command) -> std::io::Result<u32> {
        let mut children = self.0.children.lock();
        if self.is_cancelled() {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "job was cancelled"));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn()?;
        let pid = child.id();
        children.push(child);
        Ok(pid)
    }

    /// Waits for a child started with [`spawn`](Self::spawn). `None` when
    /// the job was cancelled (the child is killed) or the pid is unknown.
    pub fn wait(&self, pid: u32) -> std::io::Result<Option<ExitStatus>> {
        loop {
            if self.is_cancelled() {
                return Ok(None);
            }
            {
                let mut children = self.0.children.lock();
                let Some(pos) = children.iter().position(|c| c.id() == pid) else {
                    return Ok(None);
                };
                if let Some(status) = children[pos].try_wait()? {
                    children.remove(pos);
                    return Ok(Some(status));
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Runs `write` unless the job is cancelled. A concurrent
    /// [`cancel`](Self::cancel) waits for it, so nothing lands after
    /// `cancel` returns.
    pub(crate) fn commit<R>(&self, write: impl FnOnce() -> R) -> Option<R> {
        let _children = self.0.children.lock();
        if self.is_cancelled() {
            return None;
        }
        Some(write())
    }

    /// Flags the job cancelled and kills every child still running, along
    /// with their descendants. Idempotent.
    pub(crate) fn cancel(&self) {
        let mut children = self.0.children.lock();
        self.0.cancelled.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
        for mut child in children.drain(..) {
            kill_tree(&mut child);
            // Reap so nothing is left as a zombie.
            let _ = child.wait();
        }
    }
}

/// Kills the child's process group. The group id is the child's pid since
/// it was started with `process_group(0)` and has not been reaped yet.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    let pid = child.id();
    let Ok(group) = libc::pid_t::try_from(pid) else {
        return kill_child(child);
    };
    // SAFETY: kill(2) takes no pointers.
    if unsafe { libc::kill(-group, libc::SIGKILL) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "process group already gone");
        kill_child(child);
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    kill_child(child);
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "child already exited");
    }
}

// ----------------------------------------------------------------------------
// Job function
// ----------------------------------------------------------------------------

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    NoUpdate,
    Failed,
    Cancelled,
}

/// Where a running job writes.
pub(crate) struct JobTarget {
    pub key: String,
    pub store: Arc<dyn ResultStore>,
    pub expire: Option<Duration>,
    pub scope: JobScope,
}

/// A callback prepared to run as a background job.
#[derive(Debug, Clone)]
pub struct JobFn {
    callback: CallbackFn,
    progress: bool,
}

fn error_record(msg: &str, traceback: &str) -> Value {
    json!({ "long_callback_error": { "msg": msg, "tb": traceback } })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked".to_string()
    }
}

impl JobFn {
    pub fn new(callback: CallbackFn, progress: bool) -> Self {
        Self { callback, progress }
    }

    /// Arguments and context the callback sees inside the job.
    fn prepare(&self, target: &JobTarget, args: Grouping<Value>, context: &CallbackContext) -> (Args, CallbackContext) {
        let hook: SetPropsHook = {
            let store = Arc::clone(&target.store);
            let key = set_props_key(&target.key);
            let expire = target.expire;
            let scope = target.scope.clone();
            Arc::new(move |id: &str, props: &Map<String, Value>| {
                scope.commit(|| {
                    let mut pending = match store.get(&key) {
                        Ok(Some(Value::Object(pending))) => pending,
                        _ => Map::new(),
                    };
                    match pending.entry(id.to_string()).or_insert_with(|| Value::Object(Map::new())) {
                        Value::Object(existing) => existing.extend(props.clone()),
                        other => *other = Value::Object(props.clone()),
                    }
                    if let Err(e) = store.set(&key, Value::Object(pending), expire) {
                        warn!(key = %key, error = %e, "failed to store set_props update");
                    }
                });
            })
        };
        let context = context.fork_for_job(Some(hook));

        let mut args = Args::new(args).with_job(target.scope.clone());
        if self.progress {
            let store = Arc::clone(&target.store);
            let key = progress_key(&target.key);
            let expire = target.expire;
            let scope = target.scope.clone();
            let sink: ProgressSink = Arc::new(move |value: Value| {
                let value = match value {
                    Value::Array(_) => value,
                    other => Value::Array(vec![other]),
                };
                scope.commit(|| {
                    if let Err(e) = store.set(&key, value, expire) {
                        warn!(key = %key, error = %e, "failed to store progress");
                    }
                });
            });
            args = args.with_progress(sink);
        }
        (args, context)
    }

    /// Runs the job on the current thread.
    pub(crate) fn run(&self, target: &JobTarget, args: Grouping<Value>, context: &CallbackContext) -> JobOutcome {
        let (args, context) = self.prepare(target, args, context);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.callback.invoke_blocking(args, &context)));
        let outcome = match result {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        Self::finish(target, outcome)
    }

    /// Runs the job on a runtime of its own. An async callback is dropped
    /// at its next await point once the job is cancelled. A sync callback
    /// runs to the end and can only watch [`JobScope::is_cancelled`].
    pub(crate) fn run_abortable(&self, target: &JobTarget, args: Grouping<Value>, context: &CallbackContext) -> JobOutcome {
        if !self.callback.is_async() {
            return self.run(target, args, context);
        }
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(key = %target.key, error = %e, "no runtime for background job");
                return Self::finish(target, Err(format!("could not start a runtime: {e}")));
            }
        };
        runtime.block_on(async {
            tokio::select! {
                outcome = self.run_async(target, args, context) => outcome,
                () = target.scope.cancelled() => {
                    info!(key = %target.key, "dropped cancelled job");
                    JobOutcome::Cancelled
                }
            }
        })
    }

    /// Runs the job as a task on the current runtime.
    pub(crate) async fn run_async(&self, target: &JobTarget, args: Grouping<Value>, context: &CallbackContext) -> JobOutcome {
        let (args, context) = self.prepare(target, args, context);
        let result = AssertUnwindSafe(self.callback.invoke_async(args, &context))
            .catch_unwind()
            .await;
        let outcome = result.map_err(|payload| panic_message(payload.as_ref()));
        Self::finish(target, outcome)
    }

    /// Stores the outcome. `Err` carries a panic or runtime failure message.
    fn finish(target: &JobTarget, outcome: Result<CallbackResult, String>) -> JobOutcome {
        let discard = || {
            info!(key = %target.key, "discarding output of cancelled job");
            JobOutcome::Cancelled
        };
        if target.scope.is_cancelled() {
            return discard();
        }
        let (value, outcome) = match outcome {
            Ok(Ok(value)) => (value, JobOutcome::Completed),
            Ok(Err(CallbackError::PreventUpdate)) => (no_update(), JobOutcome::NoUpdate),
            Ok(Err(CallbackError::Failed(e))) => {
                warn!(key = %target.key, error = %e, "background callback failed");
                (error_record(&e.to_string(), &format!("{e:?}")), JobOutcome::Failed)
            }
            Err(msg) => {
                warn!(key = %target.key, error = %msg, "background callback panicked");
                (error_record(&msg, &format!("panicked: {msg}")), JobOutcome::Failed)
            }
        };
        match target.scope.commit(|| target.store.set(&target.key, value, target.expire)) {
            None => return discard(),
            Some(Err(e)) => {
                warn!(key = %target.key, error = %e, "failed to store job result");
                return JobOutcome::Failed;
            }
            Some(Ok(())) => {}
        }
        debug!(key = %target.key, ?outcome, "job finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::MemoryBackend;
    use crate::callback::is_no_update;
    use crate::context::callback_context;

    fn target(store: &Arc<MemoryBackend>) -> JobTarget {
        JobTarget {
            key: "k".into(),
            store: store.clone(),
            expire: None,
            scope: JobScope::new(),
        }
    }

    fn ctx() -> CallbackContext {
        CallbackContext::builder("out.children").build().unwrap()
    }

    #[test]
    fn stores_return_value() {
        let store = Arc::new(MemoryBackend::new());
        let job = JobFn::new(CallbackFn::sync(|args| Ok(json!(args.get::<i64>(0)? * 2))), false);
        let outcome = job.run(&target(&store), Grouping::Scalar(json!(21)), &ctx());
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(store.get("k").unwrap(), Some(json!(42)));
    }

    #[test]
    fn prevent_update_stores_marker() {
        let store = Arc::new(MemoryBackend::new());
        let job = JobFn::new(CallbackFn::sync(|_| Err(CallbackError::PreventUpdate)), false);
        assert_eq!(job.run(&target(&store), Grouping::Scalar(Value::Null), &ctx()), JobOutcome::NoUpdate);
        assert!(is_no_update(&store.get("k").unwrap().unwrap()));
    }

    #[test]
    fn failures_and_panics_become_error_records() {
        let store = Arc::new(MemoryBackend::new());
        let job = JobFn::new(CallbackFn::sync(|_| Err(CallbackError::failed(anyhow::anyhow!("boom")))), false);
        assert_eq!(job.run(&target(&store), Grouping::Scalar(Value::Null), &ctx()), JobOutcome::Failed);
        assert_eq!(store.get("k").unwrap().unwrap()["long_callback_error"]["msg"], json!("boom"));

        let job = JobFn::new(CallbackFn::sync(|_| panic!("kaput")), false);
        assert_eq!(job.run(&target(&store), Grouping::Scalar(Value::Null), &ctx()), JobOutcome::Failed);
        assert_eq!(store.get("k").unwrap().unwrap()["long_callback_error"]["msg"], json!("kaput"));
    }

    #[test]
    fn progress_and_set_props_reach_the_store() {
        let store = Arc::new(MemoryBackend::new());
        let job = JobFn::new(
            CallbackFn::sync(|args| {
                args.set_progress(json!(50))?;
                let ctx = callback_context().map_err(CallbackError::failed)?;
                assert!(ctx.is_background());
                ctx.set_props("status", serde_json::from_value(json!({"children": "half"})).unwrap());
                ctx.set_props("status", serde_json::from_value(json!({"style": {}})).unwrap());
                Ok(json!("done"))
            }),
            true,
        );
        job.run(&target(&store), Grouping::Scalar(Value::Null), &ctx());
        assert_eq!(store.get("k-progress").unwrap(), Some(json!([50])));
        assert_eq!(
            store.get("k-set_props").unwrap(),
            Some(json!({"status": {"children": "half", "style": {}}}))
        );
    }

    #[test]
    fn cancelled_jobs_write_nothing() {
        let store = Arc::new(MemoryBackend::new());
        let target = target(&store);
        let scope = target.scope.clone();
        let job = JobFn::new(
            CallbackFn::sync(move |_| {
                scope.cancel();
                Ok(json!(1))
            }),
            false,
        );
        assert_eq!(job.run(&target, Grouping::Scalar(Value::Null), &ctx()), JobOutcome::Cancelled);
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn async_jobs_run_on_the_runtime() {
        let store = Arc::new(MemoryBackend::new());
        let job = JobFn::new(
            CallbackFn::from_async(|args: Args| async move {
                tokio::task::yield_now().await;
                Ok::<_, CallbackError>(args.value(0))
            }),
            false,
        );
        let outcome = job.run_async(&target(&store), Grouping::Scalar(json!("x")), &ctx()).await;
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(store.get("k").unwrap(), Some(json!("x")));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_children() {
        let scope = JobScope::new();
        let pid = scope.spawn(Command::new("sleep").arg("30")).unwrap();
        assert!(pid > 0);
        scope.cancel();
        assert!(scope.is_cancelled());
        assert_eq!(scope.wait(pid).unwrap(), None);
        assert!(scope.spawn(&mut Command::new("true")).is_err());
    }

    /// Running and not a zombie waiting for a reaper.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat.rsplit_once(") ").is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cancel_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("grandchild.pid");
        let scope = JobScope::new();
        scope
            .spawn(
                Command::new("sh")
                    .arg("-c")
                    .arg(format!("sleep 300 & echo $! > '{}'; wait", pidfile.display())),
            )
            .unwrap();

        let start = std::time::Instant::now();
        let grandchild = loop {
            let pid = std::fs::read_to_string(&pidfile)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if let Some(pid) = pid {
                break pid;
            }
            assert!(start.elapsed() < Duration::from_secs(10), "grandchild never started");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(process_alive(grandchild));

        scope.cancel();
        let start = std::time::Instant::now();
        while process_alive(grandchild) {
            assert!(start.elapsed() < Duration::from_secs(10), "grandchild {grandchild} outlived its job");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Cancels the job from another thread in the middle of the first write.
    #[derive(Debug)]
    struct CancelDuringWrite {
        inner: Arc<MemoryBackend>,
        scope: JobScope,
        canceller: Mutex<Option<std::thread::JoinHandle<Option<Value>>>>,
    }

    impl ResultStore for CancelDuringWrite {
        fn get(&self, key: &str) -> Result<Option<Value>, crate::error::ManagerError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> Result<(), crate::error::ManagerError> {
            let mut canceller = self.canceller.lock();
            if canceller.is_none() {
                let scope = self.scope.clone();
                let inner = Arc::clone(&self.inner);
                let key = key.to_string();
                // Reports what the store holds once cancel has returned.
                *canceller = Some(std::thread::spawn(move || {
                    scope.cancel();
                    inner.get(&key).unwrap()
                }));
                std::thread::sleep(Duration::from_millis(50));
            }
            self.inner.set(key, value, expire)
        }

        fn delete(&self, key: &str) -> Result<(), crate::error::ManagerError> {
            self.inner.delete(key)
        }

        fn touch(&self, key: &str, expire: Option<Duration>) -> Result<(), crate::error::ManagerError> {
            self.inner.touch(key, expire)
        }
    }

    #[test]
    fn cancel_waits_for_a_write_in_flight() {
        let scope = JobScope::new();
        let inner = Arc::new(MemoryBackend::new());
        let store = Arc::new(CancelDuringWrite {
            inner: Arc::clone(&inner),
            scope: scope.clone(),
            canceller: Mutex::new(None),
        });
        let target = JobTarget {
            key: "k".into(),
            store: store.clone(),
            expire: None,
            scope: scope.clone(),
        };
        let job = JobFn::new(CallbackFn::sync(|_| Ok(json!(7))), false);
        assert_eq!(job.run(&target, Grouping::Scalar(Value::Null), &ctx()), JobOutcome::Completed);

        let canceller = store.canceller.lock().take().unwrap();
        assert_eq!(canceller.join().unwrap(), Some(json!(7)));
        assert!(scope.is_cancelled());

        // After cancel returned, the same scope writes nothing more.
        let job = JobFn::new(CallbackFn::sync(|_| Ok(json!(8))), false);
        assert_eq!(job.run(&target, Grouping::Scalar(Value::Null), &ctx()), JobOutcome::Cancelled);
        assert_eq!(inner.get("k").unwrap(), Some(json!(7)));
    }

    #[test]
    fn abortable_run_drops_async_jobs_on_cancel() {
        let store = Arc::new(MemoryBackend::new());
        let target = target(&store);
        let scope = target.scope.clone();
        let dropped = Arc::new(AtomicBool::new(false));

        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let job = JobFn::new(
            CallbackFn::from_async({
                let dropped = Arc::clone(&dropped);
                move |_: Args| {
                    let guard = SetOnDrop(Arc::clone(&dropped));
                    async move {
                        let _guard = guard;
                        tokio::time::sleep(Duration::from_secs(300)).await;
                        Ok::<_, CallbackError>(json!("late"))
                    }
                }
            }),
            false,
        );
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            scope.cancel();
        });
        let outcome = job.run_abortable(&target, Grouping::Scalar(Value::Null), &ctx());
        canceller.join().unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(dropped.load(Ordering::Acquire));
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let scope = JobScope::new();
        let waiter = tokio::spawn({
            let scope = scope.clone();
            async move { scope.cancelled().await }
        });
        tokio::task::yield_now().await;
        scope.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        // Already cancelled: returns at once.
        scope.cancelled().await;
    }
}
