//! Disk-Backed Manager
//!
//! [`DiskCache`] keeps one MessagePack file per key in a directory, named by
//! the blake3 hash of the key. Writes go to a temp file first and are
//! renamed into place, so readers (other threads or other processes sharing
//! the directory) never see half an entry.
//!
//! [`DiskCacheManager`] runs each job on its own worker thread. The worker
//! registry maps job ids to their [`JobScope`]; removing an entry is the
//! claim that lets exactly one caller terminate a job. Launching a job also
//! sweeps workers that finished without anyone polling them.
//!
//! Terminating a job kills the child processes it started through its
//! scope and drops an async callback at its next await point. A sync
//! callback keeps its thread until it returns or notices the flag, and its
//! result is thrown away.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::job::JobTarget;
use super::{BackgroundManager, JobFn, JobId, JobScope, ManagerOptions, ResultStore};
use crate::context::CallbackContext;
use crate::error::ManagerError;
use crate::grouping::Grouping;

// ----------------------------------------------------------------------------
// Disk cache
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    /// JSON text of the stored value.
    value: String,
    /// Unix milliseconds.
    expires_at: Option<u64>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn deadline(expire: Option<Duration>) -> Option<u64> {
    expire.map(|d| now_millis().saturating_add(d.as_millis() as u64))
}

/// Directory of cache entries.
#[derive(Debug)]
pub struct DiskCache {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskCache {
    /// Opens (creating if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ManagerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened disk cache");
        Ok(Self {
            dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.msgpack", blake3::hash(key.as_bytes()).to_hex()))
    }

    fn read_entry(&self, key: &str) -> Result<Option<DiskEntry>, ManagerError> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: DiskEntry = rmp_serde::from_slice(&bytes)?;
        if entry.key != key || entry.expires_at.is_some_and(|at| at <= now_millis()) {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn write_entry(&self, entry: &DiskEntry) -> Result<(), ManagerError> {
        let bytes = rmp_serde::to_vec_named(entry)?;
        let tmp = self.dir.join(format!(
            ".tmp-{}-{:x}-{}",
            std::process::id(),
            self as *const Self as usize,
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.path_for(&entry.key))?;
        Ok(())
    }
}

impl ResultStore for DiskCache {
    fn get(&self, key: &str) -> Result<Option<Value>, ManagerError> {
        match self.read_entry(key)? {
            Some(entry) => Ok(Some(
                serde_json::from_str(&entry.value).map_err(|e| ManagerError::Io(e.into()))?,
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> Result<(), ManagerError> {
        self.write_entry(&DiskEntry {
            key: key.to_string(),
            value: value.to_string(),
            expires_at: deadline(expire),
        })
    }

    fn delete(&self, key: &str) -> Result<(), ManagerError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn touch(&self, key: &str, expire: Option<Duration>) -> Result<(), ManagerError> {
        if let Some(mut entry) = self.read_entry(key)? {
            entry.expires_at = deadline(expire);
            self.write_entry(&entry)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Worker {
    scope: JobScope,
    finished: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn join_if_finished(&self) {
        if !self.is_finished() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("background worker thread panicked");
            }
        }
    }
}

/// Runs jobs on worker threads and stores results in a [`DiskCache`].
#[derive(Debug)]
pub struct DiskCacheManager {
    cache: Arc<DiskCache>,
    options: ManagerOptions,
    workers: DashMap<JobId, Worker>,
    next_job: AtomicU64,
}

impl DiskCacheManager {
    pub fn new(cache: DiskCache, options: ManagerOptions) -> Self {
        Self {
            cache: Arc::new(cache),
            options,
            workers: DashMap::new(),
            next_job: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Jobs still registered (running, or finished and not yet collected).
    pub fn registered_jobs(&self) -> usize {
        self.workers.len()
    }

    /// Drops workers whose job has ended. Their results stay in the cache.
    fn sweep_finished(&self) {
        self.workers.retain(|job, worker| {
            if !worker.is_finished() {
                return true;
            }
            worker.join_if_finished();
            debug!(job = %job, "swept finished background worker");
            false
        });
    }
}

impl BackgroundManager for DiskCacheManager {
    fn store(&self) -> Arc<dyn ResultStore> {
        self.cache.clone()
    }

    fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn call_job_fn(
        &self,
        key: &str,
        job_fn: JobFn,
        args: Grouping<Value>,
        context: CallbackContext,
    ) -> Result<JobId, ManagerError> {
        self.sweep_finished();
        let job = JobId(self.next_job.fetch_add(1, Ordering::Relaxed).to_string());
        let scope = JobScope::new();
        let finished = Arc::new(AtomicBool::new(false));
        let target = JobTarget {
            key: key.to_string(),
            store: self.store(),
            expire: self.expire(),
            scope: scope.clone(),
        };

        let handle = std::thread::Builder::new().name(format!("dash-job-{job}")).spawn({
            let finished = Arc::clone(&finished);
            move || {
                job_fn.run_abortable(&target, args, &context);
                finished.store(true, Ordering::Release);
            }
        })?;

        self.workers.insert(
            job.clone(),
            Worker {
                scope,
                finished,
                handle: Mutex::new(Some(handle)),
            },
        );
        info!(job = %job, key, "launched background job");
        Ok(job)
    }

    fn job_running(&self, job: &JobId) -> bool {
        self.workers.get(job).is_some_and(|w| !w.is_finished())
    }

    fn terminate_job(&self, job: &JobId) {
        let Some((_, worker)) = self.workers.remove(job) else {
            return;
        };
        worker.scope.cancel();
        worker.join_if_finished();
        info!(job = %job, "terminated background job");
    }

    fn terminate_unhealthy_job(&self, job: &JobId) -> bool {
        let unhealthy = self.workers.get(job).is_some_and(|w| w.is_finished());
        if unhealthy {
            warn!(job = %job, "reaping finished background worker");
            self.terminate_job(job);
        }
        unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackFn;
    use serde_json::json;
    use std::time::Instant;

    fn wait_until(mut f: impl FnMut() -> bool) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn cache_round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let value = json!({"a": [1, 2.5, "x", null], "b": {"c": true}});
        cache.set("key", value.clone(), None).unwrap();
        assert_eq!(cache.get("key").unwrap(), Some(value));
        cache.delete("key").unwrap();
        cache.delete("key").unwrap();
        assert_eq!(cache.get("key").unwrap(), None);
    }

    #[test]
    fn cache_is_shared_through_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskCache::open(dir.path()).unwrap();
        let reader = DiskCache::open(dir.path()).unwrap();
        writer.set("k", json!(1), None).unwrap();
        assert_eq!(reader.get("k").unwrap(), Some(json!(1)));
    }

    #[test]
    fn cache_entries_expire() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        cache.set("k", json!(1), Some(Duration::ZERO)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn jobs_run_and_store_results() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiskCacheManager::new(DiskCache::open(dir.path()).unwrap(), ManagerOptions::new());
        let job_fn = manager.make_job_fn(CallbackFn::sync(|args| Ok(json!(format!("hi {}", args.value(0))))), false);
        let ctx = CallbackContext::builder("out.children").build().unwrap();
        let job = manager
            .call_job_fn("key", job_fn, Grouping::Scalar(json!("there")), ctx)
            .unwrap();

        wait_until(|| manager.result_ready("key").unwrap());
        wait_until(|| !manager.job_running(&job));
        assert_eq!(manager.get_result("key", Some(&job)).unwrap(), Some(json!("hi \"there\"")));
        assert_eq!(manager.registered_jobs(), 0);
        // Finished and already collected: a no-op.
        manager.terminate_job(&job);
        assert!(!manager.terminate_unhealthy_job(&job));
    }

    #[test]
    fn terminate_stops_result_from_landing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiskCacheManager::new(DiskCache::open(dir.path()).unwrap(), ManagerOptions::new());
        let job_fn = manager.make_job_fn(
            CallbackFn::sync(|args| {
                let scope = args.job().cloned();
                while !scope.as_ref().is_some_and(JobScope::is_cancelled) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(json!("too late"))
            }),
            false,
        );
        let ctx = CallbackContext::builder("out.children").build().unwrap();
        let job = manager.call_job_fn("key", job_fn, Grouping::Scalar(Value::Null), ctx).unwrap();
        assert!(manager.job_running(&job));

        manager.terminate_job(&job);
        assert!(!manager.job_running(&job));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!manager.result_ready("key").unwrap());
    }

    #[test]
    fn terminate_drops_async_jobs() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let manager = DiskCacheManager::new(DiskCache::open(dir.path()).unwrap(), ManagerOptions::new());
        let started = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let job_fn = manager.make_job_fn(
            CallbackFn::from_async({
                let started = Arc::clone(&started);
                let dropped = Arc::clone(&dropped);
                move |_| {
                    let guard = SetOnDrop(Arc::clone(&dropped));
                    let started = Arc::clone(&started);
                    async move {
                        let _guard = guard;
                        started.store(true, Ordering::Release);
                        // Never looks at the cancellation flag.
                        tokio::time::sleep(Duration::from_secs(300)).await;
                        Ok::<_, crate::error::CallbackError>(json!("too late"))
                    }
                }
            }),
            false,
        );
        let ctx = CallbackContext::builder("out.children").build().unwrap();
        let job = manager.call_job_fn("key", job_fn, Grouping::Scalar(Value::Null), ctx).unwrap();
        wait_until(|| started.load(Ordering::Acquire));

        manager.terminate_job(&job);
        wait_until(|| dropped.load(Ordering::Acquire));
        assert!(!manager.result_ready("key").unwrap());
    }

    #[test]
    fn launching_sweeps_unpolled_finished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiskCacheManager::new(DiskCache::open(dir.path()).unwrap(), ManagerOptions::new());
        let ctx = CallbackContext::builder("out.children").build().unwrap();

        let quick = manager.make_job_fn(CallbackFn::sync(|_| Ok(json!(1))), false);
        let first = manager
            .call_job_fn("first", quick, Grouping::Scalar(Value::Null), ctx.clone())
            .unwrap();
        wait_until(|| !manager.job_running(&first));
        assert_eq!(manager.registered_jobs(), 1);

        let slow = manager.make_job_fn(
            CallbackFn::sync(|args| {
                let scope = args.job().cloned();
                while !scope.as_ref().is_some_and(JobScope::is_cancelled) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(Value::Null)
            }),
            false,
        );
        let second = manager.call_job_fn("second", slow, Grouping::Scalar(Value::Null), ctx).unwrap();
        // Only the running job is left; the swept one's result is still there.
        assert_eq!(manager.registered_jobs(), 1);
        assert!(manager.job_running(&second));
        assert_eq!(manager.get_result("first", None).unwrap(), Some(json!(1)));
        manager.terminate_job(&second);
        assert_eq!(manager.registered_jobs(), 0);
    }

    #[test]
    fn finished_but_registered_jobs_are_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DiskCacheManager::new(DiskCache::open(dir.path()).unwrap(), ManagerOptions::new());
        let job_fn = manager.make_job_fn(CallbackFn::sync(|_| Ok(json!(1))), false);
        let ctx = CallbackContext::builder("out.children").build().unwrap();
        let job = manager.call_job_fn("key", job_fn, Grouping::Scalar(Value::Null), ctx).unwrap();
        wait_until(|| !manager.job_running(&job));
        assert!(manager.terminate_unhealthy_job(&job));
        assert_eq!(manager.registered_jobs(), 0);
    }
}
