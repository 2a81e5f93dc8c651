//! The job manager (C12): intake, dependency resolution, fingerprinting,
//! cache probing, dispatch, and harvest, all driven from a single
//! `tick_once` that `Job::wait`/`Job::status` call in a loop. There is no
//! background thread for the engine itself — only the handlers it drives may
//! have their own (§5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobrelay_base::config::{ConfigCache, ConfigFrame, ConfigHandler, ContainerSetting};
use jobrelay_base::error::JobError;
use jobrelay_base::fingerprint::Fingerprint;
use jobrelay_base::job::{JobId, JobStatus, RuntimeInfo};
use jobrelay_base::registry::RegisterOptions;
use jobrelay_base::value::Value;
use jobrelay_blobstore::BlobStore;
use jobrelay_cache::{CacheProbe, CachedOutcome, InMemoryJobCache, JobCache};
use jobrelay_exec::{AcceptError, Handler, HandlerEvent, JobFn, LocalHandler, Task};
use jobrelay_util::config::ConfigStack;
use slog::{debug, warn, Logger};

use crate::job::Job;
use crate::registry::Registry;

/// How long `Job::wait` sleeps between ticks while a job it's blocked on is
/// still in flight. Short enough that local jobs feel synchronous, long
/// enough not to spin a core busy-waiting on a remote poll.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct JobRecord {
    function_name: String,
    function_version: String,
    function: Arc<JobFn>,
    raw_args: Value,
    container: Option<String>,
    handler_name: String,
    cache_name: String,
    download_results: bool,
    timeout: Option<f64>,
    no_resolve_input_files: bool,

    status: JobStatus,
    resolved_args: Option<Value>,
    fingerprint: Option<Fingerprint>,
    owns_reservation: bool,
    dispatched: bool,
    result: Option<Value>,
    error: Option<JobError>,
    runtime_info: RuntimeInfo,
    /// Keeps any temp directory materialised for local file resolution
    /// alive for as long as the job record exists; dropped (and cleaned up
    /// on disk) once the job is forgotten by `JobManager::reset`.
    _scratch: Option<tempfile::TempDir>,
}

struct Inner {
    registry: Registry,
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    caches: Mutex<HashMap<String, Arc<dyn JobCache>>>,
    blob_store: Arc<dyn BlobStore>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    logger: Logger,
}

/// C12. Cheap to clone — every clone shares the same underlying state, the
/// way a `maelstrom-client` handle is passed around by value.
#[derive(Clone)]
pub struct JobManager(Arc<Inner>);

impl JobManager {
    /// Builds a manager with the local handler and an in-memory cache
    /// installed as the default configuration frame (invariant 5: "the
    /// configuration stack is never empty"). Additional substrates are
    /// added with [`JobManager::with_handler`]/[`JobManager::with_cache`]
    /// and selected per-call by entering a scoped configuration frame.
    pub fn new(blob_store: Arc<dyn BlobStore>, logger: Logger) -> Self {
        let local_handler = Arc::new(LocalHandler::new());
        let local_cache = Arc::new(InMemoryJobCache::new("local"));

        let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        handlers.insert(local_handler.handler_name().to_string(), local_handler.clone());
        let mut caches: HashMap<String, Arc<dyn JobCache>> = HashMap::new();
        caches.insert(local_cache.cache_name().to_string(), local_cache.clone());

        ConfigStack::set_default(ConfigFrame {
            container: ContainerSetting::Null,
            job_handler: Some(local_handler as Arc<dyn ConfigHandler>),
            job_cache: Some(local_cache as Arc<dyn ConfigCache>),
            download_results: Some(true),
            job_timeout: None,
        });

        Self(Arc::new(Inner {
            registry: Registry::new(logger.clone()),
            handlers: Mutex::new(handlers),
            caches: Mutex::new(caches),
            blob_store,
            jobs: Mutex::new(HashMap::new()),
            logger,
        }))
    }

    /// Registers an additional handler substrate (parallel, batch, remote)
    /// under its own `handler_name()`, selectable by entering a
    /// configuration frame whose `job_handler` points at the same instance.
    pub fn with_handler<H>(self, handler: Arc<H>) -> Self
    where
        H: Handler + 'static,
    {
        self.0
            .handlers
            .lock()
            .unwrap()
            .insert(handler.handler_name().to_string(), handler);
        self
    }

    pub fn with_cache<C>(self, cache: Arc<C>) -> Self
    where
        C: JobCache + 'static,
    {
        self.0.caches.lock().unwrap().insert(cache.cache_name().to_string(), cache);
        self
    }

    /// C2. `source_path` identifies the registration call site (a
    /// `concat!(file!(), ":", line!())`-style string is typical) so that a
    /// divergent second registration under the same name can be told apart
    /// from a harmless repeat of the same one.
    pub fn register<F>(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        source_path: impl Into<String>,
        function: F,
        options: RegisterOptions,
    ) where
        F: Fn(&Value) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        self.0
            .registry
            .register(name, version, source_path, Arc::new(function), options);
    }

    /// C3's `run`: looks up the function, captures the currently active
    /// configuration frame (container resolution, handler, cache, timeout,
    /// `download_results`), and creates a `PENDING` job. The job's
    /// configuration is fixed at this point — later `ConfigStack` changes
    /// don't retroactively affect an already-submitted job, matching
    /// `hither2.core.run`'s "snapshot config at call time" behaviour.
    pub fn run(&self, name: &str, args: Value) -> Result<Job, JobError> {
        let entry = self.0.registry.lookup(name)?;
        let cfg = ConfigStack::current();
        let container = cfg.container.resolve(entry.options.container.as_deref());
        let handler_name = cfg
            .job_handler
            .as_ref()
            .map(|h| h.handler_name().to_string())
            .ok_or_else(|| JobError::framework("no job handler configured"))?;
        let cache_name = cfg
            .job_cache
            .as_ref()
            .map(|c| c.cache_name().to_string())
            .ok_or_else(|| JobError::framework("no job cache configured"))?;

        self.assert_references_exist(&args)?;

        let record = JobRecord {
            function_name: entry.name.clone(),
            function_version: entry.version.clone(),
            function: entry.function.clone(),
            raw_args: args,
            container,
            handler_name,
            cache_name,
            download_results: cfg.download_results.unwrap_or(true),
            timeout: cfg.job_timeout,
            no_resolve_input_files: entry.options.no_resolve_input_files,
            status: JobStatus::Pending,
            resolved_args: None,
            fingerprint: None,
            owns_reservation: false,
            dispatched: false,
            result: None,
            error: None,
            runtime_info: RuntimeInfo::default(),
            _scratch: None,
        };

        let id = JobId::new();
        self.0.jobs.lock().unwrap().insert(id, record);
        Ok(Job { id, manager: self.clone() })
    }

    /// Forgets every tracked job. Registrations, handlers, and caches
    /// survive a reset — this clears run-scoped state only, the shape
    /// `hither2.core.reset()` is used for between test cases.
    pub fn reset(&self) {
        self.0.jobs.lock().unwrap().clear();
    }

    /// Every `Value::JobRef` in a freshly submitted argument graph must name
    /// a job this manager already knows about. A real cycle can't arise
    /// through the public `run` API (a `JobRef` can only ever name a job
    /// created earlier), but a caller handed a stale or foreign `JobId`
    /// would otherwise surface as a confusing "upstream result missing"
    /// failure deep inside the tick loop instead of at submission time.
    fn assert_references_exist(&self, args: &Value) -> Result<(), JobError> {
        let jobs = self.0.jobs.lock().unwrap();
        for upstream in args.job_refs() {
            if !jobs.contains_key(&upstream) {
                return Err(JobError::framework(format!(
                    "job reference {upstream} does not name a job tracked by this manager"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn status_of(&self, id: JobId) -> JobStatus {
        self.0
            .jobs
            .lock()
            .unwrap()
            .get(&id)
            .map(|r| r.status)
            .unwrap_or(JobStatus::Pending)
    }

    pub(crate) fn terminal_outcome(&self, id: JobId) -> Option<Result<Value, JobError>> {
        let jobs = self.0.jobs.lock().unwrap();
        let record = jobs.get(&id)?;
        if !record.status.is_terminal() {
            return None;
        }
        Some(match &record.error {
            Some(e) => Err(e.clone()),
            None => Ok(record.result.clone().unwrap_or(Value::Null)),
        })
    }

    pub(crate) fn drive_until_terminal(&self, id: JobId, timeout: Option<f64>) -> Result<Value, JobError> {
        let deadline = timeout.map(|t| now_secs() + t);
        loop {
            self.tick_once();
            if let Some(outcome) = self.terminal_outcome(id) {
                return outcome;
            }
            if let Some(deadline) = deadline {
                if now_secs() >= deadline {
                    return Err(JobError::timed_out(timeout.unwrap_or_default()));
                }
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// One pass of intake, dispatch, and harvest. Cheap to call repeatedly;
    /// every stage is a no-op once there's nothing left to advance.
    pub(crate) fn tick_once(&self) {
        self.intake_and_resolve();
        self.probe_and_dispatch();
        self.harvest();
    }

    fn handler_for(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.0.handlers.lock().unwrap().get(name).cloned()
    }

    fn cache_for(&self, name: &str) -> Option<Arc<dyn JobCache>> {
        self.0.caches.lock().unwrap().get(name).cloned()
    }

    /// Moves every `PENDING`/`WAITING` job forward: `WAITING` while any
    /// upstream job hasn't reached a terminal status, immediate `ERROR`
    /// propagation the instant an upstream ends in `ERROR` (§7 "a job whose
    /// inputs include a failed upstream job fails immediately with
    /// `UpstreamError`, without ever being dispatched"), otherwise resolves
    /// inputs and computes the fingerprint before moving to `QUEUED`.
    fn intake_and_resolve(&self) {
        let mut jobs = self.0.jobs.lock().unwrap();
        let pending_ids: Vec<JobId> = jobs
            .iter()
            .filter(|(_, r)| matches!(r.status, JobStatus::Pending | JobStatus::Waiting))
            .map(|(id, _)| *id)
            .collect();

        for id in pending_ids {
            let upstream_ids = jobs.get(&id).unwrap().raw_args.job_refs();

            let mut upstream_error: Option<(JobId, JobError)> = None;
            let mut all_finished = true;
            for upstream in &upstream_ids {
                match jobs.get(upstream).map(|r| r.status) {
                    Some(JobStatus::Finished) => {}
                    Some(JobStatus::Error) => {
                        let err = jobs.get(upstream).unwrap().error.clone().unwrap();
                        upstream_error = Some((*upstream, err));
                        break;
                    }
                    _ => {
                        all_finished = false;
                    }
                }
            }

            if let Some((upstream, err)) = upstream_error {
                let record = jobs.get_mut(&id).unwrap();
                record.status = JobStatus::Error;
                record.error = Some(JobError::upstream(upstream, &err));
                continue;
            }

            if !all_finished {
                let record = jobs.get_mut(&id).unwrap();
                if record.status != JobStatus::Waiting {
                    record.status = JobStatus::Waiting;
                }
                continue;
            }

            let (function_name, function_version, container, raw_args) = {
                let r = jobs.get(&id).unwrap();
                (
                    r.function_name.clone(),
                    r.function_version.clone(),
                    r.container.clone(),
                    r.raw_args.clone(),
                )
            };

            let resolved = raw_args.map_job_refs(&mut |upstream| {
                jobs.get(&upstream)
                    .and_then(|r| r.result.clone())
                    .ok_or_else(|| JobError::framework(format!("upstream job {upstream} has no cached result")))
            });
            let fingerprint_args = raw_args.map_job_refs(&mut |upstream| {
                jobs.get(&upstream)
                    .and_then(|r| r.fingerprint)
                    .map(|fp| Value::Str(fp.to_hex()))
                    .ok_or_else(|| JobError::framework(format!("upstream job {upstream} has no fingerprint")))
            });

            let record = jobs.get_mut(&id).unwrap();
            match (resolved, fingerprint_args) {
                (Ok(resolved), Ok(fingerprint_args)) => {
                    match Fingerprint::compute(&function_name, &function_version, container.as_deref(), &fingerprint_args) {
                        Ok(fingerprint) => {
                            record.resolved_args = Some(resolved);
                            record.fingerprint = Some(fingerprint);
                            record.status = JobStatus::Queued;
                        }
                        Err(e) => {
                            record.status = JobStatus::Error;
                            record.error = Some(JobError::framework(e.to_string()));
                        }
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    record.status = JobStatus::Error;
                    record.error = Some(e);
                }
            }
        }
    }

    /// Probes the cache for every `QUEUED` job that hasn't been dispatched
    /// yet, reserves a fingerprint slot on a miss, and hands the job to its
    /// configured handler. A job that already owns a reservation but whose
    /// handler returned `AtCapacity` simply retries `accept` on the next
    /// tick without re-probing the cache (§4.5).
    fn probe_and_dispatch(&self) {
        let mut jobs = self.0.jobs.lock().unwrap();
        let queued_ids: Vec<JobId> = jobs
            .iter()
            .filter(|(_, r)| r.status == JobStatus::Queued && !r.dispatched)
            .map(|(id, _)| *id)
            .collect();

        for id in queued_ids {
            let (cache_name, fingerprint, owns_reservation) = {
                let r = jobs.get(&id).unwrap();
                (r.cache_name.clone(), r.fingerprint.unwrap(), r.owns_reservation)
            };
            let Some(cache) = self.cache_for(&cache_name) else {
                let record = jobs.get_mut(&id).unwrap();
                record.status = JobStatus::Error;
                record.error = Some(JobError::framework(format!("no cache registered under {cache_name:?}")));
                continue;
            };

            if !owns_reservation {
                match cache.probe(&fingerprint) {
                    Ok(CacheProbe::Hit(outcome)) => {
                        apply_cached_outcome(jobs.get_mut(&id).unwrap(), outcome);
                        continue;
                    }
                    Ok(CacheProbe::InFlight) => continue,
                    Ok(CacheProbe::Miss) => match cache.reserve(&fingerprint) {
                        Ok(true) => jobs.get_mut(&id).unwrap().owns_reservation = true,
                        Ok(false) => continue,
                        Err(e) => {
                            let record = jobs.get_mut(&id).unwrap();
                            record.status = JobStatus::Error;
                            record.error = Some(JobError::framework(e.to_string()));
                            continue;
                        }
                    },
                    Err(e) => {
                        let record = jobs.get_mut(&id).unwrap();
                        record.status = JobStatus::Error;
                        record.error = Some(JobError::framework(e.to_string()));
                        continue;
                    }
                }
            }

            let handler_name = jobs.get(&id).unwrap().handler_name.clone();
            let Some(handler) = self.handler_for(&handler_name) else {
                let record = jobs.get_mut(&id).unwrap();
                record.status = JobStatus::Error;
                record.error = Some(JobError::framework(format!("no handler registered under {handler_name:?}")));
                continue;
            };

            match self.build_task(id, &mut jobs, handler.as_ref()) {
                Ok(task) => match handler.accept(task) {
                    Ok(()) => jobs.get_mut(&id).unwrap().dispatched = true,
                    Err(AcceptError::AtCapacity) => {
                        debug!(self.0.logger, "handler at capacity, retrying next tick"; "job_id" => id.to_string());
                    }
                },
                Err(e) => {
                    let record = jobs.get_mut(&id).unwrap();
                    if record.owns_reservation {
                        let _ = cache.release_failed(&fingerprint);
                    }
                    record.status = JobStatus::Error;
                    record.error = Some(e);
                }
            }
        }
    }

    /// Canonicalises the resolved argument graph through the blob store and,
    /// unless the function opted out with `no_resolve_input_files` or the
    /// handler runs work away from this host, materialises `File` blobs to
    /// local paths (C3's `execute_locally` file-resolution step). The
    /// resulting scratch directory, if any, is kept alive for the life of
    /// the job record.
    fn build_task(&self, id: JobId, jobs: &mut HashMap<JobId, JobRecord>, handler: &dyn Handler) -> Result<Task, JobError> {
        let record = jobs.get(&id).unwrap();
        let canonical = jobrelay_codec::canonicalize(record.resolved_args.as_ref().unwrap(), self.0.blob_store.as_ref())
            .map_err(|e| JobError::blob_store_unavailable(e.to_string()))?;

        let (args, scratch) = if record.no_resolve_input_files || handler.is_remote() {
            (canonical, None)
        } else {
            let dir = tempfile::tempdir().map_err(|e| JobError::framework(e.to_string()))?;
            let resolved = jobrelay_codec::resolve_files(&canonical, self.0.blob_store.as_ref(), dir.path())
                .map_err(|e| JobError::blob_store_unavailable(e.to_string()))?;
            (resolved, Some(dir))
        };

        let record = jobs.get_mut(&id).unwrap();
        record._scratch = scratch;

        Ok(Task {
            job_id: id,
            fingerprint: record.fingerprint.unwrap().to_hex(),
            function_name: record.function_name.clone(),
            function_version: record.function_version.clone(),
            label: None,
            function: record.function.clone(),
            args,
            container: record.container.clone(),
            timeout: record.timeout,
            no_resolve_input_files: record.no_resolve_input_files,
            download_results: record.download_results,
        })
    }

    /// Drives every registered handler's `iterate()` once and folds the
    /// resulting events into job status transitions and cache writes.
    fn harvest(&self) {
        let handlers: Vec<Arc<dyn Handler>> = self.0.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            for event in handler.iterate() {
                match event {
                    HandlerEvent::Started(id) => {
                        let mut jobs = self.0.jobs.lock().unwrap();
                        if let Some(record) = jobs.get_mut(&id) {
                            if record.status == JobStatus::Queued {
                                record.status = JobStatus::Running;
                            }
                        }
                    }
                    HandlerEvent::Finished(id, outcome) => {
                        let mut jobs = self.0.jobs.lock().unwrap();
                        let Some(record) = jobs.get_mut(&id) else { continue };
                        let cache_name = record.cache_name.clone();
                        let cache = self.cache_for(&cache_name);
                        finalize(record, outcome, cache.as_deref(), self.0.blob_store.as_ref(), &self.0.logger);
                    }
                }
            }
        }
    }
}

fn apply_cached_outcome(record: &mut JobRecord, outcome: CachedOutcome) {
    record.runtime_info = outcome.runtime_info;
    match (outcome.result, outcome.error) {
        (Some(result), _) => {
            record.result = Some(result);
            record.status = JobStatus::Finished;
        }
        (None, Some(error)) => {
            record.error = Some(error);
            record.status = JobStatus::Error;
        }
        (None, None) => {
            record.error = Some(JobError::framework("cache hit with neither result nor error"));
            record.status = JobStatus::Error;
        }
    }
}

fn finalize(
    record: &mut JobRecord,
    outcome: jobrelay_exec::Outcome,
    cache: Option<&dyn JobCache>,
    blob_store: &dyn BlobStore,
    logger: &Logger,
) {
    record.runtime_info = outcome.runtime_info;
    let fingerprint = record.fingerprint;

    match outcome.result {
        Ok(value) => {
            let canonical = jobrelay_codec::canonicalize(&value, blob_store).unwrap_or(value);
            if record.owns_reservation {
                if let (Some(cache), Some(fingerprint)) = (cache, fingerprint) {
                    if let Err(e) = cache.commit(&fingerprint, CachedOutcome::finished(canonical.clone(), record.runtime_info.clone())) {
                        warn!(logger, "failed to commit job result to cache"; "error" => e.to_string());
                    }
                }
            }
            record.result = Some(canonical);
            record.status = JobStatus::Finished;
        }
        Err(error) => {
            if record.owns_reservation {
                if let (Some(cache), Some(fingerprint)) = (cache, fingerprint) {
                    let outcome = if error.is_cacheable() {
                        cache.commit(&fingerprint, CachedOutcome::errored(error.clone(), record.runtime_info.clone()))
                    } else {
                        cache.release_failed(&fingerprint)
                    };
                    if let Err(e) = outcome {
                        warn!(logger, "failed to finalise job cache entry"; "error" => e.to_string());
                    }
                }
            }
            record.error = Some(error);
            record.status = JobStatus::Error;
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}
