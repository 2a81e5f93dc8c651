//! The handler contract (C5): the uniform interface the job manager (C12)
//! drives against all four substrates. `accept` hands a queued job to the
//! handler; `iterate` is the only point at which the handler reports
//! progress back, via [`HandlerEvent`] — this keeps job-status mutation
//! confined to the manager's tick (see §5's single-threaded-cooperative
//! model) even though a handler may run work on its own OS threads.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use jobrelay_base::config::ConfigHandler;
use jobrelay_base::error::JobError;
use jobrelay_base::job::{JobId, RuntimeInfo};
use jobrelay_base::value::Value;

/// A job's function, already resolved to a concrete callable. Registration
/// and name lookup (C2) happen one layer up, in `jobrelay-core`; by the time
/// a `Task` reaches a handler the function reference is fixed.
pub type JobFn = dyn Fn(&Value) -> Result<Value, JobError> + Send + Sync;

/// Everything a handler needs to execute one job, handed over by `accept`.
pub struct Task {
    pub job_id: JobId,
    pub fingerprint: String,
    pub function_name: String,
    pub function_version: String,
    pub label: Option<String>,
    pub function: Arc<JobFn>,
    pub args: Value,
    pub container: Option<String>,
    pub timeout: Option<f64>,
    pub no_resolve_input_files: bool,
    pub download_results: bool,
}

pub struct Outcome {
    pub result: Result<Value, JobError>,
    pub runtime_info: RuntimeInfo,
}

/// Returned by `accept` when a handler cannot currently take more work.
/// Retryable failures cause the job manager to leave the job `QUEUED` and
/// retry on a later tick (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    AtCapacity,
}

/// Progress reported by `iterate`. `Started` lets the manager move a job
/// from `QUEUED` to `RUNNING` only once the handler has actually begun
/// executing it, rather than the instant `accept` returns — this is what
/// makes "job N+1 stays QUEUED until a worker slot frees" (§8) observable
/// for handlers like the parallel pool that queue internally.
pub enum HandlerEvent {
    Started(JobId),
    Finished(JobId, Outcome),
}

pub trait Handler: ConfigHandler {
    fn accept(&self, task: Task) -> Result<(), AcceptError>;
    fn iterate(&self) -> Vec<HandlerEvent>;
    /// Best-effort abort. Returns `false` if the job already finished or is
    /// past the point where cancellation can take effect.
    fn cancel(&self, job_id: JobId) -> bool;
    fn is_remote(&self) -> bool;
}

pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

/// Runs `task.function` inline, catching panics so a user function that
/// panics is reported as a `UserFunctionError` instead of taking the caller
/// down with it, and bounding the call by `task.timeout` the same way
/// `harness.rs`'s `run_in_host_process` bounds its own in-host runner: the
/// work happens on a scoped thread, the caller waits on a channel with
/// `recv_timeout`, and a firing deadline reports `ERROR` with
/// `runtime_info.timed_out = true` rather than blocking the handler forever.
/// Shared by the local handler (C6) and the parallel handler's worker
/// threads (C7).
pub(crate) fn execute_inline(task: &Task) -> Outcome {
    let start = now_secs();
    let (timed_out, result) = std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        scope.spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                (task.function)(&task.args)
            }));
            let result = match outcome {
                Ok(r) => r,
                Err(payload) => Err(JobError::user_function(panic_message(&payload))),
            };
            let _ = tx.send(result);
        });
        match task.timeout {
            Some(secs) => match rx.recv_timeout(Duration::from_secs_f64(secs)) {
                Ok(result) => (false, result),
                Err(_) => (true, Err(JobError::timed_out(secs))),
            },
            None => (
                false,
                rx.recv()
                    .unwrap_or_else(|_| Err(JobError::framework("worker thread dropped without a result"))),
            ),
        }
    });
    let end = now_secs();
    Outcome {
        result,
        runtime_info: RuntimeInfo {
            start_time: Some(start),
            end_time: Some(end),
            timed_out,
            ..Default::default()
        },
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}
