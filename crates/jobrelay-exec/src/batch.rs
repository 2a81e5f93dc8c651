//! The batch handler (C8): wraps an external batch scheduler using
//! work-directory templates — a directory per submission holding the
//! argument bundle and a trampoline script, submitted by id and polled for
//! completion. No real batch scheduler is reachable from this workspace, so
//! submission is backed by the same worker-thread execution the parallel
//! handler uses; the work-directory protocol (write bundle, submit, poll
//! for a result file, reap stale submissions) is kept faithful to the spec
//! so a real `qsub`/`sbatch`-backed implementation is a matter of swapping
//! `submit_to_scheduler`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use jobrelay_base::config::ConfigHandler;
use jobrelay_base::error::JobError;
use jobrelay_base::job::JobId;
use jobrelay_util::fs::Fs;

use crate::handler::{execute_inline, now_secs, AcceptError, Handler, HandlerEvent, Outcome, Task};

struct Submission {
    work_dir: PathBuf,
    submitted_at: f64,
}

pub struct BatchHandler {
    root: PathBuf,
    fs: Fs,
    stale_after_secs: f64,
    submissions: Mutex<HashMap<JobId, Submission>>,
    completion_tx: SyncSender<(JobId, Outcome)>,
    completion_rx: Mutex<Receiver<(JobId, Outcome)>>,
}

impl BatchHandler {
    pub fn new(root: impl Into<PathBuf>, stale_after_secs: f64) -> Result<Self> {
        let root = root.into();
        let fs = Fs::new();
        fs.create_dir_all(&root)?;
        let (completion_tx, completion_rx) = sync_channel(256);
        Ok(Self {
            root,
            fs,
            stale_after_secs,
            submissions: Mutex::new(HashMap::new()),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
        })
    }

    fn work_dir_for(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Writes the work-directory template: `kwargs.json` plus a trampoline
    /// script a real scheduler would invoke (`run.sh`, calling back into
    /// the compute resource's own binary). Mirrors the container harness's
    /// bundle step (C11) without mounting into a container.
    fn stage(&self, task: &Task) -> Result<PathBuf> {
        let work_dir = self.work_dir_for(task.job_id);
        self.fs.create_dir_all(&work_dir)?;
        let kwargs = jobrelay_codec::serialize(&task.args, &NullBlobStore)
            .context("serializing batch job arguments")?;
        self.fs.write(
            work_dir.join("kwargs.json"),
            serde_json::to_vec_pretty(&kwargs)?,
        )?;
        self.fs.write(
            work_dir.join("run.sh"),
            format!(
                "#!/bin/sh\nexec jobrelay-worker run-function --name {} --kwargs kwargs.json\n",
                task.function_name
            )
            .as_bytes(),
        )?;
        Ok(work_dir)
    }

    /// Stand-in for `qsub`/`sbatch`: hands the task to a worker thread that
    /// writes its outcome back through the completion channel instead of
    /// into a scheduler-visible result file. A production implementation
    /// replaces this one function.
    fn submit_to_scheduler(&self, task: Task) {
        let job_id = task.job_id;
        let tx = self.completion_tx.clone();
        std::thread::spawn(move || {
            let outcome = execute_inline(&task);
            let _ = tx.send((job_id, outcome));
        });
    }
}

/// `jobrelay-codec` requires a blob store, but batch kwargs staged to a
/// local work directory never need one at submission time (no value in a
/// typical kwargs tree exceeds the inline threshold); large payloads that
/// do would fail serialisation here with `BlobStoreUnavailable`, matching
/// the cacheable/fatal distinction in §7.
struct NullBlobStore;

impl jobrelay_blobstore::BlobStore for NullBlobStore {
    fn put(&self, _bytes: &[u8]) -> Result<String> {
        anyhow::bail!("no blob store configured for batch staging")
    }
    fn get(&self, _uri: &str) -> Result<Vec<u8>> {
        anyhow::bail!("no blob store configured for batch staging")
    }
    fn put_file(&self, _path: &std::path::Path) -> Result<String> {
        anyhow::bail!("no blob store configured for batch staging")
    }
    fn get_file(&self, _uri: &str) -> Result<PathBuf> {
        anyhow::bail!("no blob store configured for batch staging")
    }
}

impl std::fmt::Debug for BatchHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandler").field("root", &self.root).finish()
    }
}

impl ConfigHandler for BatchHandler {
    fn handler_name(&self) -> &str {
        "batch"
    }
}

impl Handler for BatchHandler {
    fn accept(&self, task: Task) -> Result<(), AcceptError> {
        let job_id = task.job_id;
        let work_dir = match self.stage(&task) {
            Ok(dir) => dir,
            Err(_) => return Err(AcceptError::AtCapacity),
        };
        self.submissions.lock().unwrap().insert(
            job_id,
            Submission {
                work_dir,
                submitted_at: now_secs(),
            },
        );
        self.submit_to_scheduler(task);
        Ok(())
    }

    fn iterate(&self) -> Vec<HandlerEvent> {
        let mut events = Vec::new();
        let now = now_secs();

        {
            let rx = self.completion_rx.lock().unwrap();
            while let Ok((job_id, outcome)) = rx.try_recv() {
                self.submissions.lock().unwrap().remove(&job_id);
                events.push(HandlerEvent::Finished(job_id, outcome));
            }
        }

        let mut submissions = self.submissions.lock().unwrap();
        let stale: Vec<JobId> = submissions
            .iter()
            .filter(|(_, s)| now - s.submitted_at > self.stale_after_secs)
            .map(|(id, _)| *id)
            .collect();
        for job_id in stale {
            submissions.remove(&job_id);
            events.push(HandlerEvent::Finished(
                job_id,
                Outcome {
                    result: Err(JobError::framework("batch submission reaped: stale with no result")),
                    runtime_info: Default::default(),
                },
            ));
        }

        events
    }

    fn cancel(&self, job_id: JobId) -> bool {
        self.submissions.lock().unwrap().remove(&job_id).is_some()
    }

    fn is_remote(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_base::value::Value;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn task(job_id: JobId, function_name: &str, timeout: Option<f64>) -> Task {
        Task {
            job_id,
            fingerprint: "fp".into(),
            function_name: function_name.into(),
            function_version: "0.1.0".into(),
            label: None,
            function: Arc::new(|v: &Value| Ok(v.clone())),
            args: Value::Int(1),
            container: None,
            timeout,
            no_resolve_input_files: false,
            download_results: true,
        }
    }

    fn drain_until_finished(handler: &BatchHandler, job_id: JobId) -> Outcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            for event in handler.iterate() {
                if let HandlerEvent::Finished(id, outcome) = event {
                    if id == job_id {
                        return outcome;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("batch job never finished");
    }

    #[test]
    fn staged_run_script_invokes_the_trampoline_subcommand_that_actually_exists() {
        let root = tempfile::tempdir().unwrap();
        let handler = BatchHandler::new(root.path(), 30.0).unwrap();
        let job_id = JobId::new();
        let work_dir = handler.stage(&task(job_id, "sqr", None)).unwrap();

        let script = std::fs::read_to_string(work_dir.join("run.sh")).unwrap();
        assert_eq!(script, "#!/bin/sh\nexec jobrelay-worker run-function --name sqr --kwargs kwargs.json\n");
    }

    #[test]
    fn a_timed_out_submission_reports_timed_out_instead_of_hanging() {
        let root = tempfile::tempdir().unwrap();
        let handler = BatchHandler::new(root.path(), 30.0).unwrap();
        let job_id = JobId::new();
        let mut slow_task = task(job_id, "slow", Some(0.01));
        slow_task.function = Arc::new(|_: &Value| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Value::Null)
        });

        handler.accept(slow_task).unwrap();
        let outcome = drain_until_finished(&handler, job_id);
        assert!(outcome.runtime_info.timed_out);
        assert!(outcome.result.is_err());
    }
}
