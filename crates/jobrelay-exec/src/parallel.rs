//! The parallel handler (C7): a bounded pool of worker threads. Each
//! accepted job waits in a pending FIFO until a slot frees, then runs on
//! its own thread with `catch_unwind` so a panicking job can't corrupt the
//! pool or take its siblings down with it.
//!
//! This is isolation against a *panic*, not against a *crash*: a worker
//! that aborts the process outright (stack overflow, a raw `abort()`, a
//! segfault from `unsafe`/FFI inside a user function, or `std::process::
//! exit`) still takes the whole pool down with it, because every worker is
//! a thread in this same process, not a child process. True crash
//! isolation would mean re-executing the job out-of-process — the shape
//! `jobrelay-worker run-function` already exists for on the batch/remote
//! paths — but `Task.function` here is an in-process closure bound to this
//! binary's own registry, not a named, re-invokable unit of work a
//! freshly-spawned process could look up and run; re-marshaling an
//! arbitrary Rust closure across a process boundary has no idiomatic
//! equivalent to Python's pickling. See DESIGN.md for the full tradeoff.
//! Grounded in the teacher's dispatcher pattern: a `thread::spawn` worker
//! loop communicating over `mpsc::sync_channel`
//! (`maelstrom-client-process/src/lib.rs`), not async/Tokio.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;

use jobrelay_base::config::ConfigHandler;
use jobrelay_base::job::JobId;

use crate::handler::{execute_inline, AcceptError, Handler, HandlerEvent, Outcome, Task};

pub struct ParallelHandler {
    capacity: usize,
    pending: Mutex<VecDeque<Task>>,
    active: Mutex<HashMap<JobId, ()>>,
    active_count: AtomicUsize,
    completion_tx: SyncSender<(JobId, Outcome)>,
    completion_rx: Mutex<Receiver<(JobId, Outcome)>>,
}

impl ParallelHandler {
    /// `capacity` is the maximum number of jobs this handler runs at once;
    /// the teacher's own `num_cpus`-sized worker pools are the usual
    /// default (`num_cpus::get()`), but the caller decides.
    pub fn new(capacity: usize) -> Self {
        let (completion_tx, completion_rx) = sync_channel(capacity.max(1) * 4);
        Self {
            capacity: capacity.max(1),
            pending: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
        }
    }

    fn spawn_worker(&self, task: Task) {
        let job_id = task.job_id;
        let tx = self.completion_tx.clone();
        std::thread::spawn(move || {
            let outcome = execute_inline(&task);
            // The receiving end outlives every worker thread for the life
            // of the handler, so a send failure here would mean the
            // handler itself was dropped mid-flight; nothing useful to do
            // but drop the outcome.
            let _ = tx.send((job_id, outcome));
        });
    }
}

impl std::fmt::Debug for ParallelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelHandler")
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ConfigHandler for ParallelHandler {
    fn handler_name(&self) -> &str {
        "parallel"
    }
}

impl Handler for ParallelHandler {
    fn accept(&self, task: Task) -> Result<(), AcceptError> {
        self.pending.lock().unwrap().push_back(task);
        Ok(())
    }

    fn iterate(&self) -> Vec<HandlerEvent> {
        let mut events = Vec::new();

        {
            let rx = self.completion_rx.lock().unwrap();
            while let Ok((job_id, outcome)) = rx.try_recv() {
                self.active.lock().unwrap().remove(&job_id);
                self.active_count.fetch_sub(1, Ordering::SeqCst);
                events.push(HandlerEvent::Finished(job_id, outcome));
            }
        }

        loop {
            if self.active_count.load(Ordering::SeqCst) >= self.capacity {
                break;
            }
            let Some(task) = self.pending.lock().unwrap().pop_front() else {
                break;
            };
            let job_id = task.job_id;
            self.active.lock().unwrap().insert(job_id, ());
            self.active_count.fetch_add(1, Ordering::SeqCst);
            self.spawn_worker(task);
            events.push(HandlerEvent::Started(job_id));
        }

        events
    }

    fn cancel(&self, job_id: JobId) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if let Some(pos) = pending.iter().position(|t| t.job_id == job_id) {
            pending.remove(pos);
            return true;
        }
        // Already dispatched to a worker thread: best-effort cancellation
        // has no hook into an arbitrary running closure, so this reports
        // failure rather than pretending to stop it.
        false
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
    use std::time::Duration;

    fn task(job_id: JobId) -> Task {
        Task {
            job_id,
            fingerprint: "fp".into(),
            function_name: "test_fn".into(),
            function_version: "0.1.0".into(),
            label: None,
            function: Arc::new(|v: &Value| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(v.clone())
            }),
            args: Value::Int(1),
            container: None,
            timeout: None,
            no_resolve_input_files: false,
            download_results: true,
        }
    }

    fn drain_until_all_finished(handler: &ParallelHandler, expected: usize) -> Vec<HandlerEvent> {
        let mut finished = 0;
        let mut all = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while finished < expected && std::time::Instant::now() < deadline {
            let events = handler.iterate();
            for e in &events {
                if matches!(e, HandlerEvent::Finished(..)) {
                    finished += 1;
                }
            }
            all.extend(events);
            std::thread::sleep(Duration::from_millis(5));
        }
        all
    }

    #[test]
    fn respects_capacity_before_draining() {
        let handler = ParallelHandler::new(2);
        let ids: Vec<_> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            handler.accept(task(*id)).unwrap();
        }

        let events = handler.iterate();
        let started: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, HandlerEvent::Started(_)))
            .collect();
        assert_eq!(started.len(), 2, "only capacity-many jobs should start immediately");

        let rest = drain_until_all_finished(&handler, 3);
        let all_started: usize = events
            .iter()
            .chain(rest.iter())
            .filter(|e| matches!(e, HandlerEvent::Started(_)))
            .count();
        assert_eq!(all_started, 3);
    }

    #[test]
    fn a_panicking_worker_does_not_block_other_pending_jobs() {
        // Pins down the isolation boundary documented at the top of this
        // module: a panic in one worker is caught and reported as an
        // error, and the pool keeps running every other job normally. A
        // worker that aborts the process instead of panicking is out of
        // scope for this test (and for this handler) since it would take
        // the test process down too.
        let handler = ParallelHandler::new(2);
        let panics = JobId::new();
        let survives = JobId::new();

        let panicking_task = Task {
            job_id: panics,
            fingerprint: "fp".into(),
            function_name: "boom".into(),
            function_version: "0.1.0".into(),
            label: None,
            function: Arc::new(|_: &Value| panic!("worker boom")),
            args: Value::Null,
            container: None,
            timeout: None,
            no_resolve_input_files: false,
            download_results: true,
        };

        handler.accept(panicking_task).unwrap();
        handler.accept(task(survives)).unwrap();

        let events = drain_until_all_finished(&handler, 2);
        let outcomes: Vec<_> = events
            .into_iter()
            .filter_map(|e| match e {
                HandlerEvent::Finished(id, outcome) => Some((id, outcome)),
                _ => None,
            })
            .collect();

        let panicked = outcomes.iter().find(|(id, _)| *id == panics).unwrap();
        assert!(panicked.1.result.is_err());

        let ok = outcomes.iter().find(|(id, _)| *id == survives).unwrap();
        assert!(ok.1.result.is_ok());
    }

    #[test]
    fn cancel_removes_a_still_pending_job() {
        let handler = ParallelHandler::new(1);
        let running = JobId::new();
        let queued = JobId::new();
        handler.accept(task(running)).unwrap();
        handler.accept(task(queued)).unwrap();
        handler.iterate(); // starts `running`, leaves `queued` pending

        assert!(handler.cancel(queued));
        assert!(!handler.cancel(running));
    }
}
