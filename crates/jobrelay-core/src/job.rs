//! The job entity (C3) as seen from outside the manager: a handle returned
//! by [`crate::JobManager::run`] that can be polled or blocked on without
//! exposing the manager's internal bookkeeping.

use jobrelay_base::error::JobError;
use jobrelay_base::job::{JobId, JobStatus};
use jobrelay_base::value::Value;

use crate::manager::JobManager;

/// A handle to one submitted job. Cheap to clone; every clone reads through
/// to the same manager-owned record.
#[derive(Clone)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) manager: JobManager,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// The job's current status, advancing the manager's tick loop once
    /// before reading it so a caller polling in a loop observes progress
    /// without having to drive the manager itself.
    pub fn status(&self) -> JobStatus {
        self.manager.tick_once();
        self.manager.status_of(self.id)
    }

    /// Blocks until the job reaches a terminal status, or `timeout` seconds
    /// elapse. Drives the manager's tick loop itself (§5: "the tick runs on
    /// the thread that calls `wait`").
    pub fn wait(&self, timeout: Option<f64>) -> Result<Value, JobError> {
        self.manager.drive_until_terminal(self.id, timeout)
    }

    /// Non-blocking: `None` while the job hasn't reached a terminal status
    /// yet, `Some` with the job's outcome once it has.
    pub fn result(&self) -> Option<Result<Value, JobError>> {
        self.manager.tick_once();
        self.manager.terminal_outcome(self.id)
    }
}
