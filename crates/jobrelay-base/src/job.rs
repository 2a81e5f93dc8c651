//! The job status lattice, job identifiers, and runtime bookkeeping (C3).

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A stable job identifier. Doc-store documents key on the same value
/// (`job_id (ulid)` in the external interface schema).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(Ulid);

impl JobId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(u: Ulid) -> Self {
        Self(u)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

/// Status lattice from the data model: `PENDING -> (QUEUED|WAITING) ->
/// RUNNING -> (FINISHED|ERROR)`. Regressions are forbidden (invariant 1);
/// [`JobStatus::can_advance_to`] is the single place that rule is encoded,
/// so the job manager and every handler check transitions the same way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Waiting,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Queued | JobStatus::Waiting => 1,
            JobStatus::Running => 2,
            JobStatus::Finished | JobStatus::Error => 3,
        }
    }

    /// Whether moving from `self` to `next` is a legal step in the lattice.
    /// Same-rank lateral moves between `Queued` and `Waiting` are allowed
    /// (a job can bounce between them while it waits on dependencies and
    /// cache probes); every other move must strictly increase rank, and
    /// `Running` may only be reached once (invariant 2 is enforced by the
    /// caller refusing to re-accept a job already in `Running`, not by this
    /// rank check alone).
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        if self == next {
            return matches!(self, JobStatus::Queued | JobStatus::Waiting);
        }
        if matches!((self, next), (JobStatus::Queued, JobStatus::Waiting))
            || matches!((self, next), (JobStatus::Waiting, JobStatus::Queued))
        {
            return true;
        }
        next.rank() > self.rank()
    }
}

/// Wall time, captured console output, and timeout flag for one job
/// execution. `console_out` interleaves stdout/stderr in emission order, the
/// way `hither2.ConsoleCapture.runtime_info()` does; `stdout`/`stderr` are
/// kept separate as well since the remote/container result document (§6)
/// exposes both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub stdout: String,
    pub stderr: String,
    pub console_out: String,
    pub timed_out: bool,
}

impl RuntimeInfo {
    pub fn elapsed_seconds(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_forbids_regression() {
        assert!(!JobStatus::Running.can_advance_to(JobStatus::Queued));
        assert!(!JobStatus::Finished.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_advance_to(JobStatus::Finished));
    }

    #[test]
    fn lattice_allows_forward_path() {
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Queued));
        assert!(JobStatus::Pending.can_advance_to(JobStatus::Waiting));
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Waiting));
        assert!(JobStatus::Waiting.can_advance_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Running));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Finished));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Error));
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
