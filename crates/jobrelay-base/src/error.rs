//! The error taxonomy from §7: `UnknownFunction`, `UpstreamError`,
//! `UserFunctionError`, `TimedOut`, `FrameworkError`, `BlobStoreUnavailable`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    UnknownFunction,
    UpstreamError,
    UserFunctionError,
    TimedOut,
    FrameworkError,
    BlobStoreUnavailable,
}

/// The error type returned by `Job::wait()` and recorded in `job.error`.
/// Carries `kind`, `message`, and (if available) remote stderr, per the
/// "User-visible behaviour" paragraph of §7.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub remote_stderr: Option<String>,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_stderr: None,
        }
    }

    pub fn unknown_function(name: &str) -> Self {
        Self::new(
            JobErrorKind::UnknownFunction,
            format!("no function registered under name {name:?}"),
        )
    }

    pub fn upstream(upstream: JobId, upstream_error: &JobError) -> Self {
        Self::new(
            JobErrorKind::UpstreamError,
            format!("upstream job {upstream} ended in error: {}", upstream_error.message),
        )
    }

    pub fn user_function(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::UserFunctionError, message)
    }

    pub fn timed_out(timeout_secs: f64) -> Self {
        Self::new(
            JobErrorKind::TimedOut,
            format!("execution exceeded timeout of {timeout_secs}s"),
        )
    }

    pub fn framework(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::FrameworkError, message)
    }

    pub fn blob_store_unavailable(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::BlobStoreUnavailable, message)
    }

    pub fn with_remote_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.remote_stderr = Some(stderr.into());
        self
    }

    /// `FrameworkError` outcomes are never committed to the cache (§7); this
    /// is the single predicate the job manager and cache consult before
    /// calling `commit`.
    pub fn is_cacheable(&self) -> bool {
        !matches!(self.kind, JobErrorKind::FrameworkError)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::framework(err.to_string())
    }
}
