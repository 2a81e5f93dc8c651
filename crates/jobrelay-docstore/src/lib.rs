//! The doc store used to coordinate remote dispatch (§4.9, §6). Out of
//! scope as a redesigned component per §1 ("the document store used for
//! remote coordination... referred to as the *doc store*"); this crate
//! defines the interface the remote handler (C9) and compute-resource
//! daemon (C10) consume, plus an in-memory implementation with real
//! compare-and-swap semantics for tests and for running the whole stack
//! without an external database.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use jobrelay_base::error::JobError;
use jobrelay_base::job::{JobId, RuntimeInfo};
use jobrelay_base::proto::{DocStatus, InlineOrUri, JobDocument};

/// Every mutating operation on a [`DocStore`] is atomic with respect to
/// concurrent callers: at most one `claim` may succeed per document
/// (§4.9's "at most one worker may claim a given doc"), which is the one
/// guarantee this interface exists to provide.
pub trait DocStore: Send + Sync {
    fn insert(&self, doc: JobDocument) -> Result<()>;

    /// Atomic create-if-absent: inserts `doc` and returns `true` only if no
    /// document for `doc.job_id` already existed. Callers that need a
    /// single winner out of several concurrent first-writers (the job
    /// cache's fingerprint-reservation row, for one) use this instead of
    /// `insert`, which is a blind upsert.
    fn insert_if_absent(&self, doc: JobDocument) -> Result<bool>;

    fn get(&self, job_id: JobId) -> Result<Option<JobDocument>>;
    fn delete(&self, job_id: JobId) -> Result<()>;

    /// Atomic CAS from `QUEUED` to `CLAIMED`, gated on `compute_resource_id`
    /// matching the document's target resource. Returns `true` iff this
    /// call performed the claim.
    fn claim(&self, job_id: JobId, compute_resource_id: &str, now: f64) -> Result<bool>;

    fn set_running(&self, job_id: JobId) -> Result<()>;
    fn set_heartbeat(&self, job_id: JobId, now: f64) -> Result<()>;

    fn finish(
        &self,
        job_id: JobId,
        result: InlineOrUri,
        runtime_info: RuntimeInfo,
    ) -> Result<()>;

    fn fail(&self, job_id: JobId, error: JobError, runtime_info: Option<RuntimeInfo>) -> Result<()>;

    fn list_queued_for(&self, compute_resource_id: &str) -> Result<Vec<JobDocument>>;
    fn list_claimed_for(&self, compute_resource_id: &str) -> Result<Vec<JobDocument>>;

    /// Reverts `CLAIMED` documents whose `heartbeat_at` is older than
    /// `now - stale_after_secs` back to `QUEUED` (§4.9: "stale docs revert
    /// to QUEUED"). Returns the reverted job ids.
    fn revert_stale_claims(&self, stale_after_secs: f64, now: f64) -> Result<Vec<JobId>>;
}

#[derive(Default)]
pub struct InMemoryDocStore {
    docs: Mutex<HashMap<JobId, JobDocument>>,
}

impl InMemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocStore for InMemoryDocStore {
    fn insert(&self, doc: JobDocument) -> Result<()> {
        self.docs.lock().unwrap().insert(doc.job_id, doc);
        Ok(())
    }

    fn insert_if_absent(&self, doc: JobDocument) -> Result<bool> {
        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(&doc.job_id) {
            return Ok(false);
        }
        docs.insert(doc.job_id, doc);
        Ok(true)
    }

    fn get(&self, job_id: JobId) -> Result<Option<JobDocument>> {
        Ok(self.docs.lock().unwrap().get(&job_id).cloned())
    }

    fn delete(&self, job_id: JobId) -> Result<()> {
        self.docs.lock().unwrap().remove(&job_id);
        Ok(())
    }

    fn claim(&self, job_id: JobId, compute_resource_id: &str, now: f64) -> Result<bool> {
        let mut docs = self.docs.lock().unwrap();
        let Some(doc) = docs.get_mut(&job_id) else {
            return Ok(false);
        };
        if doc.status != DocStatus::Queued || doc.compute_resource_id != compute_resource_id {
            return Ok(false);
        }
        doc.status = DocStatus::Claimed;
        doc.claimed_at = Some(now);
        doc.heartbeat_at = Some(now);
        Ok(true)
    }

    fn set_running(&self, job_id: JobId) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.get_mut(&job_id) {
            doc.status = DocStatus::Running;
        }
        Ok(())
    }

    fn set_heartbeat(&self, job_id: JobId, now: f64) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.get_mut(&job_id) {
            doc.heartbeat_at = Some(now);
        }
        Ok(())
    }

    fn finish(
        &self,
        job_id: JobId,
        result: InlineOrUri,
        runtime_info: RuntimeInfo,
    ) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.get_mut(&job_id) {
            doc.status = DocStatus::Finished;
            doc.result_serialized = Some(result);
            doc.runtime_info = Some(runtime_info);
        }
        Ok(())
    }

    fn fail(&self, job_id: JobId, error: JobError, runtime_info: Option<RuntimeInfo>) -> Result<()> {
        let mut docs = self.docs.lock().unwrap();
        if let Some(doc) = docs.get_mut(&job_id) {
            doc.status = DocStatus::Error;
            doc.error = Some(error);
            if runtime_info.is_some() {
                doc.runtime_info = runtime_info;
            }
        }
        Ok(())
    }

    fn list_queued_for(&self, compute_resource_id: &str) -> Result<Vec<JobDocument>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.status == DocStatus::Queued && d.compute_resource_id == compute_resource_id)
            .cloned()
            .collect())
    }

    fn list_claimed_for(&self, compute_resource_id: &str) -> Result<Vec<JobDocument>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.status == DocStatus::Claimed && d.compute_resource_id == compute_resource_id)
            .cloned()
            .collect())
    }

    fn revert_stale_claims(&self, stale_after_secs: f64, now: f64) -> Result<Vec<JobId>> {
        let mut docs = self.docs.lock().unwrap();
        let mut reverted = Vec::new();
        for doc in docs.values_mut() {
            if doc.status == DocStatus::Claimed {
                if let Some(heartbeat) = doc.heartbeat_at {
                    if now - heartbeat > stale_after_secs {
                        doc.status = DocStatus::Queued;
                        doc.claimed_at = None;
                        doc.heartbeat_at = None;
                        reverted.push(doc.job_id);
                    }
                }
            }
        }
        Ok(reverted)
    }
}
