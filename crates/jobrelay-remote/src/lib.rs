//! The remote handler (C9): the client side of the two-party doc-store
//! protocol from §4.9. `accept` creates a `QUEUED` document; `iterate`
//! polls every outstanding document with a per-job exponential backoff and
//! turns status transitions into `HandlerEvent`s for the job manager.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use jobrelay_base::error::JobError;
use jobrelay_base::job::JobId;
use jobrelay_base::proto::{DocStatus, InlineOrUri, JobDocument, INLINE_SIZE_THRESHOLD_BYTES};
use jobrelay_base::config::ConfigHandler;
use jobrelay_blobstore::BlobStore;
use jobrelay_docstore::DocStore;
use jobrelay_exec::handler::{AcceptError, Handler, HandlerEvent, Outcome, Task};
use jobrelay_util::backoff::Backoff;

struct Tracked {
    backoff: Backoff,
    next_poll_at: f64,
    reported_running: bool,
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

pub struct RemoteHandler {
    compute_resource_id: String,
    doc_store: std::sync::Arc<dyn DocStore>,
    blob_store: std::sync::Arc<dyn BlobStore>,
    tracked: Mutex<HashMap<JobId, Tracked>>,
}

impl RemoteHandler {
    pub fn new(
        compute_resource_id: impl Into<String>,
        doc_store: std::sync::Arc<dyn DocStore>,
        blob_store: std::sync::Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            compute_resource_id: compute_resource_id.into(),
            doc_store,
            blob_store,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn payload_for(&self, value: &jobrelay_base::value::Value) -> Result<InlineOrUri> {
        let plain = jobrelay_codec::serialize(value, self.blob_store.as_ref())?;
        let encoded = serde_json::to_vec(&plain)?;
        if encoded.len() > INLINE_SIZE_THRESHOLD_BYTES {
            let uri = self.blob_store.put(&encoded)?;
            Ok(InlineOrUri::Uri(uri))
        } else {
            Ok(InlineOrUri::Inline(plain))
        }
    }

    fn resolve_payload(&self, payload: &InlineOrUri) -> Result<serde_json::Value> {
        match payload {
            InlineOrUri::Inline(plain) => Ok(plain.clone()),
            InlineOrUri::Uri(uri) => {
                let bytes = self.blob_store.get(uri)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }
}

impl std::fmt::Debug for RemoteHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandler")
            .field("compute_resource_id", &self.compute_resource_id)
            .finish()
    }
}

impl ConfigHandler for RemoteHandler {
    fn handler_name(&self) -> &str {
        "remote"
    }
}

impl Handler for RemoteHandler {
    fn accept(&self, task: Task) -> Result<(), AcceptError> {
        let kwargs_serialized = self
            .payload_for(&task.args)
            .map_err(|_| AcceptError::AtCapacity)?;

        let doc = JobDocument {
            job_id: task.job_id,
            compute_resource_id: self.compute_resource_id.clone(),
            status: DocStatus::Queued,
            fingerprint: task.fingerprint.clone(),
            function_name: task.function_name.clone(),
            function_version: task.function_version.clone(),
            container: task.container.clone(),
            code_bundle_uri: None,
            kwargs_serialized,
            result_serialized: None,
            runtime_info: None,
            error: None,
            claimed_at: None,
            heartbeat_at: None,
            no_resolve_input_files: task.no_resolve_input_files,
            download_results: task.download_results,
            job_timeout: task.timeout,
        };
        self.doc_store.insert(doc).map_err(|_| AcceptError::AtCapacity)?;
        self.tracked.lock().unwrap().insert(
            task.job_id,
            Tracked {
                backoff: Backoff::with_default_ceiling(std::time::Duration::from_millis(50)),
                next_poll_at: 0.0,
                reported_running: false,
            },
        );
        Ok(())
    }

    fn iterate(&self) -> Vec<HandlerEvent> {
        let mut events = Vec::new();
        let now = now_secs();
        let job_ids: Vec<JobId> = self.tracked.lock().unwrap().keys().copied().collect();

        for job_id in job_ids {
            let due = matches!(
                self.tracked.lock().unwrap().get(&job_id),
                Some(entry) if now >= entry.next_poll_at
            );
            if !due {
                continue;
            }

            let Ok(Some(doc)) = self.doc_store.get(job_id) else {
                continue;
            };

            match doc.status {
                DocStatus::Queued | DocStatus::Claimed => {
                    let mut tracked = self.tracked.lock().unwrap();
                    if let Some(entry) = tracked.get_mut(&job_id) {
                        entry.next_poll_at = now + entry.backoff.next_delay().as_secs_f64();
                    }
                }
                DocStatus::Running => {
                    let mut tracked = self.tracked.lock().unwrap();
                    let report_started = if let Some(entry) = tracked.get_mut(&job_id) {
                        entry.next_poll_at = now + entry.backoff.next_delay().as_secs_f64();
                        let was_unreported = !entry.reported_running;
                        entry.reported_running = true;
                        was_unreported
                    } else {
                        false
                    };
                    drop(tracked);
                    if report_started {
                        events.push(HandlerEvent::Started(job_id));
                    }
                }
                DocStatus::Finished => {
                    self.tracked.lock().unwrap().remove(&job_id);
                    let outcome = self.finish_outcome(&doc);
                    events.push(HandlerEvent::Finished(job_id, outcome));
                }
                DocStatus::Error => {
                    self.tracked.lock().unwrap().remove(&job_id);
                    let error = doc.error.clone().unwrap_or_else(|| {
                        JobError::framework("remote job ended in ERROR with no error payload")
                    });
                    events.push(HandlerEvent::Finished(
                        job_id,
                        Outcome {
                            result: Err(error),
                            runtime_info: doc.runtime_info.clone().unwrap_or_default(),
                        },
                    ));
                }
            }
        }

        events
    }

    fn cancel(&self, job_id: JobId) -> bool {
        let removed = self.tracked.lock().unwrap().remove(&job_id).is_some();
        if removed {
            let _ = self.doc_store.delete(job_id);
        }
        removed
    }

    fn is_remote(&self) -> bool {
        true
    }
}

impl RemoteHandler {
    fn finish_outcome(&self, doc: &JobDocument) -> Outcome {
        let runtime_info = doc.runtime_info.clone().unwrap_or_default();
        let result = match &doc.result_serialized {
            Some(payload) => self
                .resolve_payload(payload)
                .context("resolving remote result payload")
                .and_then(|plain| {
                    jobrelay_codec::deserialize(&plain, self.blob_store.as_ref())
                        .context("decoding remote result")
                })
                .map_err(|e| JobError::framework(e.to_string())),
            None => Err(JobError::framework("FINISHED document with no result payload")),
        };
        Outcome { result, runtime_info }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_base::value::Value;
    use jobrelay_docstore::InMemoryDocStore;
    use std::sync::Arc;

    fn handler() -> (RemoteHandler, Arc<InMemoryDocStore>) {
        let doc_store = Arc::new(InMemoryDocStore::new());
        let blob_store = Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
        (
            RemoteHandler::new("resource1", doc_store.clone(), blob_store),
            doc_store,
        )
    }

    fn task(job_id: JobId) -> Task {
        Task {
            job_id,
            fingerprint: "fp".into(),
            function_name: "sqr".into(),
            function_version: "0.1.0".into(),
            label: None,
            function: Arc::new(|v: &Value| Ok(v.clone())),
            args: Value::Int(5),
            container: None,
            timeout: None,
            no_resolve_input_files: false,
            download_results: true,
        }
    }

    #[test]
    fn accept_creates_a_queued_document() {
        let (handler, doc_store) = handler();
        let job_id = JobId::new();
        handler.accept(task(job_id)).unwrap();
        let doc = doc_store.get(job_id).unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Queued);
        assert_eq!(doc.function_name, "sqr");
    }

    #[test]
    fn iterate_surfaces_finished_documents() {
        let (handler, doc_store) = handler();
        let job_id = JobId::new();
        handler.accept(task(job_id)).unwrap();

        doc_store.claim(job_id, "resource1", 0.0).unwrap();
        doc_store.set_running(job_id).unwrap();
        doc_store
            .finish(
                job_id,
                InlineOrUri::Inline(serde_json::json!(25)),
                Default::default(),
            )
            .unwrap();

        let events = handler.iterate();
        assert_eq!(events.len(), 1);
        match &events[0] {
            HandlerEvent::Finished(id, outcome) => {
                assert_eq!(*id, job_id);
                assert_eq!(outcome.result.as_ref().unwrap(), &Value::Int(25));
            }
            _ => panic!("expected Finished"),
        }
    }

    #[test]
    fn iterate_surfaces_error_documents_without_caching() {
        let (handler, doc_store) = handler();
        let job_id = JobId::new();
        handler.accept(task(job_id)).unwrap();
        doc_store.claim(job_id, "resource1", 0.0).unwrap();
        doc_store
            .fail(job_id, JobError::user_function("boom"), None)
            .unwrap();

        let events = handler.iterate();
        match &events[0] {
            HandlerEvent::Finished(_, outcome) => assert!(outcome.result.is_err()),
            _ => panic!("expected Finished"),
        }
    }
}
