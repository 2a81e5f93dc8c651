//! The compute-resource daemon (C10): the server side of §4.9's protocol.
//! Its loop is claim → stage → execute → write outcome, bound to a fixed
//! `compute_resource_id` and its own concurrency cap. On startup it
//! resolves any `CLAIMED` documents left behind by a previous crashed
//! instance (§4.10 "crash recovery") before polling for new work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use jobrelay_base::error::JobError;
use jobrelay_base::job::{JobId, RuntimeInfo};
use jobrelay_base::proto::{DocStatus, InlineOrUri, INLINE_SIZE_THRESHOLD_BYTES};
use jobrelay_base::value::Value;
use jobrelay_blobstore::BlobStore;
use jobrelay_docstore::DocStore;
use slog::{info, warn, Logger};

/// Executes a named, registered function against already-resolved
/// arguments. The daemon never holds typed Rust closures directly — it
/// only knows function names from the doc store — so this is the seam a
/// real deployment wires to the same function registry `jobrelay-core`
/// builds for the local/parallel path.
pub trait FunctionRunner: Send + Sync {
    fn run(&self, function_name: &str, args: &Value) -> Result<Value, JobError>;
}

struct Completion {
    job_id: JobId,
    result: Result<Value, JobError>,
    runtime_info: RuntimeInfo,
}

pub struct ComputeResourceDaemon {
    compute_resource_id: String,
    doc_store: Arc<dyn DocStore>,
    blob_store: Arc<dyn BlobStore>,
    runner: Arc<dyn FunctionRunner>,
    capacity: usize,
    active: Mutex<HashMap<JobId, ()>>,
    active_count: AtomicUsize,
    completion_tx: SyncSender<Completion>,
    completion_rx: Mutex<Receiver<Completion>>,
    logger: Logger,
}

impl ComputeResourceDaemon {
    pub fn new(
        compute_resource_id: impl Into<String>,
        doc_store: Arc<dyn DocStore>,
        blob_store: Arc<dyn BlobStore>,
        runner: Arc<dyn FunctionRunner>,
        capacity: usize,
        logger: Logger,
    ) -> Self {
        let (completion_tx, completion_rx) = sync_channel(capacity.max(1) * 4);
        let daemon = Self {
            compute_resource_id: compute_resource_id.into(),
            doc_store,
            blob_store,
            runner,
            capacity: capacity.max(1),
            active: Mutex::new(HashMap::new()),
            active_count: AtomicUsize::new(0),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            logger,
        };
        daemon.recover_from_crash();
        daemon
    }

    /// Re-examines documents this resource previously claimed. Without
    /// durable execution state to resume from, the safe choice is to mark
    /// them `ERROR` rather than guess whether the interrupted function body
    /// already ran (§4.10).
    fn recover_from_crash(&self) {
        let Ok(claimed) = self.doc_store.list_claimed_for(&self.compute_resource_id) else {
            return;
        };
        for doc in claimed {
            warn!(self.logger, "recovering claimed job after restart"; "job_id" => doc.job_id.to_string());
            let _ = self.doc_store.fail(
                doc.job_id,
                JobError::framework("worker_restart"),
                doc.runtime_info,
            );
        }
    }

    fn payload_for(&self, value: &Value) -> Result<InlineOrUri> {
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
            InlineOrUri::Uri(uri) => Ok(serde_json::from_slice(&self.blob_store.get(uri)?)?),
        }
    }

    /// One iteration: harvest finished work, then claim and dispatch as
    /// many queued documents as the concurrency cap allows. Returns the
    /// number of documents claimed this tick.
    pub fn tick(&self) -> Result<usize> {
        self.harvest();
        self.claim_and_dispatch()
    }

    fn harvest(&self) {
        let completions: Vec<Completion> = {
            let rx = self.completion_rx.lock().unwrap();
            let mut out = Vec::new();
            while let Ok(c) = rx.try_recv() {
                out.push(c);
            }
            out
        };

        for completion in completions {
            self.active.lock().unwrap().remove(&completion.job_id);
            self.active_count.fetch_sub(1, Ordering::SeqCst);

            match completion.result {
                Ok(value) => match self.payload_for(&value) {
                    Ok(payload) => {
                        let _ = self.doc_store.finish(completion.job_id, payload, completion.runtime_info);
                    }
                    Err(e) => {
                        let _ = self.doc_store.fail(
                            completion.job_id,
                            JobError::blob_store_unavailable(e.to_string()),
                            Some(completion.runtime_info),
                        );
                    }
                },
                Err(error) => {
                    let _ = self
                        .doc_store
                        .fail(completion.job_id, error, Some(completion.runtime_info));
                }
            }
        }
    }

    fn claim_and_dispatch(&self) -> Result<usize> {
        let mut claimed_count = 0;
        let queued = self.doc_store.list_queued_for(&self.compute_resource_id)?;
        let now = now_secs();

        for doc in queued {
            if self.active_count.load(Ordering::SeqCst) >= self.capacity {
                break;
            }
            if !self.doc_store.claim(doc.job_id, &self.compute_resource_id, now)? {
                continue;
            }
            claimed_count += 1;
            self.active.lock().unwrap().insert(doc.job_id, ());
            self.active_count.fetch_add(1, Ordering::SeqCst);
            self.doc_store.set_running(doc.job_id)?;

            info!(self.logger, "dispatching claimed job"; "job_id" => doc.job_id.to_string(), "function" => doc.function_name.clone());

            let job_id = doc.job_id;
            let args = match self
                .resolve_payload(&doc.kwargs_serialized)
                .and_then(|plain| jobrelay_codec::deserialize(&plain, self.blob_store.as_ref()))
            {
                Ok(v) => v,
                Err(e) => {
                    let _ = self
                        .doc_store
                        .fail(job_id, JobError::framework(e.to_string()), None);
                    self.active.lock().unwrap().remove(&job_id);
                    self.active_count.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            };

            let runner = self.runner.clone();
            let tx = self.completion_tx.clone();
            let function_name = doc.function_name.clone();
            let timeout = doc.job_timeout;
            std::thread::spawn(move || {
                let start = now_secs();
                // Mirrors `jobrelay-exec::handler::execute_inline`'s
                // timeout wiring: the actual call runs on its own thread so
                // a deadline can be enforced with `recv_timeout` instead of
                // blocking this dispatch thread (and the doc store's
                // `FINISHED`/`ERROR` transition) on an unbounded wait.
                let (inner_tx, inner_rx) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let result = runner.run(&function_name, &args);
                    let _ = inner_tx.send(result);
                });
                let (timed_out, result) = match timeout {
                    Some(secs) => match inner_rx.recv_timeout(Duration::from_secs_f64(secs)) {
                        Ok(result) => (false, result),
                        Err(_) => (true, Err(JobError::timed_out(secs))),
                    },
                    None => (
                        false,
                        inner_rx
                            .recv()
                            .unwrap_or_else(|_| Err(JobError::framework("worker thread dropped without a result"))),
                    ),
                };
                let end = now_secs();
                let _ = tx.send(Completion {
                    job_id,
                    result,
                    runtime_info: RuntimeInfo {
                        start_time: Some(start),
                        end_time: Some(end),
                        timed_out,
                        ..Default::default()
                    },
                });
            });
        }

        Ok(claimed_count)
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_docstore::InMemoryDocStore;

    struct EchoRunner;
    impl FunctionRunner for EchoRunner {
        fn run(&self, _name: &str, args: &Value) -> Result<Value, JobError> {
            Ok(args.clone())
        }
    }

    struct FailingRunner;
    impl FunctionRunner for FailingRunner {
        fn run(&self, _name: &str, _args: &Value) -> Result<Value, JobError> {
            Err(JobError::user_function("nope"))
        }
    }

    fn daemon(runner: Arc<dyn FunctionRunner>) -> (ComputeResourceDaemon, Arc<InMemoryDocStore>, Arc<dyn BlobStore>) {
        let doc_store = Arc::new(InMemoryDocStore::new());
        let blob_store: Arc<dyn BlobStore> =
            Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
        let logger = jobrelay_util::log::build_logger(jobrelay_util::log::LogLevel::Error);
        let d = ComputeResourceDaemon::new("resource1", doc_store.clone(), blob_store.clone(), runner, 2, logger);
        (d, doc_store, blob_store)
    }

    fn queued_doc(job_id: JobId, resource: &str) -> jobrelay_base::proto::JobDocument {
        jobrelay_base::proto::JobDocument {
            job_id,
            compute_resource_id: resource.into(),
            status: DocStatus::Queued,
            fingerprint: "fp".into(),
            function_name: "echo".into(),
            function_version: "0.1.0".into(),
            container: None,
            code_bundle_uri: None,
            kwargs_serialized: InlineOrUri::Inline(serde_json::json!(5)),
            result_serialized: None,
            runtime_info: None,
            error: None,
            claimed_at: None,
            heartbeat_at: None,
            no_resolve_input_files: false,
            download_results: true,
            job_timeout: None,
        }
    }

    #[test]
    fn claims_executes_and_writes_back_a_result() {
        let (daemon, doc_store, _blobs) = daemon(Arc::new(EchoRunner));
        let job_id = JobId::new();
        doc_store.insert(queued_doc(job_id, "resource1")).unwrap();

        let claimed = daemon.tick().unwrap();
        assert_eq!(claimed, 1);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            daemon.tick().unwrap();
            let doc = doc_store.get(job_id).unwrap().unwrap();
            if doc.status == DocStatus::Finished {
                assert_eq!(doc.result_serialized.is_some(), true);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never finished");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn a_failing_function_writes_an_error_document() {
        let (daemon, doc_store, _blobs) = daemon(Arc::new(FailingRunner));
        let job_id = JobId::new();
        doc_store.insert(queued_doc(job_id, "resource1")).unwrap();
        daemon.tick().unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            daemon.tick().unwrap();
            let doc = doc_store.get(job_id).unwrap().unwrap();
            if doc.status == DocStatus::Error {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never errored");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn a_timed_out_job_writes_an_error_document_instead_of_hanging() {
        struct SlowRunner;
        impl FunctionRunner for SlowRunner {
            fn run(&self, _name: &str, _args: &Value) -> Result<Value, JobError> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Value::Null)
            }
        }

        let (daemon, doc_store, _blobs) = daemon(Arc::new(SlowRunner));
        let job_id = JobId::new();
        let mut doc = queued_doc(job_id, "resource1");
        doc.job_timeout = Some(0.01);
        doc_store.insert(doc).unwrap();
        daemon.tick().unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            daemon.tick().unwrap();
            let doc = doc_store.get(job_id).unwrap().unwrap();
            if doc.status == DocStatus::Error {
                assert!(doc.runtime_info.unwrap().timed_out);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "job never timed out");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn restart_marks_previously_claimed_docs_as_error() {
        let doc_store = Arc::new(InMemoryDocStore::new());
        let blob_store: Arc<dyn BlobStore> =
            Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
        let job_id = JobId::new();
        doc_store.insert(queued_doc(job_id, "resource1")).unwrap();
        doc_store.claim(job_id, "resource1", 0.0).unwrap();

        let logger = jobrelay_util::log::build_logger(jobrelay_util::log::LogLevel::Error);
        let _daemon = ComputeResourceDaemon::new(
            "resource1",
            doc_store.clone(),
            blob_store,
            Arc::new(EchoRunner),
            1,
            logger,
        );

        let doc = doc_store.get(job_id).unwrap().unwrap();
        assert_eq!(doc.status, DocStatus::Error);
        assert_eq!(doc.error.unwrap().message, "worker_restart");
    }
}
