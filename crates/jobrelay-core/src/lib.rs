//! The top-level facade (C2, C3, C12): function registration, job
//! submission, and the tick loop that drives jobs through the status
//! lattice to a terminal outcome. Everything else in the workspace — the
//! codec, the cache, the handler substrates — is a collaborator this crate
//! wires together behind `register`/`run`/`wait`/`reset`, the Rust shape of
//! `hither2.core`'s top-level API.

pub mod job;
pub mod manager;
pub mod registry;

pub use jobrelay_base::config::{ContainerSetting, PartialConfigFrame};
pub use jobrelay_base::error::{JobError, JobErrorKind};
pub use jobrelay_base::job::{JobId, JobStatus, RuntimeInfo};
pub use jobrelay_base::registry::RegisterOptions;
pub use jobrelay_base::value::{File, NumArray, NumDtype, Value};
pub use job::Job;
pub use jobrelay_util::config::{ConfigStack, FrameGuard};
pub use manager::JobManager;
pub use registry::RegistryEntry;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager() -> JobManager {
        let blob_store = Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap());
        let logger = jobrelay_util::log::build_logger(jobrelay_util::log::LogLevel::Error);
        JobManager::new(blob_store, logger)
    }

    fn addone(manager: &JobManager) {
        manager.register(
            "addone",
            "0.1.0",
            "test:addone",
            |v: &Value| Ok(Value::Float(v.as_float().ok_or_else(|| JobError::user_function("not a number"))? + 1.0)),
            RegisterOptions::default(),
        );
    }

    #[test]
    fn local_chain_runs_end_to_end() {
        let manager = manager();
        addone(&manager);

        let first = manager.run("addone", Value::Int(1)).unwrap();
        let second = manager.run("addone", Value::JobRef(first.id())).unwrap();

        assert_eq!(second.wait(Some(5.0)).unwrap(), Value::Float(3.0));
        assert_eq!(first.status(), JobStatus::Finished);
    }

    #[test]
    fn identical_fingerprints_share_one_execution() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        manager.register(
            "counted",
            "0.1.0",
            "test:counted",
            move |v: &Value| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(v.clone())
            },
            RegisterOptions::default(),
        );

        let a = manager.run("counted", Value::Int(7)).unwrap();
        let b = manager.run("counted", Value::Int(7)).unwrap();

        assert_eq!(a.wait(Some(5.0)).unwrap(), Value::Int(7));
        assert_eq!(b.wait(Some(5.0)).unwrap(), Value::Int(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upstream_failure_propagates_without_dispatching_the_downstream_job() {
        let manager = manager();
        let downstream_ran = Arc::new(AtomicUsize::new(0));
        let ran = downstream_ran.clone();

        manager.register(
            "boom",
            "0.1.0",
            "test:boom",
            |_: &Value| Err(JobError::user_function("always fails")),
            RegisterOptions::default(),
        );
        manager.register(
            "echo",
            "0.1.0",
            "test:echo",
            move |v: &Value| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(v.clone())
            },
            RegisterOptions::default(),
        );

        let upstream = manager.run("boom", Value::Null).unwrap();
        let downstream = manager.run("echo", Value::JobRef(upstream.id())).unwrap();

        let err = downstream.wait(Some(5.0)).unwrap_err();
        assert_eq!(err.kind, JobErrorKind::UpstreamError);
        assert_eq!(downstream_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn submitting_a_reference_to_an_unknown_job_is_rejected_immediately() {
        let manager = manager();
        addone(&manager);
        let bogus = JobId::new();
        let result = manager.run("addone", Value::JobRef(bogus));
        assert!(result.is_err());
    }

    #[test]
    fn running_an_unregistered_function_fails_with_unknown_function() {
        let manager = manager();
        let err = manager.run("never_registered", Value::Null).unwrap_err();
        assert_eq!(err.kind, JobErrorKind::UnknownFunction);
    }

    #[test]
    fn empty_argument_graph_executes_normally() {
        let manager = manager();
        manager.register(
            "ignores_args",
            "0.1.0",
            "test:ignores_args",
            |_: &Value| Ok(Value::Int(42)),
            RegisterOptions::default(),
        );
        let job = manager.run("ignores_args", Value::empty_map()).unwrap();
        assert_eq!(job.wait(Some(5.0)).unwrap(), Value::Int(42));
    }

    #[test]
    fn reset_forgets_jobs_but_keeps_the_registry() {
        let manager = manager();
        addone(&manager);
        let job = manager.run("addone", Value::Int(1)).unwrap();
        job.wait(Some(5.0)).unwrap();

        manager.reset();
        // The registration survives reset; a fresh run still works.
        let job = manager.run("addone", Value::Int(4)).unwrap();
        assert_eq!(job.wait(Some(5.0)).unwrap(), Value::Float(5.0));
    }
}
