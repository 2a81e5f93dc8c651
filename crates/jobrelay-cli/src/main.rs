//! `jobrelay-run`: the CLI entry point (the Rust shape of `hither2`'s
//! `maelstrom-run`-style client binary). It wires a `jobrelay-core`
//! `JobManager` up to whichever substrate the caller asks for and either
//! runs a single named job or walks through a scripted demo that exercises
//! every substrate end to end.

use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use jobrelay_base::error::JobError;
use jobrelay_base::value::Value;
use jobrelay_core::{ConfigStack, JobManager, PartialConfigFrame, RegisterOptions};
use jobrelay_exec::{BatchHandler, ParallelHandler};
use slog::{info, Logger};

#[derive(Parser)]
#[command(name = "jobrelay-run", version, about = "submit and drive jobrelay jobs from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "JOBRELAY_LOG_LEVEL", default_value = "info")]
    log_level: jobrelay_util::log::LogLevel,

    /// Directory backing the content-addressed blob store. Defaults to a
    /// fresh temporary directory so a one-off `run` never leaves state
    /// behind.
    #[arg(long, env = "BLOB_STORAGE_DIR")]
    blob_storage_dir: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum HandlerChoice {
    Local,
    Parallel,
    Batch,
    Remote,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one of the demo functions and block for its result.
    Run {
        /// One of the functions `jobrelay-run` ships: `sqr`, `addone`,
        /// `sumsqr`, `addem`, `boom` (always fails, for exercising error
        /// propagation).
        #[arg(long)]
        function: String,
        /// Arguments as a JSON literal, e.g. `3`, `[1,2,3]`, `{"x":1}`.
        #[arg(long, default_value = "null")]
        args: String,
        #[arg(long, default_value = "local")]
        handler: HandlerChoice,
        #[arg(long)]
        container: Option<String>,
        #[arg(long, default_value_t = num_cpus::get())]
        parallel_capacity: usize,
        #[arg(long, default_value_t = 30.0)]
        batch_stale_after_secs: f64,
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Walk through the scenarios every substrate is built to handle: a
    /// local dependency chain, a cache hit on identical arguments, an
    /// upstream failure propagating to a waiting downstream job, and a
    /// remote round trip through an in-memory doc store polled by an actual
    /// compute-resource daemon loop.
    Demo,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    jobrelay_util::log::run_with_logger(cli.log_level, |logger| {
        let blob_dir = match cli.blob_storage_dir {
            Some(dir) => dir,
            None => tempfile::tempdir()?.into_path().to_string_lossy().into_owned(),
        };
        let blob_store: Arc<dyn jobrelay_blobstore::BlobStore> =
            Arc::new(jobrelay_blobstore::FsBlobStore::open(&blob_dir).context("opening blob store")?);

        match cli.command {
            Command::Run { function, args, handler, container, parallel_capacity, batch_stale_after_secs, timeout } => {
                let manager = build_manager(blob_store.clone(), logger.clone());
                register_demo_functions(&manager);
                with_handler_frame(&manager, handler, parallel_capacity, batch_stale_after_secs, container, timeout, || {
                    let args = parse_args(&args, blob_store.as_ref())?;
                    let job = manager.run(&function, args)?;
                    match job.wait(timeout) {
                        Ok(value) => {
                            println!("{}", render(&value));
                            Ok(())
                        }
                        Err(error) => {
                            eprintln!("job failed: {error}");
                            std::process::exit(1);
                        }
                    }
                })
            }
            Command::Demo => run_demo(blob_store, logger),
        }
    })
}

fn build_manager(blob_store: Arc<dyn jobrelay_blobstore::BlobStore>, logger: Logger) -> JobManager {
    JobManager::new(blob_store, logger)
}

/// The function set every `jobrelay-run` invocation carries, matching the
/// names `jobrelay-worker`'s trampoline knows so the same job can be
/// dispatched locally or through a real compute resource without the
/// caller changing anything but `--handler`.
fn register_demo_functions(manager: &JobManager) {
    manager.register(
        "sqr",
        "0.1.0",
        concat!(file!(), ":sqr"),
        |v: &Value| {
            let x = v.as_float().ok_or_else(|| JobError::user_function("sqr expects a number"))?;
            Ok(Value::Float(x * x))
        },
        RegisterOptions::default(),
    );
    manager.register(
        "addone",
        "0.1.0",
        concat!(file!(), ":addone"),
        |v: &Value| {
            let x = v.as_float().ok_or_else(|| JobError::user_function("addone expects a number"))?;
            Ok(Value::Float(x + 1.0))
        },
        RegisterOptions::default(),
    );
    manager.register(
        "sumsqr",
        "0.1.0",
        concat!(file!(), ":sumsqr"),
        |v: &Value| {
            let items = match v {
                Value::Seq(items) => items,
                _ => return Err(JobError::user_function("sumsqr expects a sequence")),
            };
            let total: f64 = items.iter().filter_map(Value::as_float).map(|x| x * x).sum();
            Ok(Value::Float(total))
        },
        RegisterOptions::default(),
    );
    manager.register(
        "addem",
        "0.1.0",
        concat!(file!(), ":addem"),
        |v: &Value| {
            let items = match v {
                Value::Seq(items) => items,
                _ => return Err(JobError::user_function("addem expects a sequence")),
            };
            let total: f64 = items.iter().filter_map(Value::as_float).sum();
            Ok(Value::Float(total))
        },
        RegisterOptions::default(),
    );
    manager.register(
        "boom",
        "0.1.0",
        concat!(file!(), ":boom"),
        |_: &Value| Err(JobError::user_function("boom always fails")),
        RegisterOptions::default(),
    );
}

fn parse_args(raw: &str, blob_store: &dyn jobrelay_blobstore::BlobStore) -> Result<Value> {
    let plain: serde_json::Value = serde_json::from_str(raw).context("parsing --args as JSON")?;
    jobrelay_codec::deserialize(&plain, blob_store).context("decoding --args")
}

fn render(value: &Value) -> String {
    format!("{value:?}")
}

/// Registers whichever extra substrate `--handler` names, enters a
/// configuration frame selecting it, runs `body`, then lets the frame pop
/// on return. For `remote`, also starts a compute-resource daemon thread so
/// the job actually gets claimed and executed somewhere.
fn with_handler_frame(
    manager: &JobManager,
    handler: HandlerChoice,
    parallel_capacity: usize,
    batch_stale_after_secs: f64,
    container: Option<String>,
    timeout: Option<f64>,
    body: impl FnOnce() -> Result<()>,
) -> Result<()> {
    let mut overrides = PartialConfigFrame::default();
    if let Some(container) = container {
        overrides = overrides.with_container(jobrelay_core::ContainerSetting::Image(container));
    }
    if let Some(timeout) = timeout {
        overrides = overrides.with_job_timeout(timeout);
    }

    match handler {
        HandlerChoice::Local => {
            // No handler/cache override: the manager's default frame
            // already selects the local handler installed by `JobManager::new`.
            let _guard = ConfigStack::enter(overrides);
            body()
        }
        HandlerChoice::Parallel => {
            let parallel = Arc::new(ParallelHandler::new(parallel_capacity));
            manager.clone().with_handler(parallel.clone());
            let overrides = overrides.with_job_handler(parallel as Arc<dyn jobrelay_base::config::ConfigHandler>);
            let _guard = ConfigStack::enter(overrides);
            body()
        }
        HandlerChoice::Batch => {
            let root = tempfile::tempdir()?.into_path();
            let batch = Arc::new(BatchHandler::new(root, batch_stale_after_secs)?);
            manager.clone().with_handler(batch.clone());
            let overrides = overrides.with_job_handler(batch as Arc<dyn jobrelay_base::config::ConfigHandler>);
            let _guard = ConfigStack::enter(overrides);
            body()
        }
        HandlerChoice::Remote => bail!("remote handler wiring requires `demo`, which starts a matching compute-resource daemon"),
    }
}

/// An end-to-end walkthrough of the scenarios the substrates exist for.
/// Mirrors the test suites each crate already carries, but runs them in one
/// process so the behaviour is visible without reading test code.
fn run_demo(blob_store: Arc<dyn jobrelay_blobstore::BlobStore>, logger: Logger) -> Result<()> {
    info!(logger, "local dependency chain");
    let manager = build_manager(blob_store.clone(), logger.clone());
    register_demo_functions(&manager);

    let first = manager.run("addone", Value::Int(1))?;
    let second = manager.run("sqr", Value::JobRef(first.id()))?;
    info!(logger, "addone(1) then sqr(..)"; "result" => render(&second.wait(Some(10.0))?));

    info!(logger, "identical arguments share one execution via the cache");
    let a = manager.run("sqr", Value::Int(9))?;
    let b = manager.run("sqr", Value::Int(9))?;
    info!(logger, "two sqr(9) submissions"; "a" => render(&a.wait(Some(10.0))?), "b" => render(&b.wait(Some(10.0))?));

    info!(logger, "an upstream failure propagates without running the downstream job");
    let upstream = manager.run("boom", Value::Null)?;
    let downstream = manager.run("addone", Value::JobRef(upstream.id()))?;
    match downstream.wait(Some(10.0)) {
        Ok(v) => bail!("expected upstream failure to propagate, got {}", render(&v)),
        Err(e) => info!(logger, "downstream failed as expected"; "error" => e.to_string()),
    }

    info!(logger, "parallel handler runs work on a bounded worker pool");
    let parallel = Arc::new(ParallelHandler::new(2));
    let manager2 = manager.clone().with_handler(parallel.clone());
    {
        let overrides = PartialConfigFrame::default()
            .with_job_handler(parallel as Arc<dyn jobrelay_base::config::ConfigHandler>);
        let _guard = ConfigStack::enter(overrides);
        let jobs: Vec<_> = (0..4)
            .map(|i| manager2.run("addone", Value::Int(i)))
            .collect::<Result<_, _>>()?;
        for job in jobs {
            info!(logger, "parallel addone"; "result" => render(&job.wait(Some(10.0))?));
        }
    }

    info!(logger, "remote round trip through an in-memory doc store and a compute-resource daemon");
    let doc_store: Arc<dyn jobrelay_docstore::DocStore> = Arc::new(jobrelay_docstore::InMemoryDocStore::new());
    let remote = Arc::new(jobrelay_remote::RemoteHandler::new("demo-resource", doc_store.clone(), blob_store.clone()));
    let manager3 = manager.clone().with_handler(remote.clone());

    let daemon = jobrelay_worker::ComputeResourceDaemon::new(
        "demo-resource",
        doc_store,
        blob_store,
        Arc::new(DemoRunner),
        2,
        logger.clone(),
    );
    let keep_polling = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let poll_flag = keep_polling.clone();
    let poll_thread = std::thread::spawn(move || {
        while poll_flag.load(std::sync::atomic::Ordering::SeqCst) {
            let _ = daemon.tick();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    });

    let remote_job = {
        let overrides = PartialConfigFrame::default()
            .with_job_handler(remote as Arc<dyn jobrelay_base::config::ConfigHandler>);
        let _guard = ConfigStack::enter(overrides);
        manager3.run("sqr", Value::Int(6))?
    };
    info!(logger, "remote sqr(6)"; "result" => render(&remote_job.wait(Some(10.0))?));

    keep_polling.store(false, std::sync::atomic::Ordering::SeqCst);
    poll_thread.join().ok();

    info!(logger, "demo complete");
    Ok(())
}

/// The function set the simulated remote compute resource runs against
/// already-deserialised arguments, kept in lock step with
/// [`register_demo_functions`] so a job dispatched locally and one
/// dispatched remotely compute the same thing.
struct DemoRunner;

impl jobrelay_worker::FunctionRunner for DemoRunner {
    fn run(&self, function_name: &str, args: &Value) -> Result<Value, JobError> {
        match function_name {
            "sqr" => {
                let x = args.as_float().ok_or_else(|| JobError::user_function("sqr expects a number"))?;
                Ok(Value::Float(x * x))
            }
            "addone" => {
                let x = args.as_float().ok_or_else(|| JobError::user_function("addone expects a number"))?;
                Ok(Value::Float(x + 1.0))
            }
            other => Err(JobError::unknown_function(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_store() -> Arc<dyn jobrelay_blobstore::BlobStore> {
        Arc::new(jobrelay_blobstore::FsBlobStore::open(tempfile::tempdir().unwrap().into_path()).unwrap())
    }

    fn logger() -> Logger {
        jobrelay_util::log::build_logger(jobrelay_util::log::LogLevel::Error)
    }

    #[test]
    fn parse_args_decodes_scalars_and_sequences() {
        let blobs = blob_store();
        assert_eq!(parse_args("3", blobs.as_ref()).unwrap(), Value::Int(3));
        assert_eq!(
            parse_args("[1,2,3]", blobs.as_ref()).unwrap(),
            Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn run_local_sqr_matches_the_worker_trampolines_function_set() {
        let manager = build_manager(blob_store(), logger());
        register_demo_functions(&manager);
        let job = manager.run("sqr", Value::Int(5)).unwrap();
        assert_eq!(job.wait(Some(5.0)).unwrap(), Value::Float(25.0));
    }

    #[test]
    fn boom_fails_with_a_user_function_error() {
        let manager = build_manager(blob_store(), logger());
        register_demo_functions(&manager);
        let job = manager.run("boom", Value::Null).unwrap();
        let err = job.wait(Some(5.0)).unwrap_err();
        assert_eq!(err.kind, jobrelay_base::error::JobErrorKind::UserFunctionError);
    }

    #[test]
    fn with_handler_frame_dispatches_through_the_parallel_handler() {
        let manager = build_manager(blob_store(), logger());
        register_demo_functions(&manager);
        let observed = std::cell::RefCell::new(None);
        with_handler_frame(&manager, HandlerChoice::Parallel, 2, 30.0, None, Some(5.0), || {
            let job = manager.run("addone", Value::Int(1))?;
            *observed.borrow_mut() = Some(job.wait(Some(5.0))?);
            Ok(())
        })
        .unwrap();
        assert_eq!(observed.into_inner(), Some(Value::Float(2.0)));
    }
}
