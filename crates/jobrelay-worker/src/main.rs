//! `jobrelay-worker`: the compute-resource daemon binary (C10), plus the
//! `run-function` subcommand the container harness (C11) and batch handler
//! (C8) trampoline scripts invoke. Config pattern follows the teacher's
//! `maelstrom-run`: a `clap`-derived struct, an env var prefix, and an XDG
//! state directory for anything persisted between runs.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use jobrelay_base::error::JobError;
use jobrelay_base::value::Value;
use jobrelay_worker::{ComputeResourceDaemon, FunctionRunner};

#[derive(Parser)]
#[command(name = "jobrelay-worker", version, about = "compute-resource daemon and job trampoline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "JOBRELAY_LOG_LEVEL", default_value = "info")]
    log_level: jobrelay_util::log::LogLevel,
}

#[derive(Subcommand)]
enum Command {
    /// Run the compute-resource daemon loop against an in-memory doc store,
    /// bound to `--resource-id`.
    Serve {
        #[arg(long, env = "JOBRELAY_RESOURCE_ID")]
        resource_id: String,
        #[arg(long, default_value_t = num_cpus::get())]
        capacity: usize,
        #[arg(long, env = "BLOB_STORAGE_DIR")]
        blob_storage_dir: String,
    },
    /// Trampoline entry point used by the container harness: runs one
    /// registered function against a `kwargs.json` file and writes
    /// `result.json` next to it.
    RunFunction {
        #[arg(long)]
        name: String,
        #[arg(long)]
        kwargs: std::path::PathBuf,
    },
}

/// The demo registry this binary carries. A full deployment re-registers
/// the same functions the main process registered via `jobrelay-core`;
/// compiled Rust has no dynamic-import equivalent to Python's pickled
/// source, so the worker binary's function set is fixed at compile time
/// rather than shipped inside the code bundle (see DESIGN.md).
struct DemoRegistry;

impl FunctionRunner for DemoRegistry {
    fn run(&self, name: &str, args: &Value) -> Result<Value, JobError> {
        match name {
            "sqr" => {
                let x = args.as_float().ok_or_else(|| JobError::user_function("sqr expects a number"))?;
                Ok(Value::Float(x * x))
            }
            "addone" => {
                let x = args.as_float().ok_or_else(|| JobError::user_function("addone expects a number"))?;
                Ok(Value::Float(x + 1.0))
            }
            "sumsqr" => {
                let items = match args {
                    Value::Seq(items) => items,
                    _ => return Err(JobError::user_function("sumsqr expects a sequence")),
                };
                let total: f64 = items.iter().filter_map(Value::as_float).map(|v| v * v).sum();
                Ok(Value::Float(total))
            }
            "addem" => {
                let items = match args {
                    Value::Seq(items) => items,
                    _ => return Err(JobError::user_function("addem expects a sequence")),
                };
                let total: f64 = items.iter().filter_map(Value::as_float).sum();
                Ok(Value::Float(total))
            }
            other => Err(JobError::unknown_function(other)),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    jobrelay_util::log::run_with_logger(cli.log_level, |logger| match cli.command {
        Command::Serve { resource_id, capacity, blob_storage_dir } => {
            std::env::set_var("BLOB_STORAGE_DIR", &blob_storage_dir);
            let doc_store: Arc<dyn jobrelay_docstore::DocStore> = Arc::new(jobrelay_docstore::InMemoryDocStore::new());
            let blob_store: Arc<dyn jobrelay_blobstore::BlobStore> =
                Arc::new(jobrelay_blobstore::FsBlobStore::open(blob_storage_dir)?);
            let daemon = ComputeResourceDaemon::new(
                resource_id,
                doc_store,
                blob_store,
                Arc::new(DemoRegistry),
                capacity,
                logger,
            );
            loop {
                daemon.tick()?;
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
        }
        Command::RunFunction { name, kwargs } => {
            let raw = std::fs::read(&kwargs).with_context(|| format!("reading {}", kwargs.display()))?;
            let plain: serde_json::Value = serde_json::from_slice(&raw)?;
            let blob_dir = std::env::var("BLOB_STORAGE_DIR").unwrap_or_default();
            let blob_store = jobrelay_blobstore::FsBlobStore::open(blob_dir)?;
            let args = jobrelay_codec::deserialize(&plain, &blob_store)?;
            let result = DemoRegistry.run(&name, &args);
            let (success, retval, error) = match result {
                Ok(v) => (true, Some(jobrelay_codec::serialize(&v, &blob_store)?), None),
                Err(e) => (false, None, Some(e)),
            };
            let doc = jobrelay_base::proto::ResultDocument {
                retval,
                success,
                runtime_info: Default::default(),
                error,
            };
            let out_path = kwargs.with_file_name("result.json");
            std::fs::write(&out_path, serde_json::to_vec_pretty(&doc)?)?;
            Ok(())
        }
    })
}
