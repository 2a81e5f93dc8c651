//! External interfaces (§6): the doc-store schema for remote dispatch, the
//! code bundle format consumed by the container harness, and the result
//! document produced by both the harness and the remote worker.

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{JobId, RuntimeInfo};

/// Status of a remote job document, a subset of the job status lattice
/// specialised with `Claimed` for the doc-store CAS handshake (§4.9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocStatus {
    Queued,
    Claimed,
    Running,
    Finished,
    Error,
}

/// One document per remote job (§6 "Doc-store schema").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDocument {
    pub job_id: JobId,
    pub compute_resource_id: String,
    pub status: DocStatus,
    pub fingerprint: String,
    pub function_name: String,
    pub function_version: String,
    pub container: Option<String>,
    pub code_bundle_uri: Option<String>,
    pub kwargs_serialized: InlineOrUri,
    pub result_serialized: Option<InlineOrUri>,
    pub runtime_info: Option<RuntimeInfo>,
    pub error: Option<JobError>,
    pub claimed_at: Option<f64>,
    pub heartbeat_at: Option<f64>,
    pub no_resolve_input_files: bool,
    pub download_results: bool,
    pub job_timeout: Option<f64>,
}

/// A payload that is either inlined or, once it exceeds the 1 MiB threshold
/// named in §6, offloaded to the blob store and referenced by URI. The
/// inline form carries "plain-data" — the JSON produced by the value codec
/// (C1), not the typed `Value` the rest of the engine operates on; codec
/// round-tripping lives in `jobrelay-codec`, which knows how to turn this
/// back into a `Value`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InlineOrUri {
    Inline(serde_json::Value),
    Uri(String),
}

pub const INLINE_SIZE_THRESHOLD_BYTES: usize = 1024 * 1024;

/// A code bundle tree (§6): the recursive `{files, dirs}` shape passed to
/// the container harness. A synthetic `__init__.py`-equivalent entry in
/// `files` re-exports the target function; local modules (including the
/// harness's own runtime) are placed under `_local_modules/`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CodeBundle {
    pub files: Vec<CodeFile>,
    pub dirs: Vec<CodeDir>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeFile {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeDir {
    pub name: String,
    pub content: CodeBundle,
}

impl CodeBundle {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// The result document produced by the container harness and by the remote
/// worker path (§6 "Result document"). `retval` is always post-codec plain
/// data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultDocument {
    pub retval: Option<serde_json::Value>,
    pub success: bool,
    pub runtime_info: RuntimeInfo,
    pub error: Option<JobError>,
}
