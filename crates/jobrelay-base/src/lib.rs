//! Data model shared by every `jobrelay` crate: the argument/result value
//! variant, the job entity and its status lattice, fingerprints, the error
//! taxonomy, configuration frames, and the wire schema used by the remote
//! dispatch protocol.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod job;
pub mod proto;
pub mod registry;
pub mod value;

pub use config::{ConfigFrame, ContainerSetting};
pub use error::{JobError, JobErrorKind};
pub use fingerprint::Fingerprint;
pub use job::{JobId, JobStatus, RuntimeInfo};
pub use registry::RegisterOptions;
pub use value::{File, FileRef, NumArray, Value};
