//! The function registry (C2): the map from a registered name to its
//! callable, version, and packaging metadata. `jobrelay-base::registry`
//! carries the plain-data `RegisterOptions`; this module owns the part that
//! needs to hold a boxed closure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jobrelay_base::error::JobError;
use jobrelay_base::registry::RegisterOptions;
use jobrelay_exec::JobFn;
use slog::{warn, Logger};

/// One registered function, plus everything the job manager needs to build a
/// `Task` from it without consulting the registry again.
#[derive(Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub version: String,
    pub function: Arc<JobFn>,
    pub options: RegisterOptions,
    /// An opaque identity for the registration site — a file path in
    /// hither2, here just whatever string the caller supplies (e.g. a
    /// `file!()`/`line!()` pair). Used only to detect divergent
    /// re-registration under the same name.
    pub source_path: String,
}

/// C2. Registration is idempotent under the same source; a second
/// registration of the same name from a *different* source is a warning, not
/// a hard failure — first-writer-wins (§9 Open Question (i), resolved in
/// DESIGN.md the way hither2's `core.py` actually behaves).
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    logger: Logger,
}

impl Registry {
    pub fn new(logger: Logger) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            logger,
        }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        source_path: impl Into<String>,
        function: Arc<JobFn>,
        options: RegisterOptions,
    ) {
        let name = name.into();
        let source_path = source_path.into();
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&name) {
            if existing.source_path != source_path {
                warn!(
                    self.logger,
                    "divergent re-registration of job function ignored";
                    "name" => name.clone(),
                    "first_source" => existing.source_path.clone(),
                    "second_source" => source_path,
                );
            }
            return;
        }
        entries.insert(
            name.clone(),
            RegistryEntry {
                name,
                version: version.into(),
                function,
                options,
                source_path,
            },
        );
    }

    pub fn lookup(&self, name: &str) -> Result<RegistryEntry, JobError> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::unknown_function(name))
    }
}
