//! Registration metadata for the function registry (C2). The registry
//! itself — the map from `(name, version)` to a callable plus this metadata
//! — lives in `jobrelay-core`, since it needs to hold a boxed closure that
//! `jobrelay-base` has no business knowing the signature of beyond `Value ->
//! Value`. This module only carries the plain-data side of a registration.

/// Packaging and dispatch options attached to a registered function, the
/// Rust analogue of hither2's `@hi.container`, `@hi.additional_files`,
/// `@hi.local_modules`, and `@hi.opts(no_resolve_input_files=...)`
/// decorators.
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    /// The function's own declared container image, used when the active
    /// configuration's `container` setting is `ContainerSetting::True`.
    pub container: Option<String>,
    /// Extra files (beyond the function's own source file) to bundle into
    /// the code bundle for container/remote execution.
    pub additional_files: Vec<String>,
    /// Local module source trees to bundle alongside the function, made
    /// importable under `_local_modules/` in the code bundle (§6).
    pub local_modules: Vec<String>,
    /// If true, `File` arguments are passed through unresolved instead of
    /// having their bytes materialised before the function runs.
    pub no_resolve_input_files: bool,
}

impl RegisterOptions {
    pub fn with_container(mut self, image: impl Into<String>) -> Self {
        self.container = Some(image.into());
        self
    }

    pub fn with_additional_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_local_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_no_resolve_input_files(mut self, value: bool) -> Self {
        self.no_resolve_input_files = value;
        self
    }
}
