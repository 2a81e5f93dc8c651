//! The configuration frame (§3 "Configuration frame"). The frame itself is
//! just data; the scoped stack that frames are pushed onto lives in
//! `jobrelay-util::config` so that `jobrelay-base` stays free of any
//! particular stack implementation.

use std::fmt;
use std::sync::Arc;

/// `container` is one of `{null, true, false, <image string>}`, matching
/// hither2's `core.py`: `true` resolves to the function's own declared
/// image, `false`/`null` both mean "no container", and a string is used
/// verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ContainerSetting {
    #[default]
    Null,
    False,
    True,
    Image(String),
}

impl ContainerSetting {
    /// Resolves against the function's own declared image (if any),
    /// reproducing `core.py`'s `run()` closure exactly.
    pub fn resolve(&self, declared: Option<&str>) -> Option<String> {
        match self {
            ContainerSetting::True => declared.map(ToOwned::to_owned),
            ContainerSetting::Image(s) => Some(s.clone()),
            ContainerSetting::Null | ContainerSetting::False => None,
        }
    }
}

/// Marker trait implemented by every handler type, so that `ConfigFrame` can
/// hold a type-erased handler reference without `jobrelay-base` depending on
/// `jobrelay-exec`. The real `Handler` trait (C5) extends this one.
pub trait ConfigHandler: Send + Sync + fmt::Debug {
    fn handler_name(&self) -> &str;
}

/// Marker trait implemented by every cache type, for the same reason. The
/// real `JobCache` trait (C4) extends this one.
pub trait ConfigCache: Send + Sync + fmt::Debug {
    fn cache_name(&self) -> &str;
}

/// One layer of the configuration stack (§3). A frame with every field unset
/// defers entirely to whatever the job manager's built-in defaults are; this
/// is the shape of the default frame installed at startup (invariant 5).
#[derive(Clone, Default)]
pub struct ConfigFrame {
    pub container: ContainerSetting,
    pub job_handler: Option<Arc<dyn ConfigHandler>>,
    pub job_cache: Option<Arc<dyn ConfigCache>>,
    pub download_results: Option<bool>,
    pub job_timeout: Option<f64>,
}

impl fmt::Debug for ConfigFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigFrame")
            .field("container", &self.container)
            .field("job_handler", &self.job_handler.as_ref().map(|h| h.handler_name()))
            .field("job_cache", &self.job_cache.as_ref().map(|c| c.cache_name()))
            .field("download_results", &self.download_results)
            .field("job_timeout", &self.job_timeout)
            .finish()
    }
}

impl ConfigFrame {
    /// Coalesces `self` on top of `base`: every field set in `self`
    /// overrides `base`, every unset field inherits `base`'s value. This is
    /// `_Config.py`'s `coalesce`, generalised to a plain merge function
    /// since Rust has no `Inherit` sentinel distinct from "not provided" —
    /// callers build an override frame with only the fields they want to
    /// change set to `Some`/non-default and leave the rest at `Default`.
    pub fn layered_on(overrides: &PartialConfigFrame, base: &ConfigFrame) -> ConfigFrame {
        ConfigFrame {
            container: overrides
                .container
                .clone()
                .unwrap_or_else(|| base.container.clone()),
            job_handler: overrides
                .job_handler
                .clone()
                .or_else(|| base.job_handler.clone()),
            job_cache: overrides.job_cache.clone().or_else(|| base.job_cache.clone()),
            download_results: overrides.download_results.or(base.download_results),
            job_timeout: overrides.job_timeout.or(base.job_timeout),
        }
    }
}

/// An override frame as constructed by a caller entering a scoped
/// configuration block (the Rust analogue of `hi.Config(...)`): every field
/// is `None`/unset unless the caller explicitly wants to override it.
#[derive(Clone, Default)]
pub struct PartialConfigFrame {
    pub container: Option<ContainerSetting>,
    pub job_handler: Option<Arc<dyn ConfigHandler>>,
    pub job_cache: Option<Arc<dyn ConfigCache>>,
    pub download_results: Option<bool>,
    pub job_timeout: Option<f64>,
}

impl PartialConfigFrame {
    pub fn with_container(mut self, container: ContainerSetting) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_job_handler(mut self, handler: Arc<dyn ConfigHandler>) -> Self {
        self.job_handler = Some(handler);
        self
    }

    pub fn with_job_cache(mut self, cache: Arc<dyn ConfigCache>) -> Self {
        self.job_cache = Some(cache);
        self
    }

    pub fn with_download_results(mut self, value: bool) -> Self {
        self.download_results = Some(value);
        self
    }

    pub fn with_job_timeout(mut self, seconds: f64) -> Self {
        self.job_timeout = Some(seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_setting_resolves_like_core_py() {
        assert_eq!(ContainerSetting::True.resolve(Some("docker://x")), Some("docker://x".into()));
        assert_eq!(ContainerSetting::True.resolve(None), None);
        assert_eq!(ContainerSetting::False.resolve(Some("docker://x")), None);
        assert_eq!(ContainerSetting::Null.resolve(Some("docker://x")), None);
        assert_eq!(
            ContainerSetting::Image("docker://y".into()).resolve(Some("docker://x")),
            Some("docker://y".into())
        );
    }

    #[test]
    fn layering_inherits_unset_fields() {
        let base = ConfigFrame {
            job_timeout: Some(30.0),
            download_results: Some(false),
            ..Default::default()
        };
        let overrides = PartialConfigFrame::default().with_container(ContainerSetting::True);
        let merged = ConfigFrame::layered_on(&overrides, &base);
        assert_eq!(merged.container, ContainerSetting::True);
        assert_eq!(merged.job_timeout, Some(30.0));
        assert_eq!(merged.download_results, Some(false));
    }
}
