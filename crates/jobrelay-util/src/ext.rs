//! Small extension traits, matching `maelstrom_util::ext`.

/// Asserts an `Option` was `None`, for the common "insert and assert no
/// collision" pattern used throughout the job manager and caches.
pub trait OptionExt<T> {
    fn assert_is_none(&self);
}

impl<T> OptionExt<T> for Option<T> {
    fn assert_is_none(&self) {
        assert!(self.is_none(), "expected None, found Some(_)");
    }
}
