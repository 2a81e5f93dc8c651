//! The process-wide (here: thread-local, per Design Note "In multi-threaded
//! ports, the stack is thread-local") configuration stack: scoped
//! acquisition via [`ConfigStack::enter`], guaranteed release on every exit
//! path via [`FrameGuard`]'s `Drop` impl (invariant 5).

use std::cell::RefCell;

use jobrelay_base::config::{ConfigFrame, PartialConfigFrame};

thread_local! {
    static STACK: RefCell<Vec<ConfigFrame>> = RefCell::new(Vec::new());
}

pub struct ConfigStack;

impl ConfigStack {
    /// Installs the default frame, replacing whatever is currently on the
    /// stack. Called once at job-manager bootstrap (invariant 5: "the
    /// configuration stack is never empty").
    pub fn set_default(frame: ConfigFrame) {
        STACK.with(|s| {
            let mut s = s.borrow_mut();
            s.clear();
            s.push(frame);
        });
    }

    /// The currently active frame. Panics if no default has been installed,
    /// matching `_Config.py`'s `config_stack[-1]` ("throws if no default
    /// set").
    pub fn current() -> ConfigFrame {
        STACK.with(|s| {
            s.borrow()
                .last()
                .cloned()
                .expect("ConfigStack::set_default was never called")
        })
    }

    pub fn depth() -> usize {
        STACK.with(|s| s.borrow().len())
    }

    /// Pushes a new frame built by layering `overrides` on top of the
    /// current frame, and returns a guard that pops it back off on drop —
    /// including on an early return or a panic unwinding through the
    /// caller's scope.
    #[must_use = "the frame is popped when the guard is dropped; binding it to `_` pops immediately"]
    pub fn enter(overrides: PartialConfigFrame) -> FrameGuard {
        let merged = ConfigFrame::layered_on(&overrides, &Self::current());
        STACK.with(|s| s.borrow_mut().push(merged));
        FrameGuard { _private: () }
    }
}

pub struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        STACK.with(|s| {
            let mut s = s.borrow_mut();
            assert!(s.len() > 1, "popped the default configuration frame");
            s.pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_restores_on_every_exit_path() {
        ConfigStack::set_default(ConfigFrame::default());
        let depth0 = ConfigStack::depth();
        {
            let _g = ConfigStack::enter(PartialConfigFrame::default());
            assert_eq!(ConfigStack::depth(), depth0 + 1);
        }
        assert_eq!(ConfigStack::depth(), depth0);

        // Exit via panic unwinding.
        let depth1 = ConfigStack::depth();
        let result = std::panic::catch_unwind(|| {
            let _g = ConfigStack::enter(PartialConfigFrame::default());
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(ConfigStack::depth(), depth1);
    }

    #[test]
    fn nested_frames_inherit_unset_fields() {
        ConfigStack::set_default(ConfigFrame {
            job_timeout: Some(10.0),
            ..Default::default()
        });
        let _g = ConfigStack::enter(PartialConfigFrame::default().with_download_results(true));
        let current = ConfigStack::current();
        assert_eq!(current.job_timeout, Some(10.0));
        assert_eq!(current.download_results, Some(true));
    }
}
