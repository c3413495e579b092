use crate::hooks;
use crate::session::CallSite;

/// Attributes allocations to the frame `name` until dropped.
///
/// This is what [`measure`](crate::measure) expands to. Entering pushes the
/// frame as a child of the current one and counts a call; dropping makes the
/// caller's frame current again. Guards of interleaved futures may drop out
/// of order. A guard whose session has been disabled in the meantime does
/// nothing on drop.
///
/// ```rust
/// let _frame = memprof::FrameGuard::enter("load_config");
/// let config = std::fs::read_to_string("Cargo.toml");
/// ```
#[must_use = "the frame is left as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FrameGuard {
    site: Option<CallSite>,
}

impl FrameGuard {
    #[inline]
    pub fn enter(name: &str) -> Self {
        Self {
            site: hooks::enter_frame(name),
        }
    }

    /// Whether a frame was pushed.
    pub fn is_active(&self) -> bool {
        self.site.is_some()
    }
}

impl Drop for FrameGuard {
    #[inline]
    fn drop(&mut self) {
        if let Some(site) = self.site {
            hooks::leave_frame(site);
        }
    }
}
