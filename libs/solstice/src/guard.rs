//! Reentrancy guard for objects whose callbacks may call back into the
//! library and request their own destruction.
//!
//! The cell tracks whether any callback frame against the object is live
//! (`in_use`) and whether deletion was requested (`stale`). Destruction is
//! performed only when `stale && !in_use`; a request made mid-callback is
//! deferred until the outermost frame unwinds.

use std::cell::Cell;

#[derive(Debug, Default)]
pub struct ReentryCell {
    in_use: Cell<bool>,
    stale: Cell<bool>,
}

impl ReentryCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with `in_use` set, restoring the previous value afterwards so
    /// nested entries unwind correctly.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let prev = self.in_use.replace(true);
        let result = f();
        self.in_use.set(prev);
        result
    }

    pub fn in_use(&self) -> bool {
        self.in_use.get()
    }

    pub fn mark_stale(&self) {
        self.stale.set(true);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.get()
    }

    /// Request destruction. Runs `destructor` now if no callback frame is
    /// active and returns whether it ran; otherwise the owner must check
    /// [`should_destroy`] when its outermost frame returns.
    ///
    /// [`should_destroy`]: ReentryCell::should_destroy
    pub fn release(&self, destructor: impl FnOnce()) -> bool {
        self.stale.set(true);
        if self.in_use.get() {
            return false;
        }
        destructor();
        true
    }

    /// True when a deferred destruction request can now be honored.
    pub fn should_destroy(&self) -> bool {
        self.stale.get() && !self.in_use.get()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn release_outside_callback_is_immediate() {
        let cell = ReentryCell::new();
        let destroyed = Cell::new(false);
        assert!(cell.release(|| destroyed.set(true)));
        assert!(destroyed.get());
        assert!(cell.is_stale());
    }

    #[test]
    fn release_inside_callback_defers() {
        let cell = ReentryCell::new();
        let destroyed = Cell::new(false);
        cell.enter(|| {
            assert!(!cell.release(|| destroyed.set(true)));
            assert!(!destroyed.get());
            assert!(!cell.should_destroy());
        });
        assert!(cell.should_destroy());
        destroyed.set(true);
        assert!(destroyed.get());
    }

    #[test]
    fn nested_entries_defer_to_outermost() {
        let cell = ReentryCell::new();
        cell.enter(|| {
            cell.enter(|| {
                cell.mark_stale();
            });
            // inner frame unwound, outer still active
            assert!(!cell.should_destroy());
        });
        assert!(cell.should_destroy());
    }
}
