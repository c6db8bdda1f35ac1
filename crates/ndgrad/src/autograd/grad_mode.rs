//! Thread-scoped switch for graph recording.
//!
//! While recording is disabled, operations still compute their forward
//! values but build no nodes and bind no gradient edges. The flag belongs to
//! the calling thread; other threads are unaffected.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Access to the calling thread's recording flag.
pub struct GradMode;

impl GradMode {
    pub fn is_enabled() -> bool {
        GRAD_ENABLED.with(|flag| flag.get())
    }

    pub fn set_enabled(enabled: bool) {
        GRAD_ENABLED.with(|flag| flag.set(enabled));
    }
}

/// Sets the recording flag for a scope and restores the previous value on drop.
///
/// Not `Send`: the guard must be dropped on the thread that created it.
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
pub struct GradModeGuard {
    prev: bool,
    _not_send: PhantomData<*const ()>,
}

impl GradModeGuard {
    pub fn new(enabled: bool) -> Self {
        let prev = GradMode::is_enabled();
        GradMode::set_enabled(enabled);
        Self {
            prev,
            _not_send: PhantomData,
        }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GradMode::set_enabled(self.prev);
    }
}

/// Disables recording for a scope.
#[must_use = "recording is re-enabled as soon as the guard is dropped"]
pub struct NoGradGuard {
    _guard: GradModeGuard,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self {
            _guard: GradModeGuard::new(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` with recording disabled.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = NoGradGuard::new();
    f()
}
