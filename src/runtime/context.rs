//! Thread-local runtime context.
//!
//! Fibers, the I/O helpers and the acceptor reach the scheduler through this
//! module instead of carrying a handle around. [`enter_context`] installs a
//! scheduler for the duration of a closure and restores the previous one on
//! exit, including when the closure unwinds.

use crate::runtime::scheduler::Scheduler;

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    /// Scheduler of the runtime currently driving this thread.
    ///
    /// Set by [`enter_context`] for every `block_on`, `run` and `enter`.
    pub(crate) static CURRENT_SCHEDULER: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

// Puts the previous scheduler back when dropped.
struct Restore(Option<Rc<Scheduler>>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT_SCHEDULER.with(|current| *current.borrow_mut() = previous);
    }
}

/// Runs `function` with `scheduler` installed as the thread's runtime.
pub(crate) fn enter_context<F, R>(scheduler: Rc<Scheduler>, function: F) -> R
where
    F: FnOnce() -> R,
{
    let previous = CURRENT_SCHEDULER.with(|current| current.borrow_mut().replace(scheduler));
    let _restore = Restore(previous);

    function()
}

/// Returns the current scheduler.
///
/// # Panics
/// Panics when no runtime context is active on this thread.
pub(crate) fn scheduler() -> Rc<Scheduler> {
    try_scheduler().unwrap_or_else(|| {
        panic!("fiber API called outside of a runtime context; use Runtime::block_on or Runtime::enter")
    })
}

pub(crate) fn try_scheduler() -> Option<Rc<Scheduler>> {
    CURRENT_SCHEDULER.with(|current| current.borrow().clone())
}
