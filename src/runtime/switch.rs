//! Explicit transfer of control between fibers.
//!
//! `call` runs the callee until it suspends or finishes, then returns to the
//! caller. The chain of callers forms a bounded stack; exactly one fiber is
//! current at any time.

use crate::fiber::Fiber;
use crate::runtime::context;

use std::rc::Rc;

/// Switches into `callee` and returns once it suspends or finishes.
///
/// Increments the callee's context-switch counter.
///
/// # Panics
/// Panics when the call stack is full, when `callee` is already running
/// (including a fiber calling itself), or outside of a runtime context.
pub fn call(callee: &Rc<Fiber>) {
    transfer(callee, None);
}

/// Like [`call`], but the callee's pending suspension point resolves to
/// `Err(Error::Raised { signal })`.
///
/// A fiber that has not started yet never observes the signal.
///
/// [`Error::Raised`]: crate::Error::Raised
pub fn raise(callee: &Rc<Fiber>, signal: i32) {
    transfer(callee, Some(signal));
}

/// Schedules `fiber` to be called by the scheduler on its next turn.
///
/// Nothing runs before this returns. Waking a fiber several times before the
/// turn calls it once; a fiber that finishes in the meantime is skipped. The
/// woken fiber sees an ordinary resume, so it must re-check whatever it was
/// waiting for.
pub fn wakeup(fiber: &Rc<Fiber>) {
    context::scheduler().wakeup(fiber);
}

/// Number of callers currently waiting on the call stack.
pub fn call_depth() -> usize {
    context::scheduler().call_depth()
}

fn transfer(callee: &Rc<Fiber>, signal: Option<i32>) {
    let scheduler = context::scheduler();

    scheduler.push_caller(callee);
    callee.note_switch();
    callee.deliver_signal(signal);

    callee.resume();

    callee.deliver_signal(None);
    scheduler.pop_caller();
}
