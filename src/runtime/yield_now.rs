use crate::error::{Error, Result};
use crate::runtime::context;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

// Pending exactly once. Returning `Pending` unwinds the poll back into
// whoever called the fiber, which is what a switch back to the caller is.
struct Suspend {
    yielded: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}

/// Suspends the current fiber until some other fiber or the reactor calls it.
///
/// Resolves to `Err(Error::Raised)` when the resume came from `raise`.
pub(crate) async fn suspend() -> Result<()> {
    Suspend { yielded: false }.await;

    match context::scheduler().current().take_signal() {
        Some(signal) => Err(Error::Raised { signal }),
        None => Ok(()),
    }
}

/// Gives control back to the fiber that called the current one.
///
/// Nothing reschedules the fiber automatically: it resumes only when someone
/// calls it, writes to its inbox while it reads, or a watcher it armed fires.
///
/// # Errors
/// Returns [`Error::Raised`] when the fiber is resumed through
/// [`raise`](crate::raise).
pub async fn yield_now() -> Result<()> {
    suspend().await
}

/// Like [`suspend`], with a timer armed when `deadline` is set.
///
/// Resolves to `Ok(false)` when the timer is what resumed the fiber and
/// `Ok(true)` for any other resume. The timer is gone afterwards either way.
pub(crate) async fn suspend_until(deadline: Option<Instant>) -> Result<bool> {
    let Some(deadline) = deadline else {
        return suspend().await.map(|()| true);
    };

    let scheduler = context::scheduler();
    let fiber = scheduler.current();
    let key = scheduler.arm_deadline(fiber.fid(), deadline);
    fiber.set_timer(Some(key));

    let outcome = suspend().await;
    let fired = !scheduler.timer_armed(key);
    scheduler.cancel_timer(key);
    fiber.set_timer(None);

    outcome.map(|()| !fired)
}

/// `now + timeout`, or no deadline at all when that overflows.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Gives control back like [`yield_now`], and additionally has the reactor
/// resume the fiber once `timeout` elapses.
///
/// Returns `true` when the timeout is what resumed the fiber, `false` when
/// something else did first.
///
/// # Errors
/// Returns [`Error::Raised`] when the fiber is resumed through
/// [`raise`](crate::raise).
pub async fn yield_timeout(timeout: Duration) -> Result<bool> {
    let resumed_early = suspend_until(deadline_after(timeout)).await?;
    Ok(!resumed_early)
}
