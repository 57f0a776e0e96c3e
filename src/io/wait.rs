use crate::error::{Error, Result};
use crate::fiber::{Fiber, current};
use crate::reactor::Interest;
use crate::runtime::context;
use crate::runtime::{deadline_after, suspend, suspend_until};

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

pub(crate) fn require_fd(fiber: &Fiber) -> Result<RawFd> {
    fiber.fd().ok_or_else(|| {
        Error::from(io::Error::new(
            io::ErrorKind::NotConnected,
            format!("fiber {} has no descriptor", fiber.name()),
        ))
    })
}

/// Arms the current fiber's descriptor for `interest` and suspends once.
///
/// The watcher stays armed after the fiber resumes, so a loop of `wait_for`
/// calls with the same interest registers only once. Resumption can also
/// come from a plain `call`; callers re-check readiness themselves.
///
/// # Errors
/// Fails when the fiber has no descriptor, when the poller rejects it, or
/// with [`Error::Raised`] when resumed through `raise`.
pub async fn wait_for(interest: Interest) -> Result<()> {
    wait_ready(interest, None).await
}

/// [`wait_for`] that gives up after `timeout`.
///
/// On timeout the watcher is disarmed and the error is an [`Error::Io`] of
/// kind [`io::ErrorKind::TimedOut`].
pub async fn wait_for_timeout(interest: Interest, timeout: Duration) -> Result<()> {
    let outcome = wait_ready(interest, deadline_after(timeout)).await;
    if matches!(&outcome, Err(err) if err.is_timeout()) {
        unwait(interest);
    }
    outcome
}

pub(crate) async fn wait_ready(interest: Interest, deadline: Option<Instant>) -> Result<()> {
    let fiber = current();
    let fd = require_fd(&fiber)?;

    context::scheduler().watch_io(fd, fiber.fid(), interest)?;
    if suspend_until(deadline).await? {
        Ok(())
    } else {
        Err(Error::timed_out())
    }
}

/// Disarms the current fiber's descriptor if it is armed for any direction
/// in `interest`. Pass `Interest::all()` to disarm unconditionally.
pub fn unwait(interest: Interest) {
    if let Some(fd) = current().fd() {
        context::scheduler().unwatch_io(fd, interest);
    }
}

/// Suspends the current fiber for at least `duration`.
///
/// `sleep(Duration::ZERO)` still goes through one reactor turn.
///
/// # Errors
/// [`Error::Raised`] when resumed through `raise`; the timer is cancelled.
pub async fn sleep(duration: Duration) -> Result<()> {
    let fiber = current();
    let scheduler = context::scheduler();

    let key = scheduler.arm_timer(fiber.fid(), duration);
    fiber.set_timer(Some(key));

    let outcome = loop {
        if let Err(err) = suspend().await {
            break Err(err);
        }
        if !scheduler.timer_armed(key) {
            break Ok(());
        }
    };

    scheduler.cancel_timer(key);
    fiber.set_timer(None);
    outcome
}

/// Suspends until child process `pid` exits and returns its status.
///
/// A normal exit yields the exit code, a death by signal `128 + signal`, and
/// a child that cannot be waited for (already reaped elsewhere) `-1`.
pub async fn wait_for_child(pid: libc::pid_t) -> Result<i32> {
    let fiber = current();
    let scheduler = context::scheduler();
    scheduler.watch_child(pid, fiber.fid());

    let outcome = loop {
        if let Err(err) = suspend().await {
            break Err(err);
        }
        if let Some(status) = scheduler.child_status(pid) {
            break Ok(status);
        }
    };

    scheduler.unwatch_child(pid);
    outcome
}
