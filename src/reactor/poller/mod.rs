//! Platform readiness queues.
//!
//! Both backends expose the same surface: `register`, `reregister`,
//! `deregister` and `poll`. Readiness is level-triggered.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;

use std::time::Duration;

// Rounds up so a 0.4ms deadline does not turn into a busy zero-timeout wait.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(duration) => {
            let mut millis = duration.as_millis();
            if Duration::from_millis(millis as u64) < duration {
                millis += 1;
            }
            millis.min(i32::MAX as u128) as i32
        }
    }
}
