//! Readiness interest and readiness reports exchanged with the poller.

use bitflags::bitflags;
use std::os::unix::io::RawFd;

bitflags! {
    /// Directions a fiber can wait on for its descriptor.
    ///
    /// `Interest::all()` stands for "every direction" when passed to `unwait`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// One readiness report produced by a poller wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) fd: RawFd,
    pub(crate) ready: Interest,
}
