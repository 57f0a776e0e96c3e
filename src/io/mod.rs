//! Cooperative I/O for fibers.
//!
//! Every helper here operates on the *current* fiber's descriptor and
//! suspends the fiber, never the thread. A fiber normally owns exactly one
//! descriptor and is the only one waiting on it.
//!
//! Each blocking helper has a `*_timeout` twin taking a [`Duration`]. When
//! the deadline passes first, the twin fails with an [`Error::Io`] of kind
//! [`TimedOut`](std::io::ErrorKind::TimedOut); see [`Error::is_timeout`].
//!
//! [`Duration`]: std::time::Duration
//! [`Error::Io`]: crate::Error::Io
//! [`Error::is_timeout`]: crate::Error::is_timeout

mod stream;
pub(crate) mod sys;
mod wait;

pub use stream::{
    connect, connect_timeout, flush_output, flush_output_timeout, read_at_least,
    read_at_least_timeout, read_full, read_full_timeout, write_full, write_full_timeout,
};
pub use wait::{sleep, unwait, wait_for, wait_for_child, wait_for_timeout};

pub(crate) use wait::require_fd;
