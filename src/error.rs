//! Error type shared by every fallible operation in the crate.

use std::io;

use thiserror::Error;

/// Errors surfaced by fibers, the reactor and the I/O helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed with no partial progress to report.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The fiber was resumed through `raise` instead of a plain call.
    #[error("fiber resumed with signal {signal}")]
    Raised { signal: i32 },

    /// `flush_output` gave up; the staged bytes that never left were discarded.
    #[error("peer unexpectedly gone, {unsent} bytes unwritten: {source}")]
    Unsent { unsent: usize, source: io::Error },

    /// A child bridge frame did not match its own length prefix.
    #[error("malformed frame: {details}")]
    Frame { details: String },

    /// `block_on` ran out of watchers while its future was still pending.
    #[error("run loop stalled: nothing can resume the main fiber")]
    Stalled,
}

impl Error {
    /// Returns the signal number when the fiber was resumed through `raise`.
    pub fn raised_signal(&self) -> Option<i32> {
        match self {
            Error::Raised { signal } => Some(*signal),
            _ => None,
        }
    }

    /// True for a deadline that passed, including one that cut a flush short.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io { source } | Error::Unsent { source, .. } => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    pub(crate) fn timed_out() -> Self {
        Error::from(io::Error::from(io::ErrorKind::TimedOut))
    }

    pub(crate) fn frame(details: impl Into<String>) -> Self {
        Error::Frame {
            details: details.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
