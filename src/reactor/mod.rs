//! Readiness, timer and child-exit watching.
//!
//! The reactor never runs fiber code itself. A turn collects wakeups and the
//! scheduler resumes the fibers that still own them.

pub(crate) mod core;
pub mod event;
mod poller;

pub use event::Interest;
