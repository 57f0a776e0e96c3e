//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub(crate) mod scheduler;
pub(crate) mod switch;
pub(crate) mod yield_now;

pub use core::Runtime;
pub(crate) use switch::call;
pub(crate) use yield_now::{deadline_after, suspend, suspend_until};
