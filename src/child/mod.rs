//! Forked helper processes bridged to fibers.
//!
//! Work that must block (a synchronous library, a CPU-heavy step) runs in a
//! forked child. The parent talks to it through two proxy fibers and plain
//! mailbox messages; see [`spawn_child`].

mod blocking;
mod bridge;
pub mod frame;

pub use blocking::BlockingHandler;
pub use bridge::{ChildBridge, spawn_child};
