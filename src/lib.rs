//! Cooperative fiber runtime over a readiness reactor.
//!
//! Fibers are lightweight tasks that run until they explicitly give up
//! control. Everything happens on one thread: exactly one fiber is current
//! at any time, and control moves only through [`call`], [`yield_now`], the
//! reactor resuming a fiber whose watcher or timer fired, a [`wakeup`]
//! queued for the next turn, or a mailbox write waking a reader.
//!
//! # Architecture
//!
//! - **Runtime**: owns the scheduler and the reactor; `block_on` runs a future as the `main` fiber
//! - **Fiber**: id, name, descriptor, inbox and a pair of memory regions; recycled through a zombie pool
//! - **Switch**: `call`/`raise`/`yield_now` over a bounded call stack
//! - **Mailbox**: bounded inboxes with copy-in/copy-out delivery
//! - **Reactor**: epoll or kqueue readiness, timers and child-exit watchers
//! - **I/O helpers**: read/write loops on the current fiber's descriptor
//! - **Acceptor**: TCP and UDP listening fibers with bind retry
//! - **Child bridge**: forked helper processes reached through proxy fibers
//!
//! # Example
//! ```ignore
//! use fiberloop::{Fiber, Runtime, call, read_inbox, write_inbox, current};
//!
//! let mut rt = Runtime::new()?;
//! let reply = rt.block_on(async {
//!     let main = current();
//!     let worker = Fiber::create("worker", None, 0, async move {
//!         let request = read_inbox().await?;
//!         write_inbox(&main, &request.payload);
//!         Ok(())
//!     });
//!     call(&worker);
//!     write_inbox(&worker, b"ping");
//!     read_inbox().await
//! })??;
//! assert_eq!(reply.payload, b"ping");
//! ```

mod builder;
pub mod child;
mod error;
pub mod fiber;
pub mod io;
pub mod net;
pub mod reactor;
mod runtime;

pub use builder::{Config, RuntimeBuilder};
pub use error::{Error, Result};
pub use fiber::{
    Fiber, FiberInfo, InboxState, Message, add_iov, current, fiber_find, fiber_info, gc,
    pending_count, read_inbox, read_inbox_timeout, register_cleanup, render_fiber_info,
    write_inbox,
};
pub use reactor::Interest;
pub use runtime::Runtime;
pub use runtime::switch::{call, call_depth, raise, wakeup};
pub use runtime::yield_now::{yield_now, yield_timeout};
