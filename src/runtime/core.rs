use crate::builder::{Config, RuntimeBuilder};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::runtime::call;
use crate::runtime::context::enter_context;
use crate::runtime::scheduler::Scheduler;

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Single-threaded fiber runtime.
///
/// Owns the scheduler (registry, zombie pool, call stack) and the reactor.
/// Fibers only run while one of `block_on`, `run`, `run_for` or `enter` is
/// on the stack. Dropping the runtime drops every fiber and closes every
/// descriptor they own.
///
/// # Example
/// ```ignore
/// let mut rt = Runtime::new()?;
/// let answer = rt.block_on(async { 42 })?;
/// assert_eq!(answer, 42);
/// ```
pub struct Runtime {
    scheduler: Rc<Scheduler>,
}

impl Runtime {
    /// Creates a runtime with the default [`Config`].
    pub fn new() -> Result<Self> {
        RuntimeBuilder::new().build()
    }

    /// Returns a builder to tune the runtime before creating it.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub(crate) fn with_config(config: Config) -> Result<Self> {
        let scheduler = Scheduler::new(config)?;
        debug!("runtime created");

        Ok(Self {
            scheduler: Rc::new(scheduler),
        })
    }

    pub fn config(&self) -> &Config {
        self.scheduler.config()
    }

    /// Runs `function` inside this runtime's context without turning the
    /// reactor. Fibers created here run only when called.
    pub fn enter<F, R>(&self, function: F) -> R
    where
        F: FnOnce() -> R,
    {
        enter_context(self.scheduler.clone(), function)
    }

    /// Runs `future` as the `main` fiber and turns the reactor until it
    /// completes.
    ///
    /// # Errors
    /// [`Error::Stalled`] when no watcher is left that could resume the main
    /// fiber, [`Error::Io`] when the poller fails.
    pub fn block_on<F>(&mut self, future: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let scheduler = self.scheduler.clone();

        enter_context(scheduler.clone(), || {
            let output = Rc::new(RefCell::new(None));
            let slot = output.clone();

            let main = Fiber::create("main", None, 0, async move {
                let value = future.await;
                *slot.borrow_mut() = Some(value);
                Ok(())
            });
            call(&main);

            loop {
                if let Some(value) = output.borrow_mut().take() {
                    return Ok(value);
                }
                if scheduler.is_idle() {
                    return Err(Error::Stalled);
                }
                scheduler.run_once(None)?;
            }
        })
    }

    /// Turns the reactor until no watcher is left.
    pub fn run(&mut self) -> Result<()> {
        let scheduler = self.scheduler.clone();

        enter_context(scheduler.clone(), || {
            while !scheduler.is_idle() {
                scheduler.run_once(None)?;
            }
            Ok(())
        })
    }

    /// Turns the reactor until `duration` has elapsed or nothing is watched.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        let scheduler = self.scheduler.clone();
        let deadline = Instant::now() + duration;

        enter_context(scheduler.clone(), || {
            loop {
                let now = Instant::now();
                if now >= deadline || scheduler.is_idle() {
                    return Ok(());
                }
                scheduler.run_once(Some(deadline - now))?;
            }
        })
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
