use crate::builder::Config;
use crate::error::Result;
use crate::fiber::registry::{Registry, SCHED_FID};
use crate::fiber::{Entry, Fiber, Stack};
use crate::reactor::Interest;
use crate::reactor::core::{Reactor, TimerKey, Wakeup};
use crate::runtime::switch::call;
use crate::runtime::yield_now::suspend;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Per-runtime scheduler state.
///
/// Borrows of the inner cells never span a switch, so any fiber may touch the
/// scheduler while others are suspended below it on the call stack.
pub(crate) struct Scheduler {
    config: Config,
    registry: RefCell<Registry>,
    reactor: RefCell<Reactor>,
    sched: Rc<Fiber>,
    current: RefCell<Rc<Fiber>>,
    call_stack: RefCell<Vec<Rc<Fiber>>>,
    // Fibers passed to `wakeup`, with the fid they had at the time.
    ready: RefCell<VecDeque<(u32, Rc<Fiber>)>>,
}

impl Scheduler {
    pub(crate) fn new(config: Config) -> io::Result<Self> {
        let reactor = Reactor::new(&config)?;

        let sched = Rc::new(Fiber::new("sched", config.default_inbox_capacity));
        sched.set_fid(SCHED_FID);

        let mut registry = Registry::new();
        registry.register(sched.clone());
        registry.track(sched.clone());

        Ok(Self {
            registry: RefCell::new(registry),
            reactor: RefCell::new(reactor),
            current: RefCell::new(sched.clone()),
            call_stack: RefCell::new(Vec::with_capacity(config.max_call_depth)),
            ready: RefCell::new(VecDeque::new()),
            sched,
            config,
        })
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn current(&self) -> Rc<Fiber> {
        self.current.borrow().clone()
    }

    pub(crate) fn is_sched(&self, fiber: &Rc<Fiber>) -> bool {
        Rc::ptr_eq(fiber, &self.sched)
    }

    pub(crate) fn call_depth(&self) -> usize {
        self.call_stack.borrow().len()
    }

    /// Makes `callee` current and remembers who to return to.
    ///
    /// # Panics
    /// Panics when the call stack is already `max_call_depth` deep.
    pub(crate) fn push_caller(&self, callee: &Rc<Fiber>) {
        let mut stack = self.call_stack.borrow_mut();
        assert!(
            stack.len() < self.config.max_call_depth,
            "fiber call stack overflow: depth {} reached while calling {}",
            stack.len(),
            callee.name()
        );

        let caller = self.current.replace(callee.clone());
        stack.push(caller);
    }

    pub(crate) fn pop_caller(&self) {
        let caller = self
            .call_stack
            .borrow_mut()
            .pop()
            .expect("fiber call stack underflow");
        *self.current.borrow_mut() = caller;
    }

    pub(crate) fn find(&self, fid: u32) -> Option<Rc<Fiber>> {
        self.registry.borrow().find(fid)
    }

    pub(crate) fn zombie_count(&self) -> usize {
        self.registry.borrow().zombie_count()
    }

    pub(crate) fn allocated_fibers(&self) -> Vec<Rc<Fiber>> {
        self.registry.borrow().allocated().to_vec()
    }

    pub(crate) fn create_fiber(
        &self,
        name: &str,
        fd: Option<OwnedFd>,
        inbox_capacity: usize,
        entry: Entry,
    ) -> Rc<Fiber> {
        let capacity = match inbox_capacity {
            0 => self.config.default_inbox_capacity,
            capacity => capacity,
        };

        let reused = self.registry.borrow_mut().pop_zombie();
        let fiber = match reused {
            Some(fiber) => {
                fiber.resize_inbox(capacity);
                fiber
            }
            None => {
                let fiber = Rc::new(Fiber::new(name, capacity));
                let stack: Stack = Box::pin(fiber_loop(Rc::downgrade(&fiber)));
                fiber.install_stack(stack);
                self.registry.borrow_mut().track(fiber.clone());
                fiber
            }
        };

        fiber.set_fd(fd);
        fiber.install_entry(entry);
        fiber.set_name(name);

        let mut registry = self.registry.borrow_mut();
        let fid = registry.next_fid();
        fiber.set_fid(fid);
        registry.register(fiber.clone());
        drop(registry);

        trace!(fid, name, "fiber created");
        fiber
    }

    /// Retires a fiber whose entry returned into the zombie pool.
    fn zombificate(&self, fiber: &Rc<Fiber>) {
        let fid = fiber.fid();
        fiber.run_cleanup();
        self.registry.borrow_mut().unregister(fid);
        fiber.recycle();
        self.registry.borrow_mut().push_zombie(fiber.clone());
        trace!(fid, "fiber retired");
    }

    pub(crate) fn watch_io(&self, fd: RawFd, fid: u32, interest: Interest) -> io::Result<()> {
        self.reactor.borrow_mut().watch_io(fd, fid, interest)
    }

    pub(crate) fn unwatch_io(&self, fd: RawFd, interest: Interest) {
        self.reactor.borrow_mut().unwatch_io(fd, interest);
    }

    pub(crate) fn arm_timer(&self, fid: u32, after: Duration) -> TimerKey {
        self.reactor.borrow_mut().arm_timer(fid, after)
    }

    pub(crate) fn arm_deadline(&self, fid: u32, deadline: Instant) -> TimerKey {
        self.reactor.borrow_mut().arm_deadline(fid, deadline)
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        self.reactor.borrow_mut().cancel_timer(key);
    }

    pub(crate) fn timer_armed(&self, key: TimerKey) -> bool {
        self.reactor.borrow().timer_armed(key)
    }

    pub(crate) fn watch_child(&self, pid: libc::pid_t, fid: u32) {
        self.reactor.borrow_mut().watch_child(pid, fid);
    }

    pub(crate) fn child_status(&self, pid: libc::pid_t) -> Option<i32> {
        self.reactor.borrow().child_status(pid)
    }

    pub(crate) fn unwatch_child(&self, pid: libc::pid_t) {
        self.reactor.borrow_mut().unwatch_child(pid);
    }

    /// Queues `fiber` to be called on the next turn. A fiber already queued
    /// is queued once; zombies are ignored.
    pub(crate) fn wakeup(&self, fiber: &Rc<Fiber>) {
        if fiber.is_zombie() {
            return;
        }
        let fid = fiber.fid();
        let mut ready = self.ready.borrow_mut();
        if ready.iter().any(|(queued, _)| *queued == fid) {
            return;
        }
        ready.push_back((fid, fiber.clone()));
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.ready.borrow().is_empty() && self.reactor.borrow().is_idle()
    }

    /// One reactor turn: wait, then resume every fiber that still owns a
    /// wakeup, in the order the wakeups were collected, then every fiber
    /// queued through `wakeup`.
    ///
    /// The poll does not block while fibers are queued.
    pub(crate) fn run_once(&self, limit: Option<Duration>) -> Result<()> {
        let limit = if self.ready.borrow().is_empty() {
            limit
        } else {
            Some(Duration::ZERO)
        };
        let wakeups = self.reactor.borrow_mut().turn(limit)?;

        for wakeup in wakeups {
            if let Some(fiber) = self.resolve(wakeup) {
                debug_assert!(self.is_sched(&self.current()));
                call(&fiber);
            }
        }

        // Fibers queued while this batch runs wait for the next turn.
        let ready = std::mem::take(&mut *self.ready.borrow_mut());
        for (fid, fiber) in ready {
            if fiber.fid() == fid {
                call(&fiber);
            }
        }
        Ok(())
    }

    fn resolve(&self, wakeup: Wakeup) -> Option<Rc<Fiber>> {
        match wakeup {
            Wakeup::Io { fd, ready } => {
                let watcher = self.reactor.borrow().io_watcher(fd)?;
                if !watcher.interest.intersects(ready) {
                    return None;
                }
                self.find(watcher.fid)
            }
            Wakeup::Timer { key, fid } => {
                let fiber = self.find(fid)?;
                (fiber.timer() == Some(key)).then_some(fiber)
            }
            Wakeup::Child { fid, .. } => self.find(fid),
        }
    }

    /// Drops every fiber's loop and descriptor.
    ///
    /// Loops hold handles to their own fiber, so they have to be dropped
    /// explicitly before the fibers can be freed.
    pub(crate) fn shutdown(&self) {
        let fibers = self.registry.borrow_mut().drain();
        debug!(fibers = fibers.len(), "scheduler shutting down");

        for fiber in &fibers {
            fiber.dismantle();
        }
        self.call_stack.borrow_mut().clear();
        self.ready.borrow_mut().clear();
        *self.current.borrow_mut() = self.sched.clone();
    }
}

/// The long-lived loop behind every fiber.
///
/// Each pass runs one entry function, then retires the fiber into the zombie
/// pool and parks until the fiber is handed its next entry. An entry that
/// returns `Err` is logged and retired like any other; a panic inside it is
/// not caught.
async fn fiber_loop(fiber: Weak<Fiber>) -> Infallible {
    loop {
        let entry = match fiber.upgrade() {
            Some(owner) => owner.take_entry(),
            None => None,
        };
        let Some(entry) = entry else {
            panic!("fiber resumed without an entry to run");
        };

        let outcome = entry.await;

        if let Some(owner) = fiber.upgrade() {
            if let Err(err) = outcome {
                error!(fid = owner.fid(), fiber = %owner.name(), error = %err, "fiber failed");
            }
            if let Err(err) = owner.close() {
                debug!(fid = owner.fid(), error = %err, "close on task exit failed");
            }
            let scheduler = crate::runtime::context::scheduler();
            scheduler.zombificate(&owner);
        }

        // Signals delivered to a zombie have nobody to observe them.
        let _ = suspend().await;
    }
}
