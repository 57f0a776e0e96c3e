//! Fibers: cooperative tasks with their own identity, memory and mailbox.
//!
//! A fiber is an allocation that outlives the work it runs. When an entry
//! function returns, the fiber becomes a *zombie* and waits in the zombie pool
//! until [`Fiber::create`] hands it a new entry. The fiber object, its
//! suspended run loop and its regions are reused as-is; only the id, the name
//! and the descriptor change.
//!
//! Fiber state lives behind `Cell`/`RefCell` and every borrow is released
//! before control can switch to another fiber.

mod info;
pub(crate) mod mailbox;
pub mod region;
pub(crate) mod registry;

pub use info::{FiberInfo, fiber_info, render_fiber_info};
pub use mailbox::{
    InboxState, Message, pending_count, read_inbox, read_inbox_timeout, write_inbox,
};
pub use registry::{SCHED_FID, fiber_find, zombie_count};

use crate::error::Result;
use crate::fiber::mailbox::{Inbox, Slot};
use crate::fiber::region::{EXCHANGE_REGION_NAME, RegionPair, Span};
use crate::io::sys;
use crate::reactor::Interest;
use crate::reactor::core::TimerKey;
use crate::runtime::context;

use socket2::SockRef;
use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::io::IoSlice;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tracing::trace;

pub(crate) type Entry = Pin<Box<dyn Future<Output = Result<()>>>>;
pub(crate) type Stack = Pin<Box<dyn Future<Output = Infallible>>>;

// Upper bound on the spans handed to one writev(2).
const IOV_MAX: usize = 1024;

/// Name carried by recycled fibers in the zombie pool.
pub const ZOMBIE_NAME: &str = "zombie";

/// Snapshot of a fiber's region pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionStats {
    pub active_id: u64,
    pub active_name: String,
    pub exchange_id: u64,
    pub exchange_name: String,
    pub allocated: usize,
}

/// A cooperative task.
///
/// Handles are `Rc<Fiber>`. A handle stays valid after the fiber finishes,
/// but then refers to a zombie (`fid() == 0`) or to whatever task reused it.
pub struct Fiber {
    fid: Cell<u32>,
    name: RefCell<String>,
    fd: RefCell<Option<OwnedFd>>,
    has_peer: Cell<bool>,
    peer_name: RefCell<Option<String>>,
    csw: Cell<u64>,
    stack: RefCell<Option<Stack>>,
    entry: RefCell<Option<Entry>>,
    regions: RefCell<RegionPair>,
    output: RefCell<Vec<Span>>,
    cleanup: RefCell<Vec<Box<dyn FnOnce()>>>,
    inbox: RefCell<Inbox>,
    reading_inbox: Cell<bool>,
    signal: Cell<Option<i32>>,
    timer: Cell<Option<TimerKey>>,
}

impl Fiber {
    pub(crate) fn new(name: &str, inbox_capacity: usize) -> Self {
        Self {
            fid: Cell::new(0),
            name: RefCell::new(name.to_owned()),
            fd: RefCell::new(None),
            has_peer: Cell::new(false),
            peer_name: RefCell::new(None),
            csw: Cell::new(0),
            stack: RefCell::new(None),
            entry: RefCell::new(None),
            regions: RefCell::new(RegionPair::new(name)),
            output: RefCell::new(Vec::new()),
            cleanup: RefCell::new(Vec::new()),
            inbox: RefCell::new(Inbox::new(inbox_capacity)),
            reading_inbox: Cell::new(false),
            signal: Cell::new(None),
            timer: Cell::new(None),
        }
    }

    /// Creates a fiber that will run `entry` on its first call.
    ///
    /// A zombie is reused when one is available. `fd`, when given, becomes the
    /// fiber's descriptor and is closed when the entry returns. An
    /// `inbox_capacity` of `0` selects the runtime default.
    ///
    /// The fiber does not run until someone [`call`](crate::call)s it.
    ///
    /// # Panics
    /// Panics when invoked outside of a runtime context.
    pub fn create<F>(name: &str, fd: Option<OwnedFd>, inbox_capacity: usize, entry: F) -> Rc<Fiber>
    where
        F: Future<Output = Result<()>> + 'static,
    {
        context::scheduler().create_fiber(name, fd, inbox_capacity, Box::pin(entry))
    }

    /// Registry id; `0` for zombies, [`SCHED_FID`] for the scheduler.
    pub fn fid(&self) -> u32 {
        self.fid.get()
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    /// Renames the fiber and its active region.
    pub fn set_name(&self, name: &str) {
        name.clone_into(&mut self.name.borrow_mut());
        self.regions.borrow_mut().active_mut().set_name(name);
    }

    /// Raw descriptor owned by the fiber, if any.
    pub fn fd(&self) -> Option<RawFd> {
        self.fd.borrow().as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn has_peer(&self) -> bool {
        self.has_peer.get()
    }

    /// Number of times control switched into this fiber.
    pub fn csw(&self) -> u64 {
        self.csw.get()
    }

    pub fn is_zombie(&self) -> bool {
        self.fid.get() == 0
    }

    /// True while the fiber is blocked in `read_inbox`.
    pub fn is_reading_inbox(&self) -> bool {
        self.reading_inbox.get()
    }

    /// Messages queued in the inbox.
    pub fn pending_count(&self) -> usize {
        self.inbox.borrow().len()
    }

    pub fn inbox_state(&self) -> InboxState {
        self.inbox.borrow().state()
    }

    /// Copies of the queued inbox messages, oldest first. Nothing is dequeued.
    pub fn inbox_messages(&self) -> Vec<Message> {
        let regions = self.regions.borrow();
        self.inbox
            .borrow()
            .slots()
            .map(|slot| Message {
                sender: slot.sender,
                payload: regions.active().get(&slot.payload).to_vec(),
            })
            .collect()
    }

    pub fn region_stats(&self) -> RegionStats {
        let regions = self.regions.borrow();
        RegionStats {
            active_id: regions.active().id(),
            active_name: regions.active().name().to_owned(),
            exchange_id: regions.exchange().id(),
            exchange_name: regions.exchange().name().to_owned(),
            allocated: regions.active().allocated(),
        }
    }

    /// Copies of the staged output buffers, in write order.
    pub fn pending_output(&self) -> Vec<Vec<u8>> {
        let regions = self.regions.borrow();
        self.output
            .borrow()
            .iter()
            .map(|span| regions.active().get(span).to_vec())
            .collect()
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup.borrow().len()
    }

    /// Address of the fiber's run loop, stable across zombie reuse.
    ///
    /// `None` for the scheduler fiber, and while the fiber is running.
    pub fn stack_id(&self) -> Option<usize> {
        let stack = self.stack.try_borrow().ok()?;
        let stack = stack.as_ref()?;
        let loop_future: *const dyn Future<Output = Infallible> = stack.as_ref().get_ref();
        Some(loop_future as *const () as usize)
    }

    /// Printable `ip:port` of the connected peer.
    ///
    /// Only fibers spawned for accepted connections have a peer. The name is
    /// looked up once and cached; an unspecified IPv4 address yields `None`.
    pub fn peer_name(&self) -> Option<String> {
        if !self.has_peer.get() {
            return None;
        }
        if let Some(name) = self.peer_name.borrow().as_ref() {
            return Some(name.clone());
        }

        self.fd().filter(|fd| *fd >= 3)?;
        let address = self
            .with_socket(|socket| socket.peer_addr())
            .ok()?
            .as_socket()?;
        if address.ip() == IpAddr::from([0, 0, 0, 0]) {
            return None;
        }

        let name = address.to_string();
        *self.peer_name.borrow_mut() = Some(name.clone());
        Some(name)
    }

    /// Runs `op` on the fiber's descriptor viewed as a socket.
    ///
    /// The descriptor stays borrowed for the duration of `op`, which must not
    /// switch fibers.
    pub(crate) fn with_socket<R>(
        &self,
        op: impl FnOnce(SockRef<'_>) -> io::Result<R>,
    ) -> io::Result<R> {
        let fd = self.fd.borrow();
        let Some(fd) = fd.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("fiber {} has no descriptor", self.name()),
            ));
        };
        op(SockRef::from(fd))
    }

    /// Closes the fiber's descriptor and disarms its I/O watcher.
    ///
    /// Closing a fiber without a descriptor is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let Some(fd) = self.fd.borrow_mut().take() else {
            return Ok(());
        };

        if let Some(scheduler) = context::try_scheduler() {
            scheduler.unwatch_io(fd.as_raw_fd(), Interest::all());
        }
        self.has_peer.set(false);
        self.peer_name.borrow_mut().take();

        let raw = fd.into_raw_fd();
        if unsafe { libc::close(raw) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn set_fd(&self, fd: Option<OwnedFd>) {
        *self.fd.borrow_mut() = fd;
    }

    pub(crate) fn set_has_peer(&self, has_peer: bool) {
        self.has_peer.set(has_peer);
    }

    pub(crate) fn set_reading_inbox(&self, reading: bool) {
        self.reading_inbox.set(reading);
    }

    pub(crate) fn set_fid(&self, fid: u32) {
        self.fid.set(fid);
    }

    pub(crate) fn timer(&self) -> Option<TimerKey> {
        self.timer.get()
    }

    pub(crate) fn set_timer(&self, key: Option<TimerKey>) {
        self.timer.set(key);
    }

    pub(crate) fn note_switch(&self) {
        self.csw.set(self.csw.get() + 1);
    }

    pub(crate) fn deliver_signal(&self, signal: Option<i32>) {
        self.signal.set(signal);
    }

    pub(crate) fn take_signal(&self) -> Option<i32> {
        self.signal.take()
    }

    pub(crate) fn install_stack(&self, stack: Stack) {
        *self.stack.borrow_mut() = Some(stack);
    }

    pub(crate) fn install_entry(&self, entry: Entry) {
        *self.entry.borrow_mut() = Some(entry);
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.entry.borrow_mut().take()
    }

    /// Runs the fiber's loop until it suspends.
    ///
    /// # Panics
    /// Panics when the fiber is already running or has no loop.
    pub(crate) fn resume(&self) {
        let Ok(mut slot) = self.stack.try_borrow_mut() else {
            panic!("fiber {} is already running", self.name());
        };
        let Some(stack) = slot.as_mut() else {
            panic!("fiber {} has no stack to switch into", self.name());
        };

        let mut cx = Context::from_waker(Waker::noop());
        if let Poll::Ready(never) = stack.as_mut().poll(&mut cx) {
            match never {}
        }
    }

    /// Stores a copy of `payload` in the inbox unless it is full.
    pub(crate) fn deliver(&self, sender: u32, payload: &[u8]) -> bool {
        let mut inbox = self.inbox.borrow_mut();
        if inbox.is_full() {
            return false;
        }

        let payload = self.regions.borrow_mut().active_mut().alloc_copy(payload);
        inbox.push(Slot { sender, payload })
    }

    /// Dequeues the oldest message, copying its payload out of the region.
    pub(crate) fn take_message(&self) -> Option<Message> {
        let slot = self.inbox.borrow_mut().pop()?;
        let payload = self.regions.borrow().active().get(&slot.payload).to_vec();
        Some(Message {
            sender: slot.sender,
            payload,
        })
    }

    pub(crate) fn resize_inbox(&self, capacity: usize) {
        self.inbox.borrow_mut().resize(capacity);
    }

    pub(crate) fn stage_output(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let span = self.regions.borrow_mut().active_mut().alloc_copy(bytes);
        self.output.borrow_mut().push(span);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.output.borrow().is_empty()
    }

    /// Writes as much staged output as `fd` accepts and trims what went out.
    pub(crate) fn write_pending(&self, fd: RawFd) -> io::Result<usize> {
        let regions = self.regions.borrow();
        let mut output = self.output.borrow_mut();

        let slices: Vec<IoSlice<'_>> = output
            .iter()
            .take(IOV_MAX)
            .map(|span| IoSlice::new(regions.active().get(span)))
            .collect();
        let written = sys::writev(fd, &slices)?;
        drop(slices);

        let mut remaining = written;
        let mut finished = 0;
        for span in output.iter_mut() {
            if remaining < span.len() {
                span.advance(remaining);
                break;
            }
            remaining -= span.len();
            finished += 1;
        }
        output.drain(..finished);

        Ok(written)
    }

    /// Drops the staged output and returns how many bytes it held.
    pub(crate) fn discard_output(&self) -> usize {
        self.output.borrow_mut().drain(..).map(|span| span.len()).sum()
    }

    pub(crate) fn push_cleanup(&self, handler: Box<dyn FnOnce()>) {
        self.cleanup.borrow_mut().push(handler);
    }

    /// Runs the registered cleanup handlers in registration order.
    pub(crate) fn run_cleanup(&self) {
        let handlers = std::mem::take(&mut *self.cleanup.borrow_mut());
        for handler in handlers {
            handler();
        }
    }

    /// Runs cleanups, then swaps regions once `threshold` bytes are in use.
    ///
    /// Returns whether a swap happened.
    pub(crate) fn collect_garbage(&self, threshold: usize) -> bool {
        self.run_cleanup();

        let mut regions = self.regions.borrow_mut();
        if regions.active().allocated() < threshold {
            return false;
        }

        let before = regions.active().allocated();
        regions.swap();
        regions.active_mut().set_name(&self.name.borrow());
        regions.exchange_mut().set_name(EXCHANGE_REGION_NAME);

        for span in self.output.borrow_mut().iter_mut() {
            *span = regions.rehome(*span);
        }
        for slot in self.inbox.borrow_mut().slots_mut() {
            slot.payload = regions.rehome(slot.payload);
        }
        regions.exchange_mut().reset();

        trace!(
            fid = self.fid(),
            before,
            after = regions.active().allocated(),
            "regions swapped"
        );
        true
    }

    /// Returns the fiber to its just-allocated state, keeping the loop.
    pub(crate) fn recycle(&self) {
        self.set_name(ZOMBIE_NAME);
        self.fid.set(0);
        self.has_peer.set(false);
        self.peer_name.borrow_mut().take();
        self.reading_inbox.set(false);
        self.signal.set(None);
        self.timer.set(None);
        self.output.borrow_mut().clear();
        self.inbox.borrow_mut().clear();
        self.regions.borrow_mut().release();
    }

    /// Drops the loop, the entry and the descriptor; used at runtime shutdown.
    pub(crate) fn dismantle(&self) {
        let stack = self.stack.borrow_mut().take();
        drop(stack);
        let entry = self.entry.borrow_mut().take();
        drop(entry);
        self.cleanup.borrow_mut().clear();
        self.fd.borrow_mut().take();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("fid", &self.fid())
            .field("name", &self.name())
            .field("fd", &self.fd())
            .field("csw", &self.csw())
            .finish_non_exhaustive()
    }
}

/// The fiber currently running.
///
/// # Panics
/// Panics when invoked outside of a runtime context.
pub fn current() -> Rc<Fiber> {
    context::scheduler().current()
}

/// Runs the current fiber's cleanup handlers and compacts its regions.
///
/// Returns whether the regions were swapped.
pub fn gc() -> bool {
    let scheduler = context::scheduler();
    scheduler
        .current()
        .collect_garbage(scheduler.config().region_swap_threshold)
}

/// Registers a handler run at the next `gc`, or when the current task ends.
pub fn register_cleanup<F>(handler: F)
where
    F: FnOnce() + 'static,
{
    current().push_cleanup(Box::new(handler));
}

/// Copies `bytes` into the current fiber's region and queues them for
/// [`flush_output`](crate::io::flush_output).
pub fn add_iov(bytes: &[u8]) {
    current().stage_output(bytes);
}

/// Bytes queued by [`add_iov`] that have not been flushed yet.
pub fn pending_output_len() -> usize {
    current().output.borrow().iter().map(Span::len).sum()
}
