//! Bounded per-fiber inboxes.
//!
//! The inbox is a ring of `C` slots that holds at most `C - 1` messages, so
//! an empty ring and a full one never share a `(head, tail)` pair. Payloads
//! are copied into the recipient's active region on delivery and copied out
//! again when read.

use crate::error::{Error, Result};
use crate::fiber::region::Span;
use crate::fiber::{Fiber, current};
use crate::runtime::{call, deadline_after, suspend_until};

use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::trace;

/// A message taken out of an inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Id of the fiber that wrote the message.
    pub sender: u32,
    pub payload: Vec<u8>,
}

/// Ring bookkeeping, exposed for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InboxState {
    pub capacity: usize,
    pub len: usize,
    pub head: usize,
    pub tail: usize,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Slot {
    pub(crate) sender: u32,
    pub(crate) payload: Span,
}

/// Fixed-capacity FIFO ring.
#[derive(Debug)]
pub(crate) struct Inbox {
    ring: Vec<Option<Slot>>,
    head: usize,
    tail: usize,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ring: vec![None; capacity.max(1)],
            head: 0,
            tail: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub(crate) fn len(&self) -> usize {
        let size = self.capacity();
        (size + self.head - self.tail) % size
    }

    pub(crate) fn is_full(&self) -> bool {
        self.len() == self.capacity() - 1
    }

    /// Appends a slot; returns `false` and changes nothing when full.
    pub(crate) fn push(&mut self, slot: Slot) -> bool {
        if self.is_full() {
            return false;
        }
        self.ring[self.head] = Some(slot);
        self.head = (self.head + 1) % self.capacity();
        true
    }

    pub(crate) fn pop(&mut self) -> Option<Slot> {
        if self.len() == 0 {
            return None;
        }
        let slot = self.ring[self.tail].take();
        self.tail = (self.tail + 1) % self.capacity();
        slot
    }

    pub(crate) fn clear(&mut self) {
        self.ring.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.tail = 0;
    }

    /// Drops queued messages and reallocates the ring if the size differs.
    pub(crate) fn resize(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity != self.capacity() {
            self.ring = vec![None; capacity];
        }
        self.clear();
    }

    /// Queued slots, oldest first.
    pub(crate) fn slots(&self) -> impl Iterator<Item = &Slot> {
        let size = self.capacity();
        (0..self.len()).filter_map(move |offset| self.ring[(self.tail + offset) % size].as_ref())
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.ring.iter_mut().filter_map(Option::as_mut)
    }

    pub(crate) fn state(&self) -> InboxState {
        InboxState {
            capacity: self.capacity(),
            len: self.len(),
            head: self.head,
            tail: self.tail,
        }
    }
}

/// Delivers a copy of `payload` to `recipient`, sent by the current fiber.
///
/// Returns `false` when the inbox is full; nothing is queued then. If the
/// recipient is blocked in [`read_inbox`], it runs before this returns.
pub fn write_inbox(recipient: &Rc<Fiber>, payload: &[u8]) -> bool {
    write_inbox_as(current().fid(), recipient, payload)
}

pub(crate) fn write_inbox_as(sender: u32, recipient: &Rc<Fiber>, payload: &[u8]) -> bool {
    if !recipient.deliver(sender, payload) {
        trace!(
            sender,
            recipient = recipient.fid(),
            "inbox full, message refused"
        );
        return false;
    }

    if recipient.is_reading_inbox() {
        call(recipient);
    }
    true
}

/// Takes the oldest message from the current fiber's inbox, suspending while
/// it is empty.
///
/// # Errors
/// Returns [`Error::Raised`](crate::Error::Raised) when resumed through `raise`.
pub async fn read_inbox() -> Result<Message> {
    read_inbox_until(None).await
}

/// [`read_inbox`] that gives up after `timeout` with a `TimedOut` error.
pub async fn read_inbox_timeout(timeout: Duration) -> Result<Message> {
    read_inbox_until(deadline_after(timeout)).await
}

async fn read_inbox_until(deadline: Option<Instant>) -> Result<Message> {
    let fiber = current();

    loop {
        if let Some(message) = fiber.take_message() {
            fiber.set_reading_inbox(false);
            return Ok(message);
        }

        fiber.set_reading_inbox(true);
        let resumed = suspend_until(deadline).await;
        fiber.set_reading_inbox(false);
        if !resumed? {
            return fiber.take_message().ok_or_else(Error::timed_out);
        }
    }
}

/// Messages waiting in `fiber`'s inbox.
pub fn pending_count(fiber: &Fiber) -> usize {
    fiber.pending_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::region::Region;

    fn slot(region: &mut Region, sender: u32, payload: &[u8]) -> Slot {
        Slot {
            sender,
            payload: region.alloc_copy(payload),
        }
    }

    #[test]
    fn holds_capacity_minus_one() {
        let mut region = Region::new("test");
        let mut inbox = Inbox::new(4);

        for sender in 0..3 {
            assert!(inbox.push(slot(&mut region, sender, b"m")));
        }
        assert!(inbox.is_full());

        let before = inbox.state();
        assert!(!inbox.push(slot(&mut region, 9, b"overflow")));
        assert_eq!(inbox.state(), before);
        assert_eq!(before.len, 3);
    }

    #[test]
    fn pops_in_fifo_order_across_wraparound() {
        let mut region = Region::new("test");
        let mut inbox = Inbox::new(3);

        for round in 0..5u32 {
            assert!(inbox.push(slot(&mut region, round, b"a")));
            assert!(inbox.push(slot(&mut region, round + 100, b"b")));
            assert_eq!(inbox.pop().map(|slot| slot.sender), Some(round));
            assert_eq!(inbox.pop().map(|slot| slot.sender), Some(round + 100));
            assert!(inbox.pop().is_none());
        }
    }

    #[test]
    fn capacity_one_accepts_nothing() {
        let mut region = Region::new("test");
        let mut inbox = Inbox::new(1);

        assert!(inbox.is_full());
        assert!(!inbox.push(slot(&mut region, 1, b"x")));
        assert_eq!(inbox.len(), 0);
    }

    #[test]
    fn resize_clears_and_changes_capacity() {
        let mut region = Region::new("test");
        let mut inbox = Inbox::new(4);
        inbox.push(slot(&mut region, 1, b"x"));

        inbox.resize(8);
        assert_eq!(inbox.state(), InboxState {
            capacity: 8,
            len: 0,
            head: 0,
            tail: 0
        });
    }

    #[test]
    fn slots_iterate_oldest_first() {
        let mut region = Region::new("test");
        let mut inbox = Inbox::new(3);
        inbox.push(slot(&mut region, 1, b"a"));
        inbox.pop();
        inbox.push(slot(&mut region, 2, b"b"));
        inbox.push(slot(&mut region, 3, b"c"));

        let senders: Vec<u32> = inbox.slots().map(|slot| slot.sender).collect();
        assert_eq!(senders, vec![2, 3]);
    }
}
