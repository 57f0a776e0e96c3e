//! Per-fiber bump regions.
//!
//! A fiber owns two regions. Everything it stages (output buffers, inbox
//! payloads) is copied into the *active* one and referenced through a
//! [`Span`]. When the active region grows past the swap threshold, `gc`
//! exchanges the pair, copies the live spans into the fresh active region
//! and resets the other one. Spans carry the epoch of the region they were cut
//! from, so a span that outlived its region is caught instead of read.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

/// Name given to the region parked behind the active one after a swap.
pub const EXCHANGE_REGION_NAME: &str = "ex_pool";

// Capacity kept across a reset; anything larger goes back to the allocator.
const RETAINED_CAPACITY: usize = 64 * 1024;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

/// A byte range inside one incarnation of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    region: u64,
    epoch: u64,
    offset: usize,
    len: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops the first `count` bytes from the span.
    pub(crate) fn advance(&mut self, count: usize) {
        let count = count.min(self.len);
        self.offset += count;
        self.len -= count;
    }
}

/// Growable bump allocator whose allocations are released all at once.
#[derive(Debug)]
pub struct Region {
    id: u64,
    epoch: u64,
    name: String,
    bytes: Vec<u8>,
}

impl Region {
    pub fn new(name: &str) -> Self {
        Self {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            epoch: 0,
            name: name.to_owned(),
            bytes: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        name.clone_into(&mut self.name);
    }

    /// Bytes handed out since the last reset.
    pub fn allocated(&self) -> usize {
        self.bytes.len()
    }

    /// Copies `data` into the region.
    pub fn alloc_copy(&mut self, data: &[u8]) -> Span {
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);

        Span {
            region: self.id,
            epoch: self.epoch,
            offset,
            len: data.len(),
        }
    }

    /// True when `span` was cut from this region since its last reset.
    pub fn owns(&self, span: &Span) -> bool {
        span.region == self.id && span.epoch == self.epoch
    }

    /// Returns the bytes behind `span`.
    ///
    /// # Panics
    /// Panics when the span belongs to another region or predates a reset.
    pub fn get(&self, span: &Span) -> &[u8] {
        assert!(
            self.owns(span),
            "stale span {span:?} read from region {} ({}, epoch {})",
            self.name,
            self.id,
            self.epoch
        );
        &self.bytes[span.offset..span.offset + span.len]
    }

    /// Releases every allocation. Outstanding spans become stale.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.bytes.shrink_to(RETAINED_CAPACITY);
        self.epoch += 1;
    }
}

/// The active/exchange region pair owned by one fiber.
#[derive(Debug)]
pub(crate) struct RegionPair {
    active: Region,
    exchange: Region,
}

impl RegionPair {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            active: Region::new(name),
            exchange: Region::new(EXCHANGE_REGION_NAME),
        }
    }

    pub(crate) fn active(&self) -> &Region {
        &self.active
    }

    pub(crate) fn active_mut(&mut self) -> &mut Region {
        &mut self.active
    }

    pub(crate) fn exchange(&self) -> &Region {
        &self.exchange
    }

    pub(crate) fn exchange_mut(&mut self) -> &mut Region {
        &mut self.exchange
    }

    pub(crate) fn swap(&mut self) {
        mem::swap(&mut self.active, &mut self.exchange);
    }

    /// Copies a span cut from the exchange region into the active one.
    pub(crate) fn rehome(&mut self, span: Span) -> Span {
        let Self { active, exchange } = self;
        active.alloc_copy(exchange.get(&span))
    }

    /// Resets both regions, as when a fiber is recycled.
    pub(crate) fn release(&mut self) {
        self.active.reset();
        self.exchange.reset();
    }
}
