use crate::fiber::Fiber;
use crate::runtime::context;

use std::collections::HashMap;
use std::rc::Rc;

/// Id of the scheduler fiber, which exists for the life of the runtime.
pub const SCHED_FID: u32 = 1;

// Ids up to and including this value are never handed to user fibers.
pub(crate) const RESERVED_FIDS: u32 = 100;

/// Id → fiber map, plus every fiber ever allocated and the zombie pool.
pub(crate) struct Registry {
    fibers: HashMap<u32, Rc<Fiber>>,
    allocated: Vec<Rc<Fiber>>,
    zombies: Vec<Rc<Fiber>>,
    last_used_fid: u32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            fibers: HashMap::new(),
            allocated: Vec::new(),
            zombies: Vec::new(),
            last_used_fid: RESERVED_FIDS,
        }
    }

    /// Next free id above the reserved range, wrapping past `u32::MAX`.
    pub(crate) fn next_fid(&mut self) -> u32 {
        loop {
            self.last_used_fid = self.last_used_fid.wrapping_add(1);
            if self.last_used_fid > RESERVED_FIDS && !self.fibers.contains_key(&self.last_used_fid) {
                return self.last_used_fid;
            }
        }
    }

    pub(crate) fn register(&mut self, fiber: Rc<Fiber>) {
        self.fibers.insert(fiber.fid(), fiber);
    }

    pub(crate) fn unregister(&mut self, fid: u32) -> Option<Rc<Fiber>> {
        self.fibers.remove(&fid)
    }

    pub(crate) fn find(&self, fid: u32) -> Option<Rc<Fiber>> {
        self.fibers.get(&fid).cloned()
    }

    pub(crate) fn track(&mut self, fiber: Rc<Fiber>) {
        self.allocated.push(fiber);
    }

    pub(crate) fn allocated(&self) -> &[Rc<Fiber>] {
        &self.allocated
    }

    pub(crate) fn push_zombie(&mut self, fiber: Rc<Fiber>) {
        self.zombies.push(fiber);
    }

    /// Most recently retired zombie first.
    pub(crate) fn pop_zombie(&mut self) -> Option<Rc<Fiber>> {
        self.zombies.pop()
    }

    pub(crate) fn zombie_count(&self) -> usize {
        self.zombies.len()
    }

    /// Forgets every fiber and hands back the allocation list.
    pub(crate) fn drain(&mut self) -> Vec<Rc<Fiber>> {
        self.fibers.clear();
        self.zombies.clear();
        std::mem::take(&mut self.allocated)
    }
}

/// Looks up a live fiber by id.
///
/// # Panics
/// Panics when invoked outside of a runtime context.
pub fn fiber_find(fid: u32) -> Option<Rc<Fiber>> {
    context::scheduler().find(fid)
}

/// Number of finished fibers waiting for reuse.
pub fn zombie_count() -> usize {
    context::scheduler().zombie_count()
}
