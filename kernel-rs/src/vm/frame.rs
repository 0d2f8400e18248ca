//! The frame table.
//!
//! One global structure tracks every frame lent to user pages: which user
//! page it backs, which address space owns it, and whether it is pinned.
//! A map keyed by frame address serves lookups; a separate list carries the
//! clock ordering for eviction, with a cursor that persists between calls.
//!
//! Lock ordering: the frame-table lock is the outermost VM lock. The
//! eviction path acquires a victim's `UserMemory` lock while holding it, so
//! a thread must never block on the frame table while holding any
//! `UserMemory` lock. Pinning exists to let a thread keep using a frame
//! after it has released every lock: a pinned frame is never evicted, and
//! its contents belong to the pinning thread alone.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::swap::SwapDev;
use super::UserMemory;
use crate::addr::UVAddr;
use crate::kalloc::{KPage, Kmem};
use crate::lock::SpinLock;

struct FrameEntry {
    kpage: KPage,
    upage: UVAddr,
    owner: Arc<SpinLock<UserMemory>>,
    pinned: bool,
}

struct FrameTableInner {
    entries: BTreeMap<usize, FrameEntry>,

    /// Frame addresses in clock order.
    clock: Vec<usize>,

    /// Clock cursor. Persists between evictions.
    hand: usize,
}

pub struct FrameTable {
    inner: SpinLock<FrameTableInner>,
}

impl FrameTableInner {
    fn unlink(&mut self, addr: usize) -> Option<FrameEntry> {
        let entry = self.entries.remove(&addr)?;
        let pos = self
            .clock
            .iter()
            .position(|&a| a == addr)
            .expect("frame table: clock list out of sync");
        let _ = self.clock.remove(pos);
        if pos < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.clock.len() {
            self.hand = 0;
        }
        Some(entry)
    }

    /// Second-chance sweep. Skips pinned frames; a frame whose owner has
    /// accessed it since the last pass gets its accessed bit cleared and
    /// survives. Gives up (out of memory) after 2N inspections.
    fn evict(&mut self, swap: &SwapDev) -> KPage {
        let n = self.clock.len();
        for _ in 0..=2 * n {
            assert!(!self.clock.is_empty(), "frame eviction: no frames");
            let addr = self.clock[self.hand];
            self.hand = (self.hand + 1) % self.clock.len();

            let entry = self.entries.get(&addr).expect("frame table: missing entry");
            if entry.pinned {
                continue;
            }
            let owner = Arc::clone(&entry.owner);
            let upage = entry.upage;
            let kpage = entry.kpage;

            let mut mem = owner.lock();
            if mem.pagedir.is_accessed(upage) {
                mem.pagedir.set_accessed(upage, false);
                continue;
            }

            // Victim found. Unmap it first so no further access can race,
            // then write it out and record where it went.
            let dirty = mem.supt.get(upage).map_or(false, |e| e.dirty)
                || mem.pagedir.is_dirty(upage);
            mem.pagedir.clear_page(upage);
            // SAFETY: the frame is unpinned and we hold the frame-table
            // lock, so nobody else is touching it.
            let slot = swap.out(unsafe { kpage.slice() });
            mem.supt.set_swap(upage, slot);
            mem.supt.set_dirty(upage, dirty);
            drop(mem);

            let _ = self.unlink(addr).expect("frame eviction: victim vanished");
            return kpage;
        }
        panic!("frame eviction: out of memory");
    }
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "frames",
                FrameTableInner {
                    entries: BTreeMap::new(),
                    clock: Vec::new(),
                    hand: 0,
                },
            ),
        }
    }

    /// Returns a frame backing `upage` for `owner`, evicting a victim if
    /// the pool is dry. The frame comes back pinned; the caller unpins it
    /// once the new mapping is installed.
    pub fn allocate(
        &self,
        kmem: &SpinLock<Kmem>,
        swap: &SwapDev,
        upage: UVAddr,
        owner: &Arc<SpinLock<UserMemory>>,
    ) -> KPage {
        let mut inner = self.inner.lock();
        let kpage = match kmem.lock().alloc() {
            Some(p) => p,
            None => inner.evict(swap),
        };
        let _ = inner.entries.insert(
            kpage.addr(),
            FrameEntry {
                kpage,
                upage,
                owner: Arc::clone(owner),
                pinned: true,
            },
        );
        inner.clock.push(kpage.addr());
        kpage
    }

    /// Releases the frame and its table entry back to the pool.
    pub fn free(&self, kmem: &SpinLock<Kmem>, kpage: KPage) {
        let mut inner = self.inner.lock();
        let _ = inner
            .unlink(kpage.addr())
            .expect("frame table: freeing an unknown frame");
        kmem.lock().free(kpage);
    }

    /// Drops the table entry but leaves the frame allocated; used at
    /// process teardown, where the page directory reclaims the frames.
    /// Returns false if the frame is no longer tracked (it was evicted).
    pub fn try_remove_entry(&self, kpage: KPage) -> bool {
        self.inner.lock().unlink(kpage.addr()).is_some()
    }

    pub fn pin(&self, kpage: KPage) {
        assert!(self.try_pin(kpage), "frame table: pinning an unknown frame");
    }

    /// Pins if the frame is still tracked. Returns false if eviction got
    /// there first.
    pub fn try_pin(&self, kpage: KPage) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&kpage.addr()) {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, kpage: KPage) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&kpage.addr())
            .expect("frame table: unpinning an unknown frame");
        entry.pinned = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
