//! Physical frame allocator for user pages. Hands out whole 4096-byte
//! frames from a pool sized at construction; when the pool runs dry the
//! frame table evicts a victim to swap and frees its frame back here.

use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::page::Page;
use crate::x86::PGSIZE;

/// A frame, identified to the kernel by its (kernel-virtual) address.
///
/// A `KPage` is a handle, not an owner: the pool in `Kmem` owns the storage.
/// Access discipline is enforced one level up, by the frame table's pinning
/// protocol; a pinned frame is read or written only by the thread that
/// pinned it, an unpinned frame only by the eviction path under the
/// frame-table lock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct KPage(NonNull<Page>);

// SAFETY: access to the pointee is governed by the pinning protocol above.
unsafe impl Send for KPage {}
unsafe impl Sync for KPage {}

impl KPage {
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Reconstructs a handle from an address previously obtained through
    /// `addr()`.
    ///
    /// # Safety
    ///
    /// `addr` must come from `KPage::addr` of a frame that is still
    /// allocated from the same pool.
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0);
        // SAFETY: addr comes from a NonNull per the contract.
        Self(unsafe { NonNull::new_unchecked(addr as *mut Page) })
    }

    /// # Safety
    ///
    /// The caller must hold the frame pinned, or the frame-table lock.
    pub unsafe fn slice(&self) -> &[u8; PGSIZE] {
        // SAFETY: the pool keeps the storage alive; aliasing per the
        // pinning protocol.
        unsafe { &*self.0.as_ptr().cast() }
    }

    /// # Safety
    ///
    /// Same as `slice`, and the caller must be the only accessor.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self) -> &mut [u8; PGSIZE] {
        // SAFETY: see above.
        unsafe { &mut *self.0.as_ptr().cast() }
    }
}

/// The frame pool.
pub struct Kmem {
    /// Backing storage. Never shrinks, so `KPage` addresses stay valid for
    /// the life of the kernel.
    pool: Vec<Box<Page>>,

    free: Vec<KPage>,
}

impl Kmem {
    pub fn new(nframes: usize) -> Self {
        let mut pool = Vec::with_capacity(nframes);
        let mut free = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            let mut page = Box::new(Page::zeroed());
            free.push(KPage(NonNull::from(&mut *page)));
            pool.push(page);
        }
        Self { pool, free }
    }

    pub fn alloc(&mut self) -> Option<KPage> {
        self.free.pop()
    }

    pub fn free(&mut self, page: KPage) {
        debug_assert!(
            !self.free.contains(&page),
            "Kmem::free: double free of {:#x}",
            page.addr()
        );
        self.free.push(page);
    }

    pub fn nfree(&self) -> usize {
        self.free.len()
    }

    pub fn nframes(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let mut kmem = Kmem::new(4);
        let pages: Vec<_> = (0..4).map(|_| kmem.alloc().unwrap()).collect();
        assert!(kmem.alloc().is_none());
        for p in pages {
            kmem.free(p);
        }
        assert_eq!(kmem.nfree(), 4);
        assert!(kmem.alloc().is_some());
    }

    #[test]
    fn frames_are_page_aligned_and_distinct() {
        let mut kmem = Kmem::new(8);
        let mut addrs = Vec::new();
        while let Some(p) = kmem.alloc() {
            assert_eq!(p.addr() % PGSIZE, 0);
            addrs.push(p.addr());
        }
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 8);
    }
}
