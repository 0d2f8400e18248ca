//! Swap.
//!
//! The swap device is carved into page-sized slots of eight sectors each. A
//! bitmap tracks free slots (true = free). The swap layer takes no lock
//! other than its own bitmap lock, so the eviction path can call it while
//! holding the frame-table lock without ever touching the filesystem side.

use alloc::sync::Arc;
use bitmaps::Bitmap;

use crate::bdev::BlockDevice;
use crate::lock::SpinLock;
use crate::param::{NSWAP, SECTOR_SIZE};
use crate::x86::{PGSIZE, SECTORS_PER_PAGE};

pub struct SwapDev {
    dev: Arc<dyn BlockDevice>,
    map: SpinLock<Bitmap<NSWAP>>,
    nslots: usize,
}

impl SwapDev {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let nslots = core::cmp::min(dev.nsectors() as usize / SECTORS_PER_PAGE, NSWAP);
        Self {
            dev,
            map: SpinLock::new("swap", Bitmap::mask(nslots)),
            nslots,
        }
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    /// Writes `page` to the lowest free slot and returns the slot id.
    /// Running out of swap is fatal.
    pub fn out(&self, page: &[u8; PGSIZE]) -> u32 {
        let slot = {
            let mut map = self.map.lock();
            let slot = map.first_index().expect("swap: out of slots");
            let _ = map.set(slot, false);
            slot
        };
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE + i;
            let buf: &[u8; SECTOR_SIZE] = page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            self.dev.write(sector as u32, buf);
        }
        slot as u32
    }

    /// Reads the page stored in `slot` back into `page`. The slot stays
    /// allocated; pair with `free`.
    pub fn in_(&self, slot: u32, page: &mut [u8; PGSIZE]) {
        let slot = slot as usize;
        assert!(slot < self.nslots, "swap: slot out of range");
        assert!(!self.map.lock().get(slot), "swap: reading a free slot");
        for i in 0..SECTORS_PER_PAGE {
            let sector = slot * SECTORS_PER_PAGE + i;
            let buf: &mut [u8; SECTOR_SIZE] = (&mut page[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE])
                .try_into()
                .unwrap();
            self.dev.read(sector as u32, buf);
        }
    }

    /// Returns `slot` to the free pool.
    pub fn free(&self, slot: u32) {
        let slot = slot as usize;
        assert!(slot < self.nslots, "swap: slot out of range");
        let mut map = self.map.lock();
        assert!(!map.get(slot), "swap: freeing a free slot");
        let _ = map.set(slot, true);
    }

    pub fn free_slots(&self) -> usize {
        self.map.lock().len()
    }
}
