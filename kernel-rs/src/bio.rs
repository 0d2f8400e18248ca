//! Sector buffer cache.
//!
//! The buffer cache is a fixed array of sector buffers holding cached copies
//! of disk sector contents. Caching sectors in memory reduces the number of
//! disk reads and also provides a synchronization point for sectors used by
//! multiple processes.
//!
//! Interface:
//! * To read a sector through the cache, call `read`.
//! * To write a sector through the cache, call `write`; the data reaches the
//!   device lazily, when the entry is evicted or at `flush_all`.
//! * At most one entry describes any given sector at any time.
//!
//! Replacement is the clock (second chance) algorithm: a cursor sweeps the
//! array, clearing recently-used bits, and evicts the first entry whose bit
//! was already clear. Dirty victims are written back before the slot is
//! reused. The whole cache is serialized by one lock, so sector I/O is
//! linearizable at sector granularity.

use alloc::sync::Arc;
use array_macro::array;

use crate::bdev::BlockDevice;
use crate::lock::SpinLock;
use crate::param::{NBUF, SECTOR_SIZE};

struct BufEntry {
    /// Has this slot been loaded from disk?
    valid: bool,

    /// Does the slot hold data newer than the device?
    dirty: bool,

    /// Second-chance bit for the clock sweep.
    recently_used: bool,

    /// Sector this slot shadows, when valid.
    sector: u32,

    data: [u8; SECTOR_SIZE],
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            valid: false,
            dirty: false,
            recently_used: false,
            sector: 0,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct BcacheInner {
    entries: [BufEntry; NBUF],

    /// Clock cursor. Persists between evictions.
    hand: usize,
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    inner: SpinLock<BcacheInner>,
}

impl BcacheInner {
    /// Index of the valid entry for `sector`, if cached.
    fn lookup(&self, sector: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.valid && e.sector == sector)
    }

    /// Picks a victim slot by the clock sweep, flushing it if dirty, and
    /// leaves it invalid. An invalid slot is taken immediately; a valid slot
    /// with its recently-used bit set gets a second chance.
    fn evict(&mut self, dev: &dyn BlockDevice) -> usize {
        loop {
            let i = self.hand;
            if !self.entries[i].valid {
                break;
            }
            if self.entries[i].recently_used {
                self.entries[i].recently_used = false;
                self.hand = (self.hand + 1) % NBUF;
                continue;
            }
            break;
        }

        let i = self.hand;
        let entry = &mut self.entries[i];
        if entry.valid && entry.dirty {
            dev.write(entry.sector, &entry.data);
            entry.dirty = false;
        }
        entry.valid = false;
        i
    }

    /// Slot holding `sector`, loading it from the device on a miss.
    fn load(&mut self, dev: &dyn BlockDevice, sector: u32) -> usize {
        match self.lookup(sector) {
            Some(i) => i,
            None => {
                let i = self.evict(dev);
                let entry = &mut self.entries[i];
                entry.valid = true;
                entry.dirty = false;
                entry.sector = sector;
                dev.read(sector, &mut entry.data);
                i
            }
        }
    }
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            inner: SpinLock::new(
                "bcache",
                BcacheInner {
                    entries: array![_ => BufEntry::new(); NBUF],
                    hand: 0,
                },
            ),
        }
    }

    pub fn dev(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    /// Reads `sector` into `dst` through the cache.
    pub fn read(&self, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        let mut inner = self.inner.lock();
        let i = inner.load(&*self.dev, sector);
        inner.entries[i].recently_used = true;
        dst.copy_from_slice(&inner.entries[i].data);
    }

    /// Writes `src` to `sector` through the cache. The slot is fetched first
    /// even on a miss so a later partial-sector update cannot clobber bytes
    /// it did not mean to touch.
    pub fn write(&self, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut inner = self.inner.lock();
        let i = inner.load(&*self.dev, sector);
        let entry = &mut inner.entries[i];
        entry.recently_used = true;
        entry.dirty = true;
        entry.data.copy_from_slice(src);
    }

    /// Installs an all-zero `sector` without reading the device. Used when a
    /// fresh data sector is about to be initialized anyway.
    pub fn zeroed(&self, sector: u32) {
        let mut inner = self.inner.lock();
        let i = match inner.lookup(sector) {
            Some(i) => i,
            None => {
                let i = inner.evict(&*self.dev);
                let entry = &mut inner.entries[i];
                entry.valid = true;
                entry.sector = sector;
                i
            }
        };
        let entry = &mut inner.entries[i];
        entry.recently_used = true;
        entry.dirty = true;
        entry.data.fill(0);
    }

    /// Writes every valid dirty entry back to the device. Called at
    /// shutdown.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.entries.iter_mut() {
            if entry.valid && entry.dirty {
                self.dev.write(entry.sector, &entry.data);
                entry.dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemDisk;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn read_observes_last_write() {
        let disk = Arc::new(MemDisk::new(128));
        let cache = Bcache::new(disk);
        cache.write(7, &sector_of(0xaa));
        cache.write(7, &sector_of(0xbb));
        let mut out = [0; SECTOR_SIZE];
        cache.read(7, &mut out);
        assert_eq!(out, sector_of(0xbb));
    }

    #[test]
    fn write_back_is_lazy_until_flush() {
        let disk = Arc::new(MemDisk::new(128));
        let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);
        cache.write(3, &sector_of(0x42));
        assert_eq!(disk.writes(), 0);
        cache.flush_all();
        assert_eq!(disk.writes(), 1);
        let mut out = [0; SECTOR_SIZE];
        disk.read(3, &mut out);
        assert_eq!(out, sector_of(0x42));
    }

    #[test]
    fn capacity_is_bounded_and_dirty_victims_are_flushed() {
        let disk = Arc::new(MemDisk::new(4 * NBUF as u32));
        let cache = Bcache::new(Arc::clone(&disk) as Arc<dyn BlockDevice>);

        // Dirty every slot, then read NBUF distinct other sectors. Each miss
        // must evict exactly one dirty victim and write it back.
        for s in 0..NBUF as u32 {
            cache.write(s, &sector_of(s as u8));
        }
        assert_eq!(disk.writes(), 0);
        let mut out = [0; SECTOR_SIZE];
        for s in 0..NBUF as u32 {
            cache.read(NBUF as u32 + s, &mut out);
        }
        assert_eq!(disk.writes(), NBUF);

        // Everything written is now observable on the device.
        for s in 0..NBUF as u32 {
            disk.read(s, &mut out);
            assert_eq!(out, sector_of(s as u8), "sector {}", s);
        }
    }

    #[test]
    fn concurrent_writers_single_sector() {
        let disk = Arc::new(MemDisk::new(64));
        let cache = Arc::new(Bcache::new(disk));
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..64 {
                    cache.write(9, &sector_of(t.wrapping_mul(64).wrapping_add(i)));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Whatever interleaving happened, a read returns some complete
        // 512-byte write, never a torn mixture.
        let mut out = [0; SECTOR_SIZE];
        cache.read(9, &mut out);
        assert!(out.iter().all(|&b| b == out[0]));
    }
}
