//! Inodes.
//!
//! An inode describes a single unnamed file. The on-disk inode is exactly
//! one sector wide and indexes its data sectors through three tiers: 123
//! direct pointers, one single-indirect block of 128 pointers, and one
//! double-indirect block of 128 pointer blocks, for a maximum file size of
//! about 8.3 MiB.
//!
//! The kernel keeps a table of in-use inodes in memory (`Itable`) so that
//! opening the same on-disk inode twice yields the same in-memory handle.
//! `open_cnt` tracks the number of openers; when the last opener closes a
//! removed inode, its data sectors, indirect blocks, and the inode sector
//! itself go back to the free map.
//!
//! A per-inode sleep lock protects the cached copy of the on-disk inode and
//! the bookkeeping fields. The open/close transitions of `open_cnt` are
//! additionally serialized by the inode-table lock, in that order.

use core::mem;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::freemap::FreeMap;
use crate::bio::Bcache;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{MAXFILE, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// On-disk inode structure. Must be exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone)]
pub struct Dinode {
    /// Direct data sector addresses.
    direct: [u32; NDIRECT],

    /// Single-indirect block address.
    indirect: u32,

    /// Double-indirect block address.
    dindirect: u32,

    /// Non-zero when this inode is a directory.
    is_dir: u32,

    /// File size in bytes.
    length: u32,

    /// Must equal INODE_MAGIC.
    magic: u32,
}

const_assert!(mem::size_of::<Dinode>() == SECTOR_SIZE);

/// A sector of 128 sector pointers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    ptrs: [u32; NINDIRECT],
}

const_assert!(mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl Dinode {
    fn zeroed() -> Self {
        Self {
            direct: [0; NDIRECT],
            indirect: 0,
            dindirect: 0,
            is_dir: 0,
            length: 0,
            magic: 0,
        }
    }
}

/// Number of sectors holding `len` bytes of data.
fn bytes_to_sectors(len: u32) -> usize {
    (len as usize + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn read_sector<T: AsBytes + FromBytes>(cache: &Bcache, sector: u32, t: &mut T) {
    cache.read(sector, t.as_bytes_mut().try_into().unwrap());
}

fn write_sector<T: AsBytes>(cache: &Bcache, sector: u32, t: &T) {
    cache.write(sector, t.as_bytes().try_into().unwrap());
}

/// Allocates one sector and installs it zeroed in the cache.
fn alloc_sector(cache: &Bcache, freemap: &SpinLock<FreeMap>) -> Result<u32, ()> {
    let sector = freemap.lock().allocate().ok_or(())?;
    cache.zeroed(sector);
    Ok(sector)
}

/// Returns the device sector backing logical sector `idx`.
///
/// Index layout: 0..123 direct, 123..251 through the single-indirect block,
/// 251..16_635 through the double-indirect block.
fn sector_for(d: &Dinode, cache: &Bcache, idx: usize) -> u32 {
    if idx < NDIRECT {
        return d.direct[idx];
    }
    let idx = idx - NDIRECT;
    if idx < NINDIRECT {
        let mut blk = IndirectBlock { ptrs: [0; NINDIRECT] };
        read_sector(cache, d.indirect, &mut blk);
        return blk.ptrs[idx];
    }
    let idx = idx - NINDIRECT;
    assert!(idx < NINDIRECT * NINDIRECT, "sector_for: out of range");
    let mut blk = IndirectBlock { ptrs: [0; NINDIRECT] };
    read_sector(cache, d.dindirect, &mut blk);
    let child = blk.ptrs[idx / NINDIRECT];
    read_sector(cache, child, &mut blk);
    blk.ptrs[idx % NINDIRECT]
}

/// Makes sure logical sector `idx` is backed, allocating the data sector and
/// any missing indirect blocks. Every fresh allocation is zeroed and pushed
/// onto `allocated` so a failed create can unwind.
fn ensure_sector(
    d: &mut Dinode,
    cache: &Bcache,
    freemap: &SpinLock<FreeMap>,
    idx: usize,
    allocated: &mut Vec<u32>,
) -> Result<u32, ()> {
    let mut alloc = |cache: &Bcache, allocated: &mut Vec<u32>| -> Result<u32, ()> {
        let s = alloc_sector(cache, freemap)?;
        allocated.push(s);
        Ok(s)
    };

    if idx < NDIRECT {
        if d.direct[idx] == 0 {
            d.direct[idx] = alloc(cache, allocated)?;
        }
        return Ok(d.direct[idx]);
    }

    let idx = idx - NDIRECT;
    if idx < NINDIRECT {
        if d.indirect == 0 {
            d.indirect = alloc(cache, allocated)?;
        }
        let mut blk = IndirectBlock { ptrs: [0; NINDIRECT] };
        read_sector(cache, d.indirect, &mut blk);
        if blk.ptrs[idx] == 0 {
            blk.ptrs[idx] = alloc(cache, allocated)?;
            write_sector(cache, d.indirect, &blk);
        }
        return Ok(blk.ptrs[idx]);
    }

    let idx = idx - NINDIRECT;
    assert!(idx < NINDIRECT * NINDIRECT, "ensure_sector: out of range");
    if d.dindirect == 0 {
        d.dindirect = alloc(cache, allocated)?;
    }
    let mut blk = IndirectBlock { ptrs: [0; NINDIRECT] };
    read_sector(cache, d.dindirect, &mut blk);
    let mut child = blk.ptrs[idx / NINDIRECT];
    if child == 0 {
        child = alloc(cache, allocated)?;
        blk.ptrs[idx / NINDIRECT] = child;
        write_sector(cache, d.dindirect, &blk);
    }
    read_sector(cache, child, &mut blk);
    if blk.ptrs[idx % NINDIRECT] == 0 {
        blk.ptrs[idx % NINDIRECT] = alloc(cache, allocated)?;
        write_sector(cache, child, &blk);
    }
    Ok(blk.ptrs[idx % NINDIRECT])
}

/// Returns every sector reachable from `d` to the free map: the data
/// sectors, then the indirect blocks themselves.
fn free_sectors(d: &Dinode, cache: &Bcache, freemap: &SpinLock<FreeMap>) {
    let sectors = bytes_to_sectors(d.length);
    for idx in 0..sectors {
        let s = sector_for(d, cache, idx);
        freemap.lock().release(s);
    }
    if d.indirect != 0 {
        freemap.lock().release(d.indirect);
    }
    if d.dindirect != 0 {
        let mut blk = IndirectBlock { ptrs: [0; NINDIRECT] };
        read_sector(cache, d.dindirect, &mut blk);
        let children = (sectors.saturating_sub(NDIRECT + NINDIRECT) + NINDIRECT - 1) / NINDIRECT;
        for &child in blk.ptrs.iter().take(children) {
            if child != 0 {
                freemap.lock().release(child);
            }
        }
        freemap.lock().release(d.dindirect);
    }
}

/// In-memory inode bookkeeping, behind the inode's sleep lock.
pub struct InodeInner {
    /// Cached copy of the on-disk inode.
    pub disk: Dinode,

    /// True once unlinked; the last closer frees the storage.
    pub removed: bool,

    /// 0: writes ok, >0: writes return 0.
    pub deny_write_cnt: u32,

    /// Number of openers. 0 <= deny_write_cnt <= open_cnt.
    open_cnt: u32,
}

/// In-memory inode handle. Exactly one exists per open on-disk inode;
/// sharing is arranged by the `Itable`.
pub struct Inode {
    sector: u32,
    pub inner: SleepLock<InodeInner>,
}

impl Inode {
    /// Initializes a fresh on-disk inode at `sector` with `length` bytes of
    /// zeroed storage and writes it out through the cache. On allocation
    /// failure every sector the walk managed to allocate is released again.
    pub fn create(
        cache: &Bcache,
        freemap: &SpinLock<FreeMap>,
        sector: u32,
        length: u32,
        is_dir: bool,
    ) -> Result<(), ()> {
        if length as usize > MAXFILE {
            return Err(());
        }
        let mut d = Dinode::zeroed();
        d.magic = INODE_MAGIC;
        d.length = length;
        d.is_dir = is_dir as u32;

        let mut allocated = Vec::new();
        for idx in 0..bytes_to_sectors(length) {
            if ensure_sector(&mut d, cache, freemap, idx, &mut allocated).is_err() {
                let mut map = freemap.lock();
                for s in allocated {
                    map.release(s);
                }
                return Err(());
            }
        }
        write_sector(cache, sector, &d);
        Ok(())
    }

    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().disk.is_dir != 0
    }

    pub fn len(&self) -> u32 {
        self.inner.lock().disk.length
    }

    /// Marks the inode to be deleted when the last opener closes it.
    pub fn remove(&self) {
        self.inner.lock().removed = true;
    }

    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_cnt += 1;
        assert!(inner.deny_write_cnt <= inner.open_cnt, "deny_write");
    }

    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.deny_write_cnt > 0, "allow_write");
        inner.deny_write_cnt -= 1;
    }

    /// Copies up to `dst.len()` bytes starting at byte `off` into `dst`.
    /// Returns the number of bytes read, which is short at end of file.
    pub fn read_at(&self, cache: &Bcache, dst: &mut [u8], off: u32) -> usize {
        let inner = self.inner.lock();
        let d = &inner.disk;
        let len = d.length;
        if off >= len {
            return 0;
        }
        let n = core::cmp::min(dst.len(), (len - off) as usize);
        let mut done = 0;
        let mut off = off as usize;
        let mut bounce = [0u8; SECTOR_SIZE];
        while done < n {
            let sector = sector_for(d, cache, off / SECTOR_SIZE);
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = core::cmp::min(n - done, SECTOR_SIZE - sector_ofs);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                // Full, aligned sector: straight into the caller's buffer.
                cache.read(sector, (&mut dst[done..done + SECTOR_SIZE]).try_into().unwrap());
            } else {
                cache.read(sector, &mut bounce);
                dst[done..done + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            done += chunk;
            off += chunk;
        }
        done
    }

    /// Copies `src` into the file starting at byte `off`, growing the file
    /// if the write extends past the current length. Returns the number of
    /// bytes written: 0 when writes are denied or the file cannot grow.
    pub fn write_at(
        &self,
        cache: &Bcache,
        freemap: &SpinLock<FreeMap>,
        src: &[u8],
        off: u32,
    ) -> usize {
        let mut inner = self.inner.lock();
        if inner.deny_write_cnt > 0 {
            return 0;
        }
        let end = off as usize + src.len();
        if end > MAXFILE {
            return 0;
        }

        if end as u32 > inner.disk.length {
            // Extend to cover the write, then publish the new length.
            let mut allocated = Vec::new();
            for idx in bytes_to_sectors(inner.disk.length)..bytes_to_sectors(end as u32) {
                if ensure_sector(&mut inner.disk, cache, freemap, idx, &mut allocated).is_err() {
                    return 0;
                }
            }
            inner.disk.length = end as u32;
            write_sector(cache, self.sector, &inner.disk);
        }

        let d = &inner.disk;
        let mut done = 0;
        let mut off = off as usize;
        let mut bounce = [0u8; SECTOR_SIZE];
        while done < src.len() {
            let sector = sector_for(d, cache, off / SECTOR_SIZE);
            let sector_ofs = off % SECTOR_SIZE;
            let chunk = core::cmp::min(src.len() - done, SECTOR_SIZE - sector_ofs);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                cache.write(sector, (&src[done..done + SECTOR_SIZE]).try_into().unwrap());
            } else {
                // Splice into the old sector contents so the bytes around
                // the chunk survive.
                if sector_ofs > 0 || chunk < SECTOR_SIZE {
                    cache.read(sector, &mut bounce);
                }
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&src[done..done + chunk]);
                cache.write(sector, &bounce);
            }
            done += chunk;
            off += chunk;
        }
        done
    }
}

/// Table of in-memory inodes, one per open on-disk inode.
pub struct Itable {
    inner: SpinLock<BTreeMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new("itable", BTreeMap::new()),
        }
    }

    /// Opens the inode at `sector`, sharing the in-memory handle with any
    /// existing openers.
    pub fn open(&self, cache: &Bcache, sector: u32) -> Arc<Inode> {
        let mut table = self.inner.lock();
        if let Some(ip) = table.get(&sector) {
            ip.inner.lock().open_cnt += 1;
            return Arc::clone(ip);
        }
        let mut disk = Dinode::zeroed();
        read_sector(cache, sector, &mut disk);
        assert_eq!(disk.magic, INODE_MAGIC, "Itable::open: bad inode magic");
        let ip = Arc::new(Inode {
            sector,
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    disk,
                    removed: false,
                    deny_write_cnt: 0,
                    open_cnt: 1,
                },
            ),
        });
        let _ = table.insert(sector, Arc::clone(&ip));
        ip
    }

    /// Registers another opener of an already-open inode.
    pub fn dup(&self, ip: &Arc<Inode>) -> Arc<Inode> {
        let mut inner = ip.inner.lock();
        assert!(inner.open_cnt > 0, "Itable::dup: inode not open");
        inner.open_cnt += 1;
        Arc::clone(ip)
    }

    /// Drops one opener. The last closer of a removed inode returns its data
    /// sectors, its indirect blocks, and the inode sector to the free map.
    pub fn close(&self, cache: &Bcache, freemap: &SpinLock<FreeMap>, ip: Arc<Inode>) {
        let mut table = self.inner.lock();
        let mut inner = ip.inner.lock();
        assert!(inner.open_cnt > 0, "Itable::close: inode not open");
        inner.open_cnt -= 1;
        if inner.open_cnt > 0 {
            return;
        }
        let _ = table.remove(&ip.sector);
        if inner.removed {
            free_sectors(&inner.disk, cache, freemap);
            freemap.lock().release(ip.sector);
        }
    }

    /// Number of distinct open inodes, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemDisk;
    use crate::param::FREE_MAP_SECTOR;
    use std::collections::HashSet;
    use std::sync::Arc;

    // 17k sectors is enough for one maximum-size file plus metadata.
    const TEST_SECTORS: u32 = 17_200;

    fn setup(nsectors: u32) -> (Bcache, SpinLock<FreeMap>) {
        let cache = Bcache::new(Arc::new(MemDisk::new(nsectors)));
        let mut map = FreeMap::new(nsectors as usize);
        map.mark_used(FREE_MAP_SECTOR);
        map.mark_used(crate::param::ROOT_DIR_SECTOR);
        (cache, SpinLock::new("freemap", map))
    }

    fn make_inode(cache: &Bcache, freemap: &SpinLock<FreeMap>, length: u32) -> Inode {
        let sector = freemap.lock().allocate().unwrap();
        Inode::create(cache, freemap, sector, length, false).unwrap();
        let mut disk = Dinode::zeroed();
        read_sector(cache, sector, &mut disk);
        Inode {
            sector,
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    disk,
                    removed: false,
                    deny_write_cnt: 0,
                    open_cnt: 1,
                },
            ),
        }
    }

    #[test]
    fn on_disk_inode_is_one_sector() {
        assert_eq!(mem::size_of::<Dinode>(), SECTOR_SIZE);
        assert_eq!(crate::param::MAXSECTORS, 16_635);
    }

    #[test]
    fn create_allocates_exactly_the_index_tree() {
        let (cache, freemap) = setup(TEST_SECTORS);
        let before = freemap.lock().count_used();
        // 200 sectors: 123 direct + 77 via the single-indirect block.
        let ip = make_inode(&cache, &freemap, 200 * SECTOR_SIZE as u32);
        let after = freemap.lock().count_used();
        assert_eq!(after - before, 1 + 200 + 1);
        assert_eq!(ip.len(), 200 * SECTOR_SIZE as u32);
    }

    #[test]
    fn index_maps_every_sector_uniquely() {
        let (cache, freemap) = setup(TEST_SECTORS);
        // Spans all three tiers: direct, single, double indirect.
        let sectors = 600u32;
        let ip = make_inode(&cache, &freemap, sectors * SECTOR_SIZE as u32);
        let inner = ip.inner.lock();
        let mut seen = HashSet::new();
        for idx in 0..sectors as usize {
            let s = sector_for(&inner.disk, &cache, idx);
            assert!(s != 0);
            assert!(freemap.lock().is_used(s));
            assert!(seen.insert(s), "index {} reuses sector {}", idx, s);
        }
    }

    #[test]
    fn growth_round_trip_at_probe_offsets() {
        let (cache, freemap) = setup(TEST_SECTORS);
        let ip = make_inode(&cache, &freemap, 0);

        let pattern = |off: u32| -> u8 { (off % 251) as u8 };
        let probes: &[u32] = &[0, 63_000, 524_288, 8_388_000];
        let mut buf = [0u8; 96];
        for &off in probes {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = pattern(off + i as u32);
            }
            assert_eq!(ip.write_at(&cache, &freemap, &buf, off), buf.len());
        }
        // Growing writes land where they were put, and everything in
        // between reads back as zero.
        assert_eq!(ip.len(), 8_388_000 + 96);
        let mut out = [0u8; 96];
        for &off in probes {
            assert_eq!(ip.read_at(&cache, &mut out, off), 96);
            for (i, &b) in out.iter().enumerate() {
                assert_eq!(b, pattern(off + i as u32), "offset {}+{}", off, i);
            }
        }
        let mut hole = [0xffu8; 64];
        assert_eq!(ip.read_at(&cache, &mut hole, 1_000_000), 64);
        assert!(hole.iter().all(|&b| b == 0));
    }

    #[test]
    fn unaligned_writes_preserve_neighbors() {
        let (cache, freemap) = setup(2048);
        let ip = make_inode(&cache, &freemap, 2 * SECTOR_SIZE as u32);
        let base: Vec<u8> = (0..2 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(ip.write_at(&cache, &freemap, &base, 0), base.len());

        // Straddles the sector boundary.
        let patch = [0xeeu8; 100];
        assert_eq!(ip.write_at(&cache, &freemap, &patch, 462), 100);

        let mut out = vec![0u8; 2 * SECTOR_SIZE];
        assert_eq!(ip.read_at(&cache, &mut out, 0), out.len());
        for (i, &b) in out.iter().enumerate() {
            let want = if (462..562).contains(&i) {
                0xee
            } else {
                (i % 251) as u8
            };
            assert_eq!(b, want, "byte {}", i);
        }
    }

    #[test]
    fn reads_past_eof_are_short() {
        let (cache, freemap) = setup(1024);
        let ip = make_inode(&cache, &freemap, 600);
        let mut buf = [0u8; 256];
        assert_eq!(ip.read_at(&cache, &mut buf, 512), 88);
        assert_eq!(ip.read_at(&cache, &mut buf, 600), 0);
        assert_eq!(ip.read_at(&cache, &mut buf, 10_000), 0);
    }

    #[test]
    fn deny_write_rejects_until_allowed() {
        let (cache, freemap) = setup(1024);
        let ip = make_inode(&cache, &freemap, 100);
        ip.deny_write();
        assert_eq!(ip.write_at(&cache, &freemap, b"xyz", 0), 0);
        ip.allow_write();
        assert_eq!(ip.write_at(&cache, &freemap, b"xyz", 0), 3);
    }

    #[test]
    fn removed_inode_frees_everything_on_last_close() {
        let (cache, freemap) = setup(TEST_SECTORS);
        let itable = Itable::new();

        let baseline = freemap.lock().count_used();
        let sector = freemap.lock().allocate().unwrap();
        Inode::create(&cache, &freemap, sector, 300 * SECTOR_SIZE as u32, false).unwrap();

        let ip = itable.open(&cache, sector);
        let ip2 = itable.dup(&ip);
        ip.remove();
        itable.close(&cache, &freemap, ip2);
        // Still open once; nothing freed yet.
        assert!(freemap.lock().count_used() > baseline);
        itable.close(&cache, &freemap, ip);
        assert_eq!(freemap.lock().count_used(), baseline);
        assert_eq!(itable.len(), 0);
    }

    #[test]
    fn create_unwinds_on_disk_exhaustion() {
        // Too few sectors for the request; the failed create must release
        // everything it grabbed.
        let (cache, freemap) = setup(64);
        let before = freemap.lock().count_used();
        let sector = freemap.lock().allocate().unwrap();
        assert!(Inode::create(&cache, &freemap, sector, 200 * SECTOR_SIZE as u32, false).is_err());
        freemap.lock().release(sector);
        assert_eq!(freemap.lock().count_used(), before);
    }
}
