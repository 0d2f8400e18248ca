//! File system.
//!
//! On-disk layout: sector 0 holds the free-map inode, sector 1 the root
//! directory inode; every other sector is fair game for the free map. The
//! free-map file's content is the allocation bitmap itself, loaded at mount
//! and written back at sync.
//!
//! One coarse lock (`FileSystem::lock`) serializes every filesystem syscall;
//! the buffer cache below serializes sector I/O. Eviction in the VM layer
//! never takes either lock, so a page fault during an I/O call cannot
//! deadlock against the filesystem.

use alloc::sync::Arc;
use spin::Once;

use crate::bio::Bcache;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub mod dir;
mod freemap;
mod inode;

pub use freemap::FreeMap;
pub use inode::{Inode, Itable, INODE_MAGIC};

struct FsMeta {
    /// The free-map file, held open for the life of the kernel.
    free_map_inode: Arc<Inode>,
}

pub struct FileSystem {
    /// The filesystem mutex: held across every open/create/remove/read/write
    /// at the syscall boundary.
    pub lock: SleepLock<()>,

    pub freemap: SpinLock<FreeMap>,
    pub itable: Itable,
    meta: Once<FsMeta>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self {
            lock: SleepLock::new("filesys", ()),
            freemap: SpinLock::new("freemap", FreeMap::new(0)),
            itable: Itable::new(),
            meta: Once::new(),
        }
    }

    /// Writes a blank filesystem: a fresh free map and an empty root
    /// directory. Leaves the filesystem mounted.
    pub fn format(&self, cache: &Bcache) {
        let nsectors = cache.dev().nsectors() as usize;
        let mut map = FreeMap::new(nsectors);
        map.mark_used(FREE_MAP_SECTOR);
        map.mark_used(ROOT_DIR_SECTOR);
        let byte_len = map.byte_len() as u32;
        *self.freemap.lock() = map;

        // The free-map file's own data sectors come out of the map being
        // persisted, so it must be created through the normal path.
        Inode::create(cache, &self.freemap, FREE_MAP_SECTOR, byte_len, false)
            .expect("format: free map");
        Inode::create(cache, &self.freemap, ROOT_DIR_SECTOR, 0, true).expect("format: root");

        let root = self.itable.open(cache, ROOT_DIR_SECTOR);
        dir::link(&root, cache, &self.freemap, b".", ROOT_DIR_SECTOR).expect("format: .");
        dir::link(&root, cache, &self.freemap, b"..", ROOT_DIR_SECTOR).expect("format: ..");
        self.itable.close(cache, &self.freemap, root);

        self.meta.call_once(|| FsMeta {
            free_map_inode: self.itable.open(cache, FREE_MAP_SECTOR),
        });
        self.sync(cache);
    }

    /// Loads the free map from an already formatted device.
    pub fn mount(&self, cache: &Bcache) {
        let meta = self.meta.call_once(|| FsMeta {
            free_map_inode: self.itable.open(cache, FREE_MAP_SECTOR),
        });
        let nsectors = cache.dev().nsectors() as usize;
        let mut bytes = alloc::vec![0u8; (nsectors + 7) / 8];
        let n = meta.free_map_inode.read_at(cache, &mut bytes, 0);
        assert_eq!(n, bytes.len(), "mount: short free map");
        *self.freemap.lock() = FreeMap::from_bytes(nsectors, &bytes);
    }

    /// Writes the free map back through its inode. Part of shutdown, before
    /// the cache flush.
    pub fn sync(&self, cache: &Bcache) {
        let meta = self.meta.get().expect("sync: not mounted");
        let bytes = self.freemap.lock().to_bytes();
        let n = meta.free_map_inode.write_at(cache, &self.freemap, &bytes, 0);
        assert_eq!(n, bytes.len(), "sync: short free map write");
    }

    pub fn root(&self, cache: &Bcache) -> Arc<Inode> {
        self.itable.open(cache, ROOT_DIR_SECTOR)
    }

    /// Resolves `path` to an open inode. Absolute paths start at the root,
    /// relative ones at `cwd`.
    pub fn resolve(&self, cache: &Bcache, cwd: &Arc<Inode>, path: &[u8]) -> Result<Arc<Inode>, ()> {
        if path.is_empty() {
            return Err(());
        }
        let mut cur = if path[0] == b'/' {
            self.root(cache)
        } else {
            self.itable.dup(cwd)
        };
        for name in path.split(|&c| c == b'/').filter(|n| !n.is_empty()) {
            if !cur.is_dir() {
                self.itable.close(cache, &self.freemap, cur);
                return Err(());
            }
            let next = match dir::lookup(&cur, cache, name) {
                Some((sector, _)) => self.itable.open(cache, sector),
                None => {
                    self.itable.close(cache, &self.freemap, cur);
                    return Err(());
                }
            };
            self.itable.close(cache, &self.freemap, cur);
            cur = next;
        }
        Ok(cur)
    }

    /// Resolves all but the last component of `path`, returning the parent
    /// directory and the final name.
    fn resolve_parent<'p>(
        &self,
        cache: &Bcache,
        cwd: &Arc<Inode>,
        path: &'p [u8],
    ) -> Result<(Arc<Inode>, &'p [u8]), ()> {
        let trimmed = match path.iter().rposition(|&c| c != b'/') {
            Some(i) => &path[..=i],
            None => return Err(()),
        };
        let split = trimmed.iter().rposition(|&c| c == b'/');
        let (prefix, name) = match split {
            Some(i) => (&trimmed[..=i], &trimmed[i + 1..]),
            None => (&b""[..], trimmed),
        };
        let parent = if prefix.is_empty() {
            self.itable.dup(cwd)
        } else {
            self.resolve(cache, cwd, prefix)?
        };
        if !parent.is_dir() {
            self.itable.close(cache, &self.freemap, parent);
            return Err(());
        }
        Ok((parent, name))
    }

    /// Creates a file (or, with `is_dir`, a directory) of `length` bytes.
    pub fn create(
        &self,
        cache: &Bcache,
        cwd: &Arc<Inode>,
        path: &[u8],
        length: u32,
        is_dir: bool,
    ) -> bool {
        let (parent, name) = match self.resolve_parent(cache, cwd, path) {
            Ok(v) => v,
            Err(()) => return false,
        };
        let done = |ok: bool, parent| {
            self.itable.close(cache, &self.freemap, parent);
            ok
        };
        if !dir::valid_name(name) || dir::lookup(&parent, cache, name).is_some() {
            return done(false, parent);
        }
        let sector = match self.freemap.lock().allocate() {
            Some(s) => s,
            None => return done(false, parent),
        };
        if Inode::create(cache, &self.freemap, sector, length, is_dir).is_err() {
            self.freemap.lock().release(sector);
            return done(false, parent);
        }
        if is_dir {
            let child = self.itable.open(cache, sector);
            let ok = dir::link(&child, cache, &self.freemap, b".", sector).is_ok()
                && dir::link(&child, cache, &self.freemap, b"..", parent.inumber()).is_ok();
            self.itable.close(cache, &self.freemap, child);
            if !ok {
                self.freemap.lock().release(sector);
                return done(false, parent);
            }
        }
        if dir::link(&parent, cache, &self.freemap, name, sector).is_err() {
            // Roll the inode back; nothing references it yet.
            let orphan = self.itable.open(cache, sector);
            orphan.remove();
            self.itable.close(cache, &self.freemap, orphan);
            return done(false, parent);
        }
        done(true, parent)
    }

    /// Opens `path`, returning its inode.
    pub fn open(&self, cache: &Bcache, cwd: &Arc<Inode>, path: &[u8]) -> Option<Arc<Inode>> {
        self.resolve(cache, cwd, path).ok()
    }

    /// Unlinks `path`. A directory must be empty; the storage itself is
    /// reclaimed when the last opener closes.
    pub fn remove(&self, cache: &Bcache, cwd: &Arc<Inode>, path: &[u8]) -> bool {
        let (parent, name) = match self.resolve_parent(cache, cwd, path) {
            Ok(v) => v,
            Err(()) => return false,
        };
        if name == b"." || name == b".." {
            self.itable.close(cache, &self.freemap, parent);
            return false;
        }
        let sector = match dir::lookup(&parent, cache, name) {
            Some((s, _)) => s,
            None => {
                self.itable.close(cache, &self.freemap, parent);
                return false;
            }
        };
        let ip = self.itable.open(cache, sector);
        if ip.is_dir() && !dir::is_empty(&ip, cache) {
            self.itable.close(cache, &self.freemap, ip);
            self.itable.close(cache, &self.freemap, parent);
            return false;
        }
        let ok = dir::unlink(&parent, cache, &self.freemap, name).is_ok();
        if ok {
            ip.remove();
        }
        self.itable.close(cache, &self.freemap, ip);
        self.itable.close(cache, &self.freemap, parent);
        ok
    }
}
