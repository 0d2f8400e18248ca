//! Open file handles.

use alloc::sync::Arc;

use crate::bio::Bcache;
use crate::fs::{FileSystem, Inode};

/// An opener's view of an inode: a cursor plus the deny-write bookkeeping.
/// Handles are closed explicitly (`close`) so the inode table can reclaim a
/// removed inode's storage with the right context in hand.
pub struct File {
    ip: Arc<Inode>,
    pos: u32,
    denied: bool,
}

impl File {
    pub fn new(ip: Arc<Inode>) -> Self {
        Self {
            ip,
            pos: 0,
            denied: false,
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.ip
    }

    pub fn len(&self) -> u32 {
        self.ip.len()
    }

    /// Reads from the cursor, advancing it. Short at end of file.
    pub fn read(&mut self, cache: &Bcache, dst: &mut [u8]) -> usize {
        let n = self.ip.read_at(cache, dst, self.pos);
        self.pos += n as u32;
        n
    }

    /// Writes at the cursor, advancing it. Returns 0 while writes are
    /// denied.
    pub fn write(&mut self, cache: &Bcache, fs: &FileSystem, src: &[u8]) -> usize {
        let n = self.ip.write_at(cache, &fs.freemap, src, self.pos);
        self.pos += n as u32;
        n
    }

    pub fn read_at(&self, cache: &Bcache, dst: &mut [u8], off: u32) -> usize {
        self.ip.read_at(cache, dst, off)
    }

    pub fn write_at(&self, cache: &Bcache, fs: &FileSystem, src: &[u8], off: u32) -> usize {
        self.ip.write_at(cache, &fs.freemap, src, off)
    }

    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// A fresh handle on the same inode with its own cursor.
    pub fn reopen(&self, fs: &FileSystem) -> File {
        File::new(fs.itable.dup(&self.ip))
    }

    /// Forbids writes through any handle until this one allows them again.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.ip.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.ip.allow_write();
        }
    }

    /// Drops this opener. Must be called rather than dropping the handle;
    /// reclaiming a removed inode needs the cache and free map.
    pub fn close(mut self, cache: &Bcache, fs: &FileSystem) {
        self.allow_write();
        fs.itable.close(cache, &fs.freemap, self.ip);
    }
}
