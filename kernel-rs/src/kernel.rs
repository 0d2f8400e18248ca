//! The kernel: one explicitly constructed value owning every kernel-wide
//! structure. There are no globals; tests build as many kernels as they
//! like, each over its own devices.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use alloc::sync::Arc;

use crate::bdev::BlockDevice;
use crate::bio::Bcache;
use crate::fs::FileSystem;
use crate::hal::Hal;
use crate::kalloc::Kmem;
use crate::lock::SpinLock;
use crate::vm::{FrameTable, SwapDev};

pub struct Kernel {
    hal: Hal,
    bcache: Bcache,
    kmem: SpinLock<Kmem>,
    frames: FrameTable,
    swap: SwapDev,
    fs: FileSystem,
    next_tid: AtomicI32,
    halted: AtomicBool,
}

impl Kernel {
    /// Builds a kernel over the two named block devices and a frame pool
    /// of `nframes` user frames. The filesystem starts unmounted; call
    /// `format_fs` on a blank device or `mount_fs` on a formatted one.
    pub fn new(
        hal: Hal,
        fsdev: Arc<dyn BlockDevice>,
        swapdev: Arc<dyn BlockDevice>,
        nframes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            hal,
            bcache: Bcache::new(fsdev),
            kmem: SpinLock::new("kmem", Kmem::new(nframes)),
            frames: FrameTable::new(),
            swap: SwapDev::new(swapdev),
            fs: FileSystem::new(),
            next_tid: AtomicI32::new(1),
            halted: AtomicBool::new(false),
        })
    }

    pub fn hal(&self) -> &Hal {
        &self.hal
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn kmem(&self) -> &SpinLock<Kmem> {
        &self.kmem
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapDev {
        &self.swap
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn format_fs(&self) {
        self.fs.format(&self.bcache);
    }

    pub fn mount_fs(&self) {
        self.fs.mount(&self.bcache);
    }

    pub(crate) fn alloc_tid(&self) -> i32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Sync, flush, power off. Also the implementation of the halt
    /// syscall.
    pub fn shutdown(&self) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fs.sync(&self.bcache);
        self.bcache.flush_all();
        self.hal.machine().power_off();
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}
