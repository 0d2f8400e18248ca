//! Supplemental page tables.
//!
//! Per process, one entry for every user page the process has ever touched,
//! recording where the page's content currently lives: nowhere yet (all
//! zero), on a frame, in a swap slot, or in a file region. The page-fault
//! handler materializes pages from this information; eviction writes it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::addr::UVAddr;
use crate::fs::Inode;
use crate::kalloc::KPage;

pub enum PageState {
    /// Not yet materialized; reads as zero.
    AllZero,

    /// Resident in the given frame.
    OnFrame(KPage),

    /// Stored in the given swap slot.
    OnSwap(u32),

    /// Backed by a file region: `read_bytes` from `offset`, then
    /// `zero_bytes` of zeros.
    FromFile {
        ip: Arc<Inode>,
        offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
    },
}

pub struct SuptEntry {
    pub state: PageState,

    /// Sticky dirty flag: set when the page was dirty at eviction time, so
    /// the information survives while the page sits in swap.
    pub dirty: bool,

    /// Whether the page-directory mapping is installed writable.
    pub writable: bool,
}

pub struct Supt {
    map: BTreeMap<usize, SuptEntry>,
}

impl Supt {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    fn install(&mut self, upage: UVAddr, entry: SuptEntry) -> Result<(), ()> {
        assert!(upage.is_page_aligned(), "supt: unaligned page");
        if self.map.contains_key(&upage.into_usize()) {
            return Err(());
        }
        let _ = self.map.insert(upage.into_usize(), entry);
        Ok(())
    }

    /// Records a page already resident in `kpage`.
    pub fn install_frame(&mut self, upage: UVAddr, kpage: KPage, writable: bool) -> Result<(), ()> {
        self.install(
            upage,
            SuptEntry {
                state: PageState::OnFrame(kpage),
                dirty: false,
                writable,
            },
        )
    }

    /// Records a page whose first touch yields zeros.
    pub fn install_zeropage(&mut self, upage: UVAddr) -> Result<(), ()> {
        self.install(
            upage,
            SuptEntry {
                state: PageState::AllZero,
                dirty: false,
                writable: true,
            },
        )
    }

    /// Records a page backed by a file region.
    pub fn install_file(
        &mut self,
        upage: UVAddr,
        ip: Arc<Inode>,
        offset: u32,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), ()> {
        self.install(
            upage,
            SuptEntry {
                state: PageState::FromFile {
                    ip,
                    offset,
                    read_bytes,
                    zero_bytes,
                },
                dirty: false,
                writable,
            },
        )
    }

    /// Moves `upage` to the on-frame state after a successful page-in.
    pub fn set_frame(&mut self, upage: UVAddr, kpage: KPage) {
        let entry = self
            .map
            .get_mut(&upage.into_usize())
            .expect("supt: set_frame on absent page");
        entry.state = PageState::OnFrame(kpage);
    }

    /// Moves `upage` to the on-swap state. Used by eviction, which may race
    /// with teardown having already dropped the entry; the slot must not be
    /// lost, so the entry is re-created in that case.
    pub fn set_swap(&mut self, upage: UVAddr, slot: u32) {
        if let Some(entry) = self.map.get_mut(&upage.into_usize()) {
            entry.state = PageState::OnSwap(slot);
            return;
        }
        let _ = self.map.insert(
            upage.into_usize(),
            SuptEntry {
                state: PageState::OnSwap(slot),
                dirty: false,
                writable: true,
            },
        );
    }

    pub fn set_dirty(&mut self, upage: UVAddr, dirty: bool) {
        if let Some(entry) = self.map.get_mut(&upage.into_usize()) {
            entry.dirty |= dirty;
        }
    }

    pub fn get(&self, upage: UVAddr) -> Option<&SuptEntry> {
        self.map.get(&upage.into_usize())
    }

    pub fn has(&self, upage: UVAddr) -> bool {
        self.map.contains_key(&upage.into_usize())
    }

    pub fn remove(&mut self, upage: UVAddr) -> Option<SuptEntry> {
        self.map.remove(&upage.into_usize())
    }

    pub fn pop_first(&mut self) -> Option<(UVAddr, SuptEntry)> {
        self.map.pop_first().map(|(k, v)| (UVAddr::from(k), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
