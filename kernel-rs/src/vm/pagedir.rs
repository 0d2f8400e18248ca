//! x86 page directories.
//!
//! The two-level IA-32 structure: a 1024-entry page directory of 1024-entry
//! page tables, each entry mapping one 4096-byte page. An entry stores the
//! frame's kernel address in its aligned bits and the flag bits below, the
//! way the hardware format does. The accessed and dirty bits are maintained
//! by the kernel's user-memory access routines, standing in for the MMU.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::addr::UVAddr;
use crate::kalloc::{KPage, Kmem};
use crate::lock::SpinLock;
use crate::x86::{pd_index, pt_index, PteFlags, PHYS_BASE};

const ENTRIES: usize = 1024;

#[derive(Clone, Copy)]
struct Pte(usize);

impl Pte {
    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn addr(self) -> usize {
        self.0 & !0xfff
    }

    fn present(self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn set(&mut self, addr: usize, flags: PteFlags) {
        debug_assert_eq!(addr & 0xfff, 0);
        self.0 = addr | flags.bits();
    }

    fn set_flag(&mut self, flag: PteFlags, value: bool) {
        if value {
            self.0 |= flag.bits();
        } else {
            self.0 &= !flag.bits();
        }
    }
}

struct PageTable {
    ptes: [Pte; ENTRIES],
}

impl PageTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            ptes: [Pte(0); ENTRIES],
        })
    }
}

pub struct PageDir {
    dir: Vec<Option<Box<PageTable>>>,
}

impl PageDir {
    pub fn new() -> Self {
        let mut dir = Vec::with_capacity(ENTRIES);
        dir.resize_with(ENTRIES, || None);
        Self { dir }
    }

    fn pte(&self, upage: UVAddr) -> Option<&Pte> {
        let va = upage.into_usize();
        let pt = self.dir[pd_index(va)].as_deref()?;
        let pte = &pt.ptes[pt_index(va)];
        if pte.present() {
            Some(pte)
        } else {
            None
        }
    }

    fn pte_mut(&mut self, upage: UVAddr, create: bool) -> Option<&mut Pte> {
        let va = upage.into_usize();
        let slot = &mut self.dir[pd_index(va)];
        if slot.is_none() {
            if !create {
                return None;
            }
            *slot = Some(PageTable::new());
        }
        Some(&mut slot.as_deref_mut().unwrap().ptes[pt_index(va)])
    }

    /// Maps `upage` to `kpage`. Fails if `upage` is already mapped.
    pub fn set_page(&mut self, upage: UVAddr, kpage: KPage, writable: bool) -> Result<(), ()> {
        assert!(upage.is_page_aligned(), "set_page: unaligned");
        assert!(upage.into_usize() < PHYS_BASE, "set_page: kernel address");
        let pte = self.pte_mut(upage, true).ok_or(())?;
        if pte.present() {
            return Err(());
        }
        let mut flags = PteFlags::P | PteFlags::U;
        if writable {
            flags |= PteFlags::W;
        }
        pte.set(kpage.addr(), flags);
        Ok(())
    }

    /// Unmaps `upage`, so no further access can race against whatever the
    /// caller does with the frame next.
    pub fn clear_page(&mut self, upage: UVAddr) {
        if let Some(pte) = self.pte_mut(upage, false) {
            pte.0 = 0;
        }
    }

    /// The frame `upage` maps to, if present.
    pub fn lookup(&self, upage: UVAddr) -> Option<KPage> {
        // SAFETY: a present PTE holds the address of an allocated frame.
        self.pte(upage).map(|pte| unsafe { KPage::from_addr(pte.addr()) })
    }

    pub fn is_writable(&self, upage: UVAddr) -> bool {
        self.pte(upage)
            .map_or(false, |pte| pte.flags().contains(PteFlags::W))
    }

    pub fn is_accessed(&self, upage: UVAddr) -> bool {
        self.pte(upage)
            .map_or(false, |pte| pte.flags().contains(PteFlags::A))
    }

    pub fn set_accessed(&mut self, upage: UVAddr, value: bool) {
        if let Some(pte) = self.pte_mut(upage, false) {
            if pte.present() {
                pte.set_flag(PteFlags::A, value);
            }
        }
    }

    pub fn is_dirty(&self, upage: UVAddr) -> bool {
        self.pte(upage)
            .map_or(false, |pte| pte.flags().contains(PteFlags::D))
    }

    pub fn set_dirty(&mut self, upage: UVAddr, value: bool) {
        if let Some(pte) = self.pte_mut(upage, false) {
            if pte.present() {
                pte.set_flag(PteFlags::D, value);
            }
        }
    }

    /// Frees every mapped frame back to the pool and drops the tables.
    /// The caller must already have emptied the frame table of this
    /// directory's frames.
    pub fn destroy(self, kmem: &SpinLock<Kmem>) {
        let mut kmem = kmem.lock();
        for pt in self.dir.into_iter().flatten() {
            for pte in pt.ptes.iter() {
                if pte.present() {
                    // SAFETY: present PTEs hold addresses of pool frames.
                    kmem.free(unsafe { KPage::from_addr(pte.addr()) });
                }
            }
        }
    }
}
