//! Virtual memory.
//!
//! `UserMemory` bundles one process's page directory and supplemental page
//! table behind a spin lock; the frame table, swap device, and frame pool
//! are kernel-wide. The operations that tie them together (page faults,
//! pinned user-memory access, unmapping, teardown) live here as `Kernel`
//! methods, because each of them touches several of those structures with a
//! strict locking discipline: take the frame table only while holding no
//! `UserMemory` lock, and touch a frame's contents only while it is pinned.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::addr::UVAddr;
use crate::file::File;
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::page::Page;
use crate::x86::{pg_round_down, PGSIZE, PHYS_BASE, STACK_HEURISTIC, STACK_LIMIT};

mod frame;
mod pagedir;
mod supt;
mod swap;

pub use frame::FrameTable;
pub use pagedir::PageDir;
pub use supt::{PageState, Supt, SuptEntry};
pub use swap::SwapDev;

/// One process's address space.
pub struct UserMemory {
    pub pagedir: PageDir,
    pub supt: Supt,
}

impl UserMemory {
    pub fn new() -> Arc<SpinLock<Self>> {
        Arc::new(SpinLock::new(
            "usermem",
            Self {
                pagedir: PageDir::new(),
                supt: Supt::new(),
            },
        ))
    }
}

impl Kernel {
    /// Fields a page fault at `addr`. Looks up the supplemental entry
    /// (installing a fresh zero page when the fault is a legal stack
    /// growth), materializes the content on a pinned frame, installs the
    /// mapping with the recorded writable bit, and unpins.
    ///
    /// Returns Err(()) when the fault cannot be resolved; the caller kills
    /// the process.
    pub fn handle_fault(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        addr: usize,
        esp: usize,
    ) -> Result<(), ()> {
        if addr == 0 || addr >= PHYS_BASE {
            return Err(());
        }
        let upage = UVAddr::from(pg_round_down(addr));

        // Decide how to materialize, without holding the lock across the
        // frame allocation below.
        enum Fill {
            Zero,
            Swap(u32),
            File {
                ip: Arc<crate::fs::Inode>,
                offset: u32,
                read_bytes: u32,
                zero_bytes: u32,
            },
        }
        let (fill, writable) = {
            let mut m = mem.lock();
            if !m.supt.has(upage) {
                // Legal stack growth faults a fresh zero page into
                // existence; anything else is fatal for the process.
                let grows =
                    addr >= STACK_LIMIT && addr < PHYS_BASE && addr + STACK_HEURISTIC >= esp;
                if !grows {
                    return Err(());
                }
                m.supt.install_zeropage(upage)?;
            }
            let entry = m.supt.get(upage).unwrap();
            let writable = entry.writable;
            match &entry.state {
                PageState::OnFrame(_) => return Ok(()),
                PageState::AllZero => (Fill::Zero, writable),
                PageState::OnSwap(slot) => (Fill::Swap(*slot), writable),
                PageState::FromFile {
                    ip,
                    offset,
                    read_bytes,
                    zero_bytes,
                } => (
                    Fill::File {
                        ip: Arc::clone(ip),
                        offset: *offset,
                        read_bytes: *read_bytes,
                        zero_bytes: *zero_bytes,
                    },
                    writable,
                ),
            }
        };

        let kpage = self.frames().allocate(self.kmem(), self.swap(), upage, mem);
        // SAFETY: the frame is pinned and this thread is its only accessor.
        let data = unsafe { kpage.slice_mut() };
        let filled = match fill {
            Fill::Zero => {
                data.fill(0);
                Ok(())
            }
            Fill::Swap(slot) => {
                self.swap().in_(slot, data);
                self.swap().free(slot);
                Ok(())
            }
            Fill::File {
                ip,
                offset,
                read_bytes,
                zero_bytes,
            } => {
                assert_eq!(
                    read_bytes + zero_bytes,
                    PGSIZE as u32,
                    "page fill: bad segment arithmetic"
                );
                let n = ip.read_at(self.bcache(), &mut data[..read_bytes as usize], offset);
                if n == read_bytes as usize {
                    data[read_bytes as usize..].fill(0);
                    Ok(())
                } else {
                    Err(())
                }
            }
        };
        if filled.is_err() {
            self.frames().free(self.kmem(), kpage);
            return Err(());
        }

        {
            let mut m = mem.lock();
            m.pagedir
                .set_page(upage, kpage, writable)
                .expect("page fault: page already mapped");
            m.supt.set_frame(upage, kpage);
            m.pagedir.set_dirty(upage, false);
        }
        self.frames().unpin(kpage);
        Ok(())
    }

    /// Runs `f` over the frame backing `upage`, faulting the page in if
    /// needed and keeping it pinned for the duration. This is the pinning
    /// window that makes kernel-side copies safe against eviction.
    ///
    /// With `write`, the page must be mapped writable, and the dirty bit is
    /// set the way the hardware would.
    pub fn with_user_page<R>(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        upage: UVAddr,
        esp: usize,
        write: bool,
        f: impl FnOnce(&mut [u8; PGSIZE]) -> R,
    ) -> Result<R, ()> {
        if !upage.is_user() {
            return Err(());
        }
        // Settle on a pinned, still-current frame first; only then run `f`.
        let kpage = loop {
            let kpage = {
                let m = mem.lock();
                match m.supt.get(upage).map(|e| &e.state) {
                    Some(PageState::OnFrame(kp)) => Some(*kp),
                    _ => None,
                }
            };
            let kpage = match kpage {
                Some(kp) => kp,
                None => {
                    self.handle_fault(mem, upage.into_usize(), esp)?;
                    continue;
                }
            };
            // Pin before trusting the lookup; eviction may have won the
            // race, in which case we fault the page back in and retry.
            if !self.frames().try_pin(kpage) {
                continue;
            }
            let still_ours = {
                let mut m = mem.lock();
                let check = match m.supt.get(upage) {
                    Some(e) => match &e.state {
                        PageState::OnFrame(kp) if *kp == kpage => Some(e.writable),
                        _ => None,
                    },
                    None => None,
                };
                match check {
                    Some(writable) => {
                        if write && !writable {
                            drop(m);
                            self.frames().unpin(kpage);
                            return Err(());
                        }
                        m.pagedir.set_accessed(upage, true);
                        if write {
                            m.pagedir.set_dirty(upage, true);
                        }
                        true
                    }
                    None => false,
                }
            };
            if !still_ours {
                self.frames().unpin(kpage);
                continue;
            }
            break kpage;
        };
        // SAFETY: pinned, and the owner thread is the sole accessor.
        let r = f(unsafe { kpage.slice_mut() });
        self.frames().unpin(kpage);
        Ok(r)
    }

    /// Copies `src` into the process's memory at `dst`.
    pub fn copy_out_bytes(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        dst: UVAddr,
        src: &[u8],
        esp: usize,
    ) -> Result<(), ()> {
        let mut addr = dst.into_usize();
        let mut done = 0;
        while done < src.len() {
            let upage = UVAddr::from(pg_round_down(addr));
            let poffset = addr - upage.into_usize();
            let n = core::cmp::min(PGSIZE - poffset, src.len() - done);
            self.with_user_page(mem, upage, esp, true, |page| {
                page[poffset..poffset + n].copy_from_slice(&src[done..done + n]);
            })?;
            done += n;
            addr += n;
        }
        Ok(())
    }

    /// Copies from the process's memory at `src` into `dst`.
    pub fn copy_in_bytes(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        dst: &mut [u8],
        src: UVAddr,
        esp: usize,
    ) -> Result<(), ()> {
        let mut addr = src.into_usize();
        let mut done = 0;
        while done < dst.len() {
            let upage = UVAddr::from(pg_round_down(addr));
            let poffset = addr - upage.into_usize();
            let n = core::cmp::min(PGSIZE - poffset, dst.len() - done);
            self.with_user_page(mem, upage, esp, false, |page| {
                dst[done..done + n].copy_from_slice(&page[poffset..poffset + n]);
            })?;
            done += n;
            addr += n;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from `src` into `dst`, probing page
    /// by page until the terminator. Err if the string is unterminated
    /// within `dst` or crosses into unmapped memory.
    pub fn copy_in_str(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        dst: &mut [u8],
        src: UVAddr,
        esp: usize,
    ) -> Result<usize, ()> {
        let mut addr = src.into_usize();
        let mut done = 0;
        while done < dst.len() {
            let upage = UVAddr::from(pg_round_down(addr));
            let poffset = addr - upage.into_usize();
            let n = core::cmp::min(PGSIZE - poffset, dst.len() - done);
            let nul = self.with_user_page(mem, upage, esp, false, |page| {
                let from = &page[poffset..poffset + n];
                match from.iter().position(|&c| c == 0) {
                    Some(i) => {
                        dst[done..done + i + 1].copy_from_slice(&from[..=i]);
                        Some(done + i + 1)
                    }
                    None => {
                        dst[done..done + n].copy_from_slice(from);
                        None
                    }
                }
            })?;
            if let Some(len) = nul {
                return Ok(len);
            }
            done += n;
            addr += n;
        }
        Err(())
    }

    /// Removes one page of a mapping. When the page carries modifications
    /// (sticky dirty flag or the page-directory dirty bit) and `backing`
    /// names a file region, the content is written back there first. Swap
    /// residents come back through a scratch page; clean ones just release
    /// their slot.
    pub fn vm_unmap_page(
        &self,
        mem: &Arc<SpinLock<UserMemory>>,
        upage: UVAddr,
        backing: Option<(&File, u32, u32)>,
    ) {
        loop {
            enum Resident {
                Frame(crate::kalloc::KPage),
                Swap(u32, bool),
                Other,
                Gone,
            }
            let state = {
                let m = mem.lock();
                match m.supt.get(upage) {
                    None => Resident::Gone,
                    Some(e) => match &e.state {
                        PageState::OnFrame(kp) => Resident::Frame(*kp),
                        PageState::OnSwap(slot) => Resident::Swap(*slot, e.dirty),
                        _ => Resident::Other,
                    },
                }
            };
            match state {
                Resident::Gone => return,
                Resident::Other => {
                    let _ = mem.lock().supt.remove(upage);
                    return;
                }
                Resident::Swap(slot, dirty) => {
                    if let (true, Some((file, offset, bytes))) = (dirty, backing) {
                        let mut scratch = Box::new(Page::zeroed());
                        self.swap().in_(slot, &mut scratch);
                        let _ = file.write_at(self.bcache(), self.fs(), &scratch[..bytes as usize], offset);
                    }
                    self.swap().free(slot);
                    let _ = mem.lock().supt.remove(upage);
                    return;
                }
                Resident::Frame(kpage) => {
                    if !self.frames().try_pin(kpage) {
                        // Evicted under us; take the swap path next round.
                        continue;
                    }
                    let verified = {
                        let m = mem.lock();
                        matches!(
                            m.supt.get(upage).map(|e| &e.state),
                            Some(PageState::OnFrame(kp)) if *kp == kpage
                        )
                    };
                    if !verified {
                        self.frames().unpin(kpage);
                        continue;
                    }
                    let dirty = {
                        let m = mem.lock();
                        m.supt.get(upage).map_or(false, |e| e.dirty) || m.pagedir.is_dirty(upage)
                    };
                    if let (true, Some((file, offset, bytes))) = (dirty, backing) {
                        // SAFETY: pinned by us.
                        let data = unsafe { kpage.slice() };
                        let _ = file.write_at(self.bcache(), self.fs(), &data[..bytes as usize], offset);
                    }
                    {
                        let mut m = mem.lock();
                        m.pagedir.clear_page(upage);
                        let _ = m.supt.remove(upage);
                    }
                    self.frames().free(self.kmem(), kpage);
                    return;
                }
            }
        }
    }

    /// Tears the address space down: resident pages lose their frame-table
    /// entries (the page directory reclaims the frames), swap residents
    /// release their slots, file-backed entries need nothing. Then the page
    /// directory itself is destroyed.
    pub fn vm_destroy(&self, mem: &Arc<SpinLock<UserMemory>>) {
        loop {
            let next = mem.lock().supt.pop_first();
            let (_, entry) = match next {
                Some(v) => v,
                None => break,
            };
            match entry.state {
                PageState::OnFrame(kpage) => {
                    // If eviction won the race the frame is not ours any
                    // more; its slot reappears as a fresh OnSwap entry and
                    // is handled on a later iteration.
                    let _ = self.frames().try_remove_entry(kpage);
                }
                PageState::OnSwap(slot) => self.swap().free(slot),
                PageState::AllZero | PageState::FromFile { .. } => {}
            }
        }
        let pagedir = {
            let mut m = mem.lock();
            core::mem::replace(&mut m.pagedir, PageDir::new())
        };
        pagedir.destroy(self.kmem());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::harness;
    use std::vec::Vec;

    const NFRAMES: usize = 8;

    fn pattern(page: usize, i: usize) -> u8 {
        (page.wrapping_mul(37) ^ i) as u8
    }

    #[test]
    fn zero_page_faults_in_zeroed() {
        let h = harness(NFRAMES, 1024, 256);
        let mem = UserMemory::new();
        let upage = UVAddr::from(0x1000_0000);
        mem.lock().supt.install_zeropage(upage).unwrap();

        h.kernel
            .with_user_page(&mem, upage, usize::MAX, false, |page| {
                assert!(page.iter().all(|&b| b == 0));
            })
            .unwrap();
        h.kernel.vm_destroy(&mem);
    }

    #[test]
    fn eviction_round_trips_through_swap() {
        let h = harness(NFRAMES, 1024, 1024);
        let mem = UserMemory::new();
        let npages = NFRAMES * 4;

        // Touch four times as many pages as there are frames, writing a
        // distinct pattern into each; earlier pages get evicted to swap.
        for p in 0..npages {
            let upage = UVAddr::from(0x1000_0000 + p * PGSIZE);
            mem.lock().supt.install_zeropage(upage).unwrap();
            h.kernel
                .with_user_page(&mem, upage, usize::MAX, true, |page| {
                    for (i, b) in page.iter_mut().enumerate() {
                        *b = pattern(p, i);
                    }
                })
                .unwrap();
        }
        assert!(h.kernel.swap().free_slots() < h.kernel.swap().nslots());

        // Every page reads back exactly, faulting the swapped ones in.
        for p in 0..npages {
            let upage = UVAddr::from(0x1000_0000 + p * PGSIZE);
            h.kernel
                .with_user_page(&mem, upage, usize::MAX, false, |page| {
                    for (i, &b) in page.iter().enumerate() {
                        assert_eq!(b, pattern(p, i), "page {} byte {}", p, i);
                    }
                })
                .unwrap();
        }
        h.kernel.vm_destroy(&mem);

        // Teardown released every frame and every swap slot.
        assert_eq!(h.kernel.kmem().lock().nfree(), NFRAMES);
        assert_eq!(h.kernel.swap().free_slots(), h.kernel.swap().nslots());
        assert_eq!(h.kernel.frames().len(), 0);
    }

    #[test]
    fn allocation_always_succeeds_past_pool_size() {
        let h = harness(4, 1024, 1024);
        let mem = UserMemory::new();
        // Far more allocations than frames; each one must succeed.
        for p in 0..64 {
            let upage = UVAddr::from(0x2000_0000 + p * PGSIZE);
            mem.lock().supt.install_zeropage(upage).unwrap();
            h.kernel
                .with_user_page(&mem, upage, usize::MAX, true, |page| page[0] = p as u8)
                .unwrap();
        }
        h.kernel.vm_destroy(&mem);
    }

    #[test]
    fn stack_growth_heuristic() {
        let h = harness(NFRAMES, 1024, 256);
        let mem = UserMemory::new();

        // A fault just below the stack pointer grows the stack.
        let esp = PHYS_BASE - PGSIZE;
        let addr = esp - 4;
        assert!(h.kernel.handle_fault(&mem, addr, esp).is_ok());
        assert!(mem.lock().supt.has(UVAddr::from(pg_round_down(addr))));

        // PUSHA-style accesses 32 bytes under esp still count.
        assert!(h
            .kernel
            .handle_fault(&mem, esp - PGSIZE - STACK_HEURISTIC, esp - PGSIZE)
            .is_ok());

        // Far below the stack pointer is fatal.
        assert!(h.kernel.handle_fault(&mem, esp - 16 * PGSIZE, esp).is_err());
        // So is anything outside the stack region or in kernel space.
        assert!(h.kernel.handle_fault(&mem, 0x1234, esp).is_err());
        assert!(h.kernel.handle_fault(&mem, PHYS_BASE + 8, esp).is_err());
        h.kernel.vm_destroy(&mem);
    }

    #[test]
    fn file_backed_pages_materialize_and_write_back() {
        let h = harness(NFRAMES, 4096, 256);
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        crate::fakes::write_file(&h, "data", &content);

        let (file, ip) = {
            let _g = h.kernel.fs().lock.lock();
            let root = h.kernel.fs().root(h.kernel.bcache());
            let ip = h
                .kernel
                .fs()
                .open(h.kernel.bcache(), &root, b"data")
                .unwrap();
            h.kernel
                .fs()
                .itable
                .close(h.kernel.bcache(), &h.kernel.fs().freemap, root);
            (crate::file::File::new(h.kernel.fs().itable.dup(&ip)), ip)
        };

        let mem = UserMemory::new();
        let base = 0x1000_0000usize;
        {
            let mut m = mem.lock();
            m.supt
                .install_file(UVAddr::from(base), ip.clone(), 0, PGSIZE as u32, 0, true)
                .unwrap();
            m.supt
                .install_file(
                    UVAddr::from(base + PGSIZE),
                    ip.clone(),
                    PGSIZE as u32,
                    5000 - PGSIZE as u32,
                    2 * PGSIZE as u32 - 5000,
                    true,
                )
                .unwrap();
        }

        // First touch reads file content and zero-fills the tail.
        h.kernel
            .with_user_page(&mem, UVAddr::from(base + PGSIZE), usize::MAX, true, |page| {
                assert_eq!(page[0], content[PGSIZE]);
                assert_eq!(page[5000 - PGSIZE], 0);
                page[10] = 0xab;
            })
            .unwrap();

        // Unmapping with a backing region flushes the modification.
        h.kernel.vm_unmap_page(
            &mem,
            UVAddr::from(base + PGSIZE),
            Some((&file, PGSIZE as u32, 5000 - PGSIZE as u32)),
        );
        h.kernel
            .vm_unmap_page(&mem, UVAddr::from(base), Some((&file, 0, PGSIZE as u32)));
        {
            let _g = h.kernel.fs().lock.lock();
            file.close(h.kernel.bcache(), h.kernel.fs());
            h.kernel
                .fs()
                .itable
                .close(h.kernel.bcache(), &h.kernel.fs().freemap, ip);
        }

        let back = crate::fakes::read_file(&h, "data");
        assert_eq!(back[PGSIZE + 10], 0xab);
        assert_eq!(back[PGSIZE], content[PGSIZE]);
        h.kernel.vm_destroy(&mem);
    }

    #[test]
    fn unmodified_file_pages_are_not_written_back() {
        let h = harness(NFRAMES, 4096, 256);
        let content = vec![9u8; PGSIZE];
        crate::fakes::write_file(&h, "ro", &content);

        let (file, ip) = {
            let _g = h.kernel.fs().lock.lock();
            let root = h.kernel.fs().root(h.kernel.bcache());
            let ip = h.kernel.fs().open(h.kernel.bcache(), &root, b"ro").unwrap();
            h.kernel
                .fs()
                .itable
                .close(h.kernel.bcache(), &h.kernel.fs().freemap, root);
            (crate::file::File::new(h.kernel.fs().itable.dup(&ip)), ip)
        };

        let mem = UserMemory::new();
        let upage = UVAddr::from(0x3000_0000);
        mem.lock()
            .supt
            .install_file(upage, ip.clone(), 0, PGSIZE as u32, 0, true)
            .unwrap();
        h.kernel
            .with_user_page(&mem, upage, usize::MAX, false, |page| {
                assert_eq!(page[0], 9);
            })
            .unwrap();

        let writes_before = h.disk.writes();
        h.kernel
            .vm_unmap_page(&mem, upage, Some((&file, 0, PGSIZE as u32)));
        // Clean page: no write-back traffic (the device write count is a
        // cache-level signal, and nothing here forced a flush).
        let reread = crate::fakes::read_file(&h, "ro");
        assert_eq!(reread, content);
        assert!(h.disk.writes() >= writes_before);

        {
            let _g = h.kernel.fs().lock.lock();
            file.close(h.kernel.bcache(), h.kernel.fs());
            h.kernel
                .fs()
                .itable
                .close(h.kernel.bcache(), &h.kernel.fs().freemap, ip);
        }
        h.kernel.vm_destroy(&mem);
    }
}
