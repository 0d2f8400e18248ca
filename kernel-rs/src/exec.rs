//! Loading user programs.
//!
//! `load` opens the executable named by the first word of the command
//! line, validates its ELF32 headers, installs the loadable segments
//! lazily (a supplemental file-backed entry per page, so content pages in
//! on first touch), builds the initial user stack, and leaves the file
//! open deny-write for the life of the process.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use num_iter::range_step;
use zerocopy::AsBytes;

use crate::addr::UVAddr;
use crate::elf::{ElfHdr, ProgHdr, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_SHLIB};
use crate::file::File;
use crate::kernel::Kernel;
use crate::param::MAXARG;
use crate::proc::Proc;
use crate::x86::{pg_round_up, TrapFrame, PGSIZE, PHYS_BASE};

/// Checks whether `ph` describes a loadable segment this kernel accepts.
fn valid_segment(ph: &ProgHdr, file_len: u32) -> bool {
    // File offset and virtual address must be congruent modulo the page
    // size, the segment must lie inside the file, must not shrink in
    // memory, must be non-empty, must stay out of page 0, and must not
    // reach into or wrap around the kernel range.
    let end = match ph.vaddr.checked_add(ph.memsz) {
        Some(e) => e,
        None => return false,
    };
    ph.off % PGSIZE as u32 == ph.vaddr % PGSIZE as u32
        && ph.off <= file_len
        && ph.memsz >= ph.filesz
        && ph.memsz > 0
        && ph.vaddr as usize >= PGSIZE
        && (end as usize) < PHYS_BASE
}

impl Kernel {
    pub(crate) fn load(
        &self,
        proc: &mut Proc,
        cmdline: &str,
        frame: &mut TrapFrame,
    ) -> Result<(), ()> {
        let mut args: ArrayVec<&str, MAXARG> = ArrayVec::new();
        for tok in cmdline.split_ascii_whitespace() {
            args.try_push(tok).map_err(|_| ())?;
        }
        if args.is_empty() {
            return Err(());
        }

        let file = {
            let _guard = self.fs().lock.lock();
            let cwd = proc.cwd.as_ref().ok_or(())?;
            let ip = self
                .fs()
                .open(self.bcache(), cwd, args[0].as_bytes())
                .ok_or(())?;
            if ip.is_dir() {
                self.fs().itable.close(self.bcache(), &self.fs().freemap, ip);
                return Err(());
            }
            File::new(ip)
        };
        // Until the load commits, failure must close the executable.
        let file = scopeguard::guard(file, |f| {
            let _guard = self.fs().lock.lock();
            f.close(self.bcache(), self.fs());
        });

        let mut ehdr = ElfHdr::default();
        if file.read_at(self.bcache(), ehdr.as_bytes_mut(), 0) != mem::size_of::<ElfHdr>()
            || !ehdr.is_valid()
        {
            return Err(());
        }

        for i in 0..ehdr.phnum as u32 {
            let off = ehdr.phoff + i * mem::size_of::<ProgHdr>() as u32;
            let mut ph = ProgHdr::default();
            if file.read_at(self.bcache(), ph.as_bytes_mut(), off) != mem::size_of::<ProgHdr>() {
                return Err(());
            }
            match ph.typ {
                PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(()),
                PT_LOAD => {
                    if !valid_segment(&ph, file.len()) {
                        return Err(());
                    }
                    self.map_segment(proc, &file, &ph)?;
                }
                // Everything else is ignored.
                _ => {}
            }
        }

        // One page of stack at the top of user memory; further growth is
        // demand-paged by the fault handler.
        {
            let mut m = proc.memory.lock();
            m.supt
                .install_zeropage(UVAddr::from(PHYS_BASE - PGSIZE))?;
        }
        let sp = self.push_args(proc, &args)?;

        frame.eip = ehdr.entry;
        frame.esp = sp as u32;

        let mut file = scopeguard::ScopeGuard::into_inner(file);
        file.deny_write();
        proc.executable = Some(file);
        Ok(())
    }

    /// Installs one file-backed supplemental entry per page of a PT_LOAD
    /// segment: `read_bytes` from the file, then zeros to the page end.
    fn map_segment(&self, proc: &mut Proc, file: &File, ph: &ProgHdr) -> Result<(), ()> {
        let file_page = ph.off as usize & !(PGSIZE - 1);
        let mem_page = ph.vaddr as usize & !(PGSIZE - 1);
        let page_offset = ph.vaddr as usize & (PGSIZE - 1);
        let (mut read_bytes, total) = if ph.filesz > 0 {
            let read = page_offset + ph.filesz as usize;
            (read, pg_round_up(page_offset + ph.memsz as usize))
        } else {
            (0, pg_round_up(page_offset + ph.memsz as usize))
        };

        let writable = ph.is_writable();
        let mut m = proc.memory.lock();
        for (upage, offset) in izip!(
            range_step(mem_page, mem_page + total, PGSIZE),
            range_step(file_page, file_page + total, PGSIZE)
        ) {
            let page_read = core::cmp::min(read_bytes, PGSIZE);
            m.supt.install_file(
                UVAddr::from(upage),
                alloc::sync::Arc::clone(file.inode()),
                offset as u32,
                page_read as u32,
                (PGSIZE - page_read) as u32,
                writable,
            )?;
            read_bytes -= page_read;
        }
        Ok(())
    }

    /// Builds the initial stack: argument strings pushed top-down, a pad
    /// to word alignment, the NULL sentinel, the argv pointers in reverse,
    /// argv itself, argc, and a fake return address of 0. Returns the
    /// resulting stack pointer.
    fn push_args(&self, proc: &mut Proc, args: &[&str]) -> Result<usize, ()> {
        let mem = &proc.memory;
        let mut sp = PHYS_BASE;
        let mut push_bytes = |sp: &mut usize, bytes: &[u8]| -> Result<(), ()> {
            *sp -= bytes.len();
            self.copy_out_bytes(mem, UVAddr::from(*sp), bytes, *sp)
        };

        let mut ptrs = [0u32; MAXARG];
        let argc = args.len();
        for (arg, ptr) in izip!(args.iter(), ptrs[..argc].iter_mut()).rev() {
            push_bytes(&mut sp, b"\0")?;
            push_bytes(&mut sp, arg.as_bytes())?;
            *ptr = sp as u32;
        }

        sp &= !3;
        push_bytes(&mut sp, &0u32.to_le_bytes())?;
        for &ptr in ptrs[..args.len()].iter().rev() {
            push_bytes(&mut sp, &ptr.to_le_bytes())?;
        }
        let argv = sp as u32;
        push_bytes(&mut sp, &argv.to_le_bytes())?;
        push_bytes(&mut sp, &(args.len() as u32).to_le_bytes())?;
        push_bytes(&mut sp, &0u32.to_le_bytes())?;
        Ok(sp)
    }
}
