//! File, directory, and memory-mapping syscalls.
//!
//! Every handler validates its user memory first, then takes the
//! filesystem lock for the duration of the operation. The read and write
//! paths work directly on the caller's pages, pinning each one around the
//! file I/O so eviction cannot pull the buffer out from under the device.

use alloc::sync::Arc;

use crate::addr::UVAddr;
use crate::file::File;
use crate::fs::dir;
use crate::kernel::Kernel;
use crate::param::{DIRNAME_SIZE, MAXPATH};
use crate::proc::{FdEntry, FdFilter, KernelCtx, MmapDesc};
use crate::syscall::SysResult;
use crate::x86::{pg_round_down, TrapFrame, PGSIZE, PHYS_BASE};

const ERR: u32 = -1i32 as u32;

impl Kernel {
    pub(crate) fn sys_create(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let mut buf = [0u8; MAXPATH];
        let path = self.arg_path(ctx, frame, 0, &mut buf)?;
        let size = self.arg(ctx, frame, 1)?;

        let _guard = self.fs().lock.lock();
        let cwd = match ctx.proc.cwd.as_ref() {
            Some(c) => c,
            None => return Ok(0),
        };
        Ok(self.fs().create(self.bcache(), cwd, path, size, false) as u32)
    }

    pub(crate) fn sys_remove(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let mut buf = [0u8; MAXPATH];
        let path = self.arg_path(ctx, frame, 0, &mut buf)?;

        let _guard = self.fs().lock.lock();
        let cwd = match ctx.proc.cwd.as_ref() {
            Some(c) => c,
            None => return Ok(0),
        };
        Ok(self.fs().remove(self.bcache(), cwd, path) as u32)
    }

    pub(crate) fn sys_open(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let mut buf = [0u8; MAXPATH];
        let path = self.arg_path(ctx, frame, 0, &mut buf)?;

        let _guard = self.fs().lock.lock();
        let cwd = match ctx.proc.cwd.as_ref() {
            Some(c) => c,
            None => return Ok(ERR),
        };
        let ip = match self.fs().open(self.bcache(), cwd, path) {
            Some(ip) => ip,
            None => return Ok(ERR),
        };
        let entry = if ip.is_dir() {
            FdEntry::Dir(File::new(ip))
        } else {
            FdEntry::File(File::new(ip))
        };
        match ctx.proc.fd_install(entry) {
            Ok(fd) => Ok(fd as u32),
            Err(entry) => {
                // Descriptor table full; undo the open.
                entry.into_file().close(self.bcache(), self.fs());
                Ok(ERR)
            }
        }
    }

    pub(crate) fn sys_filesize(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let _guard = self.fs().lock.lock();
        match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => Ok(entry.file().len()),
            None => Ok(ERR),
        }
    }

    pub(crate) fn sys_read(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let addr = self.arg(ctx, frame, 1)? as usize;
        let size = self.arg(ctx, frame, 2)? as usize;
        let esp = frame.esp as usize;

        if size == 0 {
            return Ok(0);
        }
        if addr == 0 || addr + size > PHYS_BASE {
            return Err(-1);
        }

        // Console input.
        if fd == 0 {
            let mut done = 0;
            let mut byte = [0u8; 1];
            while done < size {
                match self.hal().console().read_byte() {
                    Some(b) => byte[0] = b,
                    None => break,
                }
                self.copy_out_bytes(
                    &ctx.proc.memory,
                    UVAddr::from(addr + done),
                    &byte,
                    esp,
                )
                .map_err(|()| -1)?;
                done += 1;
            }
            return Ok(done as u32);
        }

        let _guard = self.fs().lock.lock();
        let mem = Arc::clone(&ctx.proc.memory);
        let file = match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => entry.file_mut(),
            None => return Ok(ERR),
        };

        // Page by page: fault in and pin the destination, then let the
        // file read land directly in user memory.
        let mut done = 0;
        while done < size {
            let va = addr + done;
            let upage = pg_round_down(va);
            let poffset = va - upage;
            let n = core::cmp::min(PGSIZE - poffset, size - done);
            let read = self
                .with_user_page(&mem, UVAddr::from(upage), esp, true, |page| {
                    file.read(self.bcache(), &mut page[poffset..poffset + n])
                })
                .map_err(|()| -1)?;
            done += read;
            if read < n {
                break;
            }
        }
        Ok(done as u32)
    }

    pub(crate) fn sys_write(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let addr = self.arg(ctx, frame, 1)? as usize;
        let size = self.arg(ctx, frame, 2)? as usize;
        let esp = frame.esp as usize;

        if size == 0 {
            return Ok(0);
        }
        if addr == 0 || addr + size > PHYS_BASE {
            return Err(-1);
        }

        // Console output.
        if fd == 1 || fd == 2 {
            let mut done = 0;
            let mut chunk = [0u8; 256];
            while done < size {
                let n = core::cmp::min(chunk.len(), size - done);
                self.copy_in_bytes(
                    &ctx.proc.memory,
                    &mut chunk[..n],
                    UVAddr::from(addr + done),
                    esp,
                )
                .map_err(|()| -1)?;
                self.hal().console().write_bytes(&chunk[..n]);
                done += n;
            }
            return Ok(size as u32);
        }

        let _guard = self.fs().lock.lock();
        let mem = Arc::clone(&ctx.proc.memory);
        let file = match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => entry.file_mut(),
            None => return Ok(ERR),
        };

        let mut done = 0;
        while done < size {
            let va = addr + done;
            let upage = pg_round_down(va);
            let poffset = va - upage;
            let n = core::cmp::min(PGSIZE - poffset, size - done);
            let written = self
                .with_user_page(&mem, UVAddr::from(upage), esp, false, |page| {
                    file.write(self.bcache(), self.fs(), &page[poffset..poffset + n])
                })
                .map_err(|()| -1)?;
            done += written;
            if written < n {
                break;
            }
        }
        Ok(done as u32)
    }

    pub(crate) fn sys_seek(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let pos = self.arg(ctx, frame, 1)?;
        let _guard = self.fs().lock.lock();
        if let Some(entry) = ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            entry.file_mut().seek(pos);
        }
        Ok(0)
    }

    pub(crate) fn sys_tell(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let _guard = self.fs().lock.lock();
        match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => Ok(entry.file().tell()),
            None => Ok(ERR),
        }
    }

    pub(crate) fn sys_close(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let _guard = self.fs().lock.lock();
        match ctx.proc.fd_take(fd) {
            Some(entry) => {
                entry.into_file().close(self.bcache(), self.fs());
                Ok(0)
            }
            None => Ok(ERR),
        }
    }

    pub(crate) fn sys_mmap(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let addr = self.arg(ctx, frame, 1)? as usize;

        if fd <= 1 || addr == 0 || addr % PGSIZE != 0 {
            return Ok(ERR);
        }

        let _guard = self.fs().lock.lock();
        let len = match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => entry.file().len(),
            None => return Ok(ERR),
        };
        if len == 0 {
            return Ok(ERR);
        }
        let npages = (len as usize + PGSIZE - 1) / PGSIZE;
        let end = match addr.checked_add(npages * PGSIZE) {
            Some(e) if e <= PHYS_BASE => e,
            _ => return Ok(ERR),
        };

        // The range must not collide with anything already mapped.
        {
            let m = ctx.proc.memory.lock();
            for upage in (addr..end).step_by(PGSIZE) {
                if m.supt.has(UVAddr::from(upage)) {
                    return Ok(ERR);
                }
            }
        }

        // A private reopen gives the mapping its own cursor and lifetime.
        let file = match ctx.proc.fd_get(fd, FdFilter::FileOnly) {
            Some(entry) => entry.file().reopen(self.fs()),
            None => return Ok(ERR),
        };
        {
            let mut m = ctx.proc.memory.lock();
            for (i, upage) in (addr..end).step_by(PGSIZE).enumerate() {
                let offset = (i * PGSIZE) as u32;
                let read_bytes = core::cmp::min(len - offset, PGSIZE as u32);
                m.supt
                    .install_file(
                        UVAddr::from(upage),
                        Arc::clone(file.inode()),
                        offset,
                        read_bytes,
                        PGSIZE as u32 - read_bytes,
                        true,
                    )
                    .expect("mmap: overlap appeared after the check");
            }
        }

        let id = ctx.proc.next_mapid();
        let _ = ctx.proc.mmaps.insert(
            id,
            MmapDesc {
                file,
                addr,
                len,
            },
        );
        Ok(id as u32)
    }

    pub(crate) fn sys_munmap(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let id = self.arg(ctx, frame, 0)? as i32;
        let desc = match ctx.proc.mmaps.remove(&id) {
            Some(d) => d,
            None => return Ok(ERR),
        };
        let _guard = self.fs().lock.lock();
        self.munmap_desc(&ctx.proc.memory, desc);
        Ok(0)
    }

    pub(crate) fn sys_chdir(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let mut buf = [0u8; MAXPATH];
        let path = self.arg_path(ctx, frame, 0, &mut buf)?;

        let _guard = self.fs().lock.lock();
        let cwd = match ctx.proc.cwd.as_ref() {
            Some(c) => c,
            None => return Ok(0),
        };
        let ip = match self.fs().open(self.bcache(), cwd, path) {
            Some(ip) => ip,
            None => return Ok(0),
        };
        if !ip.is_dir() {
            self.fs().itable.close(self.bcache(), &self.fs().freemap, ip);
            return Ok(0);
        }
        if let Some(old) = ctx.proc.cwd.replace(ip) {
            self.fs().itable.close(self.bcache(), &self.fs().freemap, old);
        }
        Ok(1)
    }

    pub(crate) fn sys_mkdir(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let mut buf = [0u8; MAXPATH];
        let path = self.arg_path(ctx, frame, 0, &mut buf)?;

        let _guard = self.fs().lock.lock();
        let cwd = match ctx.proc.cwd.as_ref() {
            Some(c) => c,
            None => return Ok(0),
        };
        Ok(self.fs().create(self.bcache(), cwd, path, 0, true) as u32)
    }

    pub(crate) fn sys_readdir(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        let addr = self.arg(ctx, frame, 1)? as usize;
        let esp = frame.esp as usize;
        if addr == 0 || addr >= PHYS_BASE {
            return Err(-1);
        }

        let _guard = self.fs().lock.lock();
        let mem = Arc::clone(&ctx.proc.memory);
        let file = match ctx.proc.fd_get(fd, FdFilter::DirOnly) {
            Some(entry) => entry.file_mut(),
            None => return Ok(0),
        };
        let index = file.tell();
        let de = match dir::read_entry(file.inode(), self.bcache(), index) {
            Some(de) => de,
            None => return Ok(0),
        };
        file.seek(index + 1);

        let mut name = [0u8; DIRNAME_SIZE + 1];
        name[..de.name().len()].copy_from_slice(de.name());
        self.copy_out_bytes(
            &mem,
            UVAddr::from(addr),
            &name[..de.name().len() + 1],
            esp,
        )
        .map_err(|()| -1)?;
        Ok(1)
    }

    pub(crate) fn sys_isdir(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        match ctx.proc.fd_get(fd, FdFilter::Any) {
            Some(entry) => Ok(entry.is_dir() as u32),
            None => Ok(ERR),
        }
    }

    pub(crate) fn sys_inumber(&self, ctx: &mut KernelCtx<'_>, frame: &TrapFrame) -> SysResult {
        let fd = self.arg(ctx, frame, 0)? as i32;
        match ctx.proc.fd_get(fd, FdFilter::Any) {
            Some(entry) => Ok(entry.file().inode().inumber()),
            None => Ok(ERR),
        }
    }
}
