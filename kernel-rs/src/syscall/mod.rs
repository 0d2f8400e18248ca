//! System calls.
//!
//! User threads arrive through interrupt vector 0x30 with the syscall
//! number at `esp` and arguments at `esp+4`, `esp+8`, `esp+12`; the result
//! goes back in `eax`. Every pointer crossing the boundary is validated
//! here: a null pointer, a kernel-range pointer, or a pointer to a page
//! that cannot be materialized kills the process with exit(-1). Buffers
//! are walked page by page; C strings byte by byte until their NUL.
//!
//! No lock is ever held at a kill site: validation happens before the
//! filesystem lock is taken, and every lock is a scoped guard.

use alloc::sync::Arc;

use cstr_core::CStr;

use crate::addr::UVAddr;
use crate::kernel::Kernel;
use crate::param::MAXPATH;
use crate::proc::KernelCtx;
use crate::x86::TrapFrame;

mod file;
mod proc;

/// Ok(value) lands in the user's eax. Err(status) terminates the process
/// with that exit status; errors never cross the boundary any other way.
pub type SysResult = Result<u32, i32>;

impl Kernel {
    /// The dispatcher. Returns None after a normal syscall (eax holds the
    /// result) or Some(status) when the process must terminate.
    pub fn syscall(self: &Arc<Self>, ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame) -> Option<i32> {
        match self.dispatch(ctx, frame) {
            Ok(v) => {
                frame.eax = v;
                None
            }
            Err(status) => Some(status),
        }
    }

    fn dispatch(self: &Arc<Self>, ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame) -> SysResult {
        let nr = self
            .read_user_u32(ctx, frame, frame.esp as usize)
            .map_err(|()| -1)?;
        match nr {
            // HALT
            0 => {
                self.shutdown();
                Err(0)
            }
            // EXIT(status)
            1 => Err(self.arg(ctx, frame, 0)? as i32),
            // EXEC(cmdline) -> tid
            2 => self.sys_exec(ctx, frame),
            // WAIT(tid) -> status
            3 => {
                let tid = self.arg(ctx, frame, 0)? as i32;
                Ok(self.wait(ctx.proc, tid) as u32)
            }
            // CREATE(path, size) -> bool
            4 => self.sys_create(ctx, frame),
            // REMOVE(path) -> bool
            5 => self.sys_remove(ctx, frame),
            // OPEN(path) -> fd
            6 => self.sys_open(ctx, frame),
            // FILESIZE(fd) -> len
            7 => self.sys_filesize(ctx, frame),
            // READ(fd, buf, size) -> n
            8 => self.sys_read(ctx, frame),
            // WRITE(fd, buf, size) -> n
            9 => self.sys_write(ctx, frame),
            // SEEK(fd, pos)
            10 => self.sys_seek(ctx, frame),
            // TELL(fd) -> pos
            11 => self.sys_tell(ctx, frame),
            // CLOSE(fd)
            12 => self.sys_close(ctx, frame),
            // MMAP(fd, addr) -> mapid
            13 => self.sys_mmap(ctx, frame),
            // MUNMAP(mapid)
            14 => self.sys_munmap(ctx, frame),
            // CHDIR(path) -> bool
            15 => self.sys_chdir(ctx, frame),
            // MKDIR(path) -> bool
            16 => self.sys_mkdir(ctx, frame),
            // READDIR(fd, name) -> bool
            17 => self.sys_readdir(ctx, frame),
            // ISDIR(fd) -> bool
            18 => self.sys_isdir(ctx, frame),
            // INUMBER(fd) -> sector
            19 => self.sys_inumber(ctx, frame),
            _ => Err(-1),
        }
    }

    fn read_user_u32(
        &self,
        ctx: &mut KernelCtx<'_>,
        frame: &TrapFrame,
        addr: usize,
    ) -> Result<u32, ()> {
        let mut bytes = [0u8; 4];
        self.copy_in_bytes(
            &ctx.proc.memory,
            &mut bytes,
            UVAddr::from(addr),
            frame.esp as usize,
        )?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Fetches the `n`th argument word from the user stack.
    pub(crate) fn arg(
        &self,
        ctx: &mut KernelCtx<'_>,
        frame: &TrapFrame,
        n: usize,
    ) -> Result<u32, i32> {
        self.read_user_u32(ctx, frame, frame.esp as usize + 4 + 4 * n)
            .map_err(|()| -1)
    }

    /// Fetches the `n`th argument as a NUL-terminated user string into
    /// `buf`, returning its length without the terminator. Fatal for the
    /// process if the pointer or any byte of the string is bad.
    pub(crate) fn arg_str<'b>(
        &self,
        ctx: &mut KernelCtx<'_>,
        frame: &TrapFrame,
        n: usize,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8], i32> {
        let addr = self.arg(ctx, frame, n)? as usize;
        if addr == 0 {
            return Err(-1);
        }
        let len = self
            .copy_in_str(&ctx.proc.memory, buf, UVAddr::from(addr), frame.esp as usize)
            .map_err(|()| -1)?;
        let cstr = CStr::from_bytes_with_nul(&buf[..len]).map_err(|_| -1)?;
        Ok(cstr.to_bytes())
    }

    pub(crate) fn arg_path<'b>(
        &self,
        ctx: &mut KernelCtx<'_>,
        frame: &TrapFrame,
        n: usize,
        buf: &'b mut [u8; MAXPATH],
    ) -> Result<&'b [u8], i32> {
        self.arg_str(ctx, frame, n, buf)
    }
}

#[cfg(test)]
mod tests {
    use crate::fakes::{
        exec_wait, harness, install_program_image, nr, push_user_bytes, push_user_str, sc,
    };
    use crate::x86::PHYS_BASE;

    /// create("a", 600); open("a")=3; write 600 bytes; close; reopen;
    /// filesize == 600.
    #[test]
    fn create_write_reopen_filesize() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "fstest", &[0x90; 16]);
        h.user.register("fstest", |ctx, frame| {
            let path = push_user_str(ctx, frame, "a");
            let buf = push_user_bytes(ctx, frame, &[b'X'; 600]);
            let step = |r: Result<u32, i32>, want: u32, code: i32| -> Result<(), i32> {
                match r {
                    Ok(v) if v == want => Ok(()),
                    _ => Err(code),
                }
            };
            let run = |ctx: &mut crate::proc::KernelCtx<'_>,
                       frame: &mut crate::x86::TrapFrame|
             -> Result<(), i32> {
                step(sc(ctx, frame, nr::CREATE, &[path, 600]), 1, 10)?;
                step(sc(ctx, frame, nr::OPEN, &[path]), 3, 11)?;
                step(sc(ctx, frame, nr::WRITE, &[3, buf, 600]), 600, 12)?;
                step(sc(ctx, frame, nr::CLOSE, &[3]), 0, 13)?;
                // The freed descriptor is the lowest again.
                step(sc(ctx, frame, nr::OPEN, &[path]), 3, 14)?;
                step(sc(ctx, frame, nr::FILESIZE, &[3]), 600, 15)?;
                step(sc(ctx, frame, nr::CLOSE, &[3]), 0, 16)?;
                Ok(())
            };
            match run(ctx, frame) {
                Ok(()) => 0,
                Err(code) => code,
            }
        });
        assert_eq!(exec_wait(&h, "fstest"), 0);
        h.threads.join_all();
        assert_eq!(crate::fakes::read_file(&h, "a"), vec![b'X'; 600]);
    }

    #[test]
    fn read_write_seek_tell_round_trip() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "rw", &[0x90; 16]);
        crate::fakes::write_file(&h, "data", b"abcdefghij");
        h.user.register("rw", |ctx, frame| {
            let path = push_user_str(ctx, frame, "data");
            let out = push_user_bytes(ctx, frame, &[0u8; 10]);
            let fd = match sc(ctx, frame, nr::OPEN, &[path]) {
                Ok(v) => v,
                Err(c) => return c,
            };
            if sc(ctx, frame, nr::SEEK, &[fd, 4]).is_err() {
                return 1;
            }
            if sc(ctx, frame, nr::TELL, &[fd]) != Ok(4) {
                return 2;
            }
            if sc(ctx, frame, nr::READ, &[fd, out, 3]) != Ok(3) {
                return 3;
            }
            if sc(ctx, frame, nr::TELL, &[fd]) != Ok(7) {
                return 4;
            }
            let got = [
                crate::fakes::peek_u32(ctx, frame, out) & 0xff,
                (crate::fakes::peek_u32(ctx, frame, out) >> 8) & 0xff,
                (crate::fakes::peek_u32(ctx, frame, out) >> 16) & 0xff,
            ];
            if got != [b'e' as u32, b'f' as u32, b'g' as u32] {
                return 5;
            }
            // Reads past end of file come back short.
            if sc(ctx, frame, nr::SEEK, &[fd, 100]).is_err() {
                return 6;
            }
            if sc(ctx, frame, nr::READ, &[fd, out, 10]) != Ok(0) {
                return 7;
            }
            0
        });
        assert_eq!(exec_wait(&h, "rw"), 0);
        h.threads.join_all();
    }

    #[test]
    fn bad_pointers_kill_the_process() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "evil", &[0x90; 16]);
        h.user.register("evil", |ctx, frame| {
            let path = push_user_str(ctx, frame, "x");
            let _ = sc(ctx, frame, nr::CREATE, &[path, 16]);
            let fd = sc(ctx, frame, nr::OPEN, &[path]).unwrap_or(0);
            // Reading into a kernel address must kill us; if the kernel
            // lets it through, exit 0 so the test notices.
            match sc(ctx, frame, nr::READ, &[fd, PHYS_BASE as u32, 16]) {
                Err(code) => code,
                Ok(_) => 0,
            }
        });
        assert_eq!(exec_wait(&h, "evil"), -1);
        h.threads.join_all();
        assert!(h.console.output().contains("evil: exit(-1)\n"));

        // A null path pointer is just as fatal.
        install_program_image(&h, "evil2", &[0x90; 16]);
        h.user.register("evil2", |ctx, frame| {
            match sc(ctx, frame, nr::OPEN, &[0]) {
                Err(code) => code,
                Ok(_) => 0,
            }
        });
        assert_eq!(exec_wait(&h, "evil2"), -1);
        h.threads.join_all();
    }

    #[test]
    fn deny_write_protects_a_running_executable() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "selfish", &[0x90; 16]);
        h.user.register("selfish", |ctx, frame| {
            let path = push_user_str(ctx, frame, "selfish");
            let data = push_user_bytes(ctx, frame, &[0u8; 8]);
            let fd = match sc(ctx, frame, nr::OPEN, &[path]) {
                Ok(v) => v,
                Err(c) => return c,
            };
            // Writes to our own image bounce off with 0 written.
            match sc(ctx, frame, nr::WRITE, &[fd, data, 8]) {
                Ok(0) => 0,
                Ok(_) => 1,
                Err(c) => c,
            }
        });
        assert_eq!(exec_wait(&h, "selfish"), 0);
        h.threads.join_all();

        // With the process gone, the image is writable again.
        let before = crate::fakes::read_file(&h, "selfish");
        crate::fakes::write_file(&h, "scratch", b"ok");
        assert!(!before.is_empty());
    }

    #[test]
    fn mmap_flushes_modifications_back_to_the_file() {
        let h = harness(16, 8192, 512);
        install_program_image(&h, "mapper", &[0x90; 16]);
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        crate::fakes::write_file(&h, "mfile", &content);

        h.user.register("mapper", |ctx, frame| {
            let path = push_user_str(ctx, frame, "mfile");
            let fd = match sc(ctx, frame, nr::OPEN, &[path]) {
                Ok(v) => v,
                Err(c) => return c,
            };
            // First mapping of the process gets id 1.
            let map = match sc(ctx, frame, nr::MMAP, &[fd, 0x1000_0000]) {
                Ok(1) => 1u32,
                Ok(_) => return 1,
                Err(c) => return c,
            };
            // Unaligned, null, and overlapping requests all fail.
            if sc(ctx, frame, nr::MMAP, &[fd, 0x1000_0100]) != Ok(-1i32 as u32) {
                return 2;
            }
            if sc(ctx, frame, nr::MMAP, &[fd, 0]) != Ok(-1i32 as u32) {
                return 3;
            }
            if sc(ctx, frame, nr::MMAP, &[fd, 0x1000_1000]) != Ok(-1i32 as u32) {
                return 4;
            }

            // Store through the mapping, then unmap to flush.
            let patch = [0xddu8; 4];
            if ctx
                .kernel
                .copy_out_bytes(
                    &ctx.proc.memory,
                    crate::addr::UVAddr::from(0x1000_0000usize + 4500),
                    &patch,
                    frame.esp as usize,
                )
                .is_err()
            {
                return 5;
            }
            if sc(ctx, frame, nr::MUNMAP, &[map]).is_err() {
                return 6;
            }
            if sc(ctx, frame, nr::CLOSE, &[fd]).is_err() {
                return 7;
            }
            0
        });
        assert_eq!(exec_wait(&h, "mapper"), 0);
        h.threads.join_all();

        let after = crate::fakes::read_file(&h, "mfile");
        assert_eq!(after.len(), 5000);
        assert_eq!(&after[4500..4504], &[0xdd; 4]);
        assert_eq!(after[..4500], content[..4500]);
        assert_eq!(after[4504..], content[4504..]);
    }

    #[test]
    fn directory_syscalls() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "dirs", &[0x90; 16]);
        h.user.register("dirs", |ctx, frame| {
            let d = push_user_str(ctx, frame, "sub");
            let f = push_user_str(ctx, frame, "sub/f");
            let rel = push_user_str(ctx, frame, "f");
            let name = push_user_bytes(ctx, frame, &[0u8; 16]);
            if sc(ctx, frame, nr::MKDIR, &[d]) != Ok(1) {
                return 1;
            }
            if sc(ctx, frame, nr::CREATE, &[f, 10]) != Ok(1) {
                return 2;
            }
            let dfd = match sc(ctx, frame, nr::OPEN, &[d]) {
                Ok(v) => v,
                Err(c) => return c,
            };
            if sc(ctx, frame, nr::ISDIR, &[dfd]) != Ok(1) {
                return 3;
            }
            // The one real entry comes back through readdir, then EOF.
            if sc(ctx, frame, nr::READDIR, &[dfd, name]) != Ok(1) {
                return 4;
            }
            if crate::fakes::peek_str(ctx, frame, name) != "f" {
                return 5;
            }
            if sc(ctx, frame, nr::READDIR, &[dfd, name]) != Ok(0) {
                return 6;
            }
            // chdir into the subdirectory and open by relative path.
            if sc(ctx, frame, nr::CHDIR, &[d]) != Ok(1) {
                return 7;
            }
            let ffd = match sc(ctx, frame, nr::OPEN, &[rel]) {
                Ok(v) => v,
                Err(c) => return c,
            };
            if sc(ctx, frame, nr::ISDIR, &[ffd]) != Ok(0) {
                return 8;
            }
            if sc(ctx, frame, nr::INUMBER, &[ffd]) == Ok(-1i32 as u32) {
                return 9;
            }
            0
        });
        assert_eq!(exec_wait(&h, "dirs"), 0);
        h.threads.join_all();
    }

    #[test]
    fn halt_powers_the_machine_off() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "off", &[0x90; 16]);
        h.user.register("off", |ctx, frame| match sc(ctx, frame, nr::HALT, &[]) {
            Err(code) => code,
            Ok(_) => 1,
        });
        let _ = exec_wait(&h, "off");
        h.threads.join_all();
        assert!(h.machine.is_off());
    }

    #[test]
    fn console_write_and_read() {
        let h = harness(16, 8192, 256);
        install_program_image(&h, "cons", &[0x90; 16]);
        h.console.queue_input("hi");
        h.user.register("cons", |ctx, frame| {
            let msg = push_user_bytes(ctx, frame, b"hello, console");
            if sc(ctx, frame, nr::WRITE, &[1, msg, 14]) != Ok(14) {
                return 1;
            }
            let buf = push_user_bytes(ctx, frame, &[0u8; 4]);
            if sc(ctx, frame, nr::READ, &[0, buf, 4]) != Ok(2) {
                return 2;
            }
            if crate::fakes::peek_u32(ctx, frame, buf) & 0xffff != u16::from_le_bytes(*b"hi") as u32
            {
                return 3;
            }
            0
        });
        assert_eq!(exec_wait(&h, "cons"), 0);
        h.threads.join_all();
        assert!(h.console.output().contains("hello, console"));
    }
}
