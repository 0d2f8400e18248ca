//! Processes.
//!
//! A `Pcb` is the parent-visible handle on a child: the load and wait
//! rendezvous semaphores plus the tid / exit-status protocol fields. It is
//! shared as an `Arc` with exactly two strong owners, the parent's child
//! list and the child thread itself, so whichever side lets go last frees
//! it; there is no orphan bookkeeping.
//!
//! A `Proc` is the private state of a running process: address space, file
//! descriptor table, memory mappings, working directory, and the open
//! executable. It is owned by the kernel thread running the process and
//! never shared; only the address space inside it (`Arc<SpinLock<UserMemory>>`)
//! is reachable from elsewhere, by the frame table.


use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::File;
use crate::fs::Inode;
use crate::kernel::Kernel;
use crate::lock::{Semaphore, SpinLock};
use crate::param::{FD_BASE, NOFILE};
use crate::vm::UserMemory;
use crate::x86::{TrapFrame, PGSIZE};

/// Protocol state shared between parent and child.
pub struct PcbInfo {
    /// Child tid once load succeeded, -1 after a failed load.
    pub tid: i32,

    pub exit_code: i32,

    /// The parent has already waited; a second wait returns -1.
    pub waited: bool,

    pub exited: bool,
}

/// Process control block.
pub struct Pcb {
    cmdline: String,

    /// Parent downs once; child ups once after publishing its load result.
    pub load_sema: Semaphore,

    /// Child ups once at exit; parent downs at most once.
    pub wait_sema: Semaphore,

    pub info: SpinLock<PcbInfo>,
}

impl Pcb {
    pub fn new(cmdline: &str) -> Self {
        Self {
            cmdline: cmdline.to_string(),
            load_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            info: SpinLock::new(
                "pcb",
                PcbInfo {
                    tid: -1,
                    exit_code: -1,
                    waited: false,
                    exited: false,
                },
            ),
        }
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// The child's exit status, for a caller that has already rendezvoused.
    pub fn exit_code(&self) -> i32 {
        self.info.lock().exit_code
    }
}

/// An open descriptor: a plain file, or a directory (which additionally
/// serves readdir through its cursor).
pub enum FdEntry {
    File(File),
    Dir(File),
}

impl FdEntry {
    pub fn file(&self) -> &File {
        match self {
            FdEntry::File(f) | FdEntry::Dir(f) => f,
        }
    }

    pub fn file_mut(&mut self) -> &mut File {
        match self {
            FdEntry::File(f) | FdEntry::Dir(f) => f,
        }
    }

    pub fn into_file(self) -> File {
        match self {
            FdEntry::File(f) | FdEntry::Dir(f) => f,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FdEntry::Dir(_))
    }
}

/// A memory-mapped file: a private reopen of the descriptor plus the user
/// range it covers.
pub struct MmapDesc {
    pub file: File,
    pub addr: usize,
    pub len: u32,
}

/// Per-process state, owned by the thread running the process.
pub struct Proc {
    pub tid: i32,

    /// Executable name, printed in the exit line.
    pub name: String,

    pub memory: Arc<SpinLock<UserMemory>>,

    pub cwd: Option<Arc<Inode>>,

    pub files: BTreeMap<i32, FdEntry>,

    pub mmaps: BTreeMap<i32, MmapDesc>,
    next_mapid: i32,

    /// The running image, held open deny-write until exit.
    pub executable: Option<File>,

    pub children: Vec<Arc<Pcb>>,

    pcb: Arc<Pcb>,
}

impl Proc {
    fn new(tid: i32, name: String, cwd: Arc<Inode>, pcb: Arc<Pcb>) -> Self {
        Self {
            tid,
            name,
            memory: UserMemory::new(),
            cwd: Some(cwd),
            files: BTreeMap::new(),
            mmaps: BTreeMap::new(),
            next_mapid: 1,
            executable: None,
            children: Vec::new(),
            pcb,
        }
    }

    /// Installs an entry under the lowest free descriptor id (0, 1, and 2
    /// stay reserved). Hands the entry back when the table is full so the
    /// caller can close it properly.
    pub fn fd_install(&mut self, entry: FdEntry) -> Result<i32, FdEntry> {
        if self.files.len() >= NOFILE {
            return Err(entry);
        }
        let mut fd = FD_BASE;
        while self.files.contains_key(&fd) {
            fd += 1;
        }
        let _ = self.files.insert(fd, entry);
        Ok(fd)
    }

    /// Looks up a descriptor, optionally constrained to files or
    /// directories.
    pub fn fd_get(&mut self, fd: i32, filter: FdFilter) -> Option<&mut FdEntry> {
        let entry = self.files.get_mut(&fd)?;
        match filter {
            FdFilter::Any => Some(entry),
            FdFilter::FileOnly if !entry.is_dir() => Some(entry),
            FdFilter::DirOnly if entry.is_dir() => Some(entry),
            _ => None,
        }
    }

    pub fn fd_take(&mut self, fd: i32) -> Option<FdEntry> {
        self.files.remove(&fd)
    }

    pub fn next_mapid(&mut self) -> i32 {
        let id = self.next_mapid;
        self.next_mapid += 1;
        id
    }
}

#[derive(Clone, Copy)]
pub enum FdFilter {
    Any,
    FileOnly,
    DirOnly,
}

/// What a running process hands to the syscall layer: the kernel and its
/// own (exclusively owned) process state.
pub struct KernelCtx<'a> {
    pub kernel: &'a Arc<Kernel>,
    pub proc: &'a mut Proc,
}

impl Kernel {
    /// Starts a child process running `cmdline` and blocks until the child
    /// has published its load result. The returned PCB's `tid` is the
    /// child's tid, or -1 if the load failed.
    pub fn launch(self: &Arc<Self>, cmdline: &str) -> Arc<Pcb> {
        let pcb = Arc::new(Pcb::new(cmdline));
        let name = cmdline
            .split_ascii_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        let kernel = Arc::clone(self);
        let child = Arc::clone(&pcb);
        self.hal()
            .spawner()
            .spawn(&name, Box::new(move || start_process(kernel, child)));
        pcb.load_sema.down();
        pcb
    }

    /// The exec syscall: launch, then link the child into the caller's
    /// child list so it can be waited for.
    pub fn exec(self: &Arc<Self>, proc: &mut Proc, cmdline: &str) -> i32 {
        let pcb = self.launch(cmdline);
        let tid = pcb.info.lock().tid;
        if tid >= 0 {
            proc.children.push(pcb);
        }
        tid
    }

    /// The wait syscall. Returns the child's exit status exactly once;
    /// unknown tids, non-children, and second waits return -1 without
    /// blocking.
    pub fn wait(&self, proc: &mut Proc, tid: i32) -> i32 {
        let idx = match proc
            .children
            .iter()
            .position(|p| p.info.lock().tid == tid)
        {
            Some(i) => i,
            None => return -1,
        };
        let pcb = &proc.children[idx];
        let must_block = {
            let mut info = pcb.info.lock();
            if info.waited {
                return -1;
            }
            info.waited = true;
            !info.exited
        };
        if must_block {
            pcb.wait_sema.down();
        }
        let code = pcb.info.lock().exit_code;
        let _ = proc.children.remove(idx);
        code
    }

    /// Process teardown. Releases every resource the process holds, then
    /// publishes the exit status and signals the waiting parent.
    pub fn exit_process(&self, mut proc: Proc, code: i32) {
        // Open descriptors (and their directory handles) go first.
        {
            let _guard = self.fs().lock.lock();
            while let Some((_, entry)) = proc.files.pop_first() {
                entry.into_file().close(self.bcache(), self.fs());
            }
        }

        // Flush memory-mapped files back as munmap would.
        while let Some((_, desc)) = proc.mmaps.pop_first() {
            let _guard = self.fs().lock.lock();
            self.munmap_desc(&proc.memory, desc);
        }

        // Children: dropping the parent's strong reference is all that is
        // needed; a still-running child frees the PCB when it exits.
        proc.children.clear();

        // Re-allow writes on the executable and close it.
        if let Some(exe) = proc.executable.take() {
            let _guard = self.fs().lock.lock();
            exe.close(self.bcache(), self.fs());
        }

        if let Some(cwd) = proc.cwd.take() {
            let _guard = self.fs().lock.lock();
            self.fs()
                .itable
                .close(self.bcache(), &self.fs().freemap, cwd);
        }

        self.hal()
            .console()
            .write_fmt(format_args!("{}: exit({})\n", proc.name, code));

        {
            let mut info = proc.pcb.info.lock();
            info.exit_code = code;
            info.exited = true;
        }
        proc.pcb.wait_sema.up();

        // Supplemental table first, then the page directory. A port must
        // clear the thread's page-directory register before the destroy, so
        // a preemption cannot switch back into a freed table.
        self.vm_destroy(&proc.memory);
    }

    /// Unmaps every page of `desc`, writing modified pages back to the
    /// file, and closes the private handle.
    pub(crate) fn munmap_desc(&self, mem: &Arc<SpinLock<UserMemory>>, desc: MmapDesc) {
        let mut off = 0u32;
        while off < desc.len {
            let bytes = core::cmp::min(PGSIZE as u32, desc.len - off);
            self.vm_unmap_page(
                mem,
                crate::addr::UVAddr::from(desc.addr + off as usize),
                Some((&desc.file, off, bytes)),
            );
            off += PGSIZE as u32;
        }
        desc.file.close(self.bcache(), self.fs());
    }
}

/// Entry function of a child kernel thread: build the process, load the
/// executable, publish the outcome, drop to user mode, and tear down with
/// whatever status user code exits with.
fn start_process(kernel: Arc<Kernel>, pcb: Arc<Pcb>) {
    let tid = kernel.alloc_tid();
    let name = pcb
        .cmdline()
        .split_ascii_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    let cwd = {
        let _guard = kernel.fs().lock.lock();
        kernel.fs().root(kernel.bcache())
    };
    let mut proc = Proc::new(tid, name, cwd, Arc::clone(&pcb));

    let mut frame = TrapFrame::default();
    let cmdline = pcb.cmdline().to_string();
    let ok = kernel.load(&mut proc, &cmdline, &mut frame).is_ok();

    {
        let mut info = pcb.info.lock();
        info.tid = if ok { tid } else { -1 };
    }
    pcb.load_sema.up();

    if !ok {
        kernel.exit_process(proc, -1);
        return;
    }

    let code = {
        let mut ctx = KernelCtx {
            kernel: &kernel,
            proc: &mut proc,
        };
        kernel.hal().user().run(&mut ctx, &mut frame)
    };
    kernel.exit_process(proc, code);
}

#[cfg(test)]
mod tests {
    use crate::fakes::{exec_wait, harness, install_program_image, nr, push_user_str, sc};
    use crate::x86::PGSIZE;

    #[test]
    fn exec_returns_minus_one_for_missing_or_bogus_binaries() {
        let h = harness(16, 4096, 256);
        assert_eq!(exec_wait(&h, "nosuch"), -1);

        // A present file that is not a valid ELF image fails to load too.
        crate::fakes::write_file(&h, "garbage", b"not an executable");
        assert_eq!(exec_wait(&h, "garbage"), -1);
        h.threads.join_all();
    }

    #[test]
    fn exit_status_flows_back_through_wait() {
        let h = harness(16, 4096, 256);
        install_program_image(&h, "child", &[0x90; 16]);
        h.user.register("child", |_ctx, _frame| 42);
        assert_eq!(exec_wait(&h, "child"), 42);
        h.threads.join_all();
        assert!(h.console.output().contains("child: exit(42)\n"));
    }

    #[test]
    fn parent_child_rendezvous_and_double_wait() {
        let h = harness(32, 8192, 512);
        install_program_image(&h, "child", &[0x90; 16]);
        install_program_image(&h, "parent", &[0x90; 16]);
        h.user.register("child", |_ctx, _frame| 7);
        h.user.register("parent", |ctx, frame| {
            let path = push_user_str(ctx, frame, "child");
            let tid = match sc(ctx, frame, nr::EXEC, &[path]) {
                Ok(v) => v as i32,
                Err(c) => return c,
            };
            if tid < 0 {
                return 100;
            }
            let first = sc(ctx, frame, nr::WAIT, &[tid as u32]).unwrap_or(0) as i32;
            // Waiting twice for the same child fails.
            let second = sc(ctx, frame, nr::WAIT, &[tid as u32]).unwrap_or(0) as i32;
            // So does waiting for something that is not our child.
            let bogus = sc(ctx, frame, nr::WAIT, &[9999]).unwrap_or(0) as i32;
            if first == 7 && second == -1 && bogus == -1 {
                0
            } else {
                101
            }
        });
        assert_eq!(exec_wait(&h, "parent"), 0);
        h.threads.join_all();
        let out = h.console.output();
        assert!(out.contains("child: exit(7)\n"));
        assert!(out.contains("parent: exit(0)\n"));
    }

    #[test]
    fn exiting_parent_orphans_a_running_child_without_leaks() {
        let h = harness(32, 8192, 512);
        install_program_image(&h, "sleeper", &[0x90; 16]);
        install_program_image(&h, "quitter", &[0x90; 16]);
        h.user.register("sleeper", |_ctx, _frame| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            3
        });
        // The parent execs a child and exits without waiting.
        h.user.register("quitter", |ctx, frame| {
            let path = push_user_str(ctx, frame, "sleeper");
            match sc(ctx, frame, nr::EXEC, &[path]) {
                Ok(tid) if (tid as i32) >= 0 => 0,
                _ => 1,
            }
        });
        assert_eq!(exec_wait(&h, "quitter"), 0);
        h.threads.join_all();
        // The orphan still ran to completion and printed its exit line.
        assert!(h.console.output().contains("sleeper: exit(3)\n"));
    }

    #[test]
    fn process_teardown_releases_frames_and_swap() {
        let h = harness(8, 8192, 1024);
        install_program_image(&h, "pig", &[0x90; 16]);
        h.user.register("pig", |ctx, frame| {
            // Push well past the frame pool so eviction and swap engage.
            for i in 0..32 {
                let page = vec![i as u8; PGSIZE];
                let _ = crate::fakes::push_user_bytes(ctx, frame, &page);
            }
            0
        });
        assert_eq!(exec_wait(&h, "pig"), 0);
        h.threads.join_all();
        assert_eq!(h.kernel.kmem().lock().nfree(), 8);
        assert_eq!(h.kernel.frames().len(), 0);
        assert_eq!(h.kernel.swap().free_slots(), h.kernel.swap().nslots());
    }

    #[test]
    fn many_processes_share_a_small_frame_pool() {
        let h = harness(64, 65_536, 8192);
        install_program_image(&h, "toucher", &[0x90; 16]);
        h.user.register("toucher", |ctx, frame| {
            // Touch 16 pages in sequence, then read them back.
            let tid = ctx.proc.tid as u8;
            for i in 0..16 {
                let page = vec![tid ^ i as u8; PGSIZE];
                let _ = crate::fakes::push_user_bytes(ctx, frame, &page);
            }
            let mut ok = true;
            for i in 0..16u32 {
                let addr = frame.esp + i * PGSIZE as u32;
                let word = crate::fakes::peek_u32(ctx, frame, addr);
                let want = u32::from_le_bytes([tid ^ (15 - i as u8); 4]);
                ok &= word == want;
            }
            if ok {
                0
            } else {
                1
            }
        });

        let pcbs: Vec<_> = (0..32).map(|_| h.kernel.launch("toucher")).collect();
        for pcb in &pcbs {
            assert!(pcb.info.lock().tid >= 0);
            pcb.wait_sema.down();
            assert_eq!(pcb.exit_code(), 0);
        }
        h.threads.join_all();
        assert_eq!(h.kernel.frames().len(), 0);
        assert_eq!(h.kernel.swap().free_slots(), h.kernel.swap().nslots());
    }
}
