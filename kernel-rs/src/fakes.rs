//! Test doubles for everything below the hardware line, plus a small
//! harness that wires a whole kernel together over in-memory devices.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use zerocopy::AsBytes;

use crate::addr::UVAddr;
use crate::bdev::BlockDevice;
use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, EM_386, ET_EXEC, EV_CURRENT, PT_LOAD};
use crate::file::File;
use crate::hal::{ConsoleWrite, Hal, Machine, ThreadSpawner, UserMode};
use crate::kernel::Kernel;
use crate::lock::SpinLock;
use crate::param::SECTOR_SIZE;
use crate::proc::KernelCtx;
use crate::x86::{TrapFrame, PGSIZE};

/// An in-memory block device that counts its traffic.
pub struct MemDisk {
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new(nsectors: u32) -> Self {
        Self {
            sectors: SpinLock::new("memdisk", vec![[0; SECTOR_SIZE]; nsectors as usize]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDisk {
    fn nsectors(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let _ = self.reads.fetch_add(1, Ordering::SeqCst);
        buf.copy_from_slice(&self.sectors.lock()[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        self.sectors.lock()[sector as usize].copy_from_slice(buf);
    }
}

/// A console that captures output and replays queued input.
pub struct TestConsole {
    out: SpinLock<Vec<u8>>,
    input: SpinLock<VecDeque<u8>>,
}

impl TestConsole {
    pub fn new() -> Self {
        Self {
            out: SpinLock::new("console-out", Vec::new()),
            input: SpinLock::new("console-in", VecDeque::new()),
        }
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.out.lock()).into_owned()
    }

    pub fn queue_input(&self, s: &str) {
        self.input.lock().extend(s.bytes());
    }
}

struct ConsoleHandle(Arc<TestConsole>);

impl ConsoleWrite for ConsoleHandle {
    fn putc(&self, c: u8) {
        self.0.out.lock().push(c);
    }

    fn getc(&self) -> Option<u8> {
        self.0.input.lock().pop_front()
    }
}

/// Spawns host threads and remembers them so tests can join.
pub struct ThreadTracker {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadTracker {
    fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Joins every thread spawned so far. Call before asserting on
    /// resource counts, so teardown has finished.
    pub fn join_all(&self) {
        loop {
            let handle = self.handles.lock().unwrap().pop();
            match handle {
                Some(h) => h.join().expect("child thread panicked"),
                None => break,
            }
        }
    }
}

struct SpawnerHandle(Arc<ThreadTracker>);

impl ThreadSpawner for SpawnerHandle {
    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send>) {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("spawn");
        self.0.handles.lock().unwrap().push(handle);
    }
}

/// A user program: runs with the process's kernel context and trap frame,
/// returns the exit status.
pub type Program = Arc<dyn Fn(&mut KernelCtx<'_>, &mut TrapFrame) -> i32 + Send + Sync>;

/// Simulated ring 3: looks the process's program up by executable name and
/// runs it. A name with no registered program exits with -1, standing in
/// for an image whose code we do not interpret.
pub struct SimUser {
    programs: SpinLock<BTreeMap<String, Program>>,
}

impl SimUser {
    fn new() -> Self {
        Self {
            programs: SpinLock::new("programs", BTreeMap::new()),
        }
    }

    pub fn register(
        &self,
        name: &str,
        f: impl Fn(&mut KernelCtx<'_>, &mut TrapFrame) -> i32 + Send + Sync + 'static,
    ) {
        let program: Program = Arc::new(f);
        let _ = self.programs.lock().insert(name.to_string(), program);
    }
}

struct UserHandle(Arc<SimUser>);

impl UserMode for UserHandle {
    fn run(&self, ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame) -> i32 {
        let program = self.0.programs.lock().get(&ctx.proc.name).cloned();
        match program {
            Some(p) => p(ctx, frame),
            None => -1,
        }
    }
}

pub struct TestMachine {
    off: AtomicBool,
}

impl TestMachine {
    pub fn is_off(&self) -> bool {
        self.off.load(Ordering::SeqCst)
    }
}

impl Machine for TestMachine {
    fn power_off(&self) {
        self.off.store(true, Ordering::SeqCst);
    }
}

/// Everything a test needs: the kernel plus handles on all its fakes.
pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub console: Arc<TestConsole>,
    pub disk: Arc<MemDisk>,
    pub swap: Arc<MemDisk>,
    pub user: Arc<SimUser>,
    pub threads: Arc<ThreadTracker>,
    pub machine: Arc<TestMachine>,
}

/// A formatted kernel over fresh in-memory devices.
pub fn harness(nframes: usize, fs_sectors: u32, swap_sectors: u32) -> Harness {
    let console = Arc::new(TestConsole::new());
    let disk = Arc::new(MemDisk::new(fs_sectors));
    let swap = Arc::new(MemDisk::new(swap_sectors));
    let user = Arc::new(SimUser::new());
    let threads = Arc::new(ThreadTracker::new());
    let machine = Arc::new(TestMachine {
        off: AtomicBool::new(false),
    });

    let hal = Hal::new(
        Box::new(ConsoleHandle(Arc::clone(&console))),
        Box::new(SpawnerHandle(Arc::clone(&threads))),
        Box::new(UserHandle(Arc::clone(&user))),
        Box::new(MachineHandle(Arc::clone(&machine))),
    );
    let kernel = Kernel::new(
        hal,
        Arc::clone(&disk) as Arc<dyn BlockDevice>,
        Arc::clone(&swap) as Arc<dyn BlockDevice>,
        nframes,
    );
    kernel.format_fs();
    Harness {
        kernel,
        console,
        disk,
        swap,
        user,
        threads,
        machine,
    }
}

struct MachineHandle(Arc<TestMachine>);

impl Machine for MachineHandle {
    fn power_off(&self) {
        self.0.power_off();
    }
}

/// Launches `cmdline` and waits for the process to finish, returning its
/// exit status (or -1 if the load failed).
pub fn exec_wait(h: &Harness, cmdline: &str) -> i32 {
    let pcb = h.kernel.launch(cmdline);
    let tid = pcb.info.lock().tid;
    if tid < 0 {
        return -1;
    }
    pcb.wait_sema.down();
    pcb.exit_code()
}

/// Writes a file into the filesystem from kernel context.
pub fn write_file(h: &Harness, path: &str, bytes: &[u8]) {
    let kernel = &h.kernel;
    let _guard = kernel.fs().lock.lock();
    let root = kernel.fs().root(kernel.bcache());
    assert!(kernel.fs().create(kernel.bcache(), &root, path.as_bytes(), 0, false));
    let mut f = File::new(
        kernel
            .fs()
            .open(kernel.bcache(), &root, path.as_bytes())
            .unwrap(),
    );
    assert_eq!(f.write(kernel.bcache(), kernel.fs(), bytes), bytes.len());
    f.close(kernel.bcache(), kernel.fs());
    kernel
        .fs()
        .itable
        .close(kernel.bcache(), &kernel.fs().freemap, root);
}

/// Reads a whole file back from kernel context.
pub fn read_file(h: &Harness, path: &str) -> Vec<u8> {
    let kernel = &h.kernel;
    let _guard = kernel.fs().lock.lock();
    let root = kernel.fs().root(kernel.bcache());
    let mut f = File::new(
        kernel
            .fs()
            .open(kernel.bcache(), &root, path.as_bytes())
            .unwrap(),
    );
    let mut out = vec![0u8; f.len() as usize];
    assert_eq!(f.read(kernel.bcache(), &mut out), out.len());
    f.close(kernel.bcache(), kernel.fs());
    kernel
        .fs()
        .itable
        .close(kernel.bcache(), &kernel.fs().freemap, root);
    out
}

/// Builds a minimal valid ELF32 executable: one PT_LOAD segment of `code`
/// at `vaddr`, entry at `vaddr`.
pub fn build_elf(code: &[u8], vaddr: u32) -> Vec<u8> {
    let mut ehdr = ElfHdr::default();
    ehdr.magic = ELF_MAGIC;
    ehdr.typ = ET_EXEC;
    ehdr.machine = EM_386;
    ehdr.version = EV_CURRENT;
    ehdr.entry = vaddr;
    ehdr.phoff = core::mem::size_of::<ElfHdr>() as u32;
    ehdr.phentsize = core::mem::size_of::<ProgHdr>() as u16;
    ehdr.phnum = 1;

    let mut ph = ProgHdr::default();
    ph.typ = PT_LOAD;
    ph.off = PGSIZE as u32;
    ph.vaddr = vaddr;
    ph.filesz = code.len() as u32;
    ph.memsz = code.len() as u32;
    ph.flags = crate::elf::PF_W;
    ph.align = PGSIZE as u32;

    let mut out = Vec::new();
    out.extend_from_slice(ehdr.as_bytes());
    out.extend_from_slice(ph.as_bytes());
    out.resize(PGSIZE, 0);
    out.extend_from_slice(code);
    out
}

/// Registers `name` in the filesystem as a runnable executable image.
pub fn install_program_image(h: &Harness, name: &str, code: &[u8]) {
    write_file(h, name, &build_elf(code, 0x0804_8000));
}

/// Issues a syscall the way user code would: number and arguments pushed
/// on the user stack, result in eax. Err(status) means the kernel killed
/// the process; the program must return that status immediately.
pub fn sc(
    ctx: &mut KernelCtx<'_>,
    frame: &mut TrapFrame,
    nr: u32,
    args: &[u32],
) -> Result<u32, i32> {
    let saved_esp = frame.esp;
    let mut words = vec![nr];
    words.extend_from_slice(args);
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    frame.esp -= bytes.len() as u32;
    let esp = frame.esp;
    ctx.kernel
        .copy_out_bytes(
            &ctx.proc.memory,
            UVAddr::from(esp as usize),
            &bytes,
            esp as usize,
        )
        .map_err(|()| -1)?;
    let kernel = Arc::clone(ctx.kernel);
    let result = kernel.syscall(ctx, frame);
    frame.esp = saved_esp;
    match result {
        Some(status) => Err(status),
        None => Ok(frame.eax),
    }
}

/// Pushes bytes onto the simulated user stack, returning their address.
pub fn push_user_bytes(ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame, bytes: &[u8]) -> u32 {
    frame.esp -= bytes.len() as u32;
    frame.esp &= !3;
    let addr = frame.esp;
    ctx.kernel
        .copy_out_bytes(
            &ctx.proc.memory,
            UVAddr::from(addr as usize),
            bytes,
            addr as usize,
        )
        .expect("push_user_bytes");
    addr
}

/// Pushes a NUL-terminated string, returning its address.
pub fn push_user_str(ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame, s: &str) -> u32 {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    push_user_bytes(ctx, frame, &bytes)
}

/// Reads a word of user memory.
pub fn peek_u32(ctx: &mut KernelCtx<'_>, frame: &TrapFrame, addr: u32) -> u32 {
    let mut b = [0u8; 4];
    ctx.kernel
        .copy_in_bytes(
            &ctx.proc.memory,
            &mut b,
            UVAddr::from(addr as usize),
            frame.esp as usize,
        )
        .expect("peek_u32");
    u32::from_le_bytes(b)
}

/// Reads a NUL-terminated string out of user memory.
pub fn peek_str(ctx: &mut KernelCtx<'_>, frame: &TrapFrame, addr: u32) -> String {
    let mut buf = [0u8; 256];
    let len = ctx
        .kernel
        .copy_in_str(
            &ctx.proc.memory,
            &mut buf,
            UVAddr::from(addr as usize),
            frame.esp as usize,
        )
        .expect("peek_str");
    String::from_utf8_lossy(&buf[..len - 1]).into_owned()
}

/// Syscall numbers, mirroring the dispatcher's table.
pub mod nr {
    pub const HALT: u32 = 0;
    pub const EXIT: u32 = 1;
    pub const EXEC: u32 = 2;
    pub const WAIT: u32 = 3;
    pub const CREATE: u32 = 4;
    pub const REMOVE: u32 = 5;
    pub const OPEN: u32 = 6;
    pub const FILESIZE: u32 = 7;
    pub const READ: u32 = 8;
    pub const WRITE: u32 = 9;
    pub const SEEK: u32 = 10;
    pub const TELL: u32 = 11;
    pub const CLOSE: u32 = 12;
    pub const MMAP: u32 = 13;
    pub const MUNMAP: u32 = 14;
    pub const CHDIR: u32 = 15;
    pub const MKDIR: u32 = 16;
    pub const READDIR: u32 = 17;
    pub const ISDIR: u32 = 18;
    pub const INUMBER: u32 = 19;
}
