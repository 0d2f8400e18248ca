//! Format of an ELF32 executable file.

use zerocopy::{AsBytes, FromBytes};

/// "\x7FELF" in little endian.
pub const ELF_MAGIC: u32 = 0x464c_457f;

/// e_type for an executable.
pub const ET_EXEC: u16 = 2;

/// e_machine for Intel 80386.
pub const EM_386: u16 = 3;

pub const EV_CURRENT: u32 = 1;

/// Values for ProgHdr typ.
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_SHLIB: u32 = 5;

/// Flag bits for ProgHdr flags.
pub const PF_W: u32 = 2;

/// File header. Appears at the very beginning of an ELF binary.
#[derive(Default, Clone)]
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct ElfHdr {
    /// Must equal ELF_MAGIC.
    pub magic: u32,
    pub elf: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program segment header. There are phnum of these, starting at file
/// offset phoff.
#[derive(Default, Clone)]
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct ProgHdr {
    pub typ: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

impl ElfHdr {
    /// The fixed acceptance test: 32-bit executable for the 386, current
    /// version, program headers of the expected size and a sane count.
    pub fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
            && self.typ == ET_EXEC
            && self.machine == EM_386
            && self.version == EV_CURRENT
            && self.phentsize as usize == core::mem::size_of::<ProgHdr>()
            && self.phnum <= 1024
    }
}

impl ProgHdr {
    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }
}
