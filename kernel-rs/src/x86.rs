//! x86 (IA-32) definitions: paging geometry, page-table entry bits, and the
//! interrupt frame layout user threads trap in with.

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Sectors per page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / crate::param::SECTOR_SIZE;

/// First kernel virtual address. User virtual addresses lie below it.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Lowest address the user stack may grow down to.
pub const STACK_LIMIT: usize = PHYS_BASE - 0x80_0000;

/// A fault this far below the saved user stack pointer still counts as stack
/// growth (PUSHA touches esp - 32).
pub const STACK_HEURISTIC: usize = 32;

/// Page-directory index of a virtual address (top 10 bits).
pub const fn pd_index(va: usize) -> usize {
    (va >> 22) & 0x3ff
}

/// Page-table index of a virtual address (middle 10 bits).
pub const fn pt_index(va: usize) -> usize {
    (va >> 12) & 0x3ff
}

/// Round down to the nearest page boundary.
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Round up to the nearest page boundary.
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    pub struct PteFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// User-accessible.
        const U = 1 << 2;
        /// Accessed since the bit was last cleared.
        const A = 1 << 5;
        /// Written since the bit was last cleared.
        const D = 1 << 6;
    }
}

/// Register state pushed on a trap from user mode. The syscall dispatcher
/// reads its arguments relative to `esp` and stores the result in `eax`.
#[derive(Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
}
