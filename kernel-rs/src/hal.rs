//! Hardware abstraction layer.
//!
//! Everything the core needs from below the kernel line: spawning a kernel
//! thread, dropping into user mode, console bytes, and the power switch.
//! A port supplies hardware implementations; the test harness supplies
//! fakes, which is how the whole core runs hosted.

use alloc::boxed::Box;

use crate::printer::Printer;
use crate::proc::KernelCtx;
use crate::x86::TrapFrame;

/// Console byte I/O (a UART in a real port).
pub trait ConsoleWrite: Send + Sync {
    fn putc(&self, c: u8);

    /// One byte of pending input, if any.
    fn getc(&self) -> Option<u8> {
        None
    }
}

/// Creates kernel threads. The scheduler behind it is preemptive; that is
/// all the core assumes.
pub trait ThreadSpawner: Send + Sync {
    fn spawn(&self, name: &str, f: Box<dyn FnOnce() + Send>);
}

/// The drop to ring 3. `run` returns only when the process is done running
/// user code, yielding the status it exited with; on hardware this is the
/// iret / trap round trip, under test it is a simulated user program
/// issuing syscalls through `ctx`.
pub trait UserMode: Send + Sync {
    fn run(&self, ctx: &mut KernelCtx<'_>, frame: &mut TrapFrame) -> i32;
}

/// Whole-machine operations.
pub trait Machine: Send + Sync {
    fn power_off(&self);
}

pub struct Hal {
    console: Printer,
    spawner: Box<dyn ThreadSpawner>,
    user: Box<dyn UserMode>,
    machine: Box<dyn Machine>,
}

impl Hal {
    pub fn new(
        console: Box<dyn ConsoleWrite>,
        spawner: Box<dyn ThreadSpawner>,
        user: Box<dyn UserMode>,
        machine: Box<dyn Machine>,
    ) -> Self {
        Self {
            console: Printer::new(console),
            spawner,
            user,
            machine,
        }
    }

    pub fn console(&self) -> &Printer {
        &self.console
    }

    pub fn spawner(&self) -> &dyn ThreadSpawner {
        &*self.spawner
    }

    pub fn user(&self) -> &dyn UserMode {
        &*self.user
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }
}
