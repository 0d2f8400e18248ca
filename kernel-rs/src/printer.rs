//! Formatted console output.

use core::fmt;

use alloc::boxed::Box;

use crate::hal::ConsoleWrite;
use crate::lock::SpinLock;

/// Serializes console output so lines from different threads do not
/// interleave. All kernel diagnostics, and the mandatory
/// `"<name>: exit(<code>)"` line, go through here.
pub struct Printer {
    sink: SpinLock<Box<dyn ConsoleWrite>>,
}

struct Writer<'a> {
    sink: &'a dyn ConsoleWrite,
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.bytes() {
            self.sink.putc(c);
        }
        Ok(())
    }
}

impl Printer {
    pub fn new(sink: Box<dyn ConsoleWrite>) -> Self {
        Self {
            sink: SpinLock::new("console", sink),
        }
    }

    pub fn write_fmt(&self, args: fmt::Arguments<'_>) {
        use fmt::Write;
        let sink = self.sink.lock();
        let _ = (Writer { sink: &**sink }).write_fmt(args);
    }

    /// Writes raw bytes (the write syscall on fd 1 and 2).
    pub fn write_bytes(&self, bytes: &[u8]) {
        let sink = self.sink.lock();
        for &c in bytes {
            sink.putc(c);
        }
    }

    /// Reads one byte of console input, if any (the read syscall on fd 0).
    pub fn read_byte(&self) -> Option<u8> {
        self.sink.lock().getc()
    }
}
