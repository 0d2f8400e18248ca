//! Counting semaphores.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::relax;

/// A counting semaphore with the conventional contract: `down` consumes a
/// permit, waiting until one is available; `up` adds a permit and lets one
/// waiter proceed. A zero-initialized semaphore doubles as a one-shot event
/// (parent/child rendezvous uses exactly that).
pub struct Semaphore {
    value: AtomicUsize,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
        }
    }

    /// Consumes a permit, waiting until one is available.
    pub fn down(&self) {
        loop {
            let ok = self
                .value
                .fetch_update(Ordering::Acquire, Ordering::Relaxed, |v| v.checked_sub(1))
                .is_ok();
            if ok {
                return;
            }
            relax();
        }
    }

    /// Adds a permit, releasing one waiter if any.
    pub fn up(&self) {
        let _ = self.value.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rendezvous() {
        let sema = Arc::new(Semaphore::new(0));
        let done = Arc::new(Semaphore::new(0));
        let s = Arc::clone(&sema);
        let d = Arc::clone(&done);
        let h = thread::spawn(move || {
            s.down();
            d.up();
        });
        sema.up();
        done.down();
        h.join().unwrap();
    }
}
