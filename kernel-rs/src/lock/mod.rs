//! Synchronization primitives.
//!
//! The scheduler itself lives outside this crate; these primitives only
//! assume preemptive kernel threads. `relax()` is the single point where a
//! waiting thread gives the rest of the system a chance to run.

mod semaphore;
mod sleeplock;
mod spinlock;

pub use semaphore::Semaphore;
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};

cfg_if::cfg_if! {
    if #[cfg(test)] {
        /// Under the host test harness there may be more runnable threads
        /// than cores, so a busy-waiter must yield to make progress.
        pub(crate) fn relax() {
            std::thread::yield_now();
        }
    } else {
        pub(crate) fn relax() {
            core::hint::spin_loop();
        }
    }
}
