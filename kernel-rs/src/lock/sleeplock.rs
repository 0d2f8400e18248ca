//! Long-held locks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::Semaphore;

/// A lock that may be held across disk I/O or other lengthy operations.
/// Built on a binary semaphore, so waiters do not monopolize the lock word.
pub struct SleepLock<T> {
    #[allow(dead_code)]
    name: &'static str,
    sem: Semaphore,
    data: UnsafeCell<T>,
}

// SAFETY: mutual exclusion is provided by the binary semaphore.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            sem: Semaphore::new(1),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.sem.down();
        SleepLockGuard { lock: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.sem.up();
    }
}
