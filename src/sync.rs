//! Counting semaphore used for the cycle hand-off.
//!
//! The permit count lives in an atomic so [`Semaphore::try_acquire`] never
//! blocks; the mutex/condvar pair is only touched by threads that actually
//! have to sleep.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

pub(crate) struct Semaphore {
    permits: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: AtomicUsize::new(permits),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Take a permit if one is available. Lock-free.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        while current > 0 {
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Block until a permit is available.
    pub(crate) fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        let mut guard = self.lock.lock();
        while !self.try_acquire() {
            self.cvar.wait(&mut guard);
        }
    }

    pub(crate) fn release(&self) {
        self.release_n(1);
    }

    pub(crate) fn release_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.permits.fetch_add(n, Ordering::AcqRel);
        // taking the lock orders us after any waiter that already checked
        let _guard = self.lock.lock();
        if n == 1 {
            self.cvar.notify_one();
        } else {
            self.cvar.notify_all();
        }
    }

    /// Drop every outstanding permit. Only sound while nobody waits.
    pub(crate) fn reset(&self) {
        self.permits.store(0, Ordering::Release);
    }

    pub(crate) fn try_guard(&self) -> Option<SemaphoreGuard<'_>> {
        if self.try_acquire() {
            Some(SemaphoreGuard { sem: self })
        } else {
            None
        }
    }

    pub(crate) fn guard(&self) -> SemaphoreGuard<'_> {
        self.acquire();
        SemaphoreGuard { sem: self }
    }
}

/// Releases its permit on drop.
pub struct SemaphoreGuard<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_acquire_does_not_block() {
        let sem = Semaphore::new(1);
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.release();
        assert!(sem.try_acquire());
    }

    #[test]
    fn guard_releases_on_drop() {
        let sem = Semaphore::new(1);
        {
            let _g = sem.guard();
            assert!(sem.try_guard().is_none());
        }
        assert!(sem.try_guard().is_some());
    }

    #[test]
    fn reset_drops_stale_permits() {
        let sem = Semaphore::new(0);
        sem.release_n(3);
        sem.reset();
        assert!(!sem.try_acquire());
    }

    #[test]
    fn release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.acquire())
        };
        thread::sleep(Duration::from_millis(10));
        sem.release();
        waiter.join().unwrap();
        assert!(!sem.try_acquire());
    }
}
