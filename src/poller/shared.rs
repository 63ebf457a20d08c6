//! State shared between a poller thread and the threads that feed it.

use crate::transport::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

/// A mutex the poller thread gives way on.
///
/// The poller relocks between passes. Without a hint, a busy poller can win
/// the lock back every time and starve a registering or submitting thread,
/// so outside lockers announce themselves first.
#[derive(Debug, Default)]
pub struct Shared<T> {
    value: Mutex<T>,
    waiters: AtomicUsize,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Locks from outside the poller thread.
    ///
    /// The guard must not be held across a call that waits on the poller.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let guard = lock(&self.value);
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        guard
    }

    /// Locks for one polling pass, yielding first while others wait.
    pub fn lock_for_pass(&self) -> MutexGuard<'_, T> {
        // A waiter stops counting as soon as it holds the lock
        while self.waiters.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
        lock(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_outside_locker_gets_through() {
        let shared = Arc::new(Shared::new(0u64));
        let running = Arc::new(AtomicBool::new(true));

        let poller = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    let guard = shared.lock_for_pass();
                    std::hint::spin_loop();
                    drop(guard);
                }
            })
        };

        let start = Instant::now();
        for _ in 0..1000 {
            *shared.lock() += 1;
        }
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(*shared.lock(), 1000);

        running.store(false, Ordering::Release);
        poller.join().unwrap();
    }
}
