// Copyright 2024-Present Crossbar contributors
// SPDX-License-Identifier: Apache-2.0

//! Locking helpers for the blocking-thread model: a counting semaphore
//! with a timed acquire, bounded mutex acquisition, and the idle interval
//! every polling loop in the engine sleeps on.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Granularity of the engine's polling loops.
pub const IDLE_MSEC: u64 = 5;

/// Sleep one idle interval.
pub fn idle() {
    std::thread::sleep(Duration::from_millis(IDLE_MSEC));
}

/// Number of idle intervals covering `ms` milliseconds, rounded up.
pub fn idle_intervals(ms: u64) -> u64 {
    ms.div_ceil(IDLE_MSEC)
}

/// Lock a mutex whose guard may be poisoned by a panicking test thread.
/// The protected state is plain data, so the value is still usable.
pub fn plock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bounded mutex acquisition: `None` timeout waits forever, `Some(0)` is
/// a try-lock. Polls at the idle interval, the same way the engine's
/// other deadline loops do.
pub fn lock_timeout<T>(m: &Mutex<T>, timeout: Option<Duration>) -> Option<MutexGuard<'_, T>> {
    let Some(timeout) = timeout else {
        return Some(plock(m));
    };
    let deadline = Instant::now() + timeout;
    loop {
        match m.try_lock() {
            Ok(guard) => return Some(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => return Some(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                idle();
            }
        }
    }
}

/// Counting semaphore with an upper bound: `unlock` never raises the
/// count past `max`.
pub struct Semaphore {
    max: u32,
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(max: u32, initial: u32) -> Self {
        let max = max.max(1);
        Semaphore {
            max,
            count: Mutex::new(initial.min(max)),
            cond: Condvar::new(),
        }
    }

    /// Acquire one unit. `None` waits forever, `Some(Duration::ZERO)` is
    /// a try-acquire. Returns whether the unit was obtained.
    pub fn lock(&self, timeout: Option<Duration>) -> bool {
        let mut count = plock(&self.count);
        match timeout {
            None => {
                while *count == 0 {
                    count = self
                        .cond
                        .wait(count)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *count == 0 {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(count, left)
                        .unwrap_or_else(|e| e.into_inner());
                    count = guard;
                }
            }
        }
        *count -= 1;
        true
    }

    /// Release one unit, saturating at the configured maximum.
    pub fn unlock(&self) {
        let mut count = plock(&self.count);
        if *count < self.max {
            *count += 1;
        }
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_counts_and_saturates() {
        let s = Semaphore::new(2, 2);
        assert!(s.lock(Some(Duration::ZERO)));
        assert!(s.lock(Some(Duration::ZERO)));
        assert!(!s.lock(Some(Duration::from_millis(20))));
        s.unlock();
        s.unlock();
        s.unlock(); // capped at max
        assert!(s.lock(Some(Duration::ZERO)));
        assert!(s.lock(Some(Duration::ZERO)));
        assert!(!s.lock(Some(Duration::ZERO)));
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let s = Arc::new(Semaphore::new(1, 0));
        let s2 = s.clone();
        let t = std::thread::spawn(move || s2.lock(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        s.unlock();
        assert!(t.join().unwrap());
    }

    #[test]
    fn timed_mutex() {
        let m = Mutex::new(1);
        let g = lock_timeout(&m, Some(Duration::ZERO)).unwrap();
        assert!(lock_timeout(&m, Some(Duration::from_millis(20))).is_none());
        drop(g);
        assert!(lock_timeout(&m, None).is_some());
    }
}
