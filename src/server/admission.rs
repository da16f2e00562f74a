use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

/// Counting gate bounding the number of live connections.
///
/// The acceptor takes a slot before accepting; the poller returns it when the
/// channel is cancelled. A limit of `0` disables the gate.
pub(crate) struct Admission {
    limit: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl Admission {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            available: Mutex::new(limit),
            freed: Condvar::new(),
        }
    }

    /// Waits up to `timeout` for a slot. Returns `false` on timeout.
    pub(crate) fn acquire_timeout(&self, timeout: Duration) -> bool {
        if self.limit == 0 {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut available = self.available.lock();
        while *available == 0 {
            if self.freed.wait_until(&mut available, deadline).timed_out() {
                if *available == 0 {
                    return false;
                }
                break;
            }
        }
        *available -= 1;
        true
    }

    pub(crate) fn release(&self) {
        if self.limit == 0 {
            return;
        }
        let mut available = self.available.lock();
        if *available >= self.limit {
            warn!(limit = self.limit, "admission slot released more often than acquired");
            return;
        }
        *available += 1;
        self.freed.notify_one();
    }

    /// Free slots, `None` when unlimited.
    pub(crate) fn available(&self) -> Option<usize> {
        (self.limit != 0).then(|| *self.available.lock())
    }
}

#[cfg(test)]
mod admission_tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn slots_are_bounded() {
        let admission = Admission::new(2);
        assert!(admission.acquire_timeout(Duration::ZERO));
        assert!(admission.acquire_timeout(Duration::ZERO));
        assert!(!admission.acquire_timeout(Duration::from_millis(20)));
        assert_eq!(admission.available(), Some(0));

        admission.release();
        assert_eq!(admission.available(), Some(1));
        assert!(admission.acquire_timeout(Duration::ZERO));
    }

    #[test]
    fn release_wakes_a_waiter() {
        let admission = Arc::new(Admission::new(1));
        assert!(admission.acquire_timeout(Duration::ZERO));

        let waiter = {
            let admission = admission.clone();
            thread::spawn(move || admission.acquire_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        admission.release();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn unlimited_and_over_release() {
        let unlimited = Admission::new(0);
        assert!(unlimited.acquire_timeout(Duration::ZERO));
        assert_eq!(unlimited.available(), None);

        let admission = Admission::new(1);
        admission.release();
        assert_eq!(admission.available(), Some(1));
    }
}
