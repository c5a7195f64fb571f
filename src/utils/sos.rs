use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process-wide stop request, shared by clones
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    shared: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop::default()
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // lock briefly so a waiter cannot miss the notification
        let _guard = self.shared.mutex.lock();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.mutex.lock();
        while !self.cancelled() {
            self.shared.condvar.wait(&mut guard);
        }
    }

    /// Wait at most `timeout`; returns whether the stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.shared.mutex.lock();
        if !self.cancelled() {
            let _ = self
                .shared
                .condvar
                .wait_while_for(&mut guard, |_| !self.cancelled(), timeout);
        }
        self.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_timeout_expires() {
        let sos = SignalOfStop::new();
        let start = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_releases_waiters() {
        let sos = SignalOfStop::new();
        let waiter = {
            let sos = sos.clone();
            std::thread::spawn(move || sos.wait_cancellation())
        };
        std::thread::sleep(Duration::from_millis(10));
        sos.cancel();
        waiter.join().unwrap();
        assert!(sos.cancelled());
        assert!(sos.wait_timeout(Duration::from_secs(1)));
    }
}
