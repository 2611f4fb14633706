//! One-shot completion signal set from the real-time callback
//!
//! The callback side is a single atomic store. The waiting side polls
//! cooperatively with a bound; it never blocks the real-time thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Poll period of [`FirstBufferSignal::wait`]
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct FirstBufferSignal {
    fired: AtomicBool,
}

impl FirstBufferSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the signal. Returns true only for the call that fired it.
    #[inline]
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Re-arm for a new session. Only call while no callback is running.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }

    /// Wait until fired or until `timeout` elapses. Returns whether it fired.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_fired() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return self.is_fired();
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_fires_once() {
        let signal = FirstBufferSignal::new();
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
        signal.reset();
        assert!(!signal.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_shortly_after_fire() {
        let signal = Arc::new(FirstBufferSignal::new());
        let firing = signal.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            firing.fire();
        });

        assert!(signal.wait(Duration::from_secs(2)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "resolved early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(250), "resolved late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let signal = FirstBufferSignal::new();
        let started = Instant::now();
        assert!(!signal.wait(Duration::from_millis(300)).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
