//! Master timeline clock
//!
//! The single authority for the global position. While running it is an
//! anchor `(instant, position)` and the position is derived from elapsed
//! monotonic time; while stopped it is a held position. Players' own
//! positions are never consulted.

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockState {
    Stopped { position_ms: i64 },
    Running { anchor: Instant, anchor_ms: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct MasterClock {
    state: ClockState,
}

impl Default for MasterClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterClock {
    pub fn new() -> Self {
        Self {
            state: ClockState::Stopped { position_ms: 0 },
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ClockState::Running { .. })
    }

    /// Current global position
    pub fn position_ms(&self) -> i64 {
        match self.state {
            ClockState::Stopped { position_ms } => position_ms,
            ClockState::Running { anchor, anchor_ms } => {
                anchor_ms + anchor.elapsed().as_millis() as i64
            }
        }
    }

    /// Anchor the clock at `position_ms` as of now and let it run
    pub fn start_at(&mut self, position_ms: i64) -> Instant {
        let anchor = Instant::now();
        self.state = ClockState::Running {
            anchor,
            anchor_ms: position_ms,
        };
        anchor
    }

    /// Freeze at the current position, returning it
    pub fn stop(&mut self) -> i64 {
        let position_ms = self.position_ms();
        self.state = ClockState::Stopped { position_ms };
        position_ms
    }

    /// Move to `position_ms`, keeping the running/stopped state
    pub fn set_position(&mut self, position_ms: i64) {
        match self.state {
            ClockState::Stopped { .. } => self.state = ClockState::Stopped { position_ms },
            ClockState::Running { .. } => {
                self.start_at(position_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_monotonic_time() {
        let mut clock = MasterClock::new();
        assert_eq!(clock.position_ms(), 0);

        clock.start_at(1000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.position_ms(), 1250);

        assert_eq!(clock.stop(), 1250);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.position_ms(), 1250);
        assert!(!clock.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_position_re_anchors() {
        let mut clock = MasterClock::new();
        clock.start_at(0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.set_position(5000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(clock.position_ms(), 5100);

        clock.stop();
        clock.set_position(42);
        assert_eq!(clock.position_ms(), 42);
    }
}
