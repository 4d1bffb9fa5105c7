use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for the detection loop.
///
/// Sleeping goes through the clock so simulated runs never block.
pub trait Clock: Send {
    fn now(&self) -> Instant;
    /// Wall time, for timestamps that leave the process.
    fn wall_now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            wall_origin: Utc::now(),
            now: Arc::new(Mutex::new(origin)),
        }
    }

    /// Instant at which this clock started.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Wall time matching `origin`.
    pub fn wall_origin(&self) -> DateTime<Utc> {
        self.wall_origin
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    /// Jump to `origin + offset`. Moving backwards is ignored.
    pub fn set_offset(&self, offset: Duration) {
        let target = self.origin + offset;
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if target > *now {
            *now = target;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.now().duration_since(self.origin)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wall_now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed())
            .ok()
            .and_then(|offset| self.wall_origin.checked_add_signed(offset))
            .unwrap_or(self.wall_origin)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_shares_time_between_clones() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        handle.advance(Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));

        clock.sleep(Duration::from_secs(1));
        assert_eq!(handle.elapsed(), Duration::from_secs(6));

        clock.set_offset(Duration::from_secs(2));
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn manual_wall_time_follows_simulated_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.wall_now(), clock.wall_origin());

        clock.advance(Duration::from_millis(2500));
        assert_eq!(
            clock.wall_now() - clock.wall_origin(),
            chrono::Duration::milliseconds(2500)
        );
    }
}
