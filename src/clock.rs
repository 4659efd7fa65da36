//! Wall-clock time source used for lease stamps and RTT probes.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::Timestamp;

pub trait Clock: Send + Sync {
    /// Time elapsed since the Unix epoch.
    fn now(&self) -> Duration;

    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }

    fn timestamp(&self) -> Timestamp {
        Timestamp::from_micros(self.now().as_micros() as i64)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock set before 1970 reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::{manual::ManualClock, *};

    #[test]
    fn system_clock_is_past_epoch() {
        assert!(SystemClock.now_ms() > 0);
    }

    #[test]
    fn manual_clock_timestamp() {
        let clock = ManualClock::at(Duration::from_millis(1_500));
        clock.advance(Duration::from_micros(7));

        let ts = clock.timestamp();
        assert_eq!(ts.secs, 1);
        assert_eq!(ts.micros, 500_007);
        assert_eq!(clock.now_ms(), 1_500);
    }
}
