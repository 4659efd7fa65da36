use std::{fmt, num::NonZeroU32};

use governor::{DefaultDirectRateLimiter, Quota};

/// Gate for log sites that can fire once per packet; opens at most once per second.
pub struct Throttle {
    limiter: DefaultDirectRateLimiter,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle").finish_non_exhaustive()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::per_second()
    }
}

impl Throttle {
    pub fn per_second() -> Self {
        Self {
            limiter: DefaultDirectRateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    /// Returns `true` if the caller may log now.
    pub fn ready(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
