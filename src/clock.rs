//! Time source used by every timeout and backoff decision.
//!
//! The transports never read the system clock directly so that tests can
//! drive hours of retry behaviour with [`crate::testing::ManualClock`].

use std::time::Instant;

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
