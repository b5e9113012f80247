//! Reconnection retry policy
//!
//! [`RetryController`] decides, each time the transport is waiting to
//! reconnect, whether an attempt should happen now, later or never again.
//! It is driven purely by the timestamps it is handed, so the same controller
//! behaves identically under a real or a manual clock.

use crate::error::{TransportError, TransportResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Backoff shape used between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Never reconnect
    None,
    Immediate,
    Interval,
    LinearBackoff,
    ExponentialBackoff,
    #[default]
    ExponentialBackoffWithJitter,
    Random,
}

impl RetryPolicy {
    fn default_initial_wait(self) -> Duration {
        match self {
            RetryPolicy::ExponentialBackoff | RetryPolicy::ExponentialBackoffWithJitter => {
                Duration::from_secs(1)
            }
            _ => Duration::from_secs(5),
        }
    }
}

/// Decision returned by [`RetryController::should_retry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RetryNow,
    RetryLater,
    StopRetrying,
}

/// Tunables accepted by [`RetryController::set_option`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOption {
    InitialWaitSecs(u64),
    MaxJitterPercent(u32),
    MaxDelaySecs(u64),
}

const DEFAULT_MAX_JITTER_PERCENT: u32 = 5;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

pub struct RetryController {
    policy: RetryPolicy,
    max_retry_time: Duration,
    initial_wait: Duration,
    max_jitter_percent: u32,
    max_delay: Duration,
    retry_count: u32,
    first_retry_time: Option<Instant>,
    last_retry_time: Option<Instant>,
    current_wait: Duration,
    rng: StdRng,
}

impl RetryController {
    /// `max_retry_time_secs == 0` retries forever
    pub fn new(policy: RetryPolicy, max_retry_time_secs: u64) -> Self {
        Self::with_rng(policy, max_retry_time_secs, StdRng::from_entropy())
    }

    /// Controller with a caller supplied random source
    pub fn with_rng(policy: RetryPolicy, max_retry_time_secs: u64, rng: StdRng) -> Self {
        Self {
            policy,
            max_retry_time: Duration::from_secs(max_retry_time_secs),
            initial_wait: policy.default_initial_wait(),
            max_jitter_percent: DEFAULT_MAX_JITTER_PERCENT,
            max_delay: DEFAULT_MAX_DELAY,
            retry_count: 0,
            first_retry_time: None,
            last_retry_time: None,
            current_wait: Duration::ZERO,
            rng,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Wait required before the next attempt
    pub fn current_wait(&self) -> Duration {
        self.current_wait
    }

    pub fn set_option(&mut self, option: RetryOption) -> TransportResult<()> {
        match option {
            RetryOption::InitialWaitSecs(secs) => {
                if secs < 1 {
                    return Err(TransportError::invalid_argument(
                        "retry initial wait must be at least 1 second",
                    ));
                }
                self.initial_wait = Duration::from_secs(secs);
            }
            RetryOption::MaxJitterPercent(percent) => {
                self.max_jitter_percent = percent.min(100);
            }
            RetryOption::MaxDelaySecs(secs) => {
                self.max_delay = Duration::from_secs(secs);
            }
        }
        Ok(())
    }

    pub fn should_retry(&mut self, now: Instant) -> RetryAction {
        if self.policy == RetryPolicy::None {
            return RetryAction::StopRetrying;
        }

        let first_retry_time = *self.first_retry_time.get_or_insert(now);

        let action = if self.retry_count == 0 {
            RetryAction::RetryNow
        } else if !self.max_retry_time.is_zero()
            && now.saturating_duration_since(first_retry_time) >= self.max_retry_time
        {
            RetryAction::StopRetrying
        } else if self.policy == RetryPolicy::Immediate {
            RetryAction::RetryNow
        } else {
            let since_last = self
                .last_retry_time
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or(Duration::MAX);
            if since_last < self.current_wait {
                RetryAction::RetryLater
            } else {
                RetryAction::RetryNow
            }
        };

        if action == RetryAction::RetryNow {
            self.retry_count = self.retry_count.saturating_add(1);
            self.last_retry_time = Some(now);
            self.current_wait = self.next_wait();
            debug!(
                policy = ?self.policy,
                attempt = self.retry_count,
                next_wait_ms = self.current_wait.as_millis() as u64,
                "Retry attempt granted"
            );
        }

        action
    }

    /// Forget all history after a successful connection
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.first_retry_time = None;
        self.last_retry_time = None;
        self.current_wait = Duration::ZERO;
    }

    fn next_wait(&mut self) -> Duration {
        let initial = self.initial_wait.as_secs_f64();
        let count = f64::from(self.retry_count);
        let exponential = || initial * 2f64.powf(count - 1.0);

        let secs = match self.policy {
            RetryPolicy::None | RetryPolicy::Immediate => 0.0,
            RetryPolicy::Interval => initial,
            RetryPolicy::LinearBackoff => initial * count,
            RetryPolicy::ExponentialBackoff => exponential(),
            RetryPolicy::ExponentialBackoffWithJitter => {
                let jitter = f64::from(self.max_jitter_percent) / 100.0;
                let sample: f64 = self.rng.gen();
                exponential() * (1.0 + jitter * sample)
            }
            RetryPolicy::Random => {
                let sample: f64 = self.rng.gen();
                initial * sample
            }
        };

        let wait = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);
        wait.min(self.max_delay)
    }
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .field("max_retry_time", &self.max_retry_time)
            .field("retry_count", &self.retry_count)
            .field("current_wait", &self.current_wait)
            .finish()
    }
}
