//! Outbound telemetry: FIFO drain plus in-flight acknowledgment tracking.
//!
//! The waiting list is the caller-owned [`OutboundQueue`]. Messages move from
//! it into the in-flight list when the send primitive accepts them and leave
//! the in-flight list exactly once: on acknowledgment, on timeout or on abort.
//! The queue never completes a message itself; every message leaving it is
//! handed back so the transport can report it through its callbacks.

use crate::error::TransportResult;
use crate::message::{ConfirmationResult, Message, OutboundMessage, OutboundQueue};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_RESEND_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_PUBLISH_ATTEMPTS: u32 = 2;

/// One message waiting for its acknowledgment
struct InFlight<K> {
    key: K,
    message: OutboundMessage,
    publish_time: Instant,
    publish_count: u32,
}

/// Result of one [`TelemetryQueue::drain_in_order`] pass
#[derive(Debug, Default)]
pub struct Drain {
    pub sent: usize,
    /// Message whose synchronous send failed; draining stopped there
    pub failed: Option<OutboundMessage>,
}

/// Messages that left the in-flight list during [`TelemetryQueue::on_timeout`]
#[derive(Debug, Default)]
pub struct Expired {
    pub completions: Vec<(OutboundMessage, ConfirmationResult)>,
    /// A message exhausted its publish attempts; the connection is wedged
    pub reset_connection: bool,
}

pub struct TelemetryQueue<K> {
    waiting: OutboundQueue,
    in_flight: VecDeque<InFlight<K>>,
    resend_window: Duration,
    max_publish_attempts: u32,
}

impl<K: PartialEq + Clone + fmt::Debug> TelemetryQueue<K> {
    pub fn new(waiting: OutboundQueue) -> Self {
        Self {
            waiting,
            in_flight: VecDeque::new(),
            resend_window: DEFAULT_RESEND_WINDOW,
            max_publish_attempts: DEFAULT_MAX_PUBLISH_ATTEMPTS,
        }
    }

    pub fn with_resend_policy(mut self, window: Duration, max_publish_attempts: u32) -> Self {
        self.resend_window = window;
        self.max_publish_attempts = max_publish_attempts;
        self
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }

    /// Hand every waiting message to `send`, oldest first.
    ///
    /// A message accepted by `send` becomes in-flight under the returned key.
    /// The first synchronous failure stops the pass; that message is returned
    /// and everything behind it stays queued in order.
    pub fn drain_in_order<F>(&mut self, now: Instant, mut send: F) -> Drain
    where
        F: FnMut(&Message) -> TransportResult<K>,
    {
        let mut drain = Drain::default();
        while let Some(message) = self.waiting.pop_front() {
            match send(message.message()) {
                Ok(key) => {
                    self.in_flight.push_back(InFlight {
                        key,
                        message,
                        publish_time: now,
                        publish_count: 1,
                    });
                    drain.sent += 1;
                }
                Err(e) => {
                    warn!(error = %e.sanitized(), "Telemetry send failed, stopping drain");
                    drain.failed = Some(message);
                    break;
                }
            }
        }
        drain
    }

    /// Remove and return the in-flight message tracked under `key`
    pub fn on_ack(&mut self, key: &K) -> Option<OutboundMessage> {
        let index = self.in_flight.iter().position(|entry| &entry.key == key)?;
        self.in_flight.remove(index).map(|entry| entry.message)
    }

    /// Walk in-flight messages older than the resend window.
    ///
    /// An exhausted message fails with `MessageTimeout` and requests a
    /// connection reset. Otherwise, when `can_resend` is set the message is
    /// republished through `resend` (a failure completes it with `Error`);
    /// when it is not, the attempt is counted and the window restarts.
    pub fn on_timeout<F>(&mut self, now: Instant, can_resend: bool, mut resend: F) -> Expired
    where
        F: FnMut(&Message) -> TransportResult<K>,
    {
        let mut expired = Expired::default();
        let mut kept = VecDeque::with_capacity(self.in_flight.len());

        while let Some(mut entry) = self.in_flight.pop_front() {
            if now.saturating_duration_since(entry.publish_time) <= self.resend_window {
                kept.push_back(entry);
                continue;
            }

            if entry.publish_count >= self.max_publish_attempts {
                warn!(key = ?entry.key, attempts = entry.publish_count, "Telemetry acknowledgment timed out");
                expired
                    .completions
                    .push((entry.message, ConfirmationResult::MessageTimeout));
                expired.reset_connection = true;
            } else if can_resend {
                entry.publish_count += 1;
                match resend(entry.message.message()) {
                    Ok(key) => {
                        debug!(old_key = ?entry.key, new_key = ?key, "Telemetry republished");
                        entry.key = key;
                        entry.publish_time = now;
                        kept.push_back(entry);
                    }
                    Err(e) => {
                        warn!(error = %e.sanitized(), "Telemetry republish failed");
                        expired
                            .completions
                            .push((entry.message, ConfirmationResult::Error));
                    }
                }
            } else {
                entry.publish_count += 1;
                entry.publish_time = now;
                kept.push_back(entry);
            }
        }

        self.in_flight = kept;
        expired
    }

    /// Take every in-flight message, then every waiting one, in order
    pub fn abort_all(&mut self) -> Vec<OutboundMessage> {
        let mut aborted: Vec<OutboundMessage> =
            self.in_flight.drain(..).map(|entry| entry.message).collect();
        aborted.extend(self.waiting.drain());
        aborted
    }
}

impl<K: fmt::Debug> fmt::Debug for TelemetryQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryQueue")
            .field("waiting", &self.waiting.len())
            .field("in_flight", &self.in_flight.len())
            .field("resend_window", &self.resend_window)
            .finish()
    }
}
