//! Pending and in-flight device twin operations.
//!
//! On-demand gets wait in a pending list until the transport can send them;
//! once sent, every operation is tracked in flight under its correlation id
//! until a response or a timeout removes it. Each operation leaves the queue
//! exactly once, and [`TwinRequest::expire`] turns one that never got an
//! answer into the matching "no result" notification.

use crate::callbacks::{DeviceIdentity, TransportCallbacks, TwinGetCallback, TwinUpdateState};
use crate::error::TransportResult;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_GET_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(300);

/// Status reported for a patch that never received a response
pub const REPORT_TIMEOUT_STATUS: i32 = 408;

/// What a twin operation asked for
pub enum TwinRequest {
    /// Full twin retrieval issued by the transport itself after subscribing
    GetComplete,
    /// `get_twin_async` call carrying its own callback
    GetOnDemand(TwinGetCallback),
    /// Reported-properties patch
    ReportPatch { item_id: u32 },
}

impl TwinRequest {
    pub fn is_on_demand(&self) -> bool {
        matches!(self, TwinRequest::GetOnDemand(_))
    }

    /// Deliver the "no answer" outcome for an operation leaving the queue
    /// without a response
    pub fn expire(self, device: &DeviceIdentity, callbacks: &dyn TransportCallbacks) {
        match self {
            TwinRequest::GetOnDemand(callback) => callback(TwinUpdateState::Complete, None),
            TwinRequest::ReportPatch { item_id } => {
                callbacks.twin_reported_state_complete(device, item_id, REPORT_TIMEOUT_STATUS)
            }
            TwinRequest::GetComplete => {
                debug!(device = %device, "Dropping implicit twin get without response")
            }
        }
    }
}

impl fmt::Debug for TwinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TwinRequest::GetComplete => f.write_str("GetComplete"),
            TwinRequest::GetOnDemand(_) => f.write_str("GetOnDemand"),
            TwinRequest::ReportPatch { item_id } => {
                f.debug_struct("ReportPatch").field("item_id", item_id).finish()
            }
        }
    }
}

struct TwinOperation<K> {
    key: K,
    request: TwinRequest,
    created: Instant,
}

struct PendingGet {
    callback: TwinGetCallback,
    enqueued: Instant,
}

pub struct TwinSyncQueue<K> {
    pending_gets: VecDeque<PendingGet>,
    in_flight: Vec<TwinOperation<K>>,
    get_timeout: Duration,
    report_timeout: Duration,
}

impl<K> Default for TwinSyncQueue<K> {
    fn default() -> Self {
        Self {
            pending_gets: VecDeque::new(),
            in_flight: Vec::new(),
            get_timeout: DEFAULT_GET_TIMEOUT,
            report_timeout: DEFAULT_REPORT_TIMEOUT,
        }
    }
}

impl<K: PartialEq + fmt::Debug> TwinSyncQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(mut self, get_timeout: Duration, report_timeout: Duration) -> Self {
        self.get_timeout = get_timeout;
        self.report_timeout = report_timeout;
        self
    }

    /// Queue an on-demand get until the transport can send it
    pub fn request_get(&mut self, now: Instant, callback: TwinGetCallback) {
        self.pending_gets.push_back(PendingGet {
            callback,
            enqueued: now,
        });
    }

    pub fn pending_get_count(&self) -> usize {
        self.pending_gets.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_gets.is_empty() && self.in_flight.is_empty()
    }

    /// Send every pending on-demand get.
    ///
    /// Sent gets keep their enqueue time so the timeout spans the whole wait.
    /// Gets whose send fails are returned for the caller to expire.
    pub fn send_pending_gets<F>(&mut self, mut send: F) -> (usize, Vec<TwinRequest>)
    where
        F: FnMut() -> TransportResult<K>,
    {
        let mut sent = 0;
        let mut failed = Vec::new();
        while let Some(pending) = self.pending_gets.pop_front() {
            match send() {
                Ok(key) => {
                    self.in_flight.push(TwinOperation {
                        key,
                        request: TwinRequest::GetOnDemand(pending.callback),
                        created: pending.enqueued,
                    });
                    sent += 1;
                }
                Err(e) => {
                    warn!(error = %e.sanitized(), "Failed sending pending twin get");
                    failed.push(TwinRequest::GetOnDemand(pending.callback));
                }
            }
        }
        (sent, failed)
    }

    /// Track an operation already sent under `key`
    pub fn track(&mut self, key: K, request: TwinRequest, now: Instant) {
        self.in_flight.push(TwinOperation {
            key,
            request,
            created: now,
        });
    }

    /// Remove the operation a response answers
    pub fn on_response(&mut self, key: &K) -> Option<TwinRequest> {
        let index = self.in_flight.iter().position(|op| &op.key == key)?;
        Some(self.in_flight.remove(index).request)
    }

    /// Remove every operation past its timeout.
    ///
    /// On-demand gets expire after the get timeout whether pending or sent,
    /// patches after the report timeout. The implicit full get never expires.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<TwinRequest> {
        let mut expired = Vec::new();
        let get_timeout = self.get_timeout;

        let mut pending = VecDeque::with_capacity(self.pending_gets.len());
        for get in self.pending_gets.drain(..) {
            if now.saturating_duration_since(get.enqueued) >= get_timeout {
                expired.push(TwinRequest::GetOnDemand(get.callback));
            } else {
                pending.push_back(get);
            }
        }
        self.pending_gets = pending;

        let report_timeout = self.report_timeout;
        let mut index = 0;
        while index < self.in_flight.len() {
            let op = &self.in_flight[index];
            let limit = match op.request {
                TwinRequest::GetOnDemand(_) => Some(get_timeout),
                TwinRequest::ReportPatch { .. } => Some(report_timeout),
                TwinRequest::GetComplete => None,
            };
            let timed_out =
                limit.is_some_and(|limit| now.saturating_duration_since(op.created) >= limit);
            if timed_out {
                let op = self.in_flight.remove(index);
                warn!(key = ?op.key, request = ?op.request, "Twin operation timed out");
                expired.push(op.request);
            } else {
                index += 1;
            }
        }

        expired
    }

    /// Take every operation, pending gets last
    pub fn abort_all(&mut self) -> Vec<TwinRequest> {
        let mut aborted: Vec<TwinRequest> = self.in_flight.drain(..).map(|op| op.request).collect();
        aborted.extend(
            self.pending_gets
                .drain(..)
                .map(|get| TwinRequest::GetOnDemand(get.callback)),
        );
        aborted
    }
}

impl<K> fmt::Debug for TwinSyncQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwinSyncQueue")
            .field("pending_gets", &self.pending_gets.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(TwinUpdateState, Option<Vec<u8>>)>>>;

    fn recording_callback(seen: &Seen) -> TwinGetCallback {
        let sink = seen.clone();
        Box::new(move |state, payload| {
            sink.lock().unwrap().push((state, payload.map(<[u8]>::to_vec)));
        })
    }

    #[test]
    fn test_pending_get_sent_then_answered() {
        let seen: Seen = Arc::default();
        let now = Instant::now();
        let mut queue: TwinSyncQueue<u16> = TwinSyncQueue::new();
        queue.request_get(now, recording_callback(&seen));

        let (sent, failed) = queue.send_pending_gets(|| Ok(5));
        assert_eq!(sent, 1);
        assert!(failed.is_empty());
        assert_eq!(queue.pending_get_count(), 0);

        match queue.on_response(&5) {
            Some(TwinRequest::GetOnDemand(callback)) => {
                callback(TwinUpdateState::Complete, Some(&b"{}"[..]))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(queue.is_empty());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(TwinUpdateState::Complete, Some(b"{}".to_vec()))]
        );
    }

    #[test]
    fn test_failed_send_hands_get_back() {
        let mut queue: TwinSyncQueue<u16> = TwinSyncQueue::new();
        queue.request_get(Instant::now(), Box::new(|_, _| {}));

        let (sent, failed) = queue.send_pending_gets(|| Err(TransportError::operation_failed("x")));

        assert_eq!(sent, 0);
        assert_eq!(failed.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_get_timeout_counts_from_enqueue() {
        let start = Instant::now();
        let mut queue: TwinSyncQueue<u16> = TwinSyncQueue::new();
        queue.request_get(start, Box::new(|_, _| {}));
        queue.send_pending_gets(|| Ok(1));

        assert!(queue.on_timeout(start + Duration::from_secs(59)).is_empty());
        let expired = queue.on_timeout(start + Duration::from_secs(60));

        assert_eq!(expired.len(), 1);
        assert!(expired[0].is_on_demand());
        assert!(queue.on_response(&1).is_none());
    }

    #[test]
    fn test_report_patch_times_out_after_report_window() {
        let start = Instant::now();
        let mut queue: TwinSyncQueue<u16> = TwinSyncQueue::new();
        queue.track(2, TwinRequest::ReportPatch { item_id: 9 }, start);
        queue.track(3, TwinRequest::GetComplete, start);

        assert!(queue.on_timeout(start + Duration::from_secs(299)).is_empty());
        let expired = queue.on_timeout(start + Duration::from_secs(300));

        assert!(matches!(expired.as_slice(), [TwinRequest::ReportPatch { item_id: 9 }]));
        assert_eq!(queue.in_flight_len(), 1, "implicit get stays until answered");
    }

    #[test]
    fn test_custom_timeouts_replace_defaults() {
        let start = Instant::now();
        let mut queue: TwinSyncQueue<u16> =
            TwinSyncQueue::new().with_timeouts(Duration::from_secs(5), Duration::from_secs(20));
        queue.track(1, TwinRequest::GetOnDemand(Box::new(|_, _| {})), start);
        queue.track(2, TwinRequest::ReportPatch { item_id: 4 }, start);

        let early = queue.on_timeout(start + Duration::from_secs(5));
        let late = queue.on_timeout(start + Duration::from_secs(20));

        assert!(matches!(early.as_slice(), [TwinRequest::GetOnDemand(_)]));
        assert!(matches!(late.as_slice(), [TwinRequest::ReportPatch { item_id: 4 }]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_abort_all_drains_everything() {
        let mut queue: TwinSyncQueue<u16> = TwinSyncQueue::new();
        let now = Instant::now();
        queue.track(1, TwinRequest::ReportPatch { item_id: 1 }, now);
        queue.request_get(now, Box::new(|_, _| {}));

        let aborted = queue.abort_all();

        assert_eq!(aborted.len(), 2);
        assert!(queue.is_empty());
    }
}
