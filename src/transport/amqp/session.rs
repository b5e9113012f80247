//! Per-device session on the shared AMQP connection
//!
//! A session owns one device primitive plus the bookkeeping the transport
//! keeps for it: lifecycle state, failure counters, outbound telemetry, twin
//! operations and the lazy method subscription.

use super::primitives::{
    AmqpConnection, AmqpDevice, AmqpDeviceEvent, AmqpDisposition, DeviceAuthMode, DeviceState,
};
use crate::callbacks::{
    ConnectionStatus, ConnectionStatusReason, DeviceIdentity, TransportCallbacks, TwinGetCallback,
};
use crate::device::DeviceHandle;
use crate::error::{TransportError, TransportResult};
use crate::message::{ConfirmationResult, DispositionContext, DispositionToken, OutboundQueue};
use crate::registry::RegistryEntry;
use crate::telemetry::TelemetryQueue;
use crate::twin::{TwinRequest, TwinSyncQueue};
use crate::transport::{SendStatus, TwinReport};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DEVICE_STOP_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_DEVICE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodSubscription {
    NotNeeded,
    NeededNotSubscribed,
    Subscribed,
}

/// What the transport needs to know from one device tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SessionTick {
    pub ok: bool,
    /// The device reached `Started`; the connection retry history can go
    pub started: bool,
}

/// Inputs shared by every device tick
pub(crate) struct TickContext<'a> {
    pub now: Instant,
    pub callbacks: &'a dyn TransportCallbacks,
    /// Whether a transition to `Stopped` is worth reporting
    pub report_stopped: bool,
    pub preferred_auth: DeviceAuthMode,
    pub max_state_change_timeout: Duration,
    pub device_stop_delay: Duration,
    pub max_device_failures: u32,
}

pub(crate) struct AmqpDeviceSession {
    handle: DeviceHandle,
    identity: DeviceIdentity,
    auth_mode: DeviceAuthMode,
    device: Box<dyn AmqpDevice>,
    state: DeviceState,
    time_of_last_state_change: Instant,
    telemetry: TelemetryQueue<u64>,
    twin: TwinSyncQueue<String>,
    methods: MethodSubscription,
    consecutive_failures: u32,
    consecutive_send_failures: u32,
}

impl RegistryEntry for AmqpDeviceSession {
    type Key = String;

    fn key(&self) -> &String {
        &self.identity.device_id
    }
}

impl AmqpDeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        auth_mode: DeviceAuthMode,
        device: Box<dyn AmqpDevice>,
        waiting_to_send: OutboundQueue,
        now: Instant,
    ) -> Self {
        Self {
            handle: DeviceHandle::next(),
            identity,
            auth_mode,
            device,
            state: DeviceState::Stopped,
            time_of_last_state_change: now,
            telemetry: TelemetryQueue::new(waiting_to_send),
            twin: TwinSyncQueue::new(),
            methods: MethodSubscription::NotNeeded,
            consecutive_failures: 0,
            consecutive_send_failures: 0,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn auth_mode(&self) -> DeviceAuthMode {
        self.auth_mode
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn methods(&self) -> MethodSubscription {
        self.methods
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_send_failures(&self) -> u32 {
        self.consecutive_send_failures
    }

    pub fn device_mut(&mut self) -> &mut dyn AmqpDevice {
        self.device.as_mut()
    }

    pub fn do_work(&mut self, connection: &dyn AmqpConnection, ctx: &TickContext<'_>) -> SessionTick {
        let _span = crate::device_span!(device = %self.identity).entered();
        let ok = if self.state != DeviceState::Started {
            self.advance_lifecycle(connection, ctx)
        } else if self.methods == MethodSubscription::NeededNotSubscribed
            && !self.subscribe_methods(connection)
        {
            error!(device = %self.identity, "Failed registering for device methods");
            self.consecutive_failures += 1;
            false
        } else if self.send_pending_events(ctx) {
            self.consecutive_failures = 0;
            true
        } else {
            error!(device = %self.identity, "Failed sending pending events");
            self.consecutive_failures += 1;
            false
        };

        let events = self.device.do_work();
        let started = self.process_events(events, ctx);

        SessionTick { ok, started }
    }

    fn advance_lifecycle(&mut self, connection: &dyn AmqpConnection, ctx: &TickContext<'_>) -> bool {
        match self.state {
            DeviceState::Stopped => {
                let started = if !connection.has_session() {
                    Err(TransportError::not_connected("connection has no session"))
                } else if ctx.preferred_auth == DeviceAuthMode::Cbs && !connection.has_cbs() {
                    Err(TransportError::not_connected("connection has no CBS handle"))
                } else {
                    self.device.start_async(connection)
                };
                match started {
                    Ok(()) => true,
                    Err(e) => {
                        error!(device = %self.identity, error = %e.sanitized(), "Failed to start device");
                        self.consecutive_failures += 1;
                        false
                    }
                }
            }
            DeviceState::Starting | DeviceState::Stopping => {
                let elapsed = ctx
                    .now
                    .saturating_duration_since(self.time_of_last_state_change);
                if elapsed >= ctx.max_state_change_timeout {
                    error!(
                        device = %self.identity,
                        state = ?self.state,
                        elapsed_secs = elapsed.as_secs(),
                        "Device failed to start or stop within expected timeout"
                    );
                    self.state = DeviceState::ErrorAuth;
                    self.consecutive_failures += 1;
                    false
                } else {
                    true
                }
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= ctx.max_device_failures {
                    error!(
                        device = %self.identity,
                        state = ?self.state,
                        failures = self.consecutive_failures,
                        "Device keeps failing"
                    );
                    false
                } else if let Err(e) = self.device.delayed_stop(ctx.device_stop_delay) {
                    error!(device = %self.identity, error = %e.sanitized(), "Failed to schedule device reset");
                    false
                } else {
                    true
                }
            }
        }
    }

    fn subscribe_methods(&mut self, connection: &dyn AmqpConnection) -> bool {
        if !connection.has_session() {
            return false;
        }
        match self.device.methods_subscribe(connection) {
            Ok(()) => {
                self.methods = MethodSubscription::Subscribed;
                true
            }
            Err(e) => {
                warn!(device = %self.identity, error = %e.sanitized(), "Cannot subscribe for methods");
                false
            }
        }
    }

    fn send_pending_events(&mut self, ctx: &TickContext<'_>) -> bool {
        let device = &mut self.device;
        let drain = self
            .telemetry
            .drain_in_order(ctx.now, |message| device.send_event_async(message));

        if drain.sent > 0 {
            debug!(device = %self.identity, sent = drain.sent, "Handed telemetry to device link");
        }

        match drain.failed {
            Some(message) => {
                self.consecutive_send_failures += 1;
                ctx.callbacks
                    .send_complete(&self.identity, vec![message], ConfirmationResult::Error);
                false
            }
            None => true,
        }
    }

    /// Returns true when the device reported `Started`
    fn process_events(&mut self, events: Vec<AmqpDeviceEvent>, ctx: &TickContext<'_>) -> bool {
        let mut started = false;
        for event in events {
            started |= self.process_event(event, ctx);
        }
        started
    }

    fn process_event(&mut self, event: AmqpDeviceEvent, ctx: &TickContext<'_>) -> bool {
        let callbacks = ctx.callbacks;
        match event {
            AmqpDeviceEvent::StateChanged { previous, current } => {
                return self.on_state_changed(previous, current, ctx);
            }
            AmqpDeviceEvent::SendComplete { tag, result } => match self.telemetry.on_ack(&tag) {
                Some(message) => {
                    if result.is_failure() {
                        self.consecutive_send_failures += 1;
                    } else {
                        self.consecutive_send_failures = 0;
                    }
                    callbacks.send_complete(&self.identity, vec![message], result.confirmation());
                }
                None => warn!(device = %self.identity, tag, "Send completion for unknown message"),
            },
            AmqpDeviceEvent::MessageReceived {
                mut message,
                link_name,
                delivery_id,
            } => {
                let token = DispositionToken::Amqp {
                    link_name,
                    delivery_id,
                };
                message.set_disposition_context(DispositionContext::from_token(token.clone()));
                if !callbacks.message_received(&self.identity, message) {
                    warn!(device = %self.identity, "Message declined by client, releasing it");
                    if let Err(e) = self
                        .device
                        .send_message_disposition(&token, AmqpDisposition::Released)
                    {
                        error!(device = %self.identity, error = %e.sanitized(), "Failed releasing message");
                    }
                }
            }
            AmqpDeviceEvent::TwinUpdateReceived { state, payload } => {
                callbacks.twin_retrieve_properties_complete(&self.identity, state, &payload);
            }
            AmqpDeviceEvent::TwinGetComplete {
                correlation_id,
                payload,
            } => match self.twin.on_response(&correlation_id) {
                Some(TwinRequest::GetOnDemand(callback)) => {
                    callback(crate::callbacks::TwinUpdateState::Complete, payload.as_deref())
                }
                Some(other) => warn!(device = %self.identity, request = ?other, "Get response matched a non-get operation"),
                None => warn!(device = %self.identity, %correlation_id, "Twin get response without request"),
            },
            AmqpDeviceEvent::TwinReportComplete {
                correlation_id,
                status_code,
            } => match self.twin.on_response(&correlation_id) {
                Some(TwinRequest::ReportPatch { item_id }) => {
                    callbacks.twin_reported_state_complete(&self.identity, item_id, status_code)
                }
                Some(other) => warn!(device = %self.identity, request = ?other, "Report response matched a non-report operation"),
                None => warn!(device = %self.identity, %correlation_id, "Twin report response without request"),
            },
            AmqpDeviceEvent::MethodRequest(request) => {
                let name = request.name.clone();
                if !callbacks.device_method(&self.identity, request) {
                    error!(device = %self.identity, method = %name, "Device method callback failed");
                }
            }
            AmqpDeviceEvent::MethodsUnsubscribed => {
                info!(device = %self.identity, "Methods links detached");
                self.device.methods_unsubscribe();
                if self.methods == MethodSubscription::Subscribed {
                    self.methods = MethodSubscription::NeededNotSubscribed;
                }
            }
        }
        false
    }

    fn on_state_changed(
        &mut self,
        previous: DeviceState,
        current: DeviceState,
        ctx: &TickContext<'_>,
    ) -> bool {
        if previous == current {
            return false;
        }
        info!(device = %self.identity, ?previous, ?current, "Device state changed");
        self.state = current;
        self.time_of_last_state_change = ctx.now;

        let report = |status, reason| {
            ctx.callbacks
                .connection_status_changed(&self.identity, status, reason)
        };
        match current {
            DeviceState::Started => {
                report(ConnectionStatus::Authenticated, ConnectionStatusReason::Ok);
                return true;
            }
            DeviceState::Stopped if ctx.report_stopped => {
                report(ConnectionStatus::Unauthenticated, ConnectionStatusReason::Ok)
            }
            DeviceState::ErrorAuth => report(
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::BadCredential,
            ),
            DeviceState::ErrorAuthTimeout | DeviceState::ErrorMsg => report(
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::CommunicationError,
            ),
            _ => {}
        }
        false
    }

    /// Fire the timeout outcome of every twin operation past its deadline
    pub fn expire_twin_operations(&mut self, now: Instant, callbacks: &dyn TransportCallbacks) {
        for request in self.twin.on_timeout(now) {
            request.expire(&self.identity, callbacks);
        }
    }

    /// Stop the device and forget failure history before reconnecting.
    ///
    /// Events raised by the stop are processed right away, so the session is
    /// back in `Stopped` before the next connection is created.
    pub fn prepare_for_retry(&mut self, ctx: &TickContext<'_>) {
        self.device.methods_unsubscribe();
        if self.methods == MethodSubscription::Subscribed {
            self.methods = MethodSubscription::NeededNotSubscribed;
        }
        if self.state != DeviceState::Stopped {
            if let Err(e) = self.device.stop() {
                error!(device = %self.identity, error = %e.sanitized(), "Failed stopping device for connection retry");
            }
            let events = self.device.do_work();
            self.process_events(events, ctx);
        }
        self.consecutive_failures = 0;
        self.consecutive_send_failures = 0;
    }

    pub fn subscribe_methods_lazily(&mut self) {
        self.methods = MethodSubscription::NeededNotSubscribed;
    }

    pub fn unsubscribe_methods(&mut self) {
        if self.methods != MethodSubscription::NotNeeded {
            self.methods = MethodSubscription::NotNeeded;
            self.device.methods_unsubscribe();
        }
    }

    pub fn get_twin_async(&mut self, now: Instant, callback: TwinGetCallback) -> TransportResult<()> {
        let correlation_id = Uuid::new_v4().to_string();
        self.device.get_twin_async(&correlation_id)?;
        self.twin
            .track(correlation_id, TwinRequest::GetOnDemand(callback), now);
        Ok(())
    }

    pub fn send_twin_report(&mut self, now: Instant, report: &TwinReport) -> TransportResult<()> {
        let correlation_id = Uuid::new_v4().to_string();
        self.device
            .send_twin_update_async(&correlation_id, &report.data)?;
        self.twin.track(
            correlation_id,
            TwinRequest::ReportPatch {
                item_id: report.item_id,
            },
            now,
        );
        Ok(())
    }

    pub fn send_status(&self) -> TransportResult<SendStatus> {
        if self.telemetry.waiting_len() > 0 {
            return Ok(SendStatus::Busy);
        }
        self.device.send_status()
    }

    /// Stop the device and settle everything it still owns.
    ///
    /// Final device events are processed first so send completions the
    /// primitive reports keep their own result; whatever is left completes
    /// with `BecauseDestroy`.
    pub fn shutdown(mut self, ctx: &TickContext<'_>) {
        if self.state != DeviceState::Stopped {
            if let Err(e) = self.device.stop() {
                warn!(device = %self.identity, error = %e.sanitized(), "Failed stopping device");
            }
        }
        self.device.methods_unsubscribe();
        let events = self.device.do_work();
        self.process_events(events, ctx);

        let aborted = self.telemetry.abort_all();
        if !aborted.is_empty() {
            debug!(device = %self.identity, count = aborted.len(), "Aborting outbound messages");
            ctx.callbacks
                .send_complete(&self.identity, aborted, ConfirmationResult::BecauseDestroy);
        }
        for request in self.twin.abort_all() {
            request.expire(&self.identity, ctx.callbacks);
        }
    }
}
