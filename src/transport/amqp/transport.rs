//! AMQP connection manager
//!
//! One connection, shared by every registered device. The manager owns the
//! I/O, the connection primitive and the retry controller; each device is an
//! [`AmqpDeviceSession`] ticked from [`AmqpTransport::do_work`] while the
//! connection is open.

use super::primitives::{
    AmqpConnection, AmqpConnectionConfig, AmqpConnectionEvent, AmqpConnectionFactory,
    AmqpConnectionState, AmqpDeviceConfig, AmqpDeviceOption, AmqpDisposition, DeviceAuthMode,
    DeviceState,
};
use super::session::{
    AmqpDeviceSession, MethodSubscription, TickContext, DEFAULT_DEVICE_STOP_DELAY,
    DEFAULT_MAX_DEVICE_FAILURES, DEFAULT_STATE_CHANGE_TIMEOUT,
};
use crate::auth::{Authorization, CredentialType};
use crate::callbacks::{
    ConnectionStatus, ConnectionStatusReason, MethodHandle, TransportCallbacks, TwinGetCallback,
};
use crate::clock::Clock;
use crate::device::{DeviceConfig, DeviceHandle};
use crate::error::{TransportError, TransportResult};
use crate::message::{DispositionToken, Message, MessageDisposition, OutboundQueue};
use crate::options::{IoOptions, ProxyOptions, TransportOption};
use crate::registry::DeviceRegistry;
use crate::retry::{RetryAction, RetryController, RetryOption, RetryPolicy};
use crate::transport::{
    IoTransport, IoTransportFactory, ProcessItemResult, SendStatus, TransportConfig, TwinReport,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CBS_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EVENT_SEND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SERVICE_KEEP_ALIVE_SECS: u64 = 240;
pub const DEFAULT_REMOTE_IDLE_PING_RATIO: f64 = 0.5;
pub const DEFAULT_SEND_FAILURE_RECONNECTION_THRESHOLD: u32 = 5;
pub const DEFAULT_FAULTY_DEVICE_RATIO: f64 = 0.5;
const MAX_REMOTE_IDLE_PING_RATIO: f64 = 0.9;

/// Connection lifecycle as tracked by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpTransportState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The connection failed; the next tick asks the retry controller
    ReconnectionRequired,
    /// Torn down and waiting for the next tick to connect again
    ReadyForReconnection,
    /// Retry budget exhausted; nothing happens until the policy is replaced
    NoMoreRetries,
    BeingDestroyed,
}

/// Authentication scheme the shared connection is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPreference {
    NotSet,
    Cbs,
    X509,
}

impl AuthPreference {
    fn mode(self) -> Option<DeviceAuthMode> {
        match self {
            AuthPreference::NotSet => None,
            AuthPreference::Cbs => Some(DeviceAuthMode::Cbs),
            AuthPreference::X509 => Some(DeviceAuthMode::X509),
        }
    }
}

impl From<DeviceAuthMode> for AuthPreference {
    fn from(mode: DeviceAuthMode) -> Self {
        match mode {
            DeviceAuthMode::Cbs => AuthPreference::Cbs,
            DeviceAuthMode::X509 => AuthPreference::X509,
        }
    }
}

/// Health thresholds deciding when failing devices force a reconnection
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpTransportSettings {
    /// Consecutive tick failures after which a device counts as faulty
    pub max_device_failures: u32,
    /// Consecutive send failures after which a device counts as faulty
    pub send_failure_reconnection_threshold: u32,
    /// Share of faulty devices that triggers a reconnection
    pub faulty_device_ratio: f64,
    pub state_change_timeout: Duration,
    pub device_stop_delay: Duration,
}

impl Default for AmqpTransportSettings {
    fn default() -> Self {
        Self {
            max_device_failures: DEFAULT_MAX_DEVICE_FAILURES,
            send_failure_reconnection_threshold: DEFAULT_SEND_FAILURE_RECONNECTION_THRESHOLD,
            faulty_device_ratio: DEFAULT_FAULTY_DEVICE_RATIO,
            state_change_timeout: DEFAULT_STATE_CHANGE_TIMEOUT,
            device_stop_delay: DEFAULT_DEVICE_STOP_DELAY,
        }
    }
}

pub struct AmqpTransport {
    hostname: String,
    state: AmqpTransportState,
    connection_state: AmqpConnectionState,
    preferred_auth: AuthPreference,
    retry: RetryController,
    devices: DeviceRegistry<AmqpDeviceSession>,
    connection: Option<Box<dyn AmqpConnection>>,
    io: Option<Box<dyn IoTransport>>,
    io_options: IoOptions,
    proxy: Option<ProxyOptions>,
    /// Credentials of the first device, used to prepare new I/O instances
    authorization: Option<Arc<dyn Authorization>>,
    connection_factory: Box<dyn AmqpConnectionFactory>,
    io_factory: Arc<dyn IoTransportFactory>,
    callbacks: Arc<dyn TransportCallbacks>,
    clock: Arc<dyn Clock>,
    is_trace_on: bool,
    cbs_request_timeout_secs: u64,
    event_send_timeout_secs: u64,
    svc2cl_keep_alive_timeout_secs: u64,
    cl2svc_keep_alive_send_ratio: f64,
    settings: AmqpTransportSettings,
    destroyed: bool,
}

impl AmqpTransport {
    pub fn new(
        config: &TransportConfig,
        connection_factory: Box<dyn AmqpConnectionFactory>,
        io_factory: Arc<dyn IoTransportFactory>,
        callbacks: Arc<dyn TransportCallbacks>,
        clock: Arc<dyn Clock>,
    ) -> TransportResult<Self> {
        config.validate()?;
        let hostname = config.hostname();
        info!(%hostname, "Creating AMQP transport");

        Ok(Self {
            hostname,
            state: AmqpTransportState::NotConnected,
            connection_state: AmqpConnectionState::Closed,
            preferred_auth: AuthPreference::NotSet,
            retry: RetryController::new(RetryPolicy::default(), 0),
            devices: DeviceRegistry::new(),
            connection: None,
            io: None,
            io_options: IoOptions::new(),
            proxy: None,
            authorization: None,
            connection_factory,
            io_factory,
            callbacks,
            clock,
            is_trace_on: false,
            cbs_request_timeout_secs: DEFAULT_CBS_REQUEST_TIMEOUT_SECS,
            event_send_timeout_secs: DEFAULT_EVENT_SEND_TIMEOUT_SECS,
            svc2cl_keep_alive_timeout_secs: DEFAULT_SERVICE_KEEP_ALIVE_SECS,
            cl2svc_keep_alive_send_ratio: DEFAULT_REMOTE_IDLE_PING_RATIO,
            settings: AmqpTransportSettings::default(),
            destroyed: false,
        })
    }

    pub fn with_settings(mut self, settings: AmqpTransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> AmqpTransportState {
        self.state
    }

    pub fn connection_state(&self) -> AmqpConnectionState {
        self.connection_state
    }

    pub fn preferred_auth(&self) -> AuthPreference {
        self.preferred_auth
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_state(&self, handle: DeviceHandle) -> Option<DeviceState> {
        self.devices
            .find_by(|s| s.handle() == handle)
            .map(AmqpDeviceSession::state)
    }

    pub fn method_subscription(&self, handle: DeviceHandle) -> Option<MethodSubscription> {
        self.devices
            .find_by(|s| s.handle() == handle)
            .map(AmqpDeviceSession::methods)
    }

    /// Add a device to the shared connection.
    ///
    /// The first device fixes the authentication scheme of the connection
    /// unless an X.509 option already did.
    pub fn register(
        &mut self,
        config: DeviceConfig,
        waiting_to_send: OutboundQueue,
    ) -> TransportResult<DeviceHandle> {
        if config.device_id.trim().is_empty() {
            return Err(TransportError::invalid_argument("device id is empty"));
        }
        if self.devices.contains(&config.device_id) {
            error!(device_id = %config.device_id, "Device is already registered");
            return Err(TransportError::invalid_argument(format!(
                "device '{}' is already registered",
                config.device_id
            )));
        }
        self.check_credentials(&config)?;

        let auth_mode = if config.uses_token_auth() {
            DeviceAuthMode::Cbs
        } else {
            DeviceAuthMode::X509
        };
        let device_config = AmqpDeviceConfig {
            device_id: config.device_id.clone(),
            module_id: config.module_id.clone(),
            iothub_host_fqdn: self.hostname.clone(),
            authentication_mode: auth_mode,
            authorization: Arc::clone(&config.authorization),
            product_info: self.callbacks.product_info(),
        };
        let mut device = self.connection_factory.create_device(&device_config)?;

        device.set_option(AmqpDeviceOption::EventSendTimeoutSecs(
            self.event_send_timeout_secs,
        ))?;
        if auth_mode == DeviceAuthMode::Cbs {
            device.set_option(AmqpDeviceOption::CbsRequestTimeoutSecs(
                self.cbs_request_timeout_secs,
            ))?;
        }

        let session = AmqpDeviceSession::new(
            config.identity(),
            auth_mode,
            device,
            waiting_to_send,
            self.clock.now(),
        );
        let handle = session.handle();
        let is_first = self.devices.is_empty();
        if self.devices.add(session).is_err() {
            return Err(TransportError::operation_failed(
                "device registry refused the session",
            ));
        }

        if is_first {
            if self.preferred_auth == AuthPreference::NotSet {
                self.preferred_auth = auth_mode.into();
                info!(preference = ?self.preferred_auth, "Connection authentication scheme selected");
            }
            self.authorization = Some(config.authorization);
        }
        info!(device_id = %config.device_id, %handle, ?auth_mode, "Device registered");
        Ok(handle)
    }

    fn check_credentials(&self, config: &DeviceConfig) -> TransportResult<()> {
        if config.device_key.is_some() && config.device_sas_token.is_some() {
            error!(device_id = %config.device_id, "Device has both a key and a SAS token");
            return Err(TransportError::invalid_argument(
                "a device cannot use both a key and a SAS token",
            ));
        }
        match self.preferred_auth {
            AuthPreference::NotSet => Ok(()),
            AuthPreference::X509 if config.has_token_material() => {
                error!(device_id = %config.device_id, "Token credentials on an X.509 connection");
                Err(TransportError::invalid_argument(
                    "the connection uses X.509; token credentials are not accepted",
                ))
            }
            AuthPreference::Cbs if !config.has_token_material() => {
                error!(device_id = %config.device_id, "Device without key or token on a CBS connection");
                Err(TransportError::invalid_argument(
                    "the connection uses CBS; a device key or SAS token is required",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Remove a device, settling everything it still owns
    pub fn unregister(&mut self, handle: DeviceHandle) {
        let Some(session) = self.devices.remove_by(|s| s.handle() == handle) else {
            warn!(%handle, "Unregister called for an unknown device");
            return;
        };
        info!(device = %session.identity(), "Unregistering device");
        let callbacks = Arc::clone(&self.callbacks);
        let ctx = self.tick_context(callbacks.as_ref(), self.clock.now());
        session.shutdown(&ctx);
    }

    fn session_mut(&mut self, handle: DeviceHandle) -> TransportResult<&mut AmqpDeviceSession> {
        self.devices
            .find_mut_by(|s| s.handle() == handle)
            .ok_or_else(|| TransportError::invalid_argument(format!("unknown device handle {handle}")))
    }

    /// Twin operations are only available while a single device is registered
    fn single_session_mut(
        &mut self,
        handle: DeviceHandle,
        operation: &str,
    ) -> TransportResult<&mut AmqpDeviceSession> {
        if self.devices.len() != 1 {
            error!(
                operation,
                devices = self.devices.len(),
                "Device twin is not supported on a multiplexed connection"
            );
            return Err(TransportError::unsupported(format!(
                "{operation} requires exactly one registered device"
            )));
        }
        self.session_mut(handle)
    }

    pub fn subscribe(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.session_mut(handle)?.device_mut().subscribe_message()
    }

    pub fn unsubscribe(&mut self, handle: DeviceHandle) {
        match self.session_mut(handle) {
            Ok(session) => {
                if let Err(e) = session.device_mut().unsubscribe_message() {
                    error!(device = %session.identity(), error = %e.sanitized(), "Failed unsubscribing from messages");
                }
            }
            Err(e) => warn!(error = %e, "Cannot unsubscribe from messages"),
        }
    }

    pub fn subscribe_device_twin(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.single_session_mut(handle, "subscribe_device_twin")?
            .device_mut()
            .subscribe_for_twin_updates()
    }

    pub fn unsubscribe_device_twin(&mut self, handle: DeviceHandle) {
        match self.single_session_mut(handle, "unsubscribe_device_twin") {
            Ok(session) => {
                if let Err(e) = session.device_mut().unsubscribe_for_twin_updates() {
                    error!(device = %session.identity(), error = %e.sanitized(), "Failed unsubscribing from twin updates");
                }
            }
            Err(e) => warn!(error = %e, "Cannot unsubscribe from twin updates"),
        }
    }

    /// Request the full twin document; `callback` fires exactly once
    pub fn get_twin_async(
        &mut self,
        handle: DeviceHandle,
        callback: TwinGetCallback,
    ) -> TransportResult<()> {
        let now = self.clock.now();
        self.single_session_mut(handle, "get_twin_async")?
            .get_twin_async(now, callback)
    }

    /// Methods are subscribed from the next device tick after this call
    pub fn subscribe_device_method(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.session_mut(handle)?.subscribe_methods_lazily();
        Ok(())
    }

    pub fn unsubscribe_device_method(&mut self, handle: DeviceHandle) {
        match self.session_mut(handle) {
            Ok(session) => session.unsubscribe_methods(),
            Err(e) => warn!(error = %e, "Cannot unsubscribe from methods"),
        }
    }

    pub fn device_method_response(
        &mut self,
        handle: DeviceHandle,
        method: &MethodHandle,
        payload: &[u8],
        status: i32,
    ) -> TransportResult<()> {
        self.session_mut(handle)?
            .device_mut()
            .methods_respond(method, payload, status)
    }

    pub fn subscribe_input_queue(&mut self, _handle: DeviceHandle) -> TransportResult<()> {
        error!("AMQP does not support input queues");
        Err(TransportError::unsupported("AMQP does not support input queues"))
    }

    pub fn unsubscribe_input_queue(&mut self, _handle: DeviceHandle) {
        error!("AMQP does not support input queues");
    }

    pub fn send_status(&self, handle: DeviceHandle) -> TransportResult<SendStatus> {
        self.devices
            .find_by(|s| s.handle() == handle)
            .ok_or_else(|| TransportError::invalid_argument(format!("unknown device handle {handle}")))?
            .send_status()
    }

    /// Send a reported-properties patch
    pub fn process_item(&mut self, handle: DeviceHandle, report: TwinReport) -> ProcessItemResult {
        let now = self.clock.now();
        let session = match self.single_session_mut(handle, "process_item") {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, item_id = report.item_id, "Cannot send reported properties");
                return ProcessItemResult::Error;
            }
        };
        match session.send_twin_report(now, &report) {
            Ok(()) => ProcessItemResult::Ok,
            Err(e) => {
                error!(device = %session.identity(), item_id = report.item_id, error = %e.sanitized(), "Failed sending reported properties");
                ProcessItemResult::Error
            }
        }
    }

    pub fn send_message_disposition(
        &mut self,
        handle: DeviceHandle,
        mut message: Message,
        disposition: MessageDisposition,
    ) -> TransportResult<()> {
        let context = message
            .take_disposition_context()
            .ok_or_else(|| TransportError::invalid_argument("message has no disposition context"))?;
        if !matches!(context.token(), DispositionToken::Amqp { .. }) {
            return Err(TransportError::invalid_argument(
                "disposition context was not issued by the AMQP transport",
            ));
        }
        let amqp_disposition = match disposition {
            MessageDisposition::Accepted => AmqpDisposition::Accepted,
            MessageDisposition::Abandoned => AmqpDisposition::Released,
            MessageDisposition::Rejected => AmqpDisposition::Rejected,
        };
        let session = self.session_mut(handle)?;
        debug!(device = %session.identity(), ?disposition, "Sending message disposition");
        session
            .device_mut()
            .send_message_disposition(context.token(), amqp_disposition)
    }

    /// Replace the retry controller; also lifts `NoMoreRetries`
    pub fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        max_retry_time_secs: u64,
    ) -> TransportResult<()> {
        self.retry = RetryController::new(policy, max_retry_time_secs);
        info!(?policy, max_retry_time_secs, "Retry policy replaced");
        if self.state == AmqpTransportState::NoMoreRetries {
            self.state = AmqpTransportState::ReconnectionRequired;
        }
        Ok(())
    }

    pub fn set_option(&mut self, option: TransportOption) -> TransportResult<()> {
        match option {
            TransportOption::CbsRequestTimeoutSecs(secs) => {
                self.cbs_request_timeout_secs = secs;
                self.replicate_device_option(AmqpDeviceOption::CbsRequestTimeoutSecs(secs))
            }
            TransportOption::EventSendTimeoutSecs(secs) => {
                self.event_send_timeout_secs = secs;
                self.replicate_device_option(AmqpDeviceOption::EventSendTimeoutSecs(secs))
            }
            TransportOption::RetryIntervalSecs(secs) => {
                self.retry.set_option(RetryOption::InitialWaitSecs(secs))
            }
            TransportOption::RetryMaxDelaySecs(secs) => {
                self.retry.set_option(RetryOption::MaxDelaySecs(secs))
            }
            TransportOption::ServiceSideKeepAliveSecs(secs) => {
                self.svc2cl_keep_alive_timeout_secs = secs;
                Ok(())
            }
            TransportOption::RemoteIdleTimeoutRatio(ratio) => {
                if ratio <= 0.0 || ratio >= MAX_REMOTE_IDLE_PING_RATIO {
                    warn!(ratio, "Rejected remote idle timeout ratio");
                    return Err(TransportError::invalid_argument(format!(
                        "remote idle timeout ratio must be in (0, {MAX_REMOTE_IDLE_PING_RATIO})"
                    )));
                }
                self.cl2svc_keep_alive_send_ratio = ratio;
                Ok(())
            }
            TransportOption::LogTrace(on) => {
                self.is_trace_on = on;
                match self.connection.as_mut() {
                    Some(connection) => connection.set_logging(on),
                    None => Ok(()),
                }
            }
            TransportOption::HttpProxy(proxy) => {
                if self.io.is_some() {
                    warn!("Proxy settings rejected: the I/O already exists");
                    return Err(TransportError::operation_failed(
                        "proxy must be set before the connection is created",
                    ));
                }
                proxy.validate()?;
                self.proxy = Some(proxy);
                Ok(())
            }
            other => {
                if matches!(
                    other,
                    TransportOption::X509Certificate(_) | TransportOption::X509PrivateKey(_)
                ) {
                    match self.preferred_auth {
                        AuthPreference::NotSet => self.preferred_auth = AuthPreference::X509,
                        AuthPreference::Cbs => {
                            warn!(option = other.name(), "X.509 option on a CBS connection");
                            return Err(TransportError::invalid_argument(
                                "the connection uses CBS; X.509 options are not accepted",
                            ));
                        }
                        AuthPreference::X509 => {}
                    }
                }
                self.apply_io_option(&other)
            }
        }
    }

    fn replicate_device_option(&mut self, option: AmqpDeviceOption) -> TransportResult<()> {
        let cbs_only = matches!(option, AmqpDeviceOption::CbsRequestTimeoutSecs(_));
        for session in self.devices.iter_mut() {
            if cbs_only && session.auth_mode() != DeviceAuthMode::Cbs {
                continue;
            }
            if let Err(e) = session.device_mut().set_option(option) {
                error!(device = %session.identity(), ?option, error = %e.sanitized(), "Failed replicating option to device");
                return Err(TransportError::operation_failed(format!(
                    "device '{}' rejected {option:?}",
                    session.identity()
                )));
            }
        }
        Ok(())
    }

    fn apply_io_option(&mut self, option: &TransportOption) -> TransportResult<()> {
        let Some(value) = option.value() else {
            return Err(TransportError::invalid_argument(format!(
                "option '{}' cannot be applied to the I/O",
                option.name()
            )));
        };
        let name = option.name().to_string();
        if self.io.is_none() {
            self.io = Some(self.create_io()?);
        }
        if let Some(io) = self.io.as_mut() {
            io.set_option(&name, &value)?;
        }
        debug!(option = %name, %value, "I/O option stored");
        self.io_options.insert(name, value);
        Ok(())
    }

    fn create_io(&self) -> TransportResult<Box<dyn IoTransport>> {
        let mut io = self.io_factory.create(&self.hostname, self.proxy.as_ref())?;
        if let Some(authorization) = &self.authorization {
            if authorization.credential_type() == CredentialType::X509Ecc {
                authorization.set_x509_certificate(io.as_mut())?;
            }
        }
        if let Err(e) = self.io_options.apply_to(io.as_mut()) {
            warn!(error = %e.sanitized(), "Failed restoring saved options on new I/O");
        }
        Ok(io)
    }

    fn tick_context<'a>(&self, callbacks: &'a dyn TransportCallbacks, now: Instant) -> TickContext<'a> {
        TickContext {
            now,
            callbacks,
            report_stopped: matches!(
                self.state,
                AmqpTransportState::Connected | AmqpTransportState::BeingDestroyed
            ),
            preferred_auth: self.preferred_auth.mode().unwrap_or(DeviceAuthMode::X509),
            max_state_change_timeout: self.settings.state_change_timeout,
            device_stop_delay: self.settings.device_stop_delay,
            max_device_failures: self.settings.max_device_failures,
        }
    }

    fn establish_connection(&mut self) -> TransportResult<()> {
        let mode = self.preferred_auth.mode().ok_or_else(|| {
            TransportError::not_connected("no authentication scheme selected yet")
        })?;
        if self.io.is_none() {
            self.io = Some(self.create_io()?);
        }
        let token_auth = mode == DeviceAuthMode::Cbs;
        let config = AmqpConnectionConfig {
            iothub_host_fqdn: self.hostname.clone(),
            create_sasl_io: token_auth,
            create_cbs_connection: token_auth,
            is_trace_on: self.is_trace_on,
            svc2cl_keep_alive_timeout_secs: self.svc2cl_keep_alive_timeout_secs,
            cl2svc_keep_alive_send_ratio: self.cl2svc_keep_alive_send_ratio,
        };

        self.connection_state = AmqpConnectionState::Closed;
        self.state = if self.state == AmqpTransportState::ReadyForReconnection {
            AmqpTransportState::Reconnecting
        } else {
            AmqpTransportState::Connecting
        };
        info!(hostname = %self.hostname, ?mode, state = ?self.state, "Creating AMQP connection");

        let io = self
            .io
            .as_deref_mut()
            .ok_or_else(|| TransportError::operation_failed("I/O is missing"))?;
        let connection = self.connection_factory.create_connection(&config, io)?;
        self.connection = Some(connection);
        Ok(())
    }

    fn prepare_for_retry(&mut self) {
        info!(hostname = %self.hostname, "Preparing transport for a connection retry");
        let callbacks = Arc::clone(&self.callbacks);
        let ctx = self.tick_context(callbacks.as_ref(), self.clock.now());
        for session in self.devices.iter_mut() {
            session.prepare_for_retry(&ctx);
        }
        self.connection = None;
        self.connection_state = AmqpConnectionState::Closed;
        self.io = None;
        self.state = AmqpTransportState::ReadyForReconnection;
    }

    fn on_connection_event(&mut self, event: AmqpConnectionEvent) {
        let AmqpConnectionEvent::StateChanged { previous, current } = event;
        if current == self.connection_state {
            return;
        }
        info!(?previous, ?current, "AMQP connection state changed");
        self.connection_state = current;

        match current {
            AmqpConnectionState::Error => {
                error!(hostname = %self.hostname, "AMQP connection failed");
                for session in self.devices.iter() {
                    self.callbacks.connection_status_changed(
                        session.identity(),
                        ConnectionStatus::Unauthenticated,
                        ConnectionStatusReason::NoNetwork,
                    );
                }
                self.state = AmqpTransportState::ReconnectionRequired;
            }
            AmqpConnectionState::Opened => {
                self.state = AmqpTransportState::Connected;
            }
            AmqpConnectionState::Closed => {
                if previous == AmqpConnectionState::Opened
                    && self.state != AmqpTransportState::BeingDestroyed
                {
                    warn!(hostname = %self.hostname, "AMQP connection closed unexpectedly");
                    self.state = AmqpTransportState::ReconnectionRequired;
                }
            }
        }
    }

    /// Tick every device; returns true when enough of them are faulty to
    /// justify a reconnection
    fn tick_devices(&mut self, now: Instant) -> bool {
        let Some(connection) = self.connection.as_deref() else {
            return false;
        };
        let callbacks = Arc::clone(&self.callbacks);
        let ctx = self.tick_context(callbacks.as_ref(), now);
        let send_threshold = self.settings.send_failure_reconnection_threshold;
        let failure_threshold = self.settings.max_device_failures;

        let mut total = 0usize;
        let mut faulty = 0usize;
        let mut any_started = false;
        for session in self.devices.iter_mut() {
            total += 1;
            if session.consecutive_send_failures() >= send_threshold {
                faulty += 1;
                continue;
            }
            let tick = session.do_work(connection, &ctx);
            any_started |= tick.started;
            if !tick.ok && session.consecutive_failures() >= failure_threshold {
                faulty += 1;
            }
        }

        if any_started {
            self.retry.reset();
        }
        if faulty == 0 || total == 0 {
            return false;
        }
        let ratio = faulty as f64 / total as f64;
        if ratio >= self.settings.faulty_device_ratio {
            error!(faulty, total, ratio, "Too many devices failing, reconnecting");
            return true;
        }
        false
    }

    /// Drive the connection and every device by one step
    pub fn do_work(&mut self) {
        if self.destroyed {
            return;
        }
        let _span = crate::transport_span!(protocol = "amqp", hostname = %self.hostname).entered();
        let now = self.clock.now();

        match self.state {
            AmqpTransportState::NoMoreRetries => {}
            AmqpTransportState::ReconnectionRequired => match self.retry.should_retry(now) {
                RetryAction::RetryNow => self.prepare_for_retry(),
                RetryAction::StopRetrying => {
                    error!(hostname = %self.hostname, "Retry budget exhausted");
                    self.state = AmqpTransportState::NoMoreRetries;
                    for session in self.devices.iter() {
                        self.callbacks.connection_status_changed(
                            session.identity(),
                            ConnectionStatus::Unauthenticated,
                            ConnectionStatusReason::RetryExpired,
                        );
                    }
                }
                RetryAction::RetryLater => {}
            },
            _ => {
                if !self.devices.is_empty() {
                    if self.connection.is_none() {
                        if let Err(e) = self.establish_connection() {
                            error!(error = %e.sanitized(), "Failed establishing AMQP connection");
                            self.state = AmqpTransportState::ReconnectionRequired;
                        }
                    } else if self.connection_state == AmqpConnectionState::Opened
                        && self.tick_devices(now)
                    {
                        self.state = AmqpTransportState::ReconnectionRequired;
                    }
                }

                let events = match self.connection.as_mut() {
                    Some(connection) => connection.do_work(),
                    None => Vec::new(),
                };
                for event in events {
                    self.on_connection_event(event);
                }
            }
        }

        let callbacks = Arc::clone(&self.callbacks);
        for session in self.devices.iter_mut() {
            session.expire_twin_operations(now, callbacks.as_ref());
        }
    }

    /// Tear everything down; every outstanding completion fires
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        info!(hostname = %self.hostname, devices = self.devices.len(), "Destroying AMQP transport");
        self.state = AmqpTransportState::BeingDestroyed;

        let callbacks = Arc::clone(&self.callbacks);
        let ctx = self.tick_context(callbacks.as_ref(), self.clock.now());
        for session in self.devices.drain() {
            session.shutdown(&ctx);
        }
        self.connection = None;
        self.connection_state = AmqpConnectionState::Closed;
        self.io = None;
        self.destroyed = true;
    }
}

impl Drop for AmqpTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}
