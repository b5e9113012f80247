//! Mock implementations for testing
//!
//! Provides a manual clock, recording callbacks, and mock credentials, I/O,
//! AMQP primitives and MQTT client so both transports can be driven tick by
//! tick without a network. Every mock is a cheap handle over shared state:
//! clone it before handing it to a transport and inspect the clone afterwards.

use crate::auth::{Authorization, CredentialType, SasTokenStatus};
use crate::callbacks::{
    ConnectionStatus, ConnectionStatusReason, DeviceIdentity, MethodHandle, MethodRequest,
    TransportCallbacks, TwinUpdateState,
};
use crate::clock::Clock;
use crate::error::{TransportError, TransportResult};
use crate::message::{ConfirmationResult, DispositionToken, Message, OutboundMessage};
use crate::options::{OptionValue, ProxyOptions};
use crate::transport::amqp::{
    AmqpConnection, AmqpConnectionConfig, AmqpConnectionEvent, AmqpConnectionFactory,
    AmqpConnectionState, AmqpDevice, AmqpDeviceConfig, AmqpDeviceEvent, AmqpDeviceOption,
    AmqpDisposition, DeviceState,
};
use crate::transport::mqtt::{ConnackCode, MqttClient, MqttConnectOptions, MqttEvent};
use crate::transport::{IoTransport, IoTransportFactory, SendStatus};
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// Everything the transport reported through [`TransportCallbacks`]
#[derive(Default)]
pub struct CallbackLog {
    pub messages: Vec<(DeviceIdentity, Message)>,
    pub input_messages: Vec<(DeviceIdentity, Message)>,
    pub statuses: Vec<(DeviceIdentity, ConnectionStatus, ConnectionStatusReason)>,
    /// One entry per completed message
    pub completions: Vec<(DeviceIdentity, ConfirmationResult)>,
    pub reported: Vec<(DeviceIdentity, u32, i32)>,
    pub twin_updates: Vec<(DeviceIdentity, TwinUpdateState, Vec<u8>)>,
    pub methods: Vec<(DeviceIdentity, MethodRequest)>,
}

/// [`TransportCallbacks`] that records every call
#[derive(Default)]
pub struct RecordingCallbacks {
    log: Mutex<CallbackLog>,
    decline_messages: AtomicBool,
    decline_methods: AtomicBool,
    product_info: Option<String>,
    model_id: Option<String>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product_info<S: Into<String>>(mut self, product_info: S) -> Self {
        self.product_info = Some(product_info.into());
        self
    }

    pub fn with_model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Make `message_received` and `input_message_received` return `false`
    pub fn decline_messages(&self, decline: bool) {
        self.decline_messages.store(decline, Ordering::SeqCst);
    }

    pub fn decline_methods(&self, decline: bool) {
        self.decline_methods.store(decline, Ordering::SeqCst);
    }

    pub fn log(&self) -> MutexGuard<'_, CallbackLog> {
        lock(&self.log)
    }

    pub fn statuses(&self) -> Vec<(ConnectionStatus, ConnectionStatusReason)> {
        self.log()
            .statuses
            .iter()
            .map(|(_, status, reason)| (*status, *reason))
            .collect()
    }

    pub fn completions(&self) -> Vec<ConfirmationResult> {
        self.log().completions.iter().map(|(_, r)| *r).collect()
    }

    pub fn reported(&self) -> Vec<(u32, i32)> {
        self.log()
            .reported
            .iter()
            .map(|(_, item, status)| (*item, *status))
            .collect()
    }

    pub fn twin_updates(&self) -> Vec<(TwinUpdateState, Vec<u8>)> {
        self.log()
            .twin_updates
            .iter()
            .map(|(_, state, payload)| (*state, payload.clone()))
            .collect()
    }

    pub fn method_names(&self) -> Vec<String> {
        self.log()
            .methods
            .iter()
            .map(|(_, request)| request.name.clone())
            .collect()
    }

    pub fn take_messages(&self) -> Vec<Message> {
        self.log().messages.drain(..).map(|(_, m)| m).collect()
    }

    pub fn take_input_messages(&self) -> Vec<Message> {
        self.log().input_messages.drain(..).map(|(_, m)| m).collect()
    }
}

impl TransportCallbacks for RecordingCallbacks {
    fn message_received(&self, device: &DeviceIdentity, message: Message) -> bool {
        if self.decline_messages.load(Ordering::SeqCst) {
            return false;
        }
        self.log().messages.push((device.clone(), message));
        true
    }

    fn input_message_received(&self, device: &DeviceIdentity, message: Message) -> bool {
        if self.decline_messages.load(Ordering::SeqCst) {
            return false;
        }
        self.log().input_messages.push((device.clone(), message));
        true
    }

    fn connection_status_changed(
        &self,
        device: &DeviceIdentity,
        status: ConnectionStatus,
        reason: ConnectionStatusReason,
    ) {
        self.log().statuses.push((device.clone(), status, reason));
    }

    fn send_complete(
        &self,
        device: &DeviceIdentity,
        messages: Vec<OutboundMessage>,
        result: ConfirmationResult,
    ) {
        {
            let mut log = self.log();
            for _ in &messages {
                log.completions.push((device.clone(), result));
            }
        }
        for message in messages {
            message.complete(result);
        }
    }

    fn twin_reported_state_complete(&self, device: &DeviceIdentity, item_id: u32, status_code: i32) {
        self.log().reported.push((device.clone(), item_id, status_code));
    }

    fn twin_retrieve_properties_complete(
        &self,
        device: &DeviceIdentity,
        state: TwinUpdateState,
        payload: &[u8],
    ) {
        self.log()
            .twin_updates
            .push((device.clone(), state, payload.to_vec()));
    }

    fn device_method(&self, device: &DeviceIdentity, request: MethodRequest) -> bool {
        self.log().methods.push((device.clone(), request));
        !self.decline_methods.load(Ordering::SeqCst)
    }

    fn product_info(&self) -> Option<String> {
        self.product_info.clone()
    }

    fn model_id(&self) -> Option<String> {
        self.model_id.clone()
    }
}

/// Credentials with a configurable type, token status and failure injection
#[derive(Debug)]
pub struct MockAuthorization {
    credential_type: CredentialType,
    token_status: Mutex<SasTokenStatus>,
    token_expiry: Duration,
    fail_token: AtomicBool,
    device_key: Option<String>,
    requested_scopes: Mutex<Vec<Option<String>>>,
    certificates_set: Mutex<usize>,
}

impl MockAuthorization {
    pub fn new(credential_type: CredentialType) -> Self {
        Self {
            credential_type,
            token_status: Mutex::new(SasTokenStatus::Valid),
            token_expiry: Duration::from_secs(3600),
            fail_token: AtomicBool::new(false),
            device_key: None,
            requested_scopes: Mutex::new(Vec::new()),
            certificates_set: Mutex::new(0),
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    pub fn with_device_key<S: Into<String>>(mut self, key: S) -> Self {
        self.device_key = Some(key.into());
        self
    }

    pub fn set_token_status(&self, status: SasTokenStatus) {
        *lock(&self.token_status) = status;
    }

    pub fn fail_token_generation(&self, fail: bool) {
        self.fail_token.store(fail, Ordering::SeqCst);
    }

    pub fn requested_scopes(&self) -> Vec<Option<String>> {
        lock(&self.requested_scopes).clone()
    }

    pub fn certificates_set(&self) -> usize {
        *lock(&self.certificates_set)
    }
}

impl Authorization for MockAuthorization {
    fn credential_type(&self) -> CredentialType {
        self.credential_type
    }

    fn sas_token(&self, scope: Option<&str>, _key_name: Option<&str>) -> TransportResult<String> {
        lock(&self.requested_scopes).push(scope.map(str::to_string));
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(TransportError::operation_failed("mock token generation failure"));
        }
        Ok(format!(
            "SharedAccessSignature sr={}&sig=mock&se=3600",
            scope.unwrap_or("user-supplied")
        ))
    }

    fn sas_token_status(&self) -> SasTokenStatus {
        *lock(&self.token_status)
    }

    fn sas_token_expiry(&self) -> Duration {
        self.token_expiry
    }

    fn set_x509_certificate(&self, io: &mut dyn IoTransport) -> TransportResult<()> {
        *lock(&self.certificates_set) += 1;
        io.set_option(
            crate::options::OPTION_X509_ECC_CERT,
            &OptionValue::Text("mock-certificate".to_string()),
        )
    }

    fn device_key(&self) -> Option<String> {
        self.device_key.clone()
    }
}

#[derive(Debug, Default)]
struct IoLog {
    created: Vec<String>,
    applied: Vec<(String, OptionValue)>,
    fail_create: bool,
    fail_options: bool,
}

/// In-memory I/O; every option it receives is logged in its factory
pub struct MockIo {
    hostname: String,
    proxy: Option<ProxyOptions>,
    options: BTreeMap<String, OptionValue>,
    log: Arc<Mutex<IoLog>>,
}

impl IoTransport for MockIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> TransportResult<()> {
        let mut log = lock(&self.log);
        if log.fail_options {
            return Err(TransportError::operation_failed(format!(
                "mock I/O refused option '{name}'"
            )));
        }
        log.applied.push((name.to_string(), value.clone()));
        self.options.insert(name.to_string(), value.clone());
        Ok(())
    }

    fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn proxy(&self) -> Option<&ProxyOptions> {
        self.proxy.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockIoFactory {
    log: Arc<Mutex<IoLog>>,
}

impl MockIoFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        lock(&self.log).fail_create = fail;
    }

    pub fn fail_options(&self, fail: bool) {
        lock(&self.log).fail_options = fail;
    }

    /// Hostnames of every I/O created so far
    pub fn created(&self) -> Vec<String> {
        lock(&self.log).created.clone()
    }

    /// Every option applied to any I/O, in order
    pub fn applied_options(&self) -> Vec<(String, OptionValue)> {
        lock(&self.log).applied.clone()
    }
}

impl IoTransportFactory for MockIoFactory {
    fn create(
        &self,
        hostname: &str,
        proxy: Option<&ProxyOptions>,
    ) -> TransportResult<Box<dyn IoTransport>> {
        let mut log = lock(&self.log);
        if log.fail_create {
            return Err(TransportError::operation_failed("mock I/O creation failure"));
        }
        log.created.push(hostname.to_string());
        Ok(Box::new(MockIo {
            hostname: hostname.to_string(),
            proxy: proxy.cloned(),
            options: BTreeMap::new(),
            log: Arc::clone(&self.log),
        }))
    }
}

#[derive(Debug, Default)]
struct ConnectionScript {
    events: VecDeque<AmqpConnectionEvent>,
    state: Option<AmqpConnectionState>,
    logging: Vec<bool>,
    has_cbs: bool,
    auto_open: bool,
}

/// Scripted AMQP connection; opens on its first tick unless told otherwise
#[derive(Debug, Clone)]
pub struct MockAmqpConnection {
    script: Arc<Mutex<ConnectionScript>>,
}

impl MockAmqpConnection {
    fn new(has_cbs: bool, auto_open: bool) -> Self {
        Self {
            script: Arc::new(Mutex::new(ConnectionScript {
                has_cbs,
                auto_open,
                ..Default::default()
            })),
        }
    }

    /// Report a transition on the next tick
    pub fn transition(&self, current: AmqpConnectionState) {
        let mut script = lock(&self.script);
        let previous = script.state.unwrap_or(AmqpConnectionState::Closed);
        script.state = Some(current);
        script
            .events
            .push_back(AmqpConnectionEvent::StateChanged { previous, current });
    }

    pub fn logging_calls(&self) -> Vec<bool> {
        lock(&self.script).logging.clone()
    }
}

impl AmqpConnection for MockAmqpConnection {
    fn do_work(&mut self) -> Vec<AmqpConnectionEvent> {
        let open = {
            let script = lock(&self.script);
            script.auto_open && script.state.is_none()
        };
        if open {
            self.transition(AmqpConnectionState::Opened);
        }
        lock(&self.script).events.drain(..).collect()
    }

    fn set_logging(&mut self, is_trace_on: bool) -> TransportResult<()> {
        lock(&self.script).logging.push(is_trace_on);
        Ok(())
    }

    fn has_session(&self) -> bool {
        true
    }

    fn has_cbs(&self) -> bool {
        lock(&self.script).has_cbs
    }
}

/// Calls received by one [`MockAmqpDevice`]
#[derive(Debug, Default)]
pub struct AmqpDeviceLog {
    pub starts: usize,
    pub stops: usize,
    pub delayed_stops: usize,
    pub sent: Vec<(u64, Bytes)>,
    pub message_subscribed: bool,
    pub twin_subscribed: bool,
    pub twin_gets: Vec<String>,
    pub twin_reports: Vec<(String, Bytes)>,
    pub methods_subscribes: usize,
    pub methods_unsubscribes: usize,
    pub method_responses: Vec<(String, Vec<u8>, i32)>,
    pub dispositions: Vec<(DispositionToken, AmqpDisposition)>,
    pub options: Vec<AmqpDeviceOption>,
}

struct DeviceScript {
    state: DeviceState,
    events: VecDeque<AmqpDeviceEvent>,
    next_tag: u64,
    auto_start: bool,
    fail_send: bool,
    fail_start: bool,
    send_status: SendStatus,
}

/// Scripted AMQP device; starts as soon as it is asked to unless told otherwise
#[derive(Clone)]
pub struct MockAmqpDevice {
    config: Arc<AmqpDeviceConfig>,
    log: Arc<Mutex<AmqpDeviceLog>>,
    script: Arc<Mutex<DeviceScript>>,
}

impl MockAmqpDevice {
    fn new(config: AmqpDeviceConfig, auto_start: bool) -> Self {
        Self {
            config: Arc::new(config),
            log: Arc::new(Mutex::new(AmqpDeviceLog::default())),
            script: Arc::new(Mutex::new(DeviceScript {
                state: DeviceState::Stopped,
                events: VecDeque::new(),
                next_tag: 1,
                auto_start,
                fail_send: false,
                fail_start: false,
                send_status: SendStatus::Idle,
            })),
        }
    }

    pub fn config(&self) -> &AmqpDeviceConfig {
        &self.config
    }

    pub fn log(&self) -> MutexGuard<'_, AmqpDeviceLog> {
        lock(&self.log)
    }

    pub fn state(&self) -> DeviceState {
        lock(&self.script).state
    }

    /// Report a state transition on the next tick
    pub fn transition(&self, current: DeviceState) {
        let mut script = lock(&self.script);
        let previous = script.state;
        script.state = current;
        script
            .events
            .push_back(AmqpDeviceEvent::StateChanged { previous, current });
    }

    /// Deliver an arbitrary event on the next tick
    pub fn push_event(&self, event: AmqpDeviceEvent) {
        lock(&self.script).events.push_back(event);
    }

    pub fn fail_send(&self, fail: bool) {
        lock(&self.script).fail_send = fail;
    }

    pub fn fail_start(&self, fail: bool) {
        lock(&self.script).fail_start = fail;
    }

    pub fn set_send_status(&self, status: SendStatus) {
        lock(&self.script).send_status = status;
    }
}

impl AmqpDevice for MockAmqpDevice {
    fn start_async(&mut self, _connection: &dyn AmqpConnection) -> TransportResult<()> {
        let (fail, auto_start) = {
            let script = lock(&self.script);
            (script.fail_start, script.auto_start)
        };
        if fail {
            return Err(TransportError::operation_failed("mock device start failure"));
        }
        self.log().starts += 1;
        if auto_start {
            self.transition(DeviceState::Started);
        }
        Ok(())
    }

    fn stop(&mut self) -> TransportResult<()> {
        self.log().stops += 1;
        if self.state() != DeviceState::Stopped {
            self.transition(DeviceState::Stopped);
        }
        Ok(())
    }

    fn delayed_stop(&mut self, _delay: Duration) -> TransportResult<()> {
        self.log().delayed_stops += 1;
        self.transition(DeviceState::Stopped);
        Ok(())
    }

    fn do_work(&mut self) -> Vec<AmqpDeviceEvent> {
        lock(&self.script).events.drain(..).collect()
    }

    fn send_event_async(&mut self, message: &Message) -> TransportResult<u64> {
        let mut script = lock(&self.script);
        if script.fail_send {
            return Err(TransportError::operation_failed("mock send failure"));
        }
        let tag = script.next_tag;
        script.next_tag += 1;
        self.log().sent.push((tag, message.body().clone()));
        Ok(tag)
    }

    fn send_status(&self) -> TransportResult<SendStatus> {
        Ok(lock(&self.script).send_status)
    }

    fn set_option(&mut self, option: AmqpDeviceOption) -> TransportResult<()> {
        self.log().options.push(option);
        Ok(())
    }

    fn subscribe_message(&mut self) -> TransportResult<()> {
        self.log().message_subscribed = true;
        Ok(())
    }

    fn unsubscribe_message(&mut self) -> TransportResult<()> {
        self.log().message_subscribed = false;
        Ok(())
    }

    fn send_message_disposition(
        &mut self,
        token: &DispositionToken,
        disposition: AmqpDisposition,
    ) -> TransportResult<()> {
        self.log().dispositions.push((token.clone(), disposition));
        Ok(())
    }

    fn subscribe_for_twin_updates(&mut self) -> TransportResult<()> {
        self.log().twin_subscribed = true;
        Ok(())
    }

    fn unsubscribe_for_twin_updates(&mut self) -> TransportResult<()> {
        self.log().twin_subscribed = false;
        Ok(())
    }

    fn get_twin_async(&mut self, correlation_id: &str) -> TransportResult<()> {
        self.log().twin_gets.push(correlation_id.to_string());
        Ok(())
    }

    fn send_twin_update_async(&mut self, correlation_id: &str, data: &Bytes) -> TransportResult<()> {
        self.log()
            .twin_reports
            .push((correlation_id.to_string(), data.clone()));
        Ok(())
    }

    fn methods_subscribe(&mut self, _connection: &dyn AmqpConnection) -> TransportResult<()> {
        self.log().methods_subscribes += 1;
        Ok(())
    }

    fn methods_unsubscribe(&mut self) {
        self.log().methods_unsubscribes += 1;
    }

    fn methods_respond(
        &mut self,
        handle: &MethodHandle,
        payload: &[u8],
        status: i32,
    ) -> TransportResult<()> {
        self.log().method_responses.push((
            handle.request_id().to_string(),
            payload.to_vec(),
            status,
        ));
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    connection_configs: Vec<AmqpConnectionConfig>,
    connections: Vec<MockAmqpConnection>,
    devices: Vec<MockAmqpDevice>,
    fail_connection: bool,
    fail_device: bool,
    manual_open: bool,
    manual_start: bool,
}

/// Creates scripted connections and devices and keeps a handle to each
#[derive(Clone, Default)]
pub struct MockAmqpConnectionFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockAmqpConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections stay closed until [`MockAmqpConnection::transition`]
    pub fn with_manual_open(self) -> Self {
        lock(&self.state).manual_open = true;
        self
    }

    /// Devices stay in `Stopped` until [`MockAmqpDevice::transition`]
    pub fn with_manual_start(self) -> Self {
        lock(&self.state).manual_start = true;
        self
    }

    pub fn fail_connection(&self, fail: bool) {
        lock(&self.state).fail_connection = fail;
    }

    pub fn fail_device(&self, fail: bool) {
        lock(&self.state).fail_device = fail;
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connection_configs(&self) -> Vec<AmqpConnectionConfig> {
        lock(&self.state).connection_configs.clone()
    }

    /// Most recently created connection
    pub fn connection(&self) -> Option<MockAmqpConnection> {
        lock(&self.state).connections.last().cloned()
    }

    pub fn device(&self, device_id: &str) -> Option<MockAmqpDevice> {
        lock(&self.state)
            .devices
            .iter()
            .rev()
            .find(|d| d.config.device_id == device_id)
            .cloned()
    }
}

impl AmqpConnectionFactory for MockAmqpConnectionFactory {
    fn create_connection(
        &mut self,
        config: &AmqpConnectionConfig,
        _io: &mut dyn IoTransport,
    ) -> TransportResult<Box<dyn AmqpConnection>> {
        let mut state = lock(&self.state);
        if state.fail_connection {
            return Err(TransportError::operation_failed("mock connection failure"));
        }
        let connection = MockAmqpConnection::new(config.create_cbs_connection, !state.manual_open);
        state.connection_configs.push(config.clone());
        state.connections.push(connection.clone());
        Ok(Box::new(connection))
    }

    fn create_device(&mut self, config: &AmqpDeviceConfig) -> TransportResult<Box<dyn AmqpDevice>> {
        let mut state = lock(&self.state);
        if state.fail_device {
            return Err(TransportError::operation_failed("mock device creation failure"));
        }
        let device = MockAmqpDevice::new(config.clone(), !state.manual_start);
        state.devices.push(device.clone());
        Ok(Box::new(device))
    }
}

/// Requests received by a [`MockMqttClient`]
#[derive(Debug, Default)]
pub struct MqttClientLog {
    pub connects: Vec<MqttConnectOptions>,
    pub disconnects: usize,
    pub subscribes: Vec<(u16, Vec<(String, QoS)>)>,
    pub unsubscribes: Vec<(u16, Vec<String>)>,
    pub publishes: Vec<(u16, String, QoS, Vec<u8>)>,
    pub acks: Vec<(u16, QoS)>,
    pub trace: Option<(bool, bool)>,
}

#[derive(Debug)]
struct MqttScript {
    events: VecDeque<MqttEvent>,
    connack: Option<ConnackCode>,
    auto_suback: bool,
    auto_puback: bool,
    fail_connect: bool,
    fail_publish: bool,
    fail_subscribe: bool,
}

impl Default for MqttScript {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            connack: Some(ConnackCode::Accepted),
            auto_suback: true,
            auto_puback: true,
            fail_connect: false,
            fail_publish: false,
            fail_subscribe: false,
        }
    }
}

/// Scripted [`MqttClient`].
///
/// By default a CONNECT is answered with an accepted CONNACK, a SUBSCRIBE
/// with a SUBACK and a QoS 1 PUBLISH with a PUBACK, each on the next tick.
#[derive(Debug, Clone, Default)]
pub struct MockMqttClient {
    log: Arc<Mutex<MqttClientLog>>,
    script: Arc<Mutex<MqttScript>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, MqttClientLog> {
        lock(&self.log)
    }

    /// Answer CONNECT with `code`; `None` leaves it unanswered
    pub fn set_connack(&self, code: Option<ConnackCode>) {
        lock(&self.script).connack = code;
    }

    pub fn set_auto_suback(&self, on: bool) {
        lock(&self.script).auto_suback = on;
    }

    pub fn set_auto_puback(&self, on: bool) {
        lock(&self.script).auto_puback = on;
    }

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.script).fail_connect = fail;
    }

    pub fn fail_publish(&self, fail: bool) {
        lock(&self.script).fail_publish = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        lock(&self.script).fail_subscribe = fail;
    }

    /// Deliver `event` on the next tick
    pub fn push_event(&self, event: MqttEvent) {
        lock(&self.script).events.push_back(event);
    }

    /// Deliver an inbound publish on the next tick
    pub fn receive(&self, topic: &str, payload: &[u8], qos: QoS, packet_id: u16) {
        self.push_event(MqttEvent::Publish {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
            qos,
            packet_id,
        });
    }

    pub fn publishes(&self) -> Vec<(u16, String, QoS, Vec<u8>)> {
        self.log().publishes.clone()
    }

    /// Topics of every publish starting with `prefix`
    pub fn published_topics(&self, prefix: &str) -> Vec<String> {
        self.log()
            .publishes
            .iter()
            .filter(|(_, topic, _, _)| topic.starts_with(prefix))
            .map(|(_, topic, _, _)| topic.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.log().connects.len()
    }
}

impl MqttClient for MockMqttClient {
    fn connect(&mut self, _io: &mut dyn IoTransport, options: &MqttConnectOptions) -> TransportResult<()> {
        let mut script = lock(&self.script);
        if script.fail_connect {
            return Err(TransportError::operation_failed("mock connect failure"));
        }
        self.log().connects.push(options.clone());
        if let Some(code) = script.connack {
            script.events.push_back(MqttEvent::ConnAck { code });
        }
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.log().disconnects += 1;
        lock(&self.script).events.push_back(MqttEvent::Disconnected);
        Ok(())
    }

    fn subscribe(&mut self, packet_id: u16, topics: &[(String, QoS)]) -> TransportResult<()> {
        let mut script = lock(&self.script);
        if script.fail_subscribe {
            return Err(TransportError::operation_failed("mock subscribe failure"));
        }
        self.log().subscribes.push((packet_id, topics.to_vec()));
        if script.auto_suback {
            script.events.push_back(MqttEvent::SubAck {
                packet_id,
                failures: 0,
            });
        }
        Ok(())
    }

    fn unsubscribe(&mut self, packet_id: u16, topics: &[String]) -> TransportResult<()> {
        self.log().unsubscribes.push((packet_id, topics.to_vec()));
        lock(&self.script)
            .events
            .push_back(MqttEvent::UnsubAck { packet_id });
        Ok(())
    }

    fn publish(&mut self, packet_id: u16, topic: &str, qos: QoS, payload: &[u8]) -> TransportResult<()> {
        let mut script = lock(&self.script);
        if script.fail_publish {
            return Err(TransportError::operation_failed("mock publish failure"));
        }
        self.log()
            .publishes
            .push((packet_id, topic.to_string(), qos, payload.to_vec()));
        if script.auto_puback && qos != QoS::AtMostOnce {
            script.events.push_back(MqttEvent::PublishAck { packet_id });
        }
        Ok(())
    }

    fn acknowledge(&mut self, packet_id: u16, qos: QoS) -> TransportResult<()> {
        self.log().acks.push((packet_id, qos));
        Ok(())
    }

    fn set_trace(&mut self, trace: bool, raw: bool) {
        self.log().trace = Some((trace, raw));
    }

    fn do_work(&mut self) -> Vec<MqttEvent> {
        lock(&self.script).events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
    }

    #[test]
    fn test_mock_client_answers_on_next_tick() {
        let mut client = MockMqttClient::new();
        let handle = client.clone();
        client
            .publish(7, "devices/d1/messages/events/", QoS::AtLeastOnce, b"x")
            .expect("publish");
        assert_eq!(handle.publishes().len(), 1);
        assert_eq!(client.do_work(), vec![MqttEvent::PublishAck { packet_id: 7 }]);
        assert!(client.do_work().is_empty());
    }

    #[test]
    fn test_recording_callbacks_complete_messages() {
        let callbacks = RecordingCallbacks::new();
        let fired = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&fired);
        let message = OutboundMessage::with_callback(Message::from_string("t"), move |r| {
            *lock(&seen) = Some(r);
        });
        callbacks.send_complete(&DeviceIdentity::new("d1"), vec![message], ConfirmationResult::Ok);
        assert_eq!(*lock(&fired), Some(ConfirmationResult::Ok));
        assert_eq!(callbacks.completions(), vec![ConfirmationResult::Ok]);
    }
}
