//! MQTT connection manager
//!
//! One MQTT client serving one device or module. Progress is tracked by two
//! orthogonal state machines: [`ClientStatus`] follows the connection itself
//! and [`PacketState`] sequences CONNECT, SUBSCRIBE and PUBLISH once it is up.
//! Everything happens from [`MqttTransport::do_work`].

use super::client::{ConnackCode, MqttClient, MqttClientError, MqttConnectOptions, MqttEvent};
use super::connection::{
    default_product_info, ClientStatus, PacketIdGenerator, PacketState, SubscriptionTopic,
    TopicBuilder, TopicSet, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MQTT_PORT,
    DISCONNECT_PUMP_LIMIT, SAS_REFRESH_MULTIPLIER,
};
use super::message_handler::{InboundRoute, MessageHandler};
use crate::auth::{Authorization, CredentialType, SasTokenStatus};
use crate::callbacks::{
    ConnectionStatus, ConnectionStatusReason, DeviceIdentity, MethodHandle, MethodRequest,
    TransportCallbacks, TwinGetCallback, TwinUpdateState,
};
use crate::clock::Clock;
use crate::device::{DeviceConfig, DeviceHandle};
use crate::error::{TransportError, TransportResult};
use crate::message::{
    ConfirmationResult, DispositionContext, DispositionToken, Message, MessageDisposition,
    OutboundQueue,
};
use crate::options::{IoOptions, ProxyOptions, TransportOption};
use crate::retry::{RetryAction, RetryController, RetryOption, RetryPolicy};
use crate::telemetry::TelemetryQueue;
use crate::transport::{
    IoTransport, IoTransportFactory, ProcessItemResult, SendStatus, TransportConfig, TwinReport,
};
use crate::twin::{TwinRequest, TwinSyncQueue};
use bytes::Bytes;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Longest device id the hub accepts
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// The device served by the transport
struct MqttDevice {
    handle: DeviceHandle,
    identity: DeviceIdentity,
    authorization: Arc<dyn Authorization>,
    telemetry: TelemetryQueue<u16>,
    twin: TwinSyncQueue<u16>,
}

pub struct MqttTransport {
    hostname: String,
    iothub_fqdn: String,
    port: u16,
    device_id: String,
    module_id: Option<String>,
    device_key: Option<String>,
    topics: TopicBuilder,
    client: Box<dyn MqttClient>,
    io: Option<Box<dyn IoTransport>>,
    io_options: IoOptions,
    proxy: Option<ProxyOptions>,
    io_factory: Arc<dyn IoTransportFactory>,
    callbacks: Arc<dyn TransportCallbacks>,
    clock: Arc<dyn Clock>,
    device: Option<MqttDevice>,
    status: ClientStatus,
    packet_state: PacketState,
    packet_ids: PacketIdGenerator,
    subscriptions: TopicSet,
    retry: RetryController,
    is_recoverable_error: bool,
    conn_attempted: bool,
    connect_fail_count: u32,
    retry_expired_reported: bool,
    mqtt_connect_time: Option<Instant>,
    keep_alive_secs: u16,
    connect_timeout: Duration,
    auto_url_encode_decode: bool,
    log_trace: bool,
    raw_trace: bool,
    twin_resp_packet_id: Option<u16>,
    twin_resp_sub_recv: bool,
    device_twin_get_sent: bool,
    destroyed: bool,
}

impl MqttTransport {
    pub fn new(
        config: &TransportConfig,
        client: Box<dyn MqttClient>,
        io_factory: Arc<dyn IoTransportFactory>,
        callbacks: Arc<dyn TransportCallbacks>,
        clock: Arc<dyn Clock>,
    ) -> TransportResult<Self> {
        config.validate()?;
        if config.device_key.is_some() && config.device_sas_token.is_some() {
            return Err(TransportError::invalid_argument(
                "a device cannot use both a key and a SAS token",
            ));
        }
        if config.device_id.len() > MAX_DEVICE_ID_LEN {
            return Err(TransportError::invalid_argument(format!(
                "device id is longer than {MAX_DEVICE_ID_LEN} bytes"
            )));
        }

        let hostname = config.hostname();
        let iothub_fqdn = format!("{}.{}", config.iothub_name, config.iothub_suffix);
        info!(%hostname, device_id = %config.device_id, "Creating MQTT transport");

        Ok(Self {
            hostname,
            iothub_fqdn,
            port: DEFAULT_MQTT_PORT,
            device_id: config.device_id.clone(),
            module_id: config.module_id.clone(),
            device_key: config.device_key.clone(),
            topics: TopicBuilder::new(config.device_id.clone(), config.module_id.clone()),
            client,
            io: None,
            io_options: IoOptions::new(),
            proxy: None,
            io_factory,
            callbacks,
            clock,
            device: None,
            status: ClientStatus::NotConnected,
            packet_state: PacketState::Disconnect,
            packet_ids: PacketIdGenerator::new(),
            subscriptions: TopicSet::new(),
            retry: RetryController::new(RetryPolicy::default(), 0),
            is_recoverable_error: true,
            conn_attempted: false,
            connect_fail_count: 0,
            retry_expired_reported: false,
            mqtt_connect_time: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_url_encode_decode: false,
            log_trace: false,
            raw_trace: false,
            twin_resp_packet_id: None,
            twin_resp_sub_recv: false,
            device_twin_get_sent: false,
            destroyed: false,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client_status(&self) -> ClientStatus {
        self.status
    }

    pub fn packet_state(&self) -> PacketState {
        self.packet_state
    }

    pub fn subscriptions(&self) -> TopicSet {
        self.subscriptions
    }

    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive_secs
    }

    pub fn is_registered(&self) -> bool {
        self.device.is_some()
    }

    pub fn connect_fail_count(&self) -> u32 {
        self.connect_fail_count
    }

    /// Attach the device the transport was created for
    pub fn register(
        &mut self,
        config: DeviceConfig,
        waiting_to_send: OutboundQueue,
    ) -> TransportResult<DeviceHandle> {
        if config.device_key.is_some() && config.device_sas_token.is_some() {
            error!(device_id = %config.device_id, "Device has both a key and a SAS token");
            return Err(TransportError::invalid_argument(
                "a device cannot use both a key and a SAS token",
            ));
        }
        if config.device_id != self.device_id {
            error!(device_id = %config.device_id, expected = %self.device_id, "Device id does not match the transport");
            return Err(TransportError::invalid_argument(format!(
                "transport was created for device '{}'",
                self.device_id
            )));
        }
        if config.module_id != self.module_id {
            error!(device_id = %config.device_id, "Module id does not match the transport");
            return Err(TransportError::invalid_argument(
                "module id does not match the transport",
            ));
        }
        if config.authorization.credential_type() == CredentialType::DeviceKey {
            if let Some(key) = &config.device_key {
                if self.device_key.as_ref() != Some(key) {
                    error!(device_id = %config.device_id, "Device key does not match the transport");
                    return Err(TransportError::invalid_argument(
                        "device key does not match the transport",
                    ));
                }
            }
        }
        if self.device.is_some() {
            error!(device_id = %config.device_id, "Device is already registered");
            return Err(TransportError::invalid_argument(format!(
                "device '{}' is already registered",
                config.device_id
            )));
        }

        let handle = DeviceHandle::next();
        let identity = config.identity();
        info!(device = %identity, %handle, credential = ?config.authorization.credential_type(), "Device registered");
        self.device = Some(MqttDevice {
            handle,
            identity,
            authorization: config.authorization,
            telemetry: TelemetryQueue::new(waiting_to_send),
            twin: TwinSyncQueue::new(),
        });
        Ok(handle)
    }

    /// Detach the device, settling everything it still owns
    pub fn unregister(&mut self, handle: DeviceHandle) {
        if self.device_for(handle).is_err() {
            warn!(%handle, "Unregister called for an unknown device");
            return;
        }
        self.disconnect_from_client();
        if let Some(device) = self.device.take() {
            info!(device = %device.identity, "Unregistering device");
            self.settle(device);
        }
    }

    fn device_for(&self, handle: DeviceHandle) -> TransportResult<&MqttDevice> {
        self.device
            .as_ref()
            .filter(|device| device.handle == handle)
            .ok_or_else(|| TransportError::invalid_argument(format!("unknown device handle {handle}")))
    }

    fn device_mut_for(&mut self, handle: DeviceHandle) -> TransportResult<&mut MqttDevice> {
        self.device
            .as_mut()
            .filter(|device| device.handle == handle)
            .ok_or_else(|| TransportError::invalid_argument(format!("unknown device handle {handle}")))
    }

    fn settle(&self, mut device: MqttDevice) {
        let aborted = device.telemetry.abort_all();
        if !aborted.is_empty() {
            self.callbacks.send_complete(
                &device.identity,
                aborted,
                ConfirmationResult::BecauseDestroy,
            );
        }
        for request in device.twin.abort_all() {
            request.expire(&device.identity, self.callbacks.as_ref());
        }
    }

    fn change_state_to_subscribe_if_allowed(&mut self) {
        if self.packet_state.allows_subscribe() {
            self.packet_state = PacketState::Subscribe;
        }
    }

    fn activate_topic(&mut self, topic: SubscriptionTopic) {
        self.subscriptions.activate(topic);
        self.change_state_to_subscribe_if_allowed();
    }

    fn send_unsubscribe(&mut self, topic: SubscriptionTopic) {
        self.subscriptions.deactivate(topic);
        let Some(filter) = self.topics.subscription_topic(topic) else {
            return;
        };
        let packet_id = self.packet_ids.next_id();
        if let Err(e) = self.client.unsubscribe(packet_id, &[filter]) {
            error!(?topic, error = %e.sanitized(), "Failed sending UNSUBSCRIBE");
        }
    }

    /// Cloud-to-device messages
    pub fn subscribe(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_for(handle)?;
        self.activate_topic(SubscriptionTopic::Messages);
        Ok(())
    }

    pub fn unsubscribe(&mut self, handle: DeviceHandle) {
        match self.device_for(handle) {
            Ok(_) => self.send_unsubscribe(SubscriptionTopic::Messages),
            Err(e) => warn!(error = %e, "Cannot unsubscribe from messages"),
        }
    }

    pub fn subscribe_device_twin(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_for(handle)?;
        self.activate_topic(SubscriptionTopic::TwinResponses);
        Ok(())
    }

    /// Twin topics are only forgotten; no UNSUBSCRIBE goes out
    pub fn unsubscribe_device_twin(&mut self, handle: DeviceHandle) {
        match self.device_for(handle) {
            Ok(_) => {
                self.subscriptions.deactivate(SubscriptionTopic::TwinResponses);
                self.subscriptions.deactivate(SubscriptionTopic::DesiredProperties);
            }
            Err(e) => warn!(error = %e, "Cannot unsubscribe from twin updates"),
        }
    }

    /// Queue a full twin get; `callback` fires exactly once
    pub fn get_twin_async(
        &mut self,
        handle: DeviceHandle,
        callback: TwinGetCallback,
    ) -> TransportResult<()> {
        let now = self.clock.now();
        self.device_mut_for(handle)?.twin.request_get(now, callback);
        Ok(())
    }

    pub fn subscribe_device_method(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_for(handle)?;
        self.activate_topic(SubscriptionTopic::Methods);
        Ok(())
    }

    pub fn unsubscribe_device_method(&mut self, handle: DeviceHandle) {
        match self.device_for(handle) {
            Ok(_) => self.send_unsubscribe(SubscriptionTopic::Methods),
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
        self.device_for(handle)?;
        let topic = TopicBuilder::method_response_topic(status, method.request_id());
        let packet_id = self.packet_ids.next_id();
        debug!(request_id = method.request_id(), status, "Sending method response");
        self.client
            .publish(packet_id, &topic, QoS::AtMostOnce, payload)
    }

    pub fn subscribe_input_queue(&mut self, handle: DeviceHandle) -> TransportResult<()> {
        self.device_for(handle)?;
        if self.topics.module_id().is_none() {
            error!("Input queues are only available to modules");
            return Err(TransportError::invalid_argument(
                "input queues require a module id",
            ));
        }
        self.activate_topic(SubscriptionTopic::InputQueue);
        Ok(())
    }

    pub fn unsubscribe_input_queue(&mut self, handle: DeviceHandle) {
        match self.device_for(handle) {
            Ok(_) => self.send_unsubscribe(SubscriptionTopic::InputQueue),
            Err(e) => warn!(error = %e, "Cannot unsubscribe from the input queue"),
        }
    }

    pub fn send_status(&self, handle: DeviceHandle) -> TransportResult<SendStatus> {
        let device = self.device_for(handle)?;
        Ok(if device.telemetry.is_idle() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        })
    }

    /// Send a reported-properties patch once the twin responses are subscribed
    pub fn process_item(&mut self, handle: DeviceHandle, report: TwinReport) -> ProcessItemResult {
        if let Err(e) = self.device_for(handle) {
            error!(error = %e, item_id = report.item_id, "Cannot send reported properties");
            return ProcessItemResult::Error;
        }
        if self.packet_state != PacketState::Publish {
            return ProcessItemResult::NotConnected;
        }
        if !self.twin_resp_sub_recv {
            return ProcessItemResult::Continue;
        }

        let now = self.clock.now();
        let packet_id = self.packet_ids.next_id();
        let topic = TopicBuilder::reported_properties_topic(packet_id);
        match self
            .client
            .publish(packet_id, &topic, QoS::AtMostOnce, &report.data)
        {
            Ok(()) => {
                if let Some(device) = self.device.as_mut() {
                    device.twin.track(
                        packet_id,
                        TwinRequest::ReportPatch {
                            item_id: report.item_id,
                        },
                        now,
                    );
                }
                ProcessItemResult::Ok
            }
            Err(e) => {
                error!(item_id = report.item_id, error = %e.sanitized(), "Failed publishing reported properties");
                ProcessItemResult::Error
            }
        }
    }

    /// Settle a received message; MQTT only knows PUBACK, so abandoning sends nothing
    pub fn send_message_disposition(
        &mut self,
        handle: DeviceHandle,
        mut message: Message,
        disposition: MessageDisposition,
    ) -> TransportResult<()> {
        self.device_for(handle)?;
        let context = message
            .take_disposition_context()
            .ok_or_else(|| TransportError::invalid_argument("message has no disposition context"))?;
        let (packet_id, qos) = match context.token() {
            DispositionToken::Mqtt { packet_id, qos } => (*packet_id, *qos),
            _ => {
                return Err(TransportError::invalid_argument(
                    "disposition context was not issued by the MQTT transport",
                ))
            }
        };
        debug!(packet_id, ?qos, ?disposition, "Sending message disposition");
        match disposition {
            MessageDisposition::Accepted | MessageDisposition::Rejected
                if qos != QoS::AtMostOnce =>
            {
                self.client.acknowledge(packet_id, qos)
            }
            _ => Ok(()),
        }
    }

    pub fn set_retry_policy(
        &mut self,
        policy: RetryPolicy,
        max_retry_time_secs: u64,
    ) -> TransportResult<()> {
        self.retry = RetryController::new(policy, max_retry_time_secs);
        self.retry_expired_reported = false;
        info!(?policy, max_retry_time_secs, "Retry policy replaced");
        Ok(())
    }

    pub fn set_option(&mut self, option: TransportOption) -> TransportResult<()> {
        match option {
            TransportOption::LogTrace(on) => {
                self.log_trace = on;
                self.client.set_trace(self.log_trace, self.raw_trace);
                Ok(())
            }
            TransportOption::RawLogTrace(on) => {
                self.raw_trace = on;
                self.client.set_trace(self.log_trace, self.raw_trace);
                Ok(())
            }
            TransportOption::AutoUrlEncodeDecode(on) => {
                self.auto_url_encode_decode = on;
                Ok(())
            }
            TransportOption::ConnectionTimeoutSecs(secs) => {
                self.connect_timeout = Duration::from_secs(secs);
                Ok(())
            }
            TransportOption::RetryIntervalSecs(secs) => {
                self.retry.set_option(RetryOption::InitialWaitSecs(secs))
            }
            TransportOption::RetryMaxDelaySecs(secs) => {
                self.retry.set_option(RetryOption::MaxDelaySecs(secs))
            }
            TransportOption::KeepAliveSecs(secs) => {
                if secs != self.keep_alive_secs {
                    info!(old = self.keep_alive_secs, new = secs, "Keep-alive changed");
                    self.keep_alive_secs = secs;
                    if self.status != ClientStatus::NotConnected {
                        self.disconnect_from_client();
                    }
                }
                Ok(())
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
                if other.is_x509() {
                    let credential = self
                        .device
                        .as_ref()
                        .map(|device| device.authorization.credential_type())
                        .unwrap_or(CredentialType::Unknown);
                    if !credential.is_x509() && credential != CredentialType::Unknown {
                        warn!(option = other.name(), ?credential, "X.509 option with token credentials");
                        return Err(TransportError::invalid_argument(
                            "X.509 options require X.509 credentials",
                        ));
                    }
                }
                self.apply_io_option(&other)
            }
        }
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
        if self.io_options.is_empty() {
            if let Some(device) = &self.device {
                if device.authorization.credential_type() == CredentialType::X509Ecc {
                    device.authorization.set_x509_certificate(io.as_mut())?;
                }
            }
        } else if let Err(e) = self.io_options.apply_to(io.as_mut()) {
            warn!(error = %e.sanitized(), "Failed restoring saved options on new I/O");
        }
        Ok(io)
    }

    fn report_status(&self, status: ConnectionStatus, reason: ConnectionStatusReason) {
        if let Some(device) = &self.device {
            self.callbacks
                .connection_status_changed(&device.identity, status, reason);
        }
    }

    /// CONNECT password for the registered credential
    fn connection_password(&self, device: &MqttDevice) -> TransportResult<Option<String>> {
        match device.authorization.credential_type() {
            CredentialType::X509 | CredentialType::X509Ecc => Ok(None),
            CredentialType::DeviceKey | CredentialType::DeviceAuth => {
                let scope = self.topics.sas_scope(&self.iothub_fqdn);
                device
                    .authorization
                    .sas_token(Some(&scope), None)
                    .map(Some)
            }
            CredentialType::SasToken => match device.authorization.sas_token_status() {
                SasTokenStatus::Invalid => {
                    error!(device = %device.identity, "SAS token is expired");
                    self.callbacks.connection_status_changed(
                        &device.identity,
                        ConnectionStatus::Unauthenticated,
                        ConnectionStatusReason::ExpiredSasToken,
                    );
                    Err(TransportError::operation_failed("SAS token is expired"))
                }
                SasTokenStatus::Failed => {
                    error!(device = %device.identity, "SAS token could not be validated");
                    self.callbacks.connection_status_changed(
                        &device.identity,
                        ConnectionStatus::Unauthenticated,
                        ConnectionStatusReason::BadCredential,
                    );
                    Err(TransportError::operation_failed("SAS token validation failed"))
                }
                SasTokenStatus::Valid => device.authorization.sas_token(None, None).map(Some),
            },
            CredentialType::Unknown => Err(TransportError::invalid_argument(
                "credential type is unknown",
            )),
        }
    }

    fn send_connect(&mut self, now: Instant) -> TransportResult<()> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| TransportError::not_connected("no device is registered"))?;
        let password = self.connection_password(device)?;

        let product_info = self
            .callbacks
            .product_info()
            .unwrap_or_else(default_product_info);
        let model_id = self.callbacks.model_id();
        let options = MqttConnectOptions {
            hostname: self.hostname.clone(),
            port: self.port,
            client_id: self.topics.client_id(),
            username: self
                .topics
                .username(&self.iothub_fqdn, &product_info, model_id.as_deref()),
            password,
            keep_alive_secs: self.keep_alive_secs,
            clean_session: false,
        };

        if self.io.is_none() {
            self.io = Some(self.create_io()?);
        }
        let io = self
            .io
            .as_deref_mut()
            .ok_or_else(|| TransportError::operation_failed("I/O is missing"))?;
        info!(hostname = %options.hostname, port = options.port, client_id = %options.client_id, "Sending MQTT CONNECT");
        self.client.connect(io, &options)?;

        self.conn_attempted = true;
        self.packet_state = PacketState::Connect;
        self.mqtt_connect_time = Some(now);
        self.retry_expired_reported = false;
        Ok(())
    }

    /// Drop the I/O of a previous attempt so the next one starts clean
    fn reset_connection_if_necessary(&mut self) {
        if self.conn_attempted && self.io.take().is_some() {
            debug!("Released the I/O of the previous connection attempt");
        }
    }

    fn disconnect_from_client(&mut self) {
        if self.packet_state == PacketState::Disconnect {
            return;
        }
        if self.status == ClientStatus::Connected {
            if let Err(e) = self.client.disconnect() {
                warn!(error = %e.sanitized(), "Failed sending DISCONNECT");
            }
            for _ in 0..DISCONNECT_PUMP_LIMIT {
                let events = self.client.do_work();
                let disconnected = events.iter().any(|e| matches!(e, MqttEvent::Disconnected));
                for event in events {
                    self.on_client_event(event);
                }
                if disconnected {
                    break;
                }
            }
        }
        self.io = None;
        self.device_twin_get_sent = false;
        self.status = ClientStatus::NotConnected;
        self.packet_state = PacketState::Disconnect;
        info!(hostname = %self.hostname, "Disconnected from the MQTT client");
    }

    fn initialize_connection(&mut self, now: Instant) -> TransportResult<()> {
        if self.destroyed {
            return Err(TransportError::not_connected("transport is destroyed"));
        }
        match self.status {
            ClientStatus::NotConnected if self.is_recoverable_error => {
                match self.retry.should_retry(now) {
                    RetryAction::RetryNow => {
                        self.reset_connection_if_necessary();
                        match self.send_connect(now) {
                            Ok(()) => {
                                self.status = ClientStatus::Connecting;
                                self.connect_fail_count = 0;
                                Ok(())
                            }
                            Err(e) => {
                                self.connect_fail_count += 1;
                                error!(attempts = self.connect_fail_count, error = %e.sanitized(), "MQTT connection attempt failed");
                                Err(e)
                            }
                        }
                    }
                    RetryAction::StopRetrying => {
                        if !self.retry_expired_reported {
                            self.retry_expired_reported = true;
                            error!(hostname = %self.hostname, "Retry budget exhausted");
                            self.report_status(
                                ConnectionStatus::Unauthenticated,
                                ConnectionStatusReason::RetryExpired,
                            );
                        }
                        Err(TransportError::not_connected("retry budget exhausted"))
                    }
                    RetryAction::RetryLater => {
                        Err(TransportError::not_connected("waiting to retry the connection"))
                    }
                }
            }
            ClientStatus::NotConnected => Err(TransportError::not_connected(
                "connection failed with an unrecoverable error",
            )),
            ClientStatus::ExecuteDisconnect => {
                self.disconnect_from_client();
                Ok(())
            }
            ClientStatus::Connecting => {
                let elapsed = self
                    .mqtt_connect_time
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed.as_secs() > self.connect_timeout.as_secs() {
                    error!(elapsed_secs = elapsed.as_secs(), "Timed out waiting for CONNACK");
                    self.packet_state = PacketState::Error;
                    self.disconnect_from_client();
                    return Err(TransportError::not_connected("timed out waiting for CONNACK"));
                }
                Ok(())
            }
            ClientStatus::Connected => {
                self.refresh_sas_token_if_needed(now);
                Ok(())
            }
            ClientStatus::PendingClose => Ok(()),
        }
    }

    fn refresh_sas_token_if_needed(&mut self, now: Instant) {
        let Some(device) = &self.device else {
            return;
        };
        if device.authorization.credential_type().is_x509() {
            return;
        }
        let lifetime = device
            .authorization
            .sas_token_expiry()
            .mul_f64(SAS_REFRESH_MULTIPLIER);
        let elapsed = self
            .mqtt_connect_time
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        if elapsed.as_secs() > lifetime.as_secs() {
            info!(elapsed_secs = elapsed.as_secs(), "SAS token is about to expire, reconnecting");
            self.disconnect_from_client();
            self.report_status(
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::ExpiredSasToken,
            );
            self.packet_state = PacketState::Unknown;
            self.subscriptions.flag_all_active();
        }
    }

    fn subscribe_to_pending_topics(&mut self) {
        if !self.subscriptions.has_pending() {
            self.packet_state = PacketState::Publish;
            return;
        }
        let pending = self.subscriptions.pending();
        let filters: Vec<(String, QoS)> = pending
            .iter()
            .filter_map(|topic| {
                self.topics
                    .subscription_topic(*topic)
                    .map(|filter| (filter, topic.qos()))
            })
            .collect();
        let packet_id = self.packet_ids.next_id();
        if pending.contains(&SubscriptionTopic::TwinResponses) {
            self.twin_resp_packet_id = Some(packet_id);
        }
        match self.client.subscribe(packet_id, &filters) {
            Ok(()) => {
                debug!(packet_id, topics = filters.len(), "SUBSCRIBE sent");
                self.subscriptions.clear_pending();
            }
            Err(e) => error!(error = %e.sanitized(), "Failed sending SUBSCRIBE"),
        }
        self.packet_state = PacketState::Subscribe;
    }

    /// Full twin get issued once the twin response topic is subscribed
    fn request_complete_twin(&mut self, now: Instant) {
        if self.subscriptions.is_active(SubscriptionTopic::TwinResponses) && !self.device_twin_get_sent {
            let packet_id = self.packet_ids.next_id();
            let topic = TopicBuilder::twin_get_topic(packet_id);
            match self.client.publish(packet_id, &topic, QoS::AtMostOnce, &[]) {
                Ok(()) => {
                    if let Some(device) = self.device.as_mut() {
                        device.twin.track(packet_id, TwinRequest::GetComplete, now);
                    }
                    self.device_twin_get_sent = true;
                }
                Err(e) => error!(error = %e.sanitized(), "Failed sending the twin get"),
            }
        }
        self.packet_state = PacketState::Publish;
    }

    fn publish_waiting_telemetry(&mut self, now: Instant) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let telemetry_topic = self.topics.telemetry_topic();
        let url_encode = self.auto_url_encode_decode;
        let packet_ids = &mut self.packet_ids;
        let client = &mut self.client;

        loop {
            let drain = device.telemetry.drain_in_order(now, |message| {
                let bag = MessageHandler::encode_properties(message, url_encode)?;
                let packet_id = packet_ids.next_id();
                client.publish(
                    packet_id,
                    &format!("{telemetry_topic}{bag}"),
                    QoS::AtLeastOnce,
                    message.body(),
                )?;
                Ok(packet_id)
            });
            if drain.sent > 0 {
                trace!(sent = drain.sent, "Telemetry published");
            }
            match drain.failed {
                Some(failed) => self.callbacks.send_complete(
                    &device.identity,
                    vec![failed],
                    ConfirmationResult::Error,
                ),
                None => break,
            }
        }

        let (sent, failed) = device.twin.send_pending_gets(|| {
            let packet_id = packet_ids.next_id();
            client.publish(
                packet_id,
                &TopicBuilder::twin_get_topic(packet_id),
                QoS::AtMostOnce,
                &[],
            )?;
            Ok(packet_id)
        });
        if sent > 0 {
            self.device_twin_get_sent = true;
        }
        for request in failed {
            request.expire(&device.identity, self.callbacks.as_ref());
        }
    }

    fn subscribe_to_notify_if_needed(&mut self) {
        if !self.subscriptions.is_active(SubscriptionTopic::DesiredProperties) {
            self.activate_topic(SubscriptionTopic::DesiredProperties);
        }
    }

    fn on_connack(&mut self, code: ConnackCode) {
        if code == ConnackCode::Accepted {
            info!(hostname = %self.hostname, "MQTT connection accepted");
            self.packet_state = PacketState::Connack;
            self.is_recoverable_error = true;
            self.status = ClientStatus::Connected;
            self.retry.reset();
            self.report_status(ConnectionStatus::Authenticated, ConnectionStatusReason::Ok);
            return;
        }

        error!(?code, "MQTT connection refused");
        match code {
            ConnackCode::BadUsernamePassword | ConnackCode::IdentifierRejected => {
                self.is_recoverable_error = false;
                self.report_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::BadCredential,
                );
            }
            ConnackCode::ServerUnavailable | ConnackCode::NotAuthorized => {
                self.report_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::DeviceDisabled,
                );
            }
            ConnackCode::UnacceptableProtocolVersion => {
                self.is_recoverable_error = false;
            }
            ConnackCode::Accepted => {}
        }
        self.status = ClientStatus::PendingClose;
        self.packet_state = PacketState::Error;
    }

    fn on_client_error(&mut self, error: MqttClientError) {
        match error {
            MqttClientError::ConnectionError => {
                error!("MQTT connection error");
                self.report_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::NoNetwork,
                );
            }
            MqttClientError::CommunicationError => {
                error!("MQTT communication error");
                self.report_status(
                    ConnectionStatus::Unauthenticated,
                    ConnectionStatusReason::CommunicationError,
                );
            }
            MqttClientError::NoPingResponse => warn!("MQTT ping response not received"),
            other => error!(error = ?other, "MQTT client error"),
        }
        if self.status != ClientStatus::PendingClose {
            self.status = ClientStatus::ExecuteDisconnect;
        }
        self.packet_state = PacketState::Error;
        self.device_twin_get_sent = false;
        self.subscriptions.flag_all_active();
    }

    fn on_client_event(&mut self, event: MqttEvent) {
        match event {
            MqttEvent::ConnAck { code } => self.on_connack(code),
            MqttEvent::SubAck { packet_id, failures } => {
                if failures > 0 {
                    warn!(packet_id, failures, "Subscriptions refused by the hub");
                }
                if self.twin_resp_packet_id == Some(packet_id) {
                    self.twin_resp_sub_recv = true;
                }
                self.packet_state = PacketState::Suback;
            }
            MqttEvent::UnsubAck { packet_id } => debug!(packet_id, "UNSUBACK received"),
            MqttEvent::PublishAck { packet_id } => {
                let Some(device) = self.device.as_mut() else {
                    return;
                };
                match device.telemetry.on_ack(&packet_id) {
                    Some(message) => self.callbacks.send_complete(
                        &device.identity,
                        vec![message],
                        ConfirmationResult::Ok,
                    ),
                    None => debug!(packet_id, "PUBACK for an unknown packet"),
                }
            }
            MqttEvent::Publish {
                topic,
                payload,
                qos,
                packet_id,
            } => self.on_publish(&topic, payload, qos, packet_id),
            MqttEvent::Disconnected => {
                info!("MQTT client disconnected");
                self.status = ClientStatus::NotConnected;
            }
            MqttEvent::PingResponse => trace!("PINGRESP received"),
            MqttEvent::Error(error) => self.on_client_error(error),
        }
    }

    fn on_publish(&mut self, topic: &str, payload: Bytes, qos: QoS, packet_id: u16) {
        let input_queue = if self.subscriptions.is_active(SubscriptionTopic::InputQueue) {
            self.topics.input_queue_topic()
        } else {
            None
        };
        let route = match MessageHandler::route(topic, input_queue.as_deref()) {
            Ok(route) => route,
            Err(e) => {
                warn!(topic, error = %e, "Dropping unroutable publish");
                return;
            }
        };
        let Some(identity) = self.device.as_ref().map(|device| device.identity.clone()) else {
            warn!(topic, "Dropping publish received without a registered device");
            return;
        };

        let auto_ack = matches!(
            route,
            InboundRoute::TwinDesiredPatch
                | InboundRoute::TwinResponse { .. }
                | InboundRoute::MethodRequest { .. }
        );
        if auto_ack && qos != QoS::AtMostOnce {
            if let Err(e) = self.client.acknowledge(packet_id, qos) {
                warn!(packet_id, error = %e.sanitized(), "Failed acknowledging publish");
            }
        }

        let callbacks = Arc::clone(&self.callbacks);
        match route {
            InboundRoute::TwinResponse { status, request_id } => {
                let request = self
                    .device
                    .as_mut()
                    .and_then(|device| device.twin.on_response(&request_id));
                match request {
                    Some(TwinRequest::GetComplete) => {
                        callbacks.twin_retrieve_properties_complete(
                            &identity,
                            TwinUpdateState::Complete,
                            &payload,
                        );
                        self.subscribe_to_notify_if_needed();
                    }
                    Some(TwinRequest::GetOnDemand(callback)) => {
                        callback(TwinUpdateState::Complete, Some(payload.as_ref()));
                    }
                    Some(TwinRequest::ReportPatch { item_id }) => {
                        callbacks.twin_reported_state_complete(&identity, item_id, status);
                        self.subscribe_to_notify_if_needed();
                    }
                    None => warn!(request_id, status, "Twin response for an unknown request"),
                }
            }
            InboundRoute::TwinDesiredPatch => {
                callbacks.twin_retrieve_properties_complete(
                    &identity,
                    TwinUpdateState::Partial,
                    &payload,
                );
            }
            InboundRoute::MethodRequest { name, request_id } => {
                debug!(method = %name, %request_id, "Method request received");
                let request = MethodRequest {
                    name,
                    payload,
                    handle: MethodHandle::new(request_id),
                };
                if !callbacks.device_method(&identity, request) {
                    debug!("Method request declined");
                }
            }
            InboundRoute::InputMessage { input_name } => {
                let mut message = self.inbound_message(topic, payload, qos, packet_id);
                message.properties_mut().input_name = Some(input_name);
                if !callbacks.input_message_received(&identity, message) {
                    warn!(packet_id, "Input message declined; it will not be acknowledged");
                }
            }
            InboundRoute::CloudMessage => {
                let message = self.inbound_message(topic, payload, qos, packet_id);
                if !callbacks.message_received(&identity, message) {
                    warn!(packet_id, "Message declined; it will not be acknowledged");
                }
            }
        }
    }

    fn inbound_message(&self, topic: &str, payload: Bytes, qos: QoS, packet_id: u16) -> Message {
        let mut message = Message::from_bytes(payload);
        MessageHandler::decode_properties(topic, &mut message, self.auto_url_encode_decode);
        message.set_disposition_context(DispositionContext::from_token(DispositionToken::Mqtt {
            packet_id,
            qos,
        }));
        message
    }

    fn process_queued_ack_messages(&mut self, now: Instant) {
        let can_resend = self.packet_state == PacketState::Publish;
        let Some(device) = self.device.as_mut() else {
            return;
        };
        let telemetry_topic = self.topics.telemetry_topic();
        let url_encode = self.auto_url_encode_decode;
        let packet_ids = &mut self.packet_ids;
        let client = &mut self.client;

        let expired = device.telemetry.on_timeout(now, can_resend, |message| {
            let bag = MessageHandler::encode_properties(message, url_encode)?;
            let packet_id = packet_ids.next_id();
            client.publish(
                packet_id,
                &format!("{telemetry_topic}{bag}"),
                QoS::AtLeastOnce,
                message.body(),
            )?;
            Ok(packet_id)
        });
        for (message, result) in expired.completions {
            self.callbacks
                .send_complete(&device.identity, vec![message], result);
        }
        if expired.reset_connection {
            warn!("Telemetry acknowledgment timed out, resetting the connection");
            self.disconnect_from_client();
        }
    }

    fn expire_twin_operations(&mut self, now: Instant) {
        let Some(device) = self.device.as_mut() else {
            return;
        };
        for request in device.twin.on_timeout(now) {
            request.expire(&device.identity, self.callbacks.as_ref());
        }
    }

    /// Drive the connection and the device by one step
    pub fn do_work(&mut self) {
        if self.destroyed || self.device.is_none() {
            return;
        }
        let _span = crate::transport_span!(protocol = "mqtt", hostname = %self.hostname).entered();
        let now = self.clock.now();

        if self.initialize_connection(now).is_ok() {
            if self.status == ClientStatus::PendingClose {
                if let Err(e) = self.client.disconnect() {
                    debug!(error = %e.sanitized(), "DISCONNECT after refusal failed");
                }
                self.status = ClientStatus::NotConnected;
            } else {
                match self.packet_state {
                    PacketState::Connack | PacketState::Subscribe => {
                        self.subscribe_to_pending_topics()
                    }
                    PacketState::Suback => self.request_complete_twin(now),
                    PacketState::Publish => self.publish_waiting_telemetry(now),
                    _ => {}
                }
            }

            for event in self.client.do_work() {
                self.on_client_event(event);
            }
        }

        self.process_queued_ack_messages(now);
        self.expire_twin_operations(now);
    }

    /// Tear everything down; every outstanding completion fires
    pub fn destroy(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        info!(hostname = %self.hostname, "Destroying MQTT transport");
        self.destroyed = true;
        self.disconnect_from_client();
        if let Some(device) = self.device.take() {
            self.settle(device);
        }
        self.io = None;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MockIoFactory, MockMqttClient, RecordingCallbacks};

    fn transport(config: &TransportConfig) -> TransportResult<MqttTransport> {
        MqttTransport::new(
            config,
            Box::new(MockMqttClient::new()),
            Arc::new(MockIoFactory::new()),
            Arc::new(RecordingCallbacks::new()),
            Arc::new(ManualClock::new()),
        )
    }

    #[test]
    fn test_rejects_key_and_token_together() {
        let mut config = TransportConfig::new("hub", "azure-devices.net", "d1").with_device_key("k");
        config.device_sas_token = Some("SharedAccessSignature sr=x".to_string());
        assert!(transport(&config).is_err_and(|e| e.is_invalid_argument()));
    }

    #[test]
    fn test_rejects_long_device_id() {
        let config = TransportConfig::new("hub", "azure-devices.net", "d".repeat(129));
        assert!(transport(&config).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::new("hub", "azure-devices.net", "d1");
        let transport = transport(&config).expect("transport").with_port(1883);
        assert_eq!(transport.port(), 1883);
        assert_eq!(transport.hostname(), "hub.azure-devices.net");
        assert_eq!(transport.client_status(), ClientStatus::NotConnected);
        assert_eq!(transport.keep_alive_secs(), DEFAULT_KEEP_ALIVE_SECS);
        assert!(!transport.is_registered());
    }
}
