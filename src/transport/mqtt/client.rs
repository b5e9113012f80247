//! MQTT client seam and its rumqttc-backed implementation
//!
//! [`MqttClient`] is the primitive the transport drives: it is told to
//! connect, subscribe and publish, and every tick it hands back what happened
//! as a list of [`MqttEvent`]s. [`RumqttcClient`] implements it over
//! `rumqttc`'s MQTT 3.1.1 client with the event loop polled on a tokio task.

use crate::error::{TransportError, TransportResult};
use crate::options::OPTION_X509_CERT;
use crate::options::OPTION_X509_PRIVATE_KEY;
use crate::transport::IoTransport;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS, StateError, SubscribeFilter, SubscribeReasonCode, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// I/O option carrying the PEM trust bundle for the hub certificate
pub const OPTION_TRUSTED_CERT: &str = "TrustedCerts";
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Everything the CONNECT packet needs
#[derive(Clone, PartialEq, Eq)]
pub struct MqttConnectOptions {
    pub hostname: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl fmt::Debug for MqttConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConnectOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

/// CONNACK return codes of MQTT 3.1.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernamePassword,
    NotAuthorized,
}

impl From<ConnectReturnCode> for ConnackCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => ConnackCode::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => ConnackCode::UnacceptableProtocolVersion,
            ConnectReturnCode::BadClientId => ConnackCode::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => ConnackCode::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ConnackCode::BadUsernamePassword,
            ConnectReturnCode::NotAuthorized => ConnackCode::NotAuthorized,
        }
    }
}

/// Failure classes reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttClientError {
    ConnectionError,
    CommunicationError,
    NoPingResponse,
    ParseError,
    MemoryError,
    Unknown,
}

/// What happened during one client tick
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    ConnAck { code: ConnackCode },
    /// PUBACK for the QoS 1 publish sent under `packet_id`
    PublishAck { packet_id: u16 },
    /// SUBACK; `failures` counts refused filters
    SubAck { packet_id: u16, failures: usize },
    UnsubAck { packet_id: u16 },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        packet_id: u16,
    },
    Disconnected,
    PingResponse,
    Error(MqttClientError),
}

/// Sans-IO view of an MQTT 3.1.1 client
pub trait MqttClient: Send {
    fn connect(&mut self, io: &mut dyn IoTransport, options: &MqttConnectOptions) -> TransportResult<()>;

    fn disconnect(&mut self) -> TransportResult<()>;

    fn subscribe(&mut self, packet_id: u16, topics: &[(String, QoS)]) -> TransportResult<()>;

    fn unsubscribe(&mut self, packet_id: u16, topics: &[String]) -> TransportResult<()>;

    fn publish(&mut self, packet_id: u16, topic: &str, qos: QoS, payload: &[u8]) -> TransportResult<()>;

    /// Acknowledge an inbound publish received under the broker's `packet_id`
    fn acknowledge(&mut self, packet_id: u16, qos: QoS) -> TransportResult<()>;

    fn set_trace(&mut self, trace: bool, raw: bool);

    /// Never blocks; returns what arrived since the previous call
    fn do_work(&mut self) -> Vec<MqttEvent>;
}

/// Maps the ids rumqttc assigns back to the ids the transport asked for.
///
/// rumqttc reports each outgoing packet in request order, so the transport id
/// at the head of the matching queue belongs to the next outgoing packet.
#[derive(Debug, Default)]
struct PacketCorrelation {
    publishes: VecDeque<(u16, QoS)>,
    subscribes: VecDeque<u16>,
    unsubscribes: VecDeque<u16>,
    publish_acks: HashMap<u16, u16>,
    sub_acks: HashMap<u16, u16>,
    unsub_acks: HashMap<u16, u16>,
}

impl PacketCorrelation {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn on_outgoing(&mut self, outgoing: &Outgoing) {
        match outgoing {
            Outgoing::Publish(pkid) => {
                if let Some((id, qos)) = self.publishes.pop_front() {
                    if qos != QoS::AtMostOnce {
                        self.publish_acks.insert(*pkid, id);
                    }
                }
            }
            Outgoing::Subscribe(pkid) => {
                if let Some(id) = self.subscribes.pop_front() {
                    self.sub_acks.insert(*pkid, id);
                }
            }
            Outgoing::Unsubscribe(pkid) => {
                if let Some(id) = self.unsubscribes.pop_front() {
                    self.unsub_acks.insert(*pkid, id);
                }
            }
            _ => {}
        }
    }
}

type Notification = Result<Event, ConnectionError>;

/// [`MqttClient`] over `rumqttc::AsyncClient`
pub struct RumqttcClient {
    runtime: Handle,
    client: Option<AsyncClient>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    poll_task: Option<JoinHandle<()>>,
    correlation: PacketCorrelation,
    log_trace: bool,
    raw_trace: bool,
}

impl RumqttcClient {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            client: None,
            notifications: None,
            poll_task: None,
            correlation: PacketCorrelation::default(),
            log_trace: false,
            raw_trace: false,
        }
    }

    /// Client bound to the runtime the caller is running on
    pub fn from_current_runtime() -> TransportResult<Self> {
        let runtime = Handle::try_current().map_err(TransportError::primitive)?;
        Ok(Self::new(runtime))
    }

    fn client(&self) -> TransportResult<&AsyncClient> {
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::not_connected("MQTT client is not connected"))
    }

    /// Pure function to configure rumqttc options from the CONNECT fields
    fn configure_mqtt_options(
        io: &dyn IoTransport,
        options: &MqttConnectOptions,
    ) -> TransportResult<MqttOptions> {
        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.hostname, options.port);
        mqtt_options.set_keep_alive(Duration::from_secs(u64::from(options.keep_alive_secs)));
        mqtt_options.set_clean_session(options.clean_session);
        mqtt_options.set_manual_acks(true);
        mqtt_options.set_credentials(
            options.username.clone(),
            options.password.clone().unwrap_or_default(),
        );

        let ca = io
            .option(OPTION_TRUSTED_CERT)
            .and_then(|value| value.as_text())
            .map(|pem| pem.as_bytes().to_vec());
        let client_auth = match (
            io.option(OPTION_X509_CERT).and_then(|value| value.as_text()),
            io.option(OPTION_X509_PRIVATE_KEY).and_then(|value| value.as_text()),
        ) {
            (Some(cert), Some(key)) => Some((cert.as_bytes().to_vec(), key.as_bytes().to_vec())),
            _ => None,
        };
        let transport = match ca {
            Some(ca) => Transport::tls(ca, client_auth, None),
            None => {
                if client_auth.is_some() {
                    return Err(TransportError::invalid_argument(
                        "X.509 client authentication requires the TrustedCerts option",
                    ));
                }
                Transport::tls_with_default_config()
            }
        };
        mqtt_options.set_transport(transport);

        if io.proxy().is_some() {
            warn!("HTTP proxy is not supported by the rumqttc client; connecting directly");
        }
        Ok(mqtt_options)
    }

    async fn poll_event_loop(mut event_loop: EventLoop, tx: mpsc::UnboundedSender<Notification>) {
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    let done = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                    if tx.send(Ok(event)).is_err() || done {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
        debug!("MQTT event loop task finished");
    }

    fn stop_polling(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.notifications = None;
        self.client = None;
        self.correlation.clear();
    }

    fn translate(&mut self, notification: Notification) -> Option<MqttEvent> {
        let event = match notification {
            Ok(event) => event,
            Err(e) => return Some(Self::translate_error(e)),
        };
        if self.raw_trace {
            trace!(?event, "MQTT packet");
        }
        match event {
            Event::Outgoing(outgoing) => {
                self.correlation.on_outgoing(&outgoing);
                if matches!(outgoing, Outgoing::Disconnect) {
                    return Some(MqttEvent::Disconnected);
                }
                None
            }
            Event::Incoming(packet) => {
                if self.log_trace {
                    debug!(packet = ?packet, "<- MQTT");
                }
                match packet {
                    Packet::ConnAck(connack) => Some(MqttEvent::ConnAck {
                        code: connack.code.into(),
                    }),
                    Packet::PubAck(ack) => match self.correlation.publish_acks.remove(&ack.pkid) {
                        Some(packet_id) => Some(MqttEvent::PublishAck { packet_id }),
                        None => {
                            debug!(pkid = ack.pkid, "PUBACK for an untracked publish");
                            None
                        }
                    },
                    Packet::SubAck(ack) => {
                        let packet_id = self.correlation.sub_acks.remove(&ack.pkid)?;
                        let failures = ack
                            .return_codes
                            .iter()
                            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                            .count();
                        Some(MqttEvent::SubAck { packet_id, failures })
                    }
                    Packet::UnsubAck(ack) => {
                        let packet_id = self.correlation.unsub_acks.remove(&ack.pkid)?;
                        Some(MqttEvent::UnsubAck { packet_id })
                    }
                    Packet::Publish(publish) => Some(MqttEvent::Publish {
                        topic: publish.topic,
                        payload: publish.payload,
                        qos: publish.qos,
                        packet_id: publish.pkid,
                    }),
                    Packet::PingResp => Some(MqttEvent::PingResponse),
                    Packet::Disconnect => Some(MqttEvent::Disconnected),
                    _ => None,
                }
            }
        }
    }

    fn translate_error(error: ConnectionError) -> MqttEvent {
        error!(error = %error, "MQTT event loop error");
        match error {
            ConnectionError::ConnectionRefused(code) => MqttEvent::ConnAck { code: code.into() },
            ConnectionError::MqttState(StateError::AwaitPingResp) => {
                MqttEvent::Error(MqttClientError::NoPingResponse)
            }
            ConnectionError::MqttState(StateError::Deserialization(_)) => {
                MqttEvent::Error(MqttClientError::ParseError)
            }
            ConnectionError::MqttState(_) => MqttEvent::Error(MqttClientError::CommunicationError),
            ConnectionError::Io(_)
            | ConnectionError::Tls(_)
            | ConnectionError::NetworkTimeout
            | ConnectionError::FlushTimeout => MqttEvent::Error(MqttClientError::ConnectionError),
            ConnectionError::RequestsDone => MqttEvent::Disconnected,
            _ => MqttEvent::Error(MqttClientError::Unknown),
        }
    }
}

impl MqttClient for RumqttcClient {
    fn connect(&mut self, io: &mut dyn IoTransport, options: &MqttConnectOptions) -> TransportResult<()> {
        self.stop_polling();
        let mqtt_options = Self::configure_mqtt_options(io, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        info!(hostname = %options.hostname, port = options.port, client_id = %options.client_id, "Starting MQTT connection");
        self.poll_task = Some(self.runtime.spawn(Self::poll_event_loop(event_loop, tx)));
        self.notifications = Some(rx);
        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.client()?
            .try_disconnect()
            .map_err(TransportError::primitive)
    }

    fn subscribe(&mut self, packet_id: u16, topics: &[(String, QoS)]) -> TransportResult<()> {
        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), *qos))
            .collect();
        self.client()?
            .try_subscribe_many(filters)
            .map_err(TransportError::primitive)?;
        self.correlation.subscribes.push_back(packet_id);
        Ok(())
    }

    fn unsubscribe(&mut self, packet_id: u16, topics: &[String]) -> TransportResult<()> {
        for topic in topics {
            self.client()?
                .try_unsubscribe(topic.clone())
                .map_err(TransportError::primitive)?;
            self.correlation.unsubscribes.push_back(packet_id);
        }
        Ok(())
    }

    fn publish(&mut self, packet_id: u16, topic: &str, qos: QoS, payload: &[u8]) -> TransportResult<()> {
        if self.log_trace {
            debug!(topic, ?qos, packet_id, bytes = payload.len(), "-> MQTT PUBLISH");
        }
        self.client()?
            .try_publish(topic, qos, false, payload.to_vec())
            .map_err(TransportError::primitive)?;
        self.correlation.publishes.push_back((packet_id, qos));
        Ok(())
    }

    fn acknowledge(&mut self, packet_id: u16, qos: QoS) -> TransportResult<()> {
        let mut publish = Publish::new("", qos, Vec::new());
        publish.pkid = packet_id;
        self.client()?
            .try_ack(&publish)
            .map_err(TransportError::primitive)
    }

    fn set_trace(&mut self, trace: bool, raw: bool) {
        self.log_trace = trace;
        self.raw_trace = raw;
    }

    fn do_work(&mut self) -> Vec<MqttEvent> {
        let mut notifications = Vec::new();
        if let Some(rx) = self.notifications.as_mut() {
            while let Ok(notification) = rx.try_recv() {
                notifications.push(notification);
            }
        }

        let mut events = Vec::with_capacity(notifications.len());
        for notification in notifications {
            if let Some(event) = self.translate(notification) {
                let terminal = matches!(event, MqttEvent::Disconnected | MqttEvent::Error(_))
                    || matches!(event, MqttEvent::ConnAck { code } if code != ConnackCode::Accepted);
                events.push(event);
                if terminal {
                    self.stop_polling();
                    break;
                }
            }
        }
        events
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
