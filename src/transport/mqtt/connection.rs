//! Pure connection state and topic construction for the MQTT binding
//!
//! Nothing in here touches the network: the client and packet state
//! machines, packet id allocation, the subscription bookkeeping and every topic
//! and identity string the hub expects.

use rumqttc::QoS;
use std::time::Duration;
use url::form_urlencoded;

pub const DEFAULT_MQTT_PORT: u16 = 8883;
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 240;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Reconnect once this share of the SAS token lifetime has elapsed
pub const SAS_REFRESH_MULTIPLIER: f64 = 0.8;
/// Client ticks allowed for a DISCONNECT to go out before the I/O is dropped
pub const DISCONNECT_PUMP_LIMIT: usize = 50;
pub const API_VERSION: &str = "2017-11-08-preview";

pub const TWIN_TOPIC_PREFIX: &str = "$iothub/twin";
pub const METHOD_TOPIC_PREFIX: &str = "$iothub/methods";
pub const TWIN_RESPONSE_TOPIC: &str = "$iothub/twin/res/#";
pub const DESIRED_PROPERTIES_TOPIC: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const METHOD_SUBSCRIBE_TOPIC: &str = "$iothub/methods/POST/#";
pub const REQUEST_ID_MARKER: &str = "?$rid=";

/// Connection progress of the underlying client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    NotConnected,
    Connecting,
    Connected,
    /// A CONNACK refused the connection; disconnect on the next tick
    PendingClose,
    /// A client error was reported; tear the client down on the next tick
    ExecuteDisconnect,
}

/// Protocol step the transport is in while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Connect,
    Connack,
    Subscribe,
    Suback,
    Publish,
    Disconnect,
    Error,
    Unknown,
}

impl PacketState {
    /// New subscriptions may only move the state forward once connected
    pub fn allows_subscribe(self) -> bool {
        !matches!(
            self,
            PacketState::Connack | PacketState::Connect | PacketState::Disconnect | PacketState::Error
        )
    }
}

/// 16-bit packet id source; wraps to 1 and never yields 0
#[derive(Debug, Clone, Default)]
pub struct PacketIdGenerator {
    last: u16,
}

impl PacketIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u16 {
        self.last = match self.last.checked_add(1) {
            Some(id) => id,
            None => 1,
        };
        self.last
    }
}

/// Topic families the transport subscribes to, in SUBSCRIBE order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTopic {
    Messages,
    TwinResponses,
    DesiredProperties,
    Methods,
    InputQueue,
}

impl SubscriptionTopic {
    pub const ALL: [SubscriptionTopic; 5] = [
        SubscriptionTopic::Messages,
        SubscriptionTopic::TwinResponses,
        SubscriptionTopic::DesiredProperties,
        SubscriptionTopic::Methods,
        SubscriptionTopic::InputQueue,
    ];

    fn bit(self) -> u8 {
        match self {
            SubscriptionTopic::Messages => 0x01,
            SubscriptionTopic::TwinResponses => 0x02,
            SubscriptionTopic::DesiredProperties => 0x04,
            SubscriptionTopic::Methods => 0x08,
            SubscriptionTopic::InputQueue => 0x10,
        }
    }

    /// Cloud-to-device messages need delivery guarantees; the rest do not
    pub fn qos(self) -> QoS {
        match self {
            SubscriptionTopic::Messages => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }
}

/// Which topics are wanted and which still need a SUBSCRIBE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicSet {
    active: u8,
    pending: u8,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, topic: SubscriptionTopic) {
        self.active |= topic.bit();
        self.pending |= topic.bit();
    }

    pub fn deactivate(&mut self, topic: SubscriptionTopic) {
        self.active &= !topic.bit();
        self.pending &= !topic.bit();
    }

    pub fn is_active(&self, topic: SubscriptionTopic) -> bool {
        self.active & topic.bit() != 0
    }

    pub fn is_pending(&self, topic: SubscriptionTopic) -> bool {
        self.pending & topic.bit() != 0
    }

    pub fn has_pending(&self) -> bool {
        self.pending != 0
    }

    /// Pending topics in SUBSCRIBE order
    pub fn pending(&self) -> Vec<SubscriptionTopic> {
        SubscriptionTopic::ALL
            .into_iter()
            .filter(|topic| self.is_pending(*topic))
            .collect()
    }

    pub fn clear_pending(&mut self) {
        self.pending = 0;
    }

    /// Mark every wanted topic for re-subscription after a reconnect
    pub fn flag_all_active(&mut self) {
        self.pending |= self.active;
    }
}

/// Topic and identity strings of one device or module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    device_id: String,
    module_id: Option<String>,
}

impl TopicBuilder {
    pub fn new<S: Into<String>>(device_id: S, module_id: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id,
        }
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    /// `devices/{d}/messages/devicebound/#`, module variant included
    pub fn messages_topic(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "devices/{}/modules/{}/messages/devicebound/#",
                self.device_id, module_id
            ),
            None => format!("devices/{}/messages/devicebound/#", self.device_id),
        }
    }

    /// Prefix every telemetry topic starts with, property bag excluded
    pub fn telemetry_topic(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "devices/{}/modules/{}/messages/events/",
                self.device_id, module_id
            ),
            None => format!("devices/{}/messages/events/", self.device_id),
        }
    }

    /// Input queues only exist for modules
    pub fn input_queue_topic(&self) -> Option<String> {
        self.module_id
            .as_ref()
            .map(|module_id| format!("devices/{}/modules/{}/#", self.device_id, module_id))
    }

    pub fn subscription_topic(&self, topic: SubscriptionTopic) -> Option<String> {
        match topic {
            SubscriptionTopic::Messages => Some(self.messages_topic()),
            SubscriptionTopic::TwinResponses => Some(TWIN_RESPONSE_TOPIC.to_string()),
            SubscriptionTopic::DesiredProperties => Some(DESIRED_PROPERTIES_TOPIC.to_string()),
            SubscriptionTopic::Methods => Some(METHOD_SUBSCRIBE_TOPIC.to_string()),
            SubscriptionTopic::InputQueue => self.input_queue_topic(),
        }
    }

    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    /// `{hub fqdn}/{device}[/{module}]/?api-version=..&DeviceClientType=..`
    pub fn username(&self, iothub_fqdn: &str, product_info: &str, model_id: Option<&str>) -> String {
        let mut username = format!(
            "{}/{}/?api-version={}&DeviceClientType={}",
            iothub_fqdn,
            self.client_id(),
            API_VERSION,
            url_encode(product_info)
        );
        if let Some(model_id) = model_id.filter(|m| !m.is_empty()) {
            username.push_str("&model-id=");
            username.push_str(&url_encode(model_id));
        }
        username
    }

    /// Resource scope a device key token is generated for
    pub fn sas_scope(&self, iothub_fqdn: &str) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                iothub_fqdn, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", iothub_fqdn, self.device_id),
        }
    }

    pub fn twin_get_topic(request_id: u16) -> String {
        format!("$iothub/twin/GET/{REQUEST_ID_MARKER}{request_id}")
    }

    pub fn reported_properties_topic(request_id: u16) -> String {
        format!("$iothub/twin/PATCH/properties/reported/{REQUEST_ID_MARKER}{request_id}")
    }

    pub fn method_response_topic(status: i32, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/{REQUEST_ID_MARKER}{request_id}")
    }
}

/// Product string sent when the client layer supplies none
pub fn default_product_info() -> String {
    format!("iothubclient/{}", env!("CARGO_PKG_VERSION"))
}

/// Percent-encode everything but unreserved characters; spaces become `%20`
pub fn url_encode(text: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(text.as_bytes()).collect();
    encoded.replace('+', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_ids_skip_zero_on_wrap() {
        let mut ids = PacketIdGenerator { last: u16::MAX - 1 };
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(PacketIdGenerator::new().next_id(), 1);
    }

    #[test]
    fn test_topic_set_tracks_pending_in_order() {
        let mut topics = TopicSet::new();
        topics.activate(SubscriptionTopic::Methods);
        topics.activate(SubscriptionTopic::Messages);

        assert_eq!(
            topics.pending(),
            vec![SubscriptionTopic::Messages, SubscriptionTopic::Methods]
        );

        topics.clear_pending();
        assert!(!topics.has_pending());
        assert!(topics.is_active(SubscriptionTopic::Methods));

        topics.flag_all_active();
        assert_eq!(topics.pending().len(), 2);

        topics.deactivate(SubscriptionTopic::Methods);
        assert_eq!(topics.pending(), vec![SubscriptionTopic::Messages]);
    }

    #[test]
    fn test_subscribe_allowed_only_after_connack() {
        assert!(!PacketState::Connect.allows_subscribe());
        assert!(!PacketState::Connack.allows_subscribe());
        assert!(!PacketState::Error.allows_subscribe());
        assert!(PacketState::Publish.allows_subscribe());
        assert!(PacketState::Suback.allows_subscribe());
    }

    #[test]
    fn test_device_topics() {
        let topics = TopicBuilder::new("d1", None);
        assert_eq!(topics.messages_topic(), "devices/d1/messages/devicebound/#");
        assert_eq!(topics.telemetry_topic(), "devices/d1/messages/events/");
        assert_eq!(topics.input_queue_topic(), None);
        assert_eq!(topics.client_id(), "d1");
    }

    #[test]
    fn test_module_topics() {
        let topics = TopicBuilder::new("d1", Some("m1".into()));
        assert_eq!(
            topics.messages_topic(),
            "devices/d1/modules/m1/messages/devicebound/#"
        );
        assert_eq!(topics.telemetry_topic(), "devices/d1/modules/m1/messages/events/");
        assert_eq!(topics.input_queue_topic().as_deref(), Some("devices/d1/modules/m1/#"));
        assert_eq!(topics.client_id(), "d1/m1");
        assert_eq!(
            topics.sas_scope("hub.azure-devices.net"),
            "hub.azure-devices.net/devices/d1/modules/m1"
        );
    }

    #[test]
    fn test_username_encodes_product_info() {
        let topics = TopicBuilder::new("d1", None);
        assert_eq!(
            topics.username("hub.azure-devices.net", "iothubclient/1.0", None),
            "hub.azure-devices.net/d1/?api-version=2017-11-08-preview&DeviceClientType=iothubclient%2F1.0"
        );
        assert!(topics
            .username("h", "p", Some("dtmi:x;1"))
            .ends_with("&model-id=dtmi%3Ax%3B1"));
    }

    #[test]
    fn test_request_topics() {
        assert_eq!(TopicBuilder::twin_get_topic(7), "$iothub/twin/GET/?$rid=7");
        assert_eq!(
            TopicBuilder::reported_properties_topic(8),
            "$iothub/twin/PATCH/properties/reported/?$rid=8"
        );
        assert_eq!(
            TopicBuilder::method_response_topic(200, "abc"),
            "$iothub/methods/res/200/?$rid=abc"
        );
    }
}
