//! Pure inbound routing and property-bag codec for the MQTT binding
//!
//! Incoming publishes are routed by topic prefix; telemetry and
//! cloud-to-device messages carry their properties inside the topic as an
//! `&`-separated bag. Nothing here performs I/O.

use super::connection::{url_encode, METHOD_TOPIC_PREFIX, REQUEST_ID_MARKER, TWIN_TOPIC_PREFIX};
use crate::error::{TransportError, TransportResult};
use crate::message::{DiagnosticData, Message};
use url::form_urlencoded;
use tracing::{debug, warn};

const SYSTEM_PREFIXES: [&str; 2] = ["%24.", "$."];
const MESSAGE_ID: &str = "mid";
const CORRELATION_ID: &str = "cid";
const CONTENT_TYPE: &str = "ct";
const CONTENT_ENCODING: &str = "ce";
const CONNECTION_DEVICE_ID: &str = "cdid";
const CONNECTION_MODULE_ID: &str = "cmid";
const DIAGNOSTIC_ID: &str = "diagid";
const DIAGNOSTIC_CONTEXT: &str = "diagctx";
const DIAGNOSTIC_CREATION_TIME: &str = "creationtimeutc";
const OUTPUT_NAME: &str = "on";
/// Segment of an input queue topic holding the input name
const INPUT_NAME_SEGMENT: usize = 5;

/// Where an incoming publish goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute {
    /// Desired-properties patch
    TwinDesiredPatch,
    /// Answer to a twin get or reported-properties patch
    TwinResponse { status: i32, request_id: u16 },
    MethodRequest { name: String, request_id: String },
    InputMessage { input_name: String },
    CloudMessage,
}

/// Pure message routing decisions for incoming publishes
pub struct MessageHandler;

impl MessageHandler {
    /// Route by case-insensitive topic prefix.
    ///
    /// `input_queue` is the subscribed input queue filter, `#` included; input
    /// messages are only recognised while that subscription exists.
    pub fn route(topic: &str, input_queue: Option<&str>) -> TransportResult<InboundRoute> {
        if starts_with_ignore_case(topic, TWIN_TOPIC_PREFIX) {
            Self::parse_twin_topic(topic)
        } else if starts_with_ignore_case(topic, METHOD_TOPIC_PREFIX) {
            Self::parse_method_topic(topic)
        } else if let Some(prefix) =
            input_queue.filter(|q| starts_with_ignore_case(topic, q.trim_end_matches('#')))
        {
            debug!(topic, prefix, "Routing input queue message");
            let input_name = topic
                .split('/')
                .nth(INPUT_NAME_SEGMENT)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    TransportError::invalid_argument(format!("malformed input queue topic '{topic}'"))
                })?;
            Ok(InboundRoute::InputMessage {
                input_name: input_name.to_string(),
            })
        } else {
            Ok(InboundRoute::CloudMessage)
        }
    }

    /// `$iothub/twin/PATCH/...` or `$iothub/twin/res/{status}/?$rid={id}`
    pub fn parse_twin_topic(topic: &str) -> TransportResult<InboundRoute> {
        let mut segments = topic.split('/');
        let kind = segments.nth(2).unwrap_or_default();
        if kind.eq_ignore_ascii_case("PATCH") {
            return Ok(InboundRoute::TwinDesiredPatch);
        }
        let status = segments
            .next()
            .and_then(|s| s.parse::<i32>().ok())
            .ok_or_else(|| {
                TransportError::invalid_argument(format!("twin topic '{topic}' has no status"))
            })?;
        let request_id = request_id_of(topic)
            .and_then(|rid| rid.parse::<u16>().ok())
            .ok_or_else(|| {
                TransportError::invalid_argument(format!("twin topic '{topic}' has no request id"))
            })?;
        Ok(InboundRoute::TwinResponse { status, request_id })
    }

    /// `$iothub/methods/POST/{name}/?$rid={id}`
    pub fn parse_method_topic(topic: &str) -> TransportResult<InboundRoute> {
        let segments: Vec<&str> = topic.split('/').collect();
        let name = segments
            .get(3)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                TransportError::invalid_argument(format!("method topic '{topic}' has no name"))
            })?;
        let request_id = segments
            .get(4)
            .and_then(|segment| segment.strip_prefix(REQUEST_ID_MARKER))
            .ok_or_else(|| {
                TransportError::invalid_argument(format!("method topic '{topic}' has no request id"))
            })?;
        Ok(InboundRoute::MethodRequest {
            name: name.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// Copy the property bag of an inbound topic onto `message`.
    ///
    /// System properties are recognised by their `%24.`/`$.` prefix; values
    /// are URL-decoded only when `url_decode` is set, user property names too.
    /// User properties the message refuses are skipped with a warning.
    pub fn decode_properties(topic: &str, message: &mut Message, url_decode: bool) {
        for token in topic.split('&') {
            let Some((raw_name, raw_value)) = token.split_once('=') else {
                continue;
            };
            let name = if raw_name.starts_with("devices/") {
                raw_name.rsplit('/').next().unwrap_or(raw_name)
            } else {
                raw_name
            };

            if let Some(system_name) = SYSTEM_PREFIXES
                .iter()
                .find_map(|prefix| name.strip_prefix(prefix))
            {
                let value = if url_decode {
                    decode(raw_value)
                } else {
                    raw_value.to_string()
                };
                set_system_property(message, system_name, value);
                continue;
            }
            if name.starts_with("iothub-") {
                continue;
            }

            let (key, value) = if url_decode {
                (decode(name), decode(raw_value))
            } else {
                (name.to_string(), raw_value.to_string())
            };
            if let Err(e) = message.set_property(&key, &value) {
                warn!(property = %key.escape_default(), error = %e, "Skipping inbound property");
            }
        }
    }

    /// Property bag appended to the telemetry topic of `message`.
    ///
    /// Order: user properties, `cid`, `mid`, `ct`, `ce`, diagnostics, then the
    /// output name with its trailing `/`. Diagnostic id and creation time
    /// come together or the message is rejected.
    pub fn encode_properties(message: &Message, url_encode_values: bool) -> TransportResult<String> {
        let mut bag = PropertyBag::default();

        for (key, value) in message.user_properties() {
            if url_encode_values {
                bag.push(&url_encode(key), &url_encode(value));
            } else {
                bag.push(key, value);
            }
        }

        let properties = message.properties();
        let system = [
            (CORRELATION_ID, properties.correlation_id.as_deref()),
            (MESSAGE_ID, properties.message_id.as_deref()),
            (CONTENT_TYPE, properties.content_type.as_deref()),
            (CONTENT_ENCODING, properties.content_encoding.as_deref()),
        ];
        for (name, value) in system {
            if let Some(value) = value {
                let value = if url_encode_values {
                    url_encode(value)
                } else {
                    value.to_string()
                };
                bag.push_system(name, &value);
            }
        }

        if let Some(diagnostic) = &properties.diagnostic {
            Self::encode_diagnostic(&mut bag, diagnostic)?;
        }

        if let Some(output_name) = &properties.output_name {
            bag.push_system(OUTPUT_NAME, &format!("{output_name}/"));
        }

        Ok(bag.into_string())
    }

    fn encode_diagnostic(bag: &mut PropertyBag, diagnostic: &DiagnosticData) -> TransportResult<()> {
        match (&diagnostic.diagnostic_id, &diagnostic.creation_time_utc) {
            (Some(id), Some(created)) => {
                bag.push_system(DIAGNOSTIC_ID, id);
                let context = format!("{DIAGNOSTIC_CREATION_TIME}={created}");
                bag.push_system(DIAGNOSTIC_CONTEXT, &url_encode(&context));
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(TransportError::invalid_argument(
                "diagnostic id and creation time must be present together",
            )),
        }
    }
}

#[derive(Default)]
struct PropertyBag {
    text: String,
}

impl PropertyBag {
    fn push(&mut self, key: &str, value: &str) {
        if !self.text.is_empty() {
            self.text.push('&');
        }
        self.text.push_str(key);
        self.text.push('=');
        self.text.push_str(value);
    }

    fn push_system(&mut self, name: &str, value: &str) {
        self.push(&format!("%24.{name}"), value);
    }

    fn into_string(self) -> String {
        self.text
    }
}

fn set_system_property(message: &mut Message, name: &str, value: String) {
    let properties = message.properties_mut();
    match name {
        MESSAGE_ID => properties.message_id = Some(value),
        CORRELATION_ID => properties.correlation_id = Some(value),
        CONTENT_TYPE => properties.content_type = Some(value),
        CONTENT_ENCODING => properties.content_encoding = Some(value),
        CONNECTION_DEVICE_ID => properties.connection_device_id = Some(value),
        CONNECTION_MODULE_ID => properties.connection_module_id = Some(value),
        // expiry, user id, destination and the like are not surfaced
        _ => {}
    }
}

fn decode(text: &str) -> String {
    // form decoding treats '+' as a space; protect literal pluses first
    let protected = text.replace('+', "%2B");
    form_urlencoded::parse(format!("x={protected}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

fn request_id_of(topic: &str) -> Option<&str> {
    let start = topic.find(REQUEST_ID_MARKER)? + REQUEST_ID_MARKER.len();
    let rest = &topic[start..];
    Some(rest.split('&').next().unwrap_or(rest))
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_twin_topics() {
        assert_eq!(
            MessageHandler::route("$iothub/twin/res/200/?$rid=12", None).unwrap(),
            InboundRoute::TwinResponse {
                status: 200,
                request_id: 12
            }
        );
        assert_eq!(
            MessageHandler::route("$iothub/twin/PATCH/properties/desired/?$version=3", None)
                .unwrap(),
            InboundRoute::TwinDesiredPatch
        );
        assert!(MessageHandler::route("$iothub/twin/res/abc", None).is_err());
    }

    #[test]
    fn test_route_is_case_insensitive() {
        assert_eq!(
            MessageHandler::route("$IOTHUB/Twin/res/204/?$rid=3", None).unwrap(),
            InboundRoute::TwinResponse {
                status: 204,
                request_id: 3
            }
        );
        assert_eq!(
            MessageHandler::route("$iothub/twin/patch/properties/desired/?$version=4", None)
                .unwrap(),
            InboundRoute::TwinDesiredPatch
        );
    }

    #[test]
    fn test_route_method_request() {
        assert_eq!(
            MessageHandler::route("$iothub/methods/POST/reboot/?$rid=a1", None).unwrap(),
            InboundRoute::MethodRequest {
                name: "reboot".into(),
                request_id: "a1".into()
            }
        );
        assert!(MessageHandler::route("$iothub/methods/POST/reboot", None).is_err());
    }

    #[test]
    fn test_route_input_queue_only_when_subscribed() {
        let topic = "devices/d1/modules/m1/inputs/input1/%24.mid=5";
        assert_eq!(
            MessageHandler::route(topic, Some("devices/d1/modules/m1/#")).unwrap(),
            InboundRoute::InputMessage {
                input_name: "input1".into()
            }
        );
        assert_eq!(
            MessageHandler::route(topic, None).unwrap(),
            InboundRoute::CloudMessage
        );
    }

    #[test]
    fn test_decode_system_and_user_properties() {
        let mut message = Message::from_string("x");
        MessageHandler::decode_properties(
            "devices/d1/messages/devicebound/%24.mid=m-1&%24.cid=c-1&%24.to=%2Fdevices%2Fd1&%24.ct=application%2Fjson&color=red",
            &mut message,
            false,
        );

        let properties = message.properties();
        assert_eq!(properties.message_id.as_deref(), Some("m-1"));
        assert_eq!(properties.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(properties.content_type.as_deref(), Some("application%2Fjson"));
        assert_eq!(message.property("color"), Some("red"));
        assert_eq!(message.user_properties().count(), 1);
    }

    #[test]
    fn test_decode_url_decodes_when_enabled() {
        let mut message = Message::from_string("x");
        MessageHandler::decode_properties(
            "devices/d1/messages/devicebound/%24.ct=application%2Fjson&my%20key=a%26b+c",
            &mut message,
            true,
        );
        assert_eq!(
            message.properties().content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(message.property("my key"), Some("a&b+c"));
    }

    #[test]
    fn test_encode_orders_properties() {
        let mut message = Message::from_string("x");
        message.set_property("k", "v").unwrap();
        let properties = message.properties_mut();
        properties.message_id = Some("m".into());
        properties.correlation_id = Some("c".into());
        properties.output_name = Some("out".into());

        let bag = MessageHandler::encode_properties(&message, false).unwrap();

        assert_eq!(bag, "k=v&%24.cid=c&%24.mid=m&%24.on=out/");
    }

    #[test]
    fn test_encode_diagnostic_requires_both_parts() {
        let mut message = Message::from_string("x");
        message.properties_mut().diagnostic = Some(DiagnosticData {
            diagnostic_id: Some("d".into()),
            creation_time_utc: None,
        });
        assert!(MessageHandler::encode_properties(&message, false).is_err());

        message.properties_mut().diagnostic = Some(DiagnosticData {
            diagnostic_id: Some("d".into()),
            creation_time_utc: Some("2020-01-01T00:00:00Z".into()),
        });
        let bag = MessageHandler::encode_properties(&message, false).unwrap();
        assert_eq!(
            bag,
            "%24.diagid=d&%24.diagctx=creationtimeutc%3D2020-01-01T00%3A00%3A00Z"
        );
    }

    #[test]
    fn test_encode_url_encodes_user_properties() {
        let mut message = Message::from_string("x");
        message.set_property("a b", "c&d").unwrap();
        assert_eq!(
            MessageHandler::encode_properties(&message, true).unwrap(),
            "a%20b=c%26d"
        );
        assert_eq!(
            MessageHandler::encode_properties(&message, false).unwrap(),
            "a b=c&d"
        );
    }
}
