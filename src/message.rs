//! Message container and the outbound envelope
//!
//! [`Message`] is the value type exchanged with the client layer: a body,
//! system properties, an application property bag and, for received
//! messages, the [`DispositionContext`] needed to acknowledge them later.
//! [`OutboundMessage`] pairs a message with its completion closure and
//! [`OutboundQueue`] is the caller-owned list the transports drain.

use crate::error::{TransportError, TransportResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How the body was supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    ByteArray,
    String,
}

/// Diagnostic sampling data attached to telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticData {
    pub diagnostic_id: Option<String>,
    pub creation_time_utc: Option<String>,
}

/// System properties carried next to the body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub output_name: Option<String>,
    pub input_name: Option<String>,
    pub connection_device_id: Option<String>,
    pub connection_module_id: Option<String>,
    pub diagnostic: Option<DiagnosticData>,
}

/// Protocol specific handle needed to acknowledge a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionToken {
    Amqp { link_name: String, delivery_id: u32 },
    Mqtt { packet_id: u16, qos: QoS },
}

/// Runs once when the disposition context goes away
pub type ReleaseFn = Box<dyn FnOnce(&DispositionToken) + Send>;

/// Token plus release hook attached to an inbound message.
///
/// The release hook runs exactly once when the context is dropped, which
/// happens when the transport consumes it for a disposition or when the
/// message carrying it is dropped.
pub struct DispositionContext {
    token: DispositionToken,
    release: Option<ReleaseFn>,
}

impl DispositionContext {
    pub fn new(token: DispositionToken, release: ReleaseFn) -> Self {
        Self {
            token,
            release: Some(release),
        }
    }

    /// Context without a release hook
    pub fn from_token(token: DispositionToken) -> Self {
        Self {
            token,
            release: None,
        }
    }

    pub fn token(&self) -> &DispositionToken {
        &self.token
    }
}

impl fmt::Debug for DispositionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispositionContext")
            .field("token", &self.token)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

impl Drop for DispositionContext {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(&self.token);
        }
    }
}

/// Outcome the application applies to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Accepted,
    Rejected,
    Abandoned,
}

/// Bytes allowed in application property keys and values
fn is_valid_property_text(text: &str) -> bool {
    text.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// Device-to-cloud or cloud-to-device message
#[derive(Debug)]
pub struct Message {
    body: Bytes,
    body_kind: BodyKind,
    properties: MessageProperties,
    user_properties: Vec<(String, String)>,
    disposition: Option<DispositionContext>,
}

impl Message {
    pub fn from_bytes(body: impl Into<Bytes>) -> Self {
        Self::with_kind(body.into(), BodyKind::ByteArray)
    }

    pub fn from_string(body: &str) -> Self {
        Self::with_kind(Bytes::copy_from_slice(body.as_bytes()), BodyKind::String)
    }

    fn with_kind(body: Bytes, body_kind: BodyKind) -> Self {
        Self {
            body,
            body_kind,
            properties: MessageProperties::default(),
            user_properties: Vec::new(),
            disposition: None,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_kind(&self) -> BodyKind {
        self.body_kind
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    /// Add or replace an application property.
    ///
    /// Keys and values are restricted to printable US-ASCII; anything else is
    /// rejected and the property bag is left unchanged.
    pub fn set_property(&mut self, key: &str, value: &str) -> TransportResult<()> {
        if key.is_empty() {
            return Err(TransportError::invalid_argument("property key is empty"));
        }
        if !is_valid_property_text(key) || !is_valid_property_text(value) {
            return Err(TransportError::invalid_argument(format!(
                "property '{}' contains bytes outside 0x20..=0x7E",
                key.escape_default()
            )));
        }

        match self.user_properties.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self
                .user_properties
                .push((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Application properties in insertion order
    pub fn user_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.user_properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Attach the acknowledgement context, releasing any previous one
    pub fn set_disposition_context(&mut self, context: DispositionContext) {
        self.disposition = Some(context);
    }

    pub fn disposition_context(&self) -> Option<&DispositionContext> {
        self.disposition.as_ref()
    }

    pub fn take_disposition_context(&mut self) -> Option<DispositionContext> {
        self.disposition.take()
    }
}

/// Result delivered to an outbound message's completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    Ok,
    Error,
    MessageTimeout,
    BecauseDestroy,
}

impl fmt::Display for ConfirmationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConfirmationResult::Ok => "OK",
            ConfirmationResult::Error => "ERROR",
            ConfirmationResult::MessageTimeout => "MESSAGE_TIMEOUT",
            ConfirmationResult::BecauseDestroy => "BECAUSE_DESTROY",
        };
        f.write_str(text)
    }
}

/// Completion closure of an outbound message
pub type CompletionFn = Box<dyn FnOnce(ConfirmationResult) + Send>;

/// Message queued for sending together with its completion callback.
///
/// `complete` consumes the envelope, so a callback can fire at most once. An
/// envelope dropped without completion reports `BecauseDestroy`.
pub struct OutboundMessage {
    message: Message,
    on_complete: Option<CompletionFn>,
}

impl OutboundMessage {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            on_complete: None,
        }
    }

    pub fn with_callback<F>(message: Message, on_complete: F) -> Self
    where
        F: FnOnce(ConfirmationResult) + Send + 'static,
    {
        Self {
            message,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn complete(mut self, result: ConfirmationResult) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(result);
        }
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("message", &self.message)
            .field("pending_completion", &self.on_complete.is_some())
            .finish()
    }
}

impl Drop for OutboundMessage {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(ConfirmationResult::BecauseDestroy);
        }
    }
}

/// Caller-owned FIFO of messages waiting to be sent.
///
/// Clones share the same list: the client layer keeps one handle to push
/// into and gives another to `register`.
#[derive(Clone, Default)]
pub struct OutboundQueue {
    inner: Arc<Mutex<VecDeque<OutboundMessage>>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundMessage>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: OutboundMessage) {
        self.lock().push_back(message);
    }

    pub fn pop_front(&self) -> Option<OutboundMessage> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every queued message, oldest first
    pub fn drain(&self) -> Vec<OutboundMessage> {
        self.lock().drain(..).collect()
    }
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_body_kind_follows_constructor() {
        assert_eq!(Message::from_string("hi").body_kind(), BodyKind::String);
        assert_eq!(
            Message::from_bytes(vec![1u8, 2, 3]).body_kind(),
            BodyKind::ByteArray
        );
        assert_eq!(Message::from_string("hi").body().as_ref(), b"hi");
    }

    #[test]
    fn test_set_property_replaces_existing_key() {
        let mut message = Message::from_string("x");
        message.set_property("a", "1").unwrap();
        message.set_property("b", "2").unwrap();
        message.set_property("a", "3").unwrap();

        let props: Vec<_> = message.user_properties().collect();
        assert_eq!(props, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_set_property_rejects_non_ascii() {
        let mut message = Message::from_string("x");
        assert!(message.set_property("temp", "20°").is_err());
        assert!(message.set_property("tab\tkey", "v").is_err());
        assert!(message.set_property("k", "line\n").is_err());
        assert!(message.set_property("", "v").is_err());
        assert_eq!(message.user_properties().count(), 0);
    }

    #[test]
    fn test_set_property_accepts_printable_ascii_bounds() {
        let mut message = Message::from_string("x");
        assert!(message.set_property(" ~", "~ ").is_ok());
        assert_eq!(message.property(" ~"), Some("~ "));
    }

    #[test]
    fn test_disposition_context_release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let context = DispositionContext::new(
            DispositionToken::Mqtt {
                packet_id: 7,
                qos: QoS::AtLeastOnce,
            },
            Box::new(move |_token| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut message = Message::from_string("x");
        message.set_disposition_context(context);
        drop(message);

        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outbound_message_completes_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let outbound = OutboundMessage::with_callback(Message::from_string("x"), move |r| {
            sink.lock().unwrap().push(r);
        });

        outbound.complete(ConfirmationResult::Ok);

        assert_eq!(*calls.lock().unwrap(), vec![ConfirmationResult::Ok]);
    }

    #[test]
    fn test_dropped_outbound_message_reports_destroy() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let outbound = OutboundMessage::with_callback(Message::from_string("x"), move |r| {
            sink.lock().unwrap().push(r);
        });

        drop(outbound);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![ConfirmationResult::BecauseDestroy]
        );
    }

    #[test]
    fn test_outbound_queue_clones_share_storage() {
        let queue = OutboundQueue::new();
        let handle = queue.clone();
        handle.push(OutboundMessage::new(Message::from_string("a")));
        handle.push(OutboundMessage::new(Message::from_string("b")));

        assert_eq!(queue.len(), 2);
        let first = queue.pop_front().unwrap();
        assert_eq!(first.message().body().as_ref(), b"a");
        assert_eq!(handle.len(), 1);
    }
}
