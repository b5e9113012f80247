//! Callback surface the transports invoke on the client layer.
//!
//! One [`TransportCallbacks`] object is shared by a transport and all its
//! device sessions. Every call names the device it concerns, which is how a
//! multiplexed AMQP transport routes events back to the right client.

use crate::message::{ConfirmationResult, Message, OutboundMessage};
use bytes::Bytes;
use std::fmt;

/// Device (and optional module) a session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub module_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new<S: Into<String>>(device_id: S) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
        }
    }

    pub fn with_module<S: Into<String>, M: Into<String>>(device_id: S, module_id: M) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module_id {
            Some(module_id) => write!(f, "{}/{}", self.device_id, module_id),
            None => f.write_str(&self.device_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusReason {
    Ok,
    NoNetwork,
    CommunicationError,
    BadCredential,
    ExpiredSasToken,
    NoPingResponse,
    RetryExpired,
    DeviceDisabled,
}

/// Whether a twin payload is the full document or a desired-properties patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateState {
    Complete,
    Partial,
}

/// Correlates a method response with its request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHandle {
    request_id: String,
}

impl MethodHandle {
    pub fn new<S: Into<String>>(request_id: S) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// Direct method invocation received from the service
#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub name: String,
    pub payload: Bytes,
    pub handle: MethodHandle,
}

/// Callback invoked once with the result of an on-demand twin get.
/// `None` means the request timed out or was aborted.
pub type TwinGetCallback = Box<dyn FnOnce(TwinUpdateState, Option<&[u8]>) + Send>;

/// Client-layer hooks invoked from inside `do_work`
pub trait TransportCallbacks: Send + Sync {
    /// Cloud-to-device message. Returning `false` declines the message.
    fn message_received(&self, device: &DeviceIdentity, message: Message) -> bool;

    /// Message arriving on a module input queue. Returning `false` declines it.
    fn input_message_received(&self, device: &DeviceIdentity, message: Message) -> bool;

    fn connection_status_changed(
        &self,
        device: &DeviceIdentity,
        status: ConnectionStatus,
        reason: ConnectionStatusReason,
    );

    /// Batch of outbound messages finished with the same result.
    ///
    /// The default completes each envelope, which fires its own callback.
    fn send_complete(
        &self,
        _device: &DeviceIdentity,
        messages: Vec<OutboundMessage>,
        result: ConfirmationResult,
    ) {
        for message in messages {
            message.complete(result);
        }
    }

    fn twin_reported_state_complete(&self, device: &DeviceIdentity, item_id: u32, status_code: i32);

    fn twin_retrieve_properties_complete(
        &self,
        device: &DeviceIdentity,
        state: TwinUpdateState,
        payload: &[u8],
    );

    /// Direct method request. Returning `false` means no response will follow.
    fn device_method(&self, device: &DeviceIdentity, request: MethodRequest) -> bool;

    /// Product information appended to the connection identity
    fn product_info(&self) -> Option<String> {
        None
    }

    fn model_id(&self) -> Option<String> {
        None
    }
}
