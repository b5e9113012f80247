//! AMQP wire-protocol primitives as seen by the connection manager.
//!
//! The AMQP library itself lives outside this crate. These traits describe
//! the operations the transport drives and the events each primitive reports
//! back from its `do_work`, which the transport processes immediately after
//! the call returns.

use crate::auth::Authorization;
use crate::callbacks::{MethodHandle, MethodRequest, TwinUpdateState};
use crate::error::TransportResult;
use crate::message::{ConfirmationResult, DispositionToken, Message};
use crate::transport::{IoTransport, SendStatus};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// State reported by the AMQP connection primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpConnectionState {
    Closed,
    Opened,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpConnectionEvent {
    StateChanged {
        previous: AmqpConnectionState,
        current: AmqpConnectionState,
    },
}

/// How a device proves its identity on the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAuthMode {
    /// Claims-based security with SAS tokens
    Cbs,
    X509,
}

/// Settings the connection primitive is created with
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpConnectionConfig {
    pub iothub_host_fqdn: String,
    pub create_sasl_io: bool,
    pub create_cbs_connection: bool,
    pub is_trace_on: bool,
    pub svc2cl_keep_alive_timeout_secs: u64,
    pub cl2svc_keep_alive_send_ratio: f64,
}

pub trait AmqpConnection: Send {
    fn do_work(&mut self) -> Vec<AmqpConnectionEvent>;

    fn set_logging(&mut self, is_trace_on: bool) -> TransportResult<()>;

    /// Session handle borrowed by device sessions for the current tick
    fn has_session(&self) -> bool;

    /// CBS handle, present only when created with `create_cbs_connection`
    fn has_cbs(&self) -> bool;
}

/// Lifecycle state of one device on the shared connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Starting,
    Started,
    Stopping,
    ErrorAuth,
    ErrorAuthTimeout,
    ErrorMsg,
}

impl DeviceState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            DeviceState::ErrorAuth | DeviceState::ErrorAuthTimeout | DeviceState::ErrorMsg
        )
    }
}

/// Outcome of a telemetry send reported by the device primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum D2cSendResult {
    Ok,
    ErrorCannotParse,
    ErrorFailSending,
    ErrorTimeout,
    ErrorUnknown,
    DeviceDestroyed,
}

impl D2cSendResult {
    pub fn confirmation(self) -> ConfirmationResult {
        match self {
            D2cSendResult::Ok => ConfirmationResult::Ok,
            D2cSendResult::ErrorCannotParse
            | D2cSendResult::ErrorFailSending
            | D2cSendResult::ErrorUnknown => ConfirmationResult::Error,
            D2cSendResult::ErrorTimeout => ConfirmationResult::MessageTimeout,
            D2cSendResult::DeviceDestroyed => ConfirmationResult::BecauseDestroy,
        }
    }

    /// Results that count against the device's send health
    pub fn is_failure(self) -> bool {
        !matches!(self, D2cSendResult::Ok | D2cSendResult::DeviceDestroyed)
    }
}

/// Native acknowledgment applied to a received AMQP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpDisposition {
    Accepted,
    Released,
    Rejected,
}

/// Tunables forwarded to every device primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpDeviceOption {
    CbsRequestTimeoutSecs(u64),
    EventSendTimeoutSecs(u64),
}

#[derive(Debug)]
pub enum AmqpDeviceEvent {
    StateChanged {
        previous: DeviceState,
        current: DeviceState,
    },
    SendComplete {
        tag: u64,
        result: D2cSendResult,
    },
    /// Cloud-to-device message; the transport attaches the disposition context
    MessageReceived {
        message: Message,
        link_name: String,
        delivery_id: u32,
    },
    TwinUpdateReceived {
        state: TwinUpdateState,
        payload: Bytes,
    },
    TwinGetComplete {
        correlation_id: String,
        payload: Option<Bytes>,
    },
    TwinReportComplete {
        correlation_id: String,
        status_code: i32,
    },
    MethodRequest(MethodRequest),
    /// The service detached the methods links
    MethodsUnsubscribed,
}

/// Settings a device primitive is created with
#[derive(Clone)]
pub struct AmqpDeviceConfig {
    pub device_id: String,
    pub module_id: Option<String>,
    pub iothub_host_fqdn: String,
    pub authentication_mode: DeviceAuthMode,
    pub authorization: Arc<dyn Authorization>,
    pub product_info: Option<String>,
}

impl fmt::Debug for AmqpDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpDeviceConfig")
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("iothub_host_fqdn", &self.iothub_host_fqdn)
            .field("authentication_mode", &self.authentication_mode)
            .finish()
    }
}

/// One device's authentication, messaging, twin and methods links
pub trait AmqpDevice: Send {
    fn start_async(&mut self, connection: &dyn AmqpConnection) -> TransportResult<()>;

    fn stop(&mut self) -> TransportResult<()>;

    fn delayed_stop(&mut self, delay: Duration) -> TransportResult<()>;

    fn do_work(&mut self) -> Vec<AmqpDeviceEvent>;

    /// Queue a telemetry message; the returned tag identifies its completion
    fn send_event_async(&mut self, message: &Message) -> TransportResult<u64>;

    fn send_status(&self) -> TransportResult<SendStatus>;

    fn set_option(&mut self, option: AmqpDeviceOption) -> TransportResult<()>;

    fn subscribe_message(&mut self) -> TransportResult<()>;

    fn unsubscribe_message(&mut self) -> TransportResult<()>;

    fn send_message_disposition(
        &mut self,
        token: &DispositionToken,
        disposition: AmqpDisposition,
    ) -> TransportResult<()>;

    fn subscribe_for_twin_updates(&mut self) -> TransportResult<()>;

    fn unsubscribe_for_twin_updates(&mut self) -> TransportResult<()>;

    fn get_twin_async(&mut self, correlation_id: &str) -> TransportResult<()>;

    fn send_twin_update_async(&mut self, correlation_id: &str, data: &Bytes) -> TransportResult<()>;

    fn methods_subscribe(&mut self, connection: &dyn AmqpConnection) -> TransportResult<()>;

    fn methods_unsubscribe(&mut self);

    fn methods_respond(
        &mut self,
        handle: &MethodHandle,
        payload: &[u8],
        status: i32,
    ) -> TransportResult<()>;
}

/// Creates the connection and device primitives
pub trait AmqpConnectionFactory: Send {
    fn create_connection(
        &mut self,
        config: &AmqpConnectionConfig,
        io: &mut dyn IoTransport,
    ) -> TransportResult<Box<dyn AmqpConnection>>;

    fn create_device(&mut self, config: &AmqpDeviceConfig) -> TransportResult<Box<dyn AmqpDevice>>;
}
