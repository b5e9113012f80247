//! AMQP binding
//!
//! Several devices share one AMQP connection. The wire protocol itself is
//! provided by an external library behind the [`primitives`] traits.
//!
//! # Architecture
//!
//! - [`primitives`]: traits and events of the connection and device primitives
//! - `session`: per-device lifecycle, telemetry, twin and methods bookkeeping
//! - [`transport`]: the connection manager owning I/O, connection and retry

pub mod primitives;
mod session;
pub mod transport;

pub use primitives::{
    AmqpConnection, AmqpConnectionConfig, AmqpConnectionEvent, AmqpConnectionFactory,
    AmqpConnectionState, AmqpDevice, AmqpDeviceConfig, AmqpDeviceEvent, AmqpDeviceOption,
    AmqpDisposition, D2cSendResult, DeviceAuthMode, DeviceState,
};
pub use session::{
    MethodSubscription, DEFAULT_DEVICE_STOP_DELAY, DEFAULT_MAX_DEVICE_FAILURES,
    DEFAULT_STATE_CHANGE_TIMEOUT,
};
pub use transport::{AmqpTransport, AmqpTransportSettings, AmqpTransportState, AuthPreference};
