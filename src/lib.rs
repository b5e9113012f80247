//! IoT Hub device transport core
//!
//! Connection managers that carry device traffic to and from an IoT Hub over
//! AMQP or MQTT: telemetry with acknowledgements, cloud-to-device messages,
//! device twin, direct methods and module input queues.
//!
//! # Overview
//!
//! Both transports are driven by a single-threaded `do_work` tick. Nothing
//! blocks and nothing runs behind the caller's back: every state change,
//! reconnection decision and callback happens inside that call.
//!
//! - [`transport::amqp::AmqpTransport`] multiplexes many devices over one
//!   AMQP connection. The wire protocol is supplied through the
//!   [`transport::amqp::AmqpConnectionFactory`] seam.
//! - [`transport::mqtt::MqttTransport`] serves one device or module over one
//!   MQTT client. [`transport::mqtt::RumqttcClient`] is the default client.
//!
//! Results flow back through [`callbacks::TransportCallbacks`]. Reconnection
//! is paced by [`retry::RetryController`].
//!
//! # Quick Start
//!
//! ```rust
//! use iothub_transport::message::{ConfirmationResult, Message, OutboundMessage, OutboundQueue};
//!
//! let queue = OutboundQueue::new();
//! let mut message = Message::from_string("{\"temperature\":21.5}");
//! message.set_property("alert", "false").unwrap();
//! queue.push(OutboundMessage::with_callback(message, |result| {
//!     assert_eq!(result, ConfirmationResult::BecauseDestroy);
//! }));
//! assert_eq!(queue.len(), 1);
//! ```

pub mod auth;
pub mod callbacks;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod message;
pub mod observability;
pub mod options;
pub mod registry;
pub mod retry;
pub mod sas;
pub mod telemetry;
pub mod testing;
pub mod transport;
pub mod twin;

pub use callbacks::{ConnectionStatus, ConnectionStatusReason, DeviceIdentity, TransportCallbacks};
pub use config::{AppConfig, ConfigError};
pub use device::{DeviceConfig, DeviceHandle};
pub use error::{TransportError, TransportResult};
pub use message::{ConfirmationResult, Message, OutboundMessage, OutboundQueue};
pub use transport::amqp::AmqpTransport;
pub use transport::mqtt::MqttTransport;
pub use transport::TransportConfig;
