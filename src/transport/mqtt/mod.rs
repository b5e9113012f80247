//! MQTT binding
//!
//! One MQTT 3.1.1 client per device or module, speaking the hub's topic
//! conventions for telemetry, cloud-to-device messages, twin and methods.
//!
//! # Architecture
//!
//! The module separates pure decisions from I/O:
//!
//! - [`connection`] - client and packet state, packet ids, topics and identity strings
//! - [`message_handler`] - inbound topic routing and the property-bag codec
//! - [`client`] - the [`MqttClient`] seam and its `rumqttc` implementation
//! - [`transport`] - the connection manager driving everything from `do_work`
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_transport::clock::SystemClock;
//! use iothub_transport::transport::mqtt::{MqttTransport, RumqttcClient};
//! use iothub_transport::transport::{TlsIoFactory, TransportConfig};
//! # use iothub_transport::testing::RecordingCallbacks;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = TransportConfig::new("myhub", "azure-devices.net", "d1").with_device_key("a2V5");
//! let client = RumqttcClient::from_current_runtime()?;
//! let mut transport = MqttTransport::new(
//!     &config,
//!     Box::new(client),
//!     Arc::new(TlsIoFactory),
//!     Arc::new(RecordingCallbacks::new()),
//!     Arc::new(SystemClock),
//! )?;
//! transport.do_work();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod transport;

pub use client::{
    ConnackCode, MqttClient, MqttClientError, MqttConnectOptions, MqttEvent, RumqttcClient,
};
pub use connection::{ClientStatus, PacketIdGenerator, PacketState, SubscriptionTopic, TopicBuilder, TopicSet};
pub use message_handler::{InboundRoute, MessageHandler};
pub use transport::MqttTransport;
