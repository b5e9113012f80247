//! Testing utilities and mock implementations
//!
//! Scripted stand-ins for the clock, credentials, I/O, the AMQP primitives
//! and the MQTT client, so both transports can be exercised without a hub.

pub mod mocks;

pub use mocks::*;
