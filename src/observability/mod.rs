//! Observability
//!
//! Subscriber setup and span helpers for the `tracing` events the transports
//! emit.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

pub use logging::{device_span, transport_span};
