//! Transport layer shared by the protocol bindings
//!
//! This module holds the contract both connection managers implement against:
//! the I/O seam, the transport configuration, and the small result types
//! returned to the client layer.
//!
//! - [`amqp`]: one AMQP connection multiplexing many device sessions
//! - [`mqtt`]: one MQTT client serving a single device or module

use crate::error::{TransportError, TransportResult};
use crate::options::{IoOptions, OptionValue, ProxyOptions};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod amqp;
pub mod mqtt;

/// Underlying TLS/socket I/O handed to a wire-protocol primitive.
///
/// The transports only configure it; reading and writing is the primitive's
/// business.
pub trait IoTransport: Send {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> TransportResult<()>;

    fn option(&self, name: &str) -> Option<&OptionValue>;

    fn hostname(&self) -> &str;

    fn proxy(&self) -> Option<&ProxyOptions>;
}

/// Creates a fresh I/O for every (re)connection
pub trait IoTransportFactory: Send + Sync {
    fn create(
        &self,
        hostname: &str,
        proxy: Option<&ProxyOptions>,
    ) -> TransportResult<Box<dyn IoTransport>>;
}

/// I/O description handed to primitives that open their own TLS socket
#[derive(Debug, Clone)]
pub struct TlsIo {
    hostname: String,
    proxy: Option<ProxyOptions>,
    options: IoOptions,
}

impl TlsIo {
    pub fn new<S: Into<String>>(hostname: S, proxy: Option<ProxyOptions>) -> Self {
        Self {
            hostname: hostname.into(),
            proxy,
            options: IoOptions::new(),
        }
    }

    pub fn options(&self) -> &IoOptions {
        &self.options
    }
}

impl IoTransport for TlsIo {
    fn set_option(&mut self, name: &str, value: &OptionValue) -> TransportResult<()> {
        if name.is_empty() {
            return Err(TransportError::invalid_argument("option name is empty"));
        }
        self.options.insert(name, value.clone());
        Ok(())
    }

    fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn proxy(&self) -> Option<&ProxyOptions> {
        self.proxy.as_ref()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TlsIoFactory;

impl IoTransportFactory for TlsIoFactory {
    fn create(
        &self,
        hostname: &str,
        proxy: Option<&ProxyOptions>,
    ) -> TransportResult<Box<dyn IoTransport>> {
        Ok(Box::new(TlsIo::new(hostname, proxy.cloned())))
    }
}

/// Whether a device still has telemetry to deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    Busy,
}

/// Outcome of `process_item`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessItemResult {
    Ok,
    Error,
    /// Not ready yet; offer the item again on a later tick
    Continue,
    NotConnected,
}

/// Reported-properties patch queued by the client layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwinReport {
    pub item_id: u32,
    pub data: Bytes,
}

impl TwinReport {
    pub fn new(item_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            item_id,
            data: data.into(),
        }
    }
}

/// Hub coordinates plus the creating device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub iothub_name: String,
    pub iothub_suffix: String,
    #[serde(default)]
    pub protocol_gateway_hostname: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub device_key: Option<String>,
    #[serde(default)]
    pub device_sas_token: Option<String>,
}

impl TransportConfig {
    pub fn new<N, S, D>(iothub_name: N, iothub_suffix: S, device_id: D) -> Self
    where
        N: Into<String>,
        S: Into<String>,
        D: Into<String>,
    {
        Self {
            iothub_name: iothub_name.into(),
            iothub_suffix: iothub_suffix.into(),
            protocol_gateway_hostname: None,
            device_id: device_id.into(),
            module_id: None,
            device_key: None,
            device_sas_token: None,
        }
    }

    pub fn with_gateway<S: Into<String>>(mut self, hostname: S) -> Self {
        self.protocol_gateway_hostname = Some(hostname.into());
        self
    }

    pub fn with_module<S: Into<String>>(mut self, module_id: S) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_device_key<S: Into<String>>(mut self, device_key: S) -> Self {
        self.device_key = Some(device_key.into());
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.iothub_name.trim().is_empty() {
            return Err(TransportError::invalid_argument("iothub name is empty"));
        }
        if self.iothub_suffix.trim().is_empty() {
            return Err(TransportError::invalid_argument("iothub suffix is empty"));
        }
        if self.device_id.trim().is_empty() {
            return Err(TransportError::invalid_argument("device id is empty"));
        }
        if self
            .protocol_gateway_hostname
            .as_deref()
            .is_some_and(|gateway| gateway.trim().is_empty())
        {
            return Err(TransportError::invalid_argument("gateway hostname is empty"));
        }
        Ok(())
    }

    /// Gateway hostname when set, `{name}.{suffix}` otherwise
    pub fn hostname(&self) -> String {
        match &self.protocol_gateway_hostname {
            Some(gateway) if !gateway.trim().is_empty() => gateway.clone(),
            _ => format!("{}.{}", self.iothub_name, self.iothub_suffix),
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("iothub_name", &self.iothub_name)
            .field("iothub_suffix", &self.iothub_suffix)
            .field("protocol_gateway_hostname", &self.protocol_gateway_hostname)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("device_key", &self.device_key.as_ref().map(|_| "***"))
            .field("device_sas_token", &self.device_sas_token.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_prefers_gateway() {
        let config = TransportConfig::new("hub", "azure-devices.net", "d1");
        assert_eq!(config.hostname(), "hub.azure-devices.net");
        assert_eq!(config.with_gateway("edge.local").hostname(), "edge.local");
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        assert!(TransportConfig::new("", "x", "d").validate().is_err());
        assert!(TransportConfig::new("h", "", "d").validate().is_err());
        assert!(TransportConfig::new("h", "x", " ").validate().is_err());
        assert!(TransportConfig::new("h", "x", "d").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_gateway() {
        let config = TransportConfig::new("h", "x", "d");

        assert!(config
            .clone()
            .with_gateway("  ")
            .validate()
            .is_err_and(|e| e.is_invalid_argument()));
        assert!(config.with_gateway("edge.local").validate().is_ok());
    }

    #[test]
    fn test_tls_io_records_options() {
        let io = TlsIoFactory.create("hub.local", None).unwrap();
        let mut io = io;
        io.set_option("TrustedCerts", &OptionValue::Text("pem".into()))
            .unwrap();
        assert_eq!(io.option("TrustedCerts").and_then(OptionValue::as_text), Some("pem"));
        assert_eq!(io.hostname(), "hub.local");
        assert!(io.set_option("", &OptionValue::Bool(true)).is_err());
    }

    #[test]
    fn test_config_debug_hides_key() {
        let config = TransportConfig::new("h", "x", "d").with_device_key("secret-key");
        assert!(!format!("{config:?}").contains("secret-key"));
    }
}
