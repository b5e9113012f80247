//! Typed `set_option` values.
//!
//! Options the transports do not interpret themselves end up in
//! [`IoOptions`], which is replayed onto every I/O instance the transport
//! creates, so reconnections keep the TLS configuration the caller set.

use crate::error::{TransportError, TransportResult};
use crate::transport::IoTransport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const OPTION_CBS_REQUEST_TIMEOUT: &str = "cbs_request_timeout";
pub const OPTION_EVENT_SEND_TIMEOUT_SECS: &str = "event_send_timeout_secs";
pub const OPTION_RETRY_INTERVAL_SEC: &str = "retry_interval_sec";
pub const OPTION_RETRY_MAX_DELAY_SECS: &str = "retry_max_delay_secs";
pub const OPTION_SERVICE_SIDE_KEEP_ALIVE_FREQ_SECS: &str = "svc2cl_keep_alive_timeout_secs";
pub const OPTION_REMOTE_IDLE_TIMEOUT_RATIO: &str = "cl2svc_keep_alive_send_ratio";
pub const OPTION_KEEP_ALIVE: &str = "keepalive";
pub const OPTION_LOG_TRACE: &str = "logtrace";
pub const OPTION_RAW_LOG_TRACE: &str = "rawlogtrace";
pub const OPTION_HTTP_PROXY: &str = "proxy_data";
pub const OPTION_X509_CERT: &str = "x509certificate";
pub const OPTION_X509_PRIVATE_KEY: &str = "x509privatekey";
pub const OPTION_X509_ECC_CERT: &str = "x509EccCertificate";
pub const OPTION_X509_ECC_KEY: &str = "x509EccAliasKey";
pub const OPTION_AUTO_URL_ENCODE_DECODE: &str = "auto_url_encode_decode";
pub const OPTION_CONNECTION_TIMEOUT: &str = "connect_timeout";

/// Untyped option value passed through to the I/O layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(x) => write!(f, "{x}"),
            OptionValue::Text(_) => f.write_str("<text>"),
        }
    }
}

/// HTTP proxy the I/O layer tunnels through
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Host is required; username and password come together or not at all
    pub fn validate(&self) -> TransportResult<()> {
        if self.host.trim().is_empty() {
            return Err(TransportError::invalid_argument("proxy host is required"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(TransportError::invalid_argument(
                "proxy username and password must both be set or both be omitted",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Option accepted by `set_option`
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOption {
    CbsRequestTimeoutSecs(u64),
    EventSendTimeoutSecs(u64),
    RetryIntervalSecs(u64),
    RetryMaxDelaySecs(u64),
    ServiceSideKeepAliveSecs(u64),
    RemoteIdleTimeoutRatio(f64),
    KeepAliveSecs(u16),
    LogTrace(bool),
    RawLogTrace(bool),
    HttpProxy(ProxyOptions),
    X509Certificate(String),
    X509PrivateKey(String),
    X509EccCertificate(String),
    X509EccAliasKey(String),
    AutoUrlEncodeDecode(bool),
    ConnectionTimeoutSecs(u64),
    /// Anything else, handed to the I/O layer verbatim
    Io { name: String, value: OptionValue },
}

impl TransportOption {
    pub fn name(&self) -> &str {
        match self {
            TransportOption::CbsRequestTimeoutSecs(_) => OPTION_CBS_REQUEST_TIMEOUT,
            TransportOption::EventSendTimeoutSecs(_) => OPTION_EVENT_SEND_TIMEOUT_SECS,
            TransportOption::RetryIntervalSecs(_) => OPTION_RETRY_INTERVAL_SEC,
            TransportOption::RetryMaxDelaySecs(_) => OPTION_RETRY_MAX_DELAY_SECS,
            TransportOption::ServiceSideKeepAliveSecs(_) => OPTION_SERVICE_SIDE_KEEP_ALIVE_FREQ_SECS,
            TransportOption::RemoteIdleTimeoutRatio(_) => OPTION_REMOTE_IDLE_TIMEOUT_RATIO,
            TransportOption::KeepAliveSecs(_) => OPTION_KEEP_ALIVE,
            TransportOption::LogTrace(_) => OPTION_LOG_TRACE,
            TransportOption::RawLogTrace(_) => OPTION_RAW_LOG_TRACE,
            TransportOption::HttpProxy(_) => OPTION_HTTP_PROXY,
            TransportOption::X509Certificate(_) => OPTION_X509_CERT,
            TransportOption::X509PrivateKey(_) => OPTION_X509_PRIVATE_KEY,
            TransportOption::X509EccCertificate(_) => OPTION_X509_ECC_CERT,
            TransportOption::X509EccAliasKey(_) => OPTION_X509_ECC_KEY,
            TransportOption::AutoUrlEncodeDecode(_) => OPTION_AUTO_URL_ENCODE_DECODE,
            TransportOption::ConnectionTimeoutSecs(_) => OPTION_CONNECTION_TIMEOUT,
            TransportOption::Io { name, .. } => name,
        }
    }

    pub fn is_x509(&self) -> bool {
        matches!(
            self,
            TransportOption::X509Certificate(_)
                | TransportOption::X509PrivateKey(_)
                | TransportOption::X509EccCertificate(_)
                | TransportOption::X509EccAliasKey(_)
        )
    }

    /// Name and value as seen by the I/O layer, for options it consumes
    pub fn to_io_option(&self) -> Option<(String, OptionValue)> {
        match self {
            TransportOption::X509Certificate(v)
            | TransportOption::X509PrivateKey(v)
            | TransportOption::X509EccCertificate(v)
            | TransportOption::X509EccAliasKey(v) => {
                Some((self.name().to_string(), OptionValue::Text(v.clone())))
            }
            TransportOption::Io { name, value } => Some((name.clone(), value.clone())),
            _ => None,
        }
    }

    /// Untyped value, as handed to an I/O that receives the option verbatim
    pub fn value(&self) -> Option<OptionValue> {
        let int = |v: u64| OptionValue::Int(i64::try_from(v).unwrap_or(i64::MAX));
        match self {
            TransportOption::CbsRequestTimeoutSecs(v)
            | TransportOption::EventSendTimeoutSecs(v)
            | TransportOption::RetryIntervalSecs(v)
            | TransportOption::RetryMaxDelaySecs(v)
            | TransportOption::ServiceSideKeepAliveSecs(v)
            | TransportOption::ConnectionTimeoutSecs(v) => Some(int(*v)),
            TransportOption::RemoteIdleTimeoutRatio(ratio) => Some(OptionValue::Float(*ratio)),
            TransportOption::KeepAliveSecs(secs) => Some(OptionValue::Int(i64::from(*secs))),
            TransportOption::LogTrace(b)
            | TransportOption::RawLogTrace(b)
            | TransportOption::AutoUrlEncodeDecode(b) => Some(OptionValue::Bool(*b)),
            TransportOption::HttpProxy(_) => None,
            TransportOption::X509Certificate(v)
            | TransportOption::X509PrivateKey(v)
            | TransportOption::X509EccCertificate(v)
            | TransportOption::X509EccAliasKey(v) => Some(OptionValue::Text(v.clone())),
            TransportOption::Io { value, .. } => Some(value.clone()),
        }
    }

    /// Build an option from its wire name, as found in a configuration file
    pub fn from_name_value(name: &str, value: OptionValue) -> TransportResult<Self> {
        let unsigned = |value: &OptionValue| -> TransportResult<u64> {
            value
                .as_int()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| {
                    TransportError::invalid_argument(format!("'{name}' expects a non-negative integer"))
                })
        };
        let flag = |value: &OptionValue| -> TransportResult<bool> {
            value.as_bool().ok_or_else(|| {
                TransportError::invalid_argument(format!("'{name}' expects a boolean"))
            })
        };
        let text = |value: &OptionValue| -> TransportResult<String> {
            value.as_text().map(str::to_string).ok_or_else(|| {
                TransportError::invalid_argument(format!("'{name}' expects a string"))
            })
        };

        let option = match name {
            OPTION_CBS_REQUEST_TIMEOUT => TransportOption::CbsRequestTimeoutSecs(unsigned(&value)?),
            OPTION_EVENT_SEND_TIMEOUT_SECS => {
                TransportOption::EventSendTimeoutSecs(unsigned(&value)?)
            }
            OPTION_RETRY_INTERVAL_SEC => TransportOption::RetryIntervalSecs(unsigned(&value)?),
            OPTION_RETRY_MAX_DELAY_SECS => TransportOption::RetryMaxDelaySecs(unsigned(&value)?),
            OPTION_SERVICE_SIDE_KEEP_ALIVE_FREQ_SECS => {
                TransportOption::ServiceSideKeepAliveSecs(unsigned(&value)?)
            }
            OPTION_REMOTE_IDLE_TIMEOUT_RATIO => match value {
                OptionValue::Float(ratio) => TransportOption::RemoteIdleTimeoutRatio(ratio),
                OptionValue::Int(i) => TransportOption::RemoteIdleTimeoutRatio(i as f64),
                OptionValue::Text(ref s) => s
                    .parse::<f64>()
                    .map(TransportOption::RemoteIdleTimeoutRatio)
                    .map_err(|_| TransportError::invalid_argument(format!("'{name}' expects a number")))?,
                OptionValue::Bool(_) => {
                    return Err(TransportError::invalid_argument(format!(
                        "'{name}' expects a number"
                    )))
                }
            },
            OPTION_KEEP_ALIVE => {
                let secs = unsigned(&value)?;
                let secs = u16::try_from(secs).map_err(|_| {
                    TransportError::invalid_argument("keepalive does not fit in 16 bits")
                })?;
                TransportOption::KeepAliveSecs(secs)
            }
            OPTION_LOG_TRACE => TransportOption::LogTrace(flag(&value)?),
            OPTION_RAW_LOG_TRACE => TransportOption::RawLogTrace(flag(&value)?),
            OPTION_X509_CERT => TransportOption::X509Certificate(text(&value)?),
            OPTION_X509_PRIVATE_KEY => TransportOption::X509PrivateKey(text(&value)?),
            OPTION_X509_ECC_CERT => TransportOption::X509EccCertificate(text(&value)?),
            OPTION_X509_ECC_KEY => TransportOption::X509EccAliasKey(text(&value)?),
            OPTION_AUTO_URL_ENCODE_DECODE => TransportOption::AutoUrlEncodeDecode(flag(&value)?),
            OPTION_CONNECTION_TIMEOUT => TransportOption::ConnectionTimeoutSecs(unsigned(&value)?),
            OPTION_HTTP_PROXY => {
                return Err(TransportError::invalid_argument(
                    "proxy settings must be given as a [proxy] table",
                ))
            }
            other => TransportOption::Io {
                name: other.to_string(),
                value,
            },
        };
        Ok(option)
    }
}

/// Options applied to every I/O instance the transport creates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoOptions {
    values: BTreeMap<String, OptionValue>,
}

impl IoOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, name: S, value: OptionValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Replay every option onto `io`, stopping at the first failure
    pub fn apply_to(&self, io: &mut dyn IoTransport) -> TransportResult<()> {
        for (name, value) in &self.values {
            io.set_option(name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_validation() {
        assert!(ProxyOptions::new("proxy.local", 8888).validate().is_ok());
        assert!(ProxyOptions::new("proxy.local", 8888)
            .with_credentials("u", "p")
            .validate()
            .is_ok());
        assert!(ProxyOptions::new("", 8888).validate().is_err());

        let mut half = ProxyOptions::new("proxy.local", 8888);
        half.username = Some("u".into());
        assert!(half.validate().is_err());
    }

    #[test]
    fn test_proxy_debug_hides_password() {
        let proxy = ProxyOptions::new("proxy.local", 8888).with_credentials("u", "hunter2");
        assert!(!format!("{proxy:?}").contains("hunter2"));
    }

    #[test]
    fn test_from_name_value_maps_known_options() {
        assert_eq!(
            TransportOption::from_name_value("keepalive", OptionValue::Int(120)).unwrap(),
            TransportOption::KeepAliveSecs(120)
        );
        assert_eq!(
            TransportOption::from_name_value("logtrace", OptionValue::Bool(true)).unwrap(),
            TransportOption::LogTrace(true)
        );
        assert_eq!(
            TransportOption::from_name_value("cl2svc_keep_alive_send_ratio", OptionValue::Float(0.25))
                .unwrap(),
            TransportOption::RemoteIdleTimeoutRatio(0.25)
        );
        assert_eq!(
            TransportOption::from_name_value(
                "cl2svc_keep_alive_send_ratio",
                OptionValue::Text("0.5".into())
            )
            .unwrap(),
            TransportOption::RemoteIdleTimeoutRatio(0.5)
        );
    }

    #[test]
    fn test_from_name_value_rejects_wrong_types() {
        assert!(TransportOption::from_name_value("keepalive", OptionValue::Bool(true)).is_err());
        assert!(TransportOption::from_name_value("keepalive", OptionValue::Int(-1)).is_err());
        assert!(TransportOption::from_name_value("keepalive", OptionValue::Int(70_000)).is_err());
        assert!(TransportOption::from_name_value("logtrace", OptionValue::Int(1)).is_err());
    }

    #[test]
    fn test_unknown_names_become_io_options() {
        let option =
            TransportOption::from_name_value("TrustedCerts", OptionValue::Text("pem".into()))
                .unwrap();
        assert_eq!(option.name(), "TrustedCerts");
        assert_eq!(
            option.to_io_option(),
            Some(("TrustedCerts".to_string(), OptionValue::Text("pem".into())))
        );
    }

    #[test]
    fn test_x509_options_pass_through() {
        let option = TransportOption::X509Certificate("cert".into());
        assert!(option.is_x509());
        assert_eq!(
            option.to_io_option().map(|(n, _)| n),
            Some(OPTION_X509_CERT.to_string())
        );
        assert!(TransportOption::LogTrace(true).to_io_option().is_none());
    }
}
