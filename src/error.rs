//! Error types for the device-to-cloud transport
//!
//! Every public operation returns a [`TransportResult`]. The tick entry points
//! (`do_work`) never fail; their failures surface as status callbacks instead.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Boxed error produced by a wire-protocol primitive (connection, device, client).
pub type PrimitiveError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Operation failed: {message}")]
    OperationFailed { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Not connected: {message}")]
    NotConnected { message: String },

    #[error("Device '{device_id}' is not registered")]
    DeviceNotRegistered { device_id: String },

    #[error("Primitive error: {0}")]
    Primitive(#[from] PrimitiveError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl TransportError {
    /// Create invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create generic operation failure
    pub fn operation_failed<S: Into<String>>(message: S) -> Self {
        Self::OperationFailed {
            message: message.into(),
        }
    }

    /// Create unsupported operation error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create not connected error
    pub fn not_connected<S: Into<String>>(message: S) -> Self {
        Self::NotConnected {
            message: message.into(),
        }
    }

    /// Create unknown device error
    pub fn device_not_registered<S: Into<String>>(device_id: S) -> Self {
        Self::DeviceNotRegistered {
            device_id: device_id.into(),
        }
    }

    /// Wrap any primitive error
    pub fn primitive<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Primitive(Box::new(error))
    }

    /// True for argument validation failures
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Display form that is safe to put in a log line
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)(SharedAccessSignature\s+)\S+", "${1}***"),
        (
            r"(?i)(sig|skn|sharedaccesskey|password|token|key|secret)[=:]\s*[^&;\s]+",
            "${1}=***",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

const MAX_SANITIZED_LEN: usize = 500;

/// Strip SAS tokens, keys and passwords from a message before it is logged
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        sanitized = pattern.replace_all(&sanitized, *replacement).to_string();
    }

    if sanitized.len() > MAX_SANITIZED_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_SANITIZED_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_produce_matching_variants() {
        assert!(TransportError::invalid_argument("x").is_invalid_argument());
        assert!(matches!(
            TransportError::unsupported("twin"),
            TransportError::Unsupported { .. }
        ));
        assert!(matches!(
            TransportError::not_connected("nope"),
            TransportError::NotConnected { .. }
        ));
    }

    #[test]
    fn test_display_includes_message() {
        let error = TransportError::operation_failed("subscribe refused");
        assert_eq!(error.to_string(), "Operation failed: subscribe refused");

        let error = TransportError::device_not_registered("d1");
        assert_eq!(error.to_string(), "Device 'd1' is not registered");
    }

    #[test]
    fn test_sanitize_removes_sas_signature() {
        let message = "connect failed: SharedAccessSignature sr=hub%2Fdevices%2Fd1&sig=abc123&se=1";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("abc123"));
        assert!(sanitized.contains("SharedAccessSignature ***"));
    }

    #[test]
    fn test_sanitize_removes_key_values() {
        let sanitized = sanitize_error_message("HostName=h;SharedAccessKey=c2VjcmV0;DeviceId=d1");
        assert!(!sanitized.contains("c2VjcmV0"));
        assert!(sanitized.contains("DeviceId=d1"));

        let sanitized = sanitize_error_message("proxy password: hunter2");
        assert!(!sanitized.contains("hunter2"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let long = "x".repeat(2000);
        let sanitized = sanitize_error_message(&long);
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_primitive_error_wrapping() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = TransportError::primitive(io);
        assert!(error.to_string().contains("refused"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
