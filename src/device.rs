//! Per-device registration input and the handle returned for it

use crate::auth::{Authorization, CredentialType};
use crate::callbacks::DeviceIdentity;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything `register` needs to know about a device
#[derive(Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub module_id: Option<String>,
    pub device_key: Option<String>,
    pub device_sas_token: Option<String>,
    pub authorization: Arc<dyn Authorization>,
}

impl DeviceConfig {
    pub fn new<S: Into<String>>(device_id: S, authorization: Arc<dyn Authorization>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: None,
            device_key: None,
            device_sas_token: None,
            authorization,
        }
    }

    pub fn with_module<S: Into<String>>(mut self, module_id: S) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_device_key<S: Into<String>>(mut self, device_key: S) -> Self {
        self.device_key = Some(device_key.into());
        self
    }

    pub fn with_sas_token<S: Into<String>>(mut self, token: S) -> Self {
        self.device_sas_token = Some(token.into());
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id.clone(),
            module_id: self.module_id.clone(),
        }
    }

    /// True when the device authenticates with a token (key, SAS token or HSM)
    pub fn uses_token_auth(&self) -> bool {
        self.device_key.is_some()
            || self.device_sas_token.is_some()
            || self.authorization.credential_type() == CredentialType::DeviceAuth
    }

    pub fn has_token_material(&self) -> bool {
        self.device_key.is_some() || self.device_sas_token.is_some()
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("device_key", &self.device_key.as_ref().map(|_| "***"))
            .field("device_sas_token", &self.device_sas_token.as_ref().map(|_| "***"))
            .field("credential_type", &self.authorization.credential_type())
            .finish()
    }
}

/// Opaque handle returned by `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl DeviceHandle {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockAuthorization;

    #[test]
    fn test_token_auth_detection() {
        let auth = Arc::new(MockAuthorization::new(CredentialType::DeviceKey));
        let config = DeviceConfig::new("d1", auth).with_device_key("abc");
        assert!(config.uses_token_auth());

        let auth = Arc::new(MockAuthorization::new(CredentialType::X509));
        let config = DeviceConfig::new("d1", auth);
        assert!(!config.uses_token_auth());

        let auth = Arc::new(MockAuthorization::new(CredentialType::DeviceAuth));
        let config = DeviceConfig::new("d1", auth);
        assert!(config.uses_token_auth());
        assert!(!config.has_token_material());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = Arc::new(MockAuthorization::new(CredentialType::DeviceKey));
        let config = DeviceConfig::new("d1", auth).with_device_key("super-secret");
        let printed = format!("{config:?}");
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(DeviceHandle::next(), DeviceHandle::next());
    }
}
