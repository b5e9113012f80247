//! Configuration file for the `iothub-transport` binary
//!
//! The library itself is configured with [`TransportConfig`] values and
//! [`TransportOption`]s; this module turns a TOML file into both.

use crate::device::DeviceConfig;
use crate::options::TransportOption;
use crate::retry::RetryPolicy;
use crate::sas::{SasTokenAuthorization, SharedAccessKeyAuthorization};
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Complete binary configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub hub: HubSection,
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    pub name: String,
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Connect here instead of `{name}.{suffix}`
    pub gateway_hostname: Option<String>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            suffix: default_suffix(),
            gateway_hostname: None,
        }
    }
}

fn default_suffix() -> String {
    "azure-devices.net".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub device_id: String,
    pub module_id: Option<String>,
    /// Environment variable containing the device key
    pub device_key_env: Option<String>,
    /// Environment variable containing a ready-made SAS token
    pub sas_token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default)]
    pub auto_url_encode_decode: bool,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            connection_timeout_secs: default_connection_timeout(),
            auto_url_encode_decode: false,
        }
    }
}

fn default_port() -> u16 {
    8883
}

fn default_keep_alive() -> u16 {
    240
}

fn default_connection_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_policy")]
    pub policy: String,
    /// 0 retries forever
    #[serde(default)]
    pub max_retry_time_secs: u64,
    #[serde(default = "default_initial_wait")]
    pub initial_wait_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            max_retry_time_secs: 0,
            initial_wait_secs: default_initial_wait(),
            max_delay_secs: default_max_delay(),
        }
    }
}

fn default_policy() -> String {
    "exponential_backoff_with_jitter".to_string()
}

fn default_initial_wait() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    30
}

impl RetrySection {
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        match self.policy.to_lowercase().as_str() {
            "none" => Ok(RetryPolicy::None),
            "immediate" => Ok(RetryPolicy::Immediate),
            "interval" => Ok(RetryPolicy::Interval),
            "linear_backoff" => Ok(RetryPolicy::LinearBackoff),
            "exponential_backoff" => Ok(RetryPolicy::ExponentialBackoff),
            "exponential_backoff_with_jitter" => Ok(RetryPolicy::ExponentialBackoffWithJitter),
            "random" => Ok(RetryPolicy::Random),
            other => Err(ConfigError::InvalidConfig(format!(
                "unknown retry policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hub.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("hub.name is empty".to_string()));
        }
        if self
            .hub
            .gateway_hostname
            .as_deref()
            .is_some_and(|gateway| gateway.trim().is_empty())
        {
            return Err(ConfigError::InvalidConfig(
                "hub.gateway_hostname is empty".to_string(),
            ));
        }
        if self.device.device_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "device.device_id is empty".to_string(),
            ));
        }
        if self.device.device_key_env.is_some() && self.device.sas_token_env.is_some() {
            return Err(ConfigError::InvalidConfig(
                "set only one of device.device_key_env and device.sas_token_env".to_string(),
            ));
        }
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than zero".to_string(),
            ));
        }
        self.retry.retry_policy()?;
        Ok(())
    }

    /// Helper method to get environment variable with error propagation
    pub fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Device key read from `device.device_key_env`, if configured
    pub fn device_key(&self) -> Result<Option<String>, ConfigError> {
        self.device
            .device_key_env
            .as_deref()
            .map(Self::get_env_var_required)
            .transpose()
    }

    /// SAS token read from `device.sas_token_env`, if configured
    pub fn sas_token(&self) -> Result<Option<String>, ConfigError> {
        self.device
            .sas_token_env
            .as_deref()
            .map(Self::get_env_var_required)
            .transpose()
    }

    /// Transport configuration with secrets resolved from the environment
    pub fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
        let mut config = TransportConfig::new(
            self.hub.name.clone(),
            self.hub.suffix.clone(),
            self.device.device_id.clone(),
        );
        if let Some(gateway) = &self.hub.gateway_hostname {
            config = config.with_gateway(gateway.clone());
        }
        if let Some(module_id) = &self.device.module_id {
            config = config.with_module(module_id.clone());
        }
        if let Some(key) = self.device_key()? {
            config = config.with_device_key(key);
        }
        config.device_sas_token = self.sas_token()?;
        Ok(config)
    }

    /// Registration for the configured device, authorized by its key or token
    pub fn device_config(&self, transport: &TransportConfig) -> Result<DeviceConfig, ConfigError> {
        let device = match (&transport.device_key, &transport.device_sas_token) {
            (Some(key), None) => DeviceConfig::new(
                transport.device_id.clone(),
                Arc::new(SharedAccessKeyAuthorization::new(key.clone())),
            )
            .with_device_key(key.clone()),
            (None, Some(token)) => DeviceConfig::new(
                transport.device_id.clone(),
                Arc::new(SasTokenAuthorization::new(token.clone())),
            )
            .with_sas_token(token.clone()),
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "a device key and a SAS token cannot be used together".to_string(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::InvalidConfig(
                    "device.device_key_env or device.sas_token_env is required".to_string(),
                ))
            }
        };
        Ok(match &transport.module_id {
            Some(module_id) => device.with_module(module_id.clone()),
            None => device,
        })
    }

    /// Options applied to the MQTT transport right after creation
    pub fn transport_options(&self) -> Vec<TransportOption> {
        vec![
            TransportOption::KeepAliveSecs(self.mqtt.keep_alive_secs),
            TransportOption::ConnectionTimeoutSecs(self.mqtt.connection_timeout_secs),
            TransportOption::AutoUrlEncodeDecode(self.mqtt.auto_url_encode_decode),
            TransportOption::RetryIntervalSecs(self.retry.initial_wait_secs),
            TransportOption::RetryMaxDelaySecs(self.retry.max_delay_secs),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[hub]
name = "myhub"
suffix = "azure-devices.net"

[device]
device_id = "d1"
module_id = "m1"

[mqtt]
port = 1883
keep_alive_secs = 60
connection_timeout_secs = 10
auto_url_encode_decode = true

[retry]
policy = "interval"
max_retry_time_secs = 300
initial_wait_secs = 2
max_delay_secs = 20

[logging]
level = "debug"
format = "pretty"
"#;

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(FULL).unwrap();
        assert_eq!(config.hub.name, "myhub");
        assert_eq!(config.device.module_id.as_deref(), Some("m1"));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert!(config.mqtt.auto_url_encode_decode);
        assert_eq!(config.retry.retry_policy().unwrap(), RetryPolicy::Interval);
        assert_eq!(config.retry.max_retry_time_secs, 300);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
[hub]
name = "myhub"

[device]
device_id = "d1"
"#,
        )
        .unwrap();
        assert_eq!(config.hub.suffix, "azure-devices.net");
        assert_eq!(config.mqtt, MqttSection::default());
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.keep_alive_secs, 240);
        assert_eq!(
            config.retry.retry_policy().unwrap(),
            RetryPolicy::ExponentialBackoffWithJitter
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validation_errors() {
        let empty_hub = FULL.replace("name = \"myhub\"", "name = \"\"");
        assert!(matches!(
            AppConfig::from_toml(&empty_hub),
            Err(ConfigError::InvalidConfig(_))
        ));

        let zero_keep_alive = FULL.replace("keep_alive_secs = 60", "keep_alive_secs = 0");
        assert!(matches!(
            AppConfig::from_toml(&zero_keep_alive),
            Err(ConfigError::InvalidConfig(_))
        ));

        let bad_policy = FULL.replace("policy = \"interval\"", "policy = \"sometimes\"");
        let err = AppConfig::from_toml(&bad_policy).unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn test_transport_config_without_secrets() {
        let config = AppConfig::from_toml(FULL).unwrap();
        let transport = config.transport_config().unwrap();
        assert_eq!(transport.hostname(), "myhub.azure-devices.net");
        assert_eq!(transport.module_id.as_deref(), Some("m1"));
        assert!(transport.device_key.is_none());
    }

    #[test]
    fn test_missing_key_env_var() {
        let mut config = AppConfig::from_toml(FULL).unwrap();
        config.device.device_key_env = Some("IOTHUB_TEST_KEY_THAT_IS_NOT_SET_4242".to_string());
        assert!(matches!(
            config.transport_config(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_transport_options() {
        let config = AppConfig::from_toml(FULL).unwrap();
        let options = config.transport_options();
        assert!(options.contains(&TransportOption::KeepAliveSecs(60)));
        assert!(options.contains(&TransportOption::AutoUrlEncodeDecode(true)));
        assert!(options.contains(&TransportOption::RetryIntervalSecs(2)));
    }

    #[test]
    fn test_device_config_picks_credential() {
        use crate::auth::CredentialType;

        let config = AppConfig::from_toml(FULL).unwrap();
        let base = config.transport_config().unwrap();

        let keyed = config
            .device_config(&base.clone().with_device_key("a2V5"))
            .unwrap();
        assert_eq!(keyed.authorization.credential_type(), CredentialType::DeviceKey);
        assert_eq!(keyed.module_id.as_deref(), Some("m1"));

        let mut with_token = base.clone();
        with_token.device_sas_token = Some("SharedAccessSignature sr=x&sig=y&se=1".to_string());
        let tokened = config.device_config(&with_token).unwrap();
        assert_eq!(tokened.authorization.credential_type(), CredentialType::SasToken);

        assert!(matches!(
            config.device_config(&base),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_key_and_token_env_are_exclusive() {
        let both = FULL.replace(
            "module_id = \"m1\"",
            "device_key_env = \"K\"\nsas_token_env = \"T\"",
        );
        assert!(matches!(
            AppConfig::from_toml(&both),
            Err(ConfigError::InvalidConfig(_))
        ));
    }
}
