//! Shared access signature credentials.
//!
//! Two [`Authorization`] providers for token-based devices: one wrapping a
//! token issued elsewhere, one signing fresh tokens with the device's
//! shared access key. HSM and X.509 providers live outside this crate.

use crate::auth::{Authorization, CredentialType, SasTokenStatus};
use crate::error::{TransportError, TransportResult};
use crate::transport::IoTransport;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

pub const SAS_TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Lifetime of tokens signed from a device key
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Expiry carried by the `se=` field of a token, if it has one
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let fields = token.strip_prefix(SAS_TOKEN_PREFIX)?;
    let seconds = fields
        .split('&')
        .find_map(|field| field.strip_prefix("se="))?
        .parse::<i64>()
        .ok()?;
    DateTime::from_timestamp(seconds, 0)
}

/// Sign a token for `scope` valid until `expiry`.
///
/// `key` is the base64 shared access key. The signed string is the
/// URL-encoded scope and the expiry in seconds separated by a newline.
pub fn generate_sas_token(
    key: &str,
    scope: &str,
    key_name: Option<&str>,
    expiry: DateTime<Utc>,
) -> TransportResult<String> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| TransportError::invalid_argument(format!("device key is not base64: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| TransportError::operation_failed(format!("cannot key HMAC: {e}")))?;

    let resource = encode(scope);
    let expiry = expiry.timestamp();
    mac.update(format!("{resource}\n{expiry}").as_bytes());
    let signature = encode(&STANDARD.encode(mac.finalize().into_bytes()));

    let mut token = format!("{SAS_TOKEN_PREFIX}sr={resource}&sig={signature}&se={expiry}");
    if let Some(name) = key_name.filter(|name| !name.is_empty()) {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }
    Ok(token)
}

fn encode(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

/// Token issued by someone else, used as is until its `se=` expiry
pub struct SasTokenAuthorization {
    token: String,
    lifetime: Duration,
}

impl SasTokenAuthorization {
    /// The refresh lifetime is what remains of the token right now
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self::issued_at(token, Utc::now())
    }

    pub fn issued_at<S: Into<String>>(token: S, now: DateTime<Utc>) -> Self {
        let token = token.into();
        let lifetime = token_expiry(&token)
            .and_then(|expiry| (expiry - now).to_std().ok())
            .unwrap_or_default();
        Self { token, lifetime }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> SasTokenStatus {
        match token_expiry(&self.token) {
            None => SasTokenStatus::Failed,
            Some(expiry) if expiry <= now => SasTokenStatus::Invalid,
            Some(_) => SasTokenStatus::Valid,
        }
    }
}

impl Authorization for SasTokenAuthorization {
    fn credential_type(&self) -> CredentialType {
        CredentialType::SasToken
    }

    fn sas_token(&self, _scope: Option<&str>, _key_name: Option<&str>) -> TransportResult<String> {
        Ok(self.token.clone())
    }

    fn sas_token_status(&self) -> SasTokenStatus {
        self.status_at(Utc::now())
    }

    fn sas_token_expiry(&self) -> Duration {
        self.lifetime
    }

    fn set_x509_certificate(&self, _io: &mut dyn IoTransport) -> TransportResult<()> {
        Err(TransportError::unsupported(
            "SAS token credentials carry no certificate",
        ))
    }

    fn device_key(&self) -> Option<String> {
        None
    }
}

/// Signs a new token from the device key on every connect
pub struct SharedAccessKeyAuthorization {
    key: String,
    key_name: Option<String>,
    lifetime: Duration,
}

impl SharedAccessKeyAuthorization {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            key: key.into(),
            key_name: None,
            lifetime: DEFAULT_TOKEN_LIFETIME,
        }
    }

    pub fn with_key_name<S: Into<String>>(mut self, key_name: S) -> Self {
        self.key_name = Some(key_name.into());
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn token_at(&self, scope: &str, now: DateTime<Utc>) -> TransportResult<String> {
        self.sign(scope, self.key_name.as_deref(), now)
    }

    fn sign(&self, scope: &str, key_name: Option<&str>, now: DateTime<Utc>) -> TransportResult<String> {
        let lifetime = chrono::Duration::from_std(self.lifetime)
            .map_err(|e| TransportError::invalid_argument(format!("token lifetime: {e}")))?;
        generate_sas_token(&self.key, scope, key_name, now + lifetime)
    }
}

impl Authorization for SharedAccessKeyAuthorization {
    fn credential_type(&self) -> CredentialType {
        CredentialType::DeviceKey
    }

    fn sas_token(&self, scope: Option<&str>, key_name: Option<&str>) -> TransportResult<String> {
        let scope =
            scope.ok_or_else(|| TransportError::invalid_argument("a key-signed token needs a scope"))?;
        self.sign(scope, key_name.or(self.key_name.as_deref()), Utc::now())
    }

    fn sas_token_status(&self) -> SasTokenStatus {
        SasTokenStatus::Valid
    }

    fn sas_token_expiry(&self) -> Duration {
        self.lifetime
    }

    fn set_x509_certificate(&self, _io: &mut dyn IoTransport) -> TransportResult<()> {
        Err(TransportError::unsupported(
            "shared access key credentials carry no certificate",
        ))
    }

    fn device_key(&self) -> Option<String> {
        Some(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    #[test]
    fn test_expiry_comes_from_se_field() {
        let token = "SharedAccessSignature sr=hub%2Fdevices%2Fd1&sig=abc&se=1700000000&skn=";

        assert_eq!(token_expiry(token), Some(at(1_700_000_000)));
        assert_eq!(token_expiry("SharedAccessSignature sr=x&sig=y"), None);
        assert_eq!(token_expiry("Bearer se=1700000000"), None);
    }

    #[test]
    fn test_user_token_status_follows_expiry() {
        let auth = SasTokenAuthorization::issued_at(
            "SharedAccessSignature sr=x&sig=y&se=2000",
            at(1000),
        );

        assert_eq!(auth.status_at(at(1999)), SasTokenStatus::Valid);
        assert_eq!(auth.status_at(at(2000)), SasTokenStatus::Invalid);
        assert_eq!(auth.sas_token_expiry(), Duration::from_secs(1000));
    }

    #[test]
    fn test_token_without_expiry_fails_validation() {
        let auth = SasTokenAuthorization::issued_at("SharedAccessSignature sr=x&sig=y", at(0));

        assert_eq!(auth.status_at(at(0)), SasTokenStatus::Failed);
        assert_eq!(auth.sas_token_expiry(), Duration::ZERO);
    }

    #[test]
    fn test_signed_token_layout() {
        // "a2V5" is base64 for "key"
        let token = generate_sas_token("a2V5", "hub.azure-devices.net/devices/d1", None, at(3600))
            .unwrap();

        assert!(token.starts_with("SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fd1&sig="));
        assert!(token.ends_with("&se=3600"));
        assert_eq!(token_expiry(&token), Some(at(3600)));
        let signature = token
            .split('&')
            .find_map(|field| field.strip_prefix("sig="))
            .unwrap();
        assert!(!signature.contains('+') && !signature.contains('/') && !signature.contains('='));
    }

    #[test]
    fn test_signature_depends_on_key_and_expiry() {
        let scope = "hub/devices/d1";
        let first = generate_sas_token("a2V5", scope, None, at(10)).unwrap();
        let same = generate_sas_token("a2V5", scope, None, at(10)).unwrap();
        let other_key = generate_sas_token("b3RoZXI=", scope, None, at(10)).unwrap();
        let later = generate_sas_token("a2V5", scope, None, at(11)).unwrap();

        assert_eq!(first, same);
        assert_ne!(first, other_key);
        assert_ne!(first.split("&se=").next(), later.split("&se=").next());
    }

    #[test]
    fn test_key_name_is_appended() {
        let token = generate_sas_token("a2V5", "hub", Some("device"), at(1)).unwrap();

        assert!(token.ends_with("&se=1&skn=device"));
    }

    #[test]
    fn test_bad_key_is_invalid_argument() {
        let result = generate_sas_token("not base64!", "hub", None, at(1));

        assert!(result.is_err_and(|e| e.is_invalid_argument()));
    }

    #[test]
    fn test_key_authorization_signs_for_the_scope() {
        let auth = SharedAccessKeyAuthorization::new("a2V5").with_lifetime(Duration::from_secs(60));

        let token = auth.token_at("hub/devices/d1", at(100)).unwrap();

        assert_eq!(auth.credential_type(), CredentialType::DeviceKey);
        assert_eq!(token_expiry(&token), Some(at(160)));
        assert!(auth.sas_token(None, None).is_err());
        assert_eq!(auth.device_key().as_deref(), Some("a2V5"));
    }
}
