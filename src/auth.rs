//! Authorization module seam.
//!
//! Token generation and certificate handling live outside this crate; the
//! transports only ask for a token, its validity, its lifetime and to install
//! an X.509 certificate on a freshly created I/O.

use crate::error::TransportResult;
use crate::transport::IoTransport;
use std::time::Duration;

/// Kind of credential a device authenticates with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialType {
    Unknown,
    DeviceKey,
    X509,
    X509Ecc,
    SasToken,
    /// Hardware security module issuing tokens
    DeviceAuth,
}

impl CredentialType {
    pub fn is_x509(self) -> bool {
        matches!(self, CredentialType::X509 | CredentialType::X509Ecc)
    }
}

/// Validity of a user supplied SAS token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasTokenStatus {
    Valid,
    Invalid,
    Failed,
}

pub trait Authorization: Send + Sync {
    fn credential_type(&self) -> CredentialType;

    /// SAS token for `scope`; `None` returns the user supplied token as is
    fn sas_token(&self, scope: Option<&str>, key_name: Option<&str>) -> TransportResult<String>;

    fn sas_token_status(&self) -> SasTokenStatus;

    /// Lifetime of generated tokens
    fn sas_token_expiry(&self) -> Duration;

    fn set_x509_certificate(&self, io: &mut dyn IoTransport) -> TransportResult<()>;

    fn device_key(&self) -> Option<String>;
}
