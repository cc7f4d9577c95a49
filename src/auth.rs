//! Credential storage and SAS-token minting.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How long a minted SAS token stays valid.
const SAS_TOKEN_LIFETIME_SECS: i64 = 3600;

/// The credential a device presents to the hub, fixed at creation.
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Base64-encoded shared access key; a fresh SAS token is minted for
    /// every request.
    DeviceKey(String),
    /// A caller-supplied SAS token used verbatim in the Authorization
    /// header.
    SasToken(String),
    /// Client-certificate authentication; no Authorization header is sent.
    /// The certificate and key are usually supplied later through options.
    X509 {
        cert: Option<String>,
        private_key: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    DeviceKey,
    SasToken,
    X509,
}

/// Per-device credential store. Owns the device identity and answers
/// per-request Authorization material for the transports.
#[derive(Clone, Debug)]
pub(crate) struct AuthModule {
    device_id: String,
    credentials: Credentials,
}

impl AuthModule {
    pub(crate) fn new(device_id: impl Into<String>, credentials: Credentials) -> Self {
        AuthModule {
            device_id: device_id.into(),
            credentials,
        }
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub(crate) fn kind(&self) -> CredentialKind {
        match self.credentials {
            Credentials::DeviceKey(_) => CredentialKind::DeviceKey,
            Credentials::SasToken(_) => CredentialKind::SasToken,
            Credentials::X509 { .. } => CredentialKind::X509,
        }
    }

    /// The value of the Authorization header for a request against the
    /// given hub, or `None` for certificate authentication.
    ///
    /// Key-based devices get a token scoped to `<host>/devices/<id>` with
    /// an hour-forward expiry, minted per request so a long-lived handle
    /// never sends a stale signature.
    pub(crate) fn authorization_header(&self, hostname: &str) -> Result<Option<String>> {
        match &self.credentials {
            Credentials::DeviceKey(key) => {
                let resource = format!(
                    "{}/devices/{}",
                    hostname,
                    urlencoding::encode(&self.device_id)
                );
                let expiry = chrono::Utc::now().timestamp() + SAS_TOKEN_LIFETIME_SECS;
                Ok(Some(generate_sas_token(&resource, key, None, expiry)?))
            }
            Credentials::SasToken(token) => Ok(Some(token.clone())),
            Credentials::X509 { .. } => Ok(None),
        }
    }

    pub(crate) fn x509_material(&self) -> Option<(Option<&str>, Option<&str>)> {
        match &self.credentials {
            Credentials::X509 { cert, private_key } => {
                Some((cert.as_deref(), private_key.as_deref()))
            }
            _ => None,
        }
    }
}

/// Mints `SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>`
/// (plus `&skn=<name>` when a key name is given).
///
/// The signature is HMAC-SHA256 over `"<url(resource)>\n<expiry>"` keyed
/// with the base64-decoded device key.
pub(crate) fn generate_sas_token(
    resource_uri: &str,
    key_base64: &str,
    key_name: Option<&str>,
    expiry_unix: i64,
) -> Result<String> {
    let key = BASE64
        .decode(key_base64)
        .context("The device key is not valid base64")?;

    let encoded_resource = urlencoding::encode(resource_uri).into_owned();
    let to_sign = format!("{encoded_resource}\n{expiry_unix}");

    let mut mac = HmacSha256::new_from_slice(&key)
        .context("Unable to initialize the token signature")?;
    mac.update(to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_resource,
        urlencoding::encode(&signature),
        expiry_unix
    );
    if let Some(key_name) = key_name {
        token.push_str("&skn=");
        token.push_str(key_name);
    }

    Ok(token)
}
