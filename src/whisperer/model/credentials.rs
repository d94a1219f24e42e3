//! Refresh-credential data model
//!
//! Credentials reach the gateway in several encodings: a JSON array or single
//! object (envelope variable or file), or legacy per-method variables. The
//! loader normalises all of them into a validated, deduplicated list of
//! `PoolCredential`s; the token pool consumes only that list.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Envelope variable holding a JSON array or object of credentials
pub const CREDENTIALS_ENV: &str = "GATEWAY_CREDENTIALS";

/// Legacy variable: comma-separated Social refresh tokens
pub const SOCIAL_TOKENS_ENV: &str = "GATEWAY_SOCIAL_REFRESH_TOKENS";

/// Legacy IdC variables
pub const IDC_REFRESH_TOKEN_ENV: &str = "GATEWAY_IDC_REFRESH_TOKEN";
pub const IDC_CLIENT_ID_ENV: &str = "GATEWAY_IDC_CLIENT_ID";
pub const IDC_CLIENT_SECRET_ENV: &str = "GATEWAY_IDC_CLIENT_SECRET";

/// Authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Social,
    Idc,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Social => write!(f, "social"),
            Self::Idc => write!(f, "idc"),
        }
    }
}

/// One refresh credential
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolCredential {
    /// Authentication method; detected from the client fields when absent
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,

    #[serde(default)]
    pub refresh_token: String,

    /// OIDC client id (required for IdC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// OIDC client secret (required for IdC)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Credential-level region override for the refresh endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl PoolCredential {
    pub fn social(refresh_token: impl Into<String>) -> Self {
        Self {
            auth_method: Some(AuthMethod::Social),
            refresh_token: refresh_token.into(),
            ..Default::default()
        }
    }

    pub fn idc(
        refresh_token: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            auth_method: Some(AuthMethod::Idc),
            refresh_token: refresh_token.into(),
            client_id: Some(client_id.into()),
            client_secret: Some(client_secret.into()),
            ..Default::default()
        }
    }

    /// Effective method: explicit, otherwise detected from the client fields
    pub fn method(&self) -> AuthMethod {
        self.auth_method.unwrap_or_else(|| {
            if self.client_id.is_some() && self.client_secret.is_some() {
                AuthMethod::Idc
            } else {
                AuthMethod::Social
            }
        })
    }

    /// Validate the fields the refresh strategy for this method requires
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_token.trim().is_empty() {
            anyhow::bail!("credential is missing a refreshToken");
        }
        if self.method() == AuthMethod::Idc {
            if self.client_id.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("IdC credential is missing a clientId");
            }
            if self.client_secret.as_deref().unwrap_or("").is_empty() {
                anyhow::bail!("IdC credential is missing a clientSecret");
            }
        }
        Ok(())
    }

    /// Identity fingerprint over (method, refresh-token[, client-id])
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method().to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.refresh_token.as_bytes());
        if self.method() == AuthMethod::Idc {
            hasher.update(b"\0");
            hasher.update(self.client_id.as_deref().unwrap_or("").as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Credentials configuration, single object or array
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialsConfig {
    Single(PoolCredential),
    Multiple(Vec<PoolCredential>),
}

impl CredentialsConfig {
    /// Load from a JSON file; a missing or empty file yields an empty list
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(CredentialsConfig::Multiple(vec![]));
        }

        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(CredentialsConfig::Multiple(vec![]));
        }

        Ok(serde_json::from_str(&content)?)
    }

    /// Parse from the envelope variable content
    pub fn from_envelope(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn into_credentials(self) -> Vec<PoolCredential> {
        match self {
            CredentialsConfig::Single(cred) => vec![cred],
            CredentialsConfig::Multiple(creds) => creds,
        }
    }
}

/// Assemble the credential list from every accepted source, in precedence
/// order: envelope variable, credentials file, legacy variables.
///
/// The result is validated (invalid entries are dropped with a warning) and
/// deduplicated by identity fingerprint.
pub fn load_credentials(credentials_path: Option<&str>) -> anyhow::Result<Vec<PoolCredential>> {
    let mut raw: Vec<PoolCredential> = Vec::new();

    if let Ok(envelope) = std::env::var(CREDENTIALS_ENV) {
        raw.extend(CredentialsConfig::from_envelope(&envelope)?.into_credentials());
    } else if let Some(path) = credentials_path {
        raw.extend(CredentialsConfig::load(path)?.into_credentials());
    }

    if raw.is_empty() {
        if let Ok(tokens) = std::env::var(SOCIAL_TOKENS_ENV) {
            raw.extend(
                tokens
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(PoolCredential::social),
            );
        }
        if let Ok(refresh_token) = std::env::var(IDC_REFRESH_TOKEN_ENV) {
            raw.push(PoolCredential {
                auth_method: Some(AuthMethod::Idc),
                refresh_token,
                client_id: std::env::var(IDC_CLIENT_ID_ENV).ok(),
                client_secret: std::env::var(IDC_CLIENT_SECRET_ENV).ok(),
                region: None,
            });
        }
    }

    Ok(sanitize_credentials(raw))
}

/// Validate and deduplicate a raw credential list
pub fn sanitize_credentials(raw: Vec<PoolCredential>) -> Vec<PoolCredential> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();

    for cred in raw {
        if let Err(e) = cred.validate() {
            tracing::warn!("dropping invalid credential: {}", e);
            continue;
        }
        if seen.insert(cred.fingerprint()) {
            out.push(cred);
        } else {
            tracing::warn!("dropping duplicate {} credential", cred.method());
        }
    }

    out
}
