//! Token refresh strategies
//!
//! Social and IdC are two implementations of the same refresh capability,
//! dispatched by the credential's method enum. The `TokenRefresher` trait is
//! the seam the token pool sees, so the HTTP exchange can be swapped out in
//! tests.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;

use crate::model::config::Config;

use super::model::credentials::{AuthMethod, PoolCredential};
use super::model::token_refresh::{
    IdcRefreshRequest, IdcRefreshResponse, SocialRefreshRequest, SocialRefreshResponse,
};

/// Cloneable refresh failure, shared verbatim with every single-flight waiter
#[derive(Debug, Clone)]
pub struct RefreshError {
    pub message: String,
}

impl RefreshError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::error::Error for RefreshError {}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Outcome of one refresh exchange
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Lifetime in seconds, when the endpoint reports one
    pub expires_in: Option<i64>,
    /// Rotated refresh token (Social only; IdC tokens are preserved verbatim)
    pub rotated_refresh_token: Option<String>,
    /// Profile identifier, when the endpoint reports one
    pub profile_arn: Option<String>,
}

/// Refresh capability consumed by the token pool
pub trait TokenRefresher: Send + Sync {
    fn refresh(
        &self,
        credential: PoolCredential,
    ) -> BoxFuture<'static, Result<RefreshedToken, RefreshError>>;
}

/// `x-amz-user-agent` the OIDC endpoint requires to accept the exchange
const IDC_AMZ_USER_AGENT: &str =
    "aws-sdk-js/3.738.0 ua/2.1 os/other lang/js md/browser#unknown_unknown api/sso-oidc#3.738.0 m/E WhispererGateway";

/// Production refresher performing the HTTP exchanges
pub struct HttpRefresher {
    client: Client,
    config: Config,
}

impl HttpRefresher {
    pub fn new(client: Client, config: Config) -> Self {
        Self { client, config }
    }
}

impl TokenRefresher for HttpRefresher {
    fn refresh(
        &self,
        credential: PoolCredential,
    ) -> BoxFuture<'static, Result<RefreshedToken, RefreshError>> {
        let client = self.client.clone();
        let config = self.config.clone();
        async move {
            match credential.method() {
                AuthMethod::Social => refresh_social(&client, &config, &credential).await,
                AuthMethod::Idc => refresh_idc(&client, &config, &credential).await,
            }
        }
        .boxed()
    }
}

fn auth_region<'a>(config: &'a Config, credential: &'a PoolCredential) -> &'a str {
    credential
        .region
        .as_deref()
        .unwrap_or_else(|| config.effective_auth_region())
}

fn status_hint(status: reqwest::StatusCode) -> &'static str {
    match status.as_u16() {
        401 => "credentials expired or invalid, re-authentication required",
        403 => "insufficient permissions to refresh token",
        429 => "too many requests, rate limited",
        500..=599 => "auth service temporarily unavailable",
        _ => "token refresh failed",
    }
}

/// Refresh a Social credential
async fn refresh_social(
    client: &Client,
    config: &Config,
    credential: &PoolCredential,
) -> Result<RefreshedToken, RefreshError> {
    tracing::info!("refreshing Social token");

    let region = auth_region(config, credential);
    let refresh_url = format!("https://prod.{}.auth.desktop.whisperer.dev/refreshToken", region);
    let refresh_domain = format!("prod.{}.auth.desktop.whisperer.dev", region);

    let body = SocialRefreshRequest {
        refresh_token: credential.refresh_token.clone(),
    };

    let response = client
        .post(&refresh_url)
        .header("Accept", "application/json, text/plain, */*")
        .header("Content-Type", "application/json")
        .header("User-Agent", format!("WhispererGateway-{}", config.client_version))
        .header("Accept-Encoding", "gzip, compress, deflate, br")
        .header("host", &refresh_domain)
        .header("Connection", "close")
        .json(&body)
        .send()
        .await
        .map_err(|e| RefreshError::new(format!("social refresh request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(RefreshError::new(format!(
            "{}: {} {}",
            status_hint(status),
            status,
            body_text
        )));
    }

    let data: SocialRefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::new(format!("social refresh response malformed: {}", e)))?;

    if let Some(identity) = extract_identity_from_jwt(&data.access_token) {
        tracing::info!(identity = %identity, "social token refreshed");
    }

    Ok(RefreshedToken {
        access_token: data.access_token,
        expires_in: data.expires_in,
        rotated_refresh_token: data.refresh_token,
        profile_arn: data.profile_arn,
    })
}

/// Refresh an IdC credential (SSO OIDC)
async fn refresh_idc(
    client: &Client,
    config: &Config,
    credential: &PoolCredential,
) -> Result<RefreshedToken, RefreshError> {
    tracing::info!("refreshing IdC token");

    let client_id = credential
        .client_id
        .as_deref()
        .ok_or_else(|| RefreshError::new("IdC refresh requires a clientId"))?;
    let client_secret = credential
        .client_secret
        .as_deref()
        .ok_or_else(|| RefreshError::new("IdC refresh requires a clientSecret"))?;

    let region = auth_region(config, credential);
    let refresh_url = format!("https://oidc.{}.amazonaws.com/token", region);

    let body = IdcRefreshRequest {
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        refresh_token: credential.refresh_token.clone(),
        grant_type: "refresh_token".to_string(),
    };

    let response = client
        .post(&refresh_url)
        .header("Content-Type", "application/json")
        .header("Host", format!("oidc.{}.amazonaws.com", region))
        .header("Connection", "keep-alive")
        .header("x-amz-user-agent", IDC_AMZ_USER_AGENT)
        .header("Accept", "*/*")
        .header("Accept-Language", "*")
        .header("sec-fetch-mode", "cors")
        .header("User-Agent", "node")
        .header("Accept-Encoding", "br, gzip, deflate")
        .json(&body)
        .send()
        .await
        .map_err(|e| RefreshError::new(format!("IdC refresh request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(RefreshError::new(format!(
            "{}: {} {}",
            status_hint(status),
            status,
            body_text
        )));
    }

    let data: IdcRefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshError::new(format!("IdC refresh response malformed: {}", e)))?;

    if let Some(identity) = extract_identity_from_jwt(&data.access_token) {
        tracing::info!(identity = %identity, "IdC token refreshed");
    }

    // IdC refresh tokens are preserved verbatim across refreshes
    Ok(RefreshedToken {
        access_token: data.access_token,
        expires_in: data.expires_in,
        rotated_refresh_token: None,
        profile_arn: None,
    })
}

/// Claims probed, in order, for a loggable account identity. The `email`
/// claim is taken as-is; anything else must at least look like an address,
/// since `preferred_username` and `sub` often hold opaque ids.
const IDENTITY_CLAIMS: &[(&str, fn(&str) -> bool)] = &[
    ("email", |v| !v.is_empty()),
    ("preferred_username", |v| v.contains('@')),
    ("sub", |v| v.contains('@')),
];

/// Extract an account identity from a JWT access token payload.
///
/// Used for logging only; the token itself is treated as opaque and its
/// signature is never checked.
pub fn extract_identity_from_jwt(access_token: &str) -> Option<String> {
    let segments: Vec<&str> = access_token.split('.').collect();
    let [_header, payload, _signature] = segments.as_slice() else {
        return None;
    };

    let claims: serde_json::Value =
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).ok()?).ok()?;

    IDENTITY_CLAIMS.iter().find_map(|(claim, plausible)| {
        let value = claims.get(claim)?.as_str()?;
        plausible(value).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(payload: &str) -> String {
        format!(
            "h.{}.s",
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        )
    }

    #[test]
    fn test_extract_identity_email() {
        let jwt = make_jwt(r#"{"email":"dev@example.com"}"#);
        assert_eq!(
            extract_identity_from_jwt(&jwt).as_deref(),
            Some("dev@example.com")
        );
    }

    #[test]
    fn test_extract_identity_fallbacks() {
        let jwt = make_jwt(r#"{"preferred_username":"dev@example.com"}"#);
        assert_eq!(
            extract_identity_from_jwt(&jwt).as_deref(),
            Some("dev@example.com")
        );

        let jwt = make_jwt(r#"{"sub":"no-at-sign"}"#);
        assert_eq!(extract_identity_from_jwt(&jwt), None);
    }

    #[test]
    fn test_extract_identity_malformed() {
        assert_eq!(extract_identity_from_jwt("not-a-jwt"), None);
        assert_eq!(extract_identity_from_jwt("a.%%%.c"), None);
    }
}
