use serde::{Deserialize, Serialize};

/// Token refresh request body (Social authentication)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshRequest {
    pub refresh_token: String,
}

/// Token refresh response body (Social authentication)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshResponse {
    pub access_token: String,
    /// Social refresh may rotate the refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// IdC token refresh request body (SSO OIDC)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdcRefreshRequest {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub grant_type: String,
}

/// IdC token refresh response body (SSO OIDC)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdcRefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}
