//! Upstream API provider
//!
//! Issues requests to the CodeWhisperer-style response endpoint with a bearer
//! token from the shared pool, classifying failures into terminal, credential
//! and transient categories.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONNECTION, CONTENT_TYPE, HOST, HeaderMap, HeaderValue};
use tokio::time::sleep;
use uuid::Uuid;

use crate::model::config::Config;

use super::errors::enhance_upstream_error;
use super::token_pool::TokenPool;

/// Maximum attempts per credential in the pool
const MAX_RETRIES_PER_CREDENTIAL: usize = 3;

/// Hard ceiling on total attempts
const MAX_TOTAL_RETRIES: usize = 9;

/// Enhance an error body for the caller, falling back to the raw text
fn enhance_error_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(error_json) => {
            let info = enhance_upstream_error(&error_json);
            tracing::debug!(
                original_message = %info.original_message,
                reason = %info.reason,
                "upstream error enhanced"
            );
            info.user_message
        }
        Err(_) => body.to_string(),
    }
}

/// Upstream provider
pub struct WhispererProvider {
    token_pool: Arc<TokenPool>,
    config: Config,
    client: Client,
}

impl WhispererProvider {
    pub fn new(token_pool: Arc<TokenPool>, config: Config, client: Client) -> Self {
        Self {
            token_pool,
            config,
            client,
        }
    }

    pub fn token_pool(&self) -> &Arc<TokenPool> {
        &self.token_pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Response-generation endpoint URL
    pub fn base_url(&self) -> String {
        format!(
            "https://q.{}.amazonaws.com/generateAssistantResponse",
            self.config.effective_api_region()
        )
    }

    fn base_domain(&self) -> String {
        format!("q.{}.amazonaws.com", self.config.effective_api_region())
    }

    fn build_headers(&self, token: &str) -> anyhow::Result<HeaderMap> {
        let user_agent = format!(
            "aws-sdk-js/1.0.27 ua/2.1 lang/js api/codewhispererstreaming#1.0.27 m/E WhispererGateway-{}",
            self.config.client_version
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-amzn-codewhisperer-optout",
            HeaderValue::from_static("true"),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&user_agent)?,
        );
        headers.insert(HOST, HeaderValue::from_str(&self.base_domain())?);
        headers.insert(
            "amz-sdk-invocation-id",
            HeaderValue::from_str(&Uuid::new_v4().to_string())?,
        );
        headers.insert(
            "amz-sdk-request",
            HeaderValue::from_static("attempt=1; max=3"),
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        Ok(headers)
    }

    /// Send a request, returning the raw streaming response.
    ///
    /// Failure classification:
    /// - 400 and other 4xx: terminal, retrying cannot help
    /// - 401/403: the bearer token is suspect; drop the cached tokens so the
    ///   next attempt refreshes, then retry
    /// - 408/429/5xx and network errors: transient, retry with jittered
    ///   exponential backoff
    pub async fn call_api_stream(&self, request_body: &str) -> anyhow::Result<reqwest::Response> {
        let max_retries = (self.token_pool.len() * MAX_RETRIES_PER_CREDENTIAL).min(MAX_TOTAL_RETRIES);
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..max_retries {
            let token = match self.token_pool.get_access_token().await {
                Ok(t) => t,
                Err(e) => {
                    // Pool exhaustion is fatal for the request
                    return Err(e);
                }
            };

            let headers = self.build_headers(&token)?;
            let response = match self
                .client
                .post(self.base_url())
                .headers(headers)
                .body(request_body.to_string())
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(
                        "upstream request failed to send (attempt {}/{}): {}",
                        attempt + 1,
                        max_retries,
                        e
                    );
                    last_error = Some(e.into());
                    if attempt + 1 < max_retries {
                        sleep(Self::retry_delay(attempt)).await;
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                tracing::info!(attempt = attempt + 1, "upstream request accepted");
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 400 {
                anyhow::bail!("upstream request failed: {} - {}", status, enhance_error_message(&body));
            }

            if matches!(status.as_u16(), 401 | 403) {
                tracing::warn!(
                    "upstream rejected bearer token (attempt {}/{}): {} {}",
                    attempt + 1,
                    max_retries,
                    status,
                    body
                );
                self.token_pool.clear();
                last_error = Some(anyhow::anyhow!("upstream request failed: {} {}", status, body));
                continue;
            }

            if matches!(status.as_u16(), 408 | 429) || status.is_server_error() {
                tracing::warn!(
                    "upstream transient error (attempt {}/{}): {} {}",
                    attempt + 1,
                    max_retries,
                    status,
                    body
                );
                last_error = Some(anyhow::anyhow!("upstream request failed: {} {}", status, body));
                if attempt + 1 < max_retries {
                    sleep(Self::retry_delay(attempt)).await;
                }
                continue;
            }

            if status.is_client_error() {
                anyhow::bail!("upstream request failed: {} - {}", status, enhance_error_message(&body));
            }

            last_error = Some(anyhow::anyhow!("upstream request failed: {} {}", status, body));
            if attempt + 1 < max_retries {
                sleep(Self::retry_delay(attempt)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("upstream request failed after {} attempts", MAX_TOTAL_RETRIES)
        }))
    }

    /// Exponential backoff with a small jitter
    fn retry_delay(attempt: usize) -> Duration {
        const BASE_MS: u64 = 200;
        const MAX_MS: u64 = 2_000;
        let exp = BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(6) as u32));
        let backoff = exp.min(MAX_MS);
        let jitter_max = (backoff / 4).max(1);
        let jitter = fastrand::u64(0..=jitter_max);
        Duration::from_millis(backoff.saturating_add(jitter))
    }
}
