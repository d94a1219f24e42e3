use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsBackend {
    #[default]
    Rustls,
    NativeTls,
}

/// Gateway application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_region")]
    pub region: String,

    /// Auth region (token refresh), falls back to `region`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_region: Option<String>,

    /// API region (upstream requests), falls back to `region`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_region: Option<String>,

    /// API key clients must present
    #[serde(default)]
    pub api_key: Option<String>,

    /// Client version advertised in upstream user agents
    #[serde(default = "default_client_version")]
    pub client_version: String,

    #[serde(default)]
    pub tls_backend: TlsBackend,

    /// HTTP proxy URL (http://, https:// or socks5://)
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub proxy_username: Option<String>,

    #[serde(default)]
    pub proxy_password: Option<String>,

    /// Frame CRC failures abort the stream instead of resynchronising
    #[serde(default)]
    pub strict_mode: bool,

    /// Recovery events tolerated before a stream is aborted
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// Emit partial `input_json_delta` events as tool fragments arrive
    #[serde(default = "default_incremental_tool_events")]
    pub incremental_tool_events: bool,

    /// Bound on waiting for a token refresh (seconds)
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,

    /// Skew subtracted from token lifetimes (seconds)
    #[serde(default = "default_token_skew_secs")]
    pub token_skew_secs: u64,

    /// Idle tool fragment buffers expire after this long (seconds)
    #[serde(default = "default_buffer_expiry_secs")]
    pub buffer_expiry_secs: u64,

    /// Maximum request body size in bytes (0 = unlimited)
    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: usize,

    /// Config file path (runtime metadata, not written to JSON)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_client_version() -> String {
    "1.0.27".to_string()
}

fn default_max_errors() -> usize {
    5
}

fn default_incremental_tool_events() -> bool {
    true
}

fn default_refresh_timeout_secs() -> u64 {
    30
}

fn default_token_skew_secs() -> u64 {
    300
}

fn default_buffer_expiry_secs() -> u64 {
    300
}

fn default_max_request_body_bytes() -> usize {
    400_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            region: default_region(),
            auth_region: None,
            api_region: None,
            api_key: None,
            client_version: default_client_version(),
            tls_backend: TlsBackend::default(),
            proxy_url: None,
            proxy_username: None,
            proxy_password: None,
            strict_mode: false,
            max_errors: default_max_errors(),
            incremental_tool_events: default_incremental_tool_events(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            token_skew_secs: default_token_skew_secs(),
            buffer_expiry_secs: default_buffer_expiry_secs(),
            max_request_body_bytes: default_max_request_body_bytes(),
            config_path: None,
        }
    }
}

impl Config {
    /// Default config file path
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    /// Effective auth region (token refresh)
    pub fn effective_auth_region(&self) -> &str {
        self.auth_region.as_deref().unwrap_or(&self.region)
    }

    /// Effective API region (upstream requests)
    pub fn effective_api_region(&self) -> &str {
        self.api_region.as_deref().unwrap_or(&self.region)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn token_skew(&self) -> Duration {
        Duration::from_secs(self.token_skew_secs)
    }

    pub fn buffer_expiry(&self) -> Duration {
        Duration::from_secs(self.buffer_expiry_secs)
    }

    /// Load configuration from a file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}
