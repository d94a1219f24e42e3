mod anthropic;
mod common;
mod http_client;
mod model;
mod whisperer;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use model::arg::Args;
use model::config::Config;
use whisperer::auth::HttpRefresher;
use whisperer::model::credentials::load_credentials;
use whisperer::provider::WhispererProvider;
use whisperer::token_pool::{TokenPool, TokenPoolConfig};

/// Expired-token sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = args
        .config
        .unwrap_or_else(|| Config::default_config_path().to_string());
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        tracing::error!("failed to load config: {}", e);
        std::process::exit(1);
    });

    let api_key = config.api_key.clone().unwrap_or_else(|| {
        tracing::error!("apiKey not set in config file");
        std::process::exit(1);
    });

    // Credentials: envelope variable, file, or legacy variables
    let credentials = load_credentials(args.credentials.as_deref().or(Some("credentials.json")))
        .unwrap_or_else(|e| {
            tracing::error!("failed to load credentials: {}", e);
            std::process::exit(1);
        });
    tracing::info!("loaded {} credential(s)", credentials.len());

    let proxy_config = config.proxy_url.as_ref().map(|url| {
        let mut proxy = http_client::ProxyConfig::new(url);
        if let (Some(username), Some(password)) = (&config.proxy_username, &config.proxy_password) {
            proxy = proxy.with_auth(username, password);
        }
        proxy
    });
    if let Some(proxy) = &proxy_config {
        tracing::info!("HTTP proxy configured: {}", proxy.url);
    }

    let auth_client = http_client::build_client(proxy_config.as_ref(), 60, config.tls_backend)
        .unwrap_or_else(|e| {
            tracing::error!("failed to build auth HTTP client: {}", e);
            std::process::exit(1);
        });
    let refresher = Arc::new(HttpRefresher::new(auth_client, config.clone()));

    let pool_config = TokenPoolConfig {
        refresh_timeout: config.refresh_timeout(),
        token_skew: config.token_skew(),
        max_retries: 3,
    };
    let token_pool = TokenPool::new(credentials, refresher, pool_config).unwrap_or_else(|e| {
        tracing::error!("failed to create token pool: {}", e);
        std::process::exit(1);
    });
    let token_pool = Arc::new(token_pool);
    token_pool.spawn_sweeper(SWEEP_INTERVAL);

    // Long upstream timeout: streaming responses can run for minutes
    let api_client = http_client::build_client(proxy_config.as_ref(), 720, config.tls_backend)
        .unwrap_or_else(|e| {
            tracing::error!("failed to build API HTTP client: {}", e);
            std::process::exit(1);
        });
    let provider = WhispererProvider::new(token_pool.clone(), config.clone(), api_client);

    let app = anthropic::create_router_with_provider(&api_key, Some(provider), config.clone());

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("starting Anthropic API endpoint: {}", addr);
    tracing::info!("available APIs:");
    tracing::info!("  GET  /v1/models");
    tracing::info!("  POST /v1/messages");
    tracing::info!("  POST /v1/messages/count_tokens");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
