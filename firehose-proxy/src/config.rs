use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub polygon_api_key: String,
    pub polygon_ws_url: String,
    pub proxy_port: u16,
    pub subscribe_data_types: Vec<String>,
    pub log_level: String,
    /// Shared-secret token downstream consumers must present on connect.
    /// Distinct from `polygon_api_key`, which authenticates this proxy to
    /// Polygon, not clients to this proxy.
    pub firehose_token: String,
    pub max_client_queue: usize,
    pub reconnect_backoff_max_ms: u64,
    pub client_queue_deadline_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let data_types = env::var("SUBSCRIBE_DATA_TYPES")
            .unwrap_or_else(|_| "T,Q,A,AM".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Config {
            polygon_api_key: env::var("POLYGON_API_KEY")
                .context("POLYGON_API_KEY must be set")?,
            polygon_ws_url: env::var("POLYGON_WS_URL")
                .unwrap_or_else(|_| "wss://socket.polygon.io/stocks".to_string()),
            proxy_port: env::var("FIREHOSE_PORT")
                .unwrap_or_else(|_| "8767".to_string())
                .parse()
                .context("FIREHOSE_PORT must be a valid port number")?,
            subscribe_data_types: data_types,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            firehose_token: env::var("FIREHOSE_TOKEN")
                .context("FIREHOSE_TOKEN must be set")?,
            max_client_queue: env::var("MAX_CLIENT_QUEUE")
                .unwrap_or_else(|_| "100000".to_string())
                .parse()
                .context("MAX_CLIENT_QUEUE must be a valid number")?,
            reconnect_backoff_max_ms: env::var("RECONNECT_BACKOFF_MAX_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("RECONNECT_BACKOFF_MAX_MS must be a valid number")?,
            client_queue_deadline_ms: env::var("MAX_CLIENT_QUEUE_DEADLINE_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("MAX_CLIENT_QUEUE_DEADLINE_MS must be a valid number")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polygon_api_key.is_empty() {
            anyhow::bail!("POLYGON_API_KEY must not be empty");
        }
        if self.firehose_token.is_empty() {
            anyhow::bail!("FIREHOSE_TOKEN must not be empty");
        }
        if self.subscribe_data_types.is_empty() {
            anyhow::bail!("SUBSCRIBE_DATA_TYPES must list at least one channel");
        }
        if self.max_client_queue == 0 {
            anyhow::bail!("MAX_CLIENT_QUEUE must be greater than zero");
        }
        Ok(())
    }

    pub fn get_subscription_string(&self) -> String {
        self.subscribe_data_types
            .iter()
            .map(|dt| format!("{dt}.*"))
            .collect::<Vec<_>>()
            .join(",")
    }
}
