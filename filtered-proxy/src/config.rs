use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub firehose_url: String,
    pub firehose_token: String,
    pub ms_aggregator_url: String,
    pub proxy_port: u16,
    pub include_extended_hours: bool,
    pub max_client_queue: usize,
    pub client_queue_deadline_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let config = Config {
            firehose_url: env::var("FIREHOSE_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8767".to_string()),
            firehose_token: env::var("FIREHOSE_TOKEN").context("FIREHOSE_TOKEN must be set")?,
            ms_aggregator_url: env::var("MS_AGGREGATOR_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8768".to_string()),
            proxy_port: env::var("FILTERED_PROXY_PORT")
                .unwrap_or_else(|_| "8769".to_string())
                .parse()
                .context("FILTERED_PROXY_PORT must be a valid port number")?,
            include_extended_hours: env::var("INCLUDE_EXTENDED_HOURS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("INCLUDE_EXTENDED_HOURS must be true or false")?,
            max_client_queue: env::var("MAX_CLIENT_QUEUE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("MAX_CLIENT_QUEUE must be a valid number")?,
            client_queue_deadline_ms: env::var("MAX_CLIENT_QUEUE_DEADLINE_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("MAX_CLIENT_QUEUE_DEADLINE_MS must be a valid number")?,
            reconnect_backoff_max_ms: env::var("RECONNECT_BACKOFF_MAX_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("RECONNECT_BACKOFF_MAX_MS must be a valid number")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.firehose_token.is_empty() {
            anyhow::bail!("FIREHOSE_TOKEN must not be empty");
        }
        if self.max_client_queue == 0 {
            anyhow::bail!("MAX_CLIENT_QUEUE must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            firehose_url: "ws://127.0.0.1:8767".to_string(),
            firehose_token: "secret".to_string(),
            ms_aggregator_url: "ws://127.0.0.1:8768".to_string(),
            proxy_port: 8769,
            include_extended_hours: true,
            max_client_queue: 1000,
            client_queue_deadline_ms: 1000,
            reconnect_backoff_max_ms: 30_000,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn rejects_empty_firehose_token() {
        let mut config = base();
        config.firehose_token = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_queue_capacity() {
        let mut config = base();
        config.max_client_queue = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base().validate().is_ok());
    }
}
