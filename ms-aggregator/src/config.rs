use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub firehose_url: String,
    pub firehose_token: String,
    pub aggregator_port: u16,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub timer_interval_ms: u64,
    pub replay_window_seconds: u64,
    pub log_level: String,
    pub max_client_queue: usize,
    pub reconnect_backoff_max_ms: u64,
    pub client_queue_deadline_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let config = Config {
            firehose_url: env::var("FIREHOSE_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8767".to_string()),
            firehose_token: env::var("FIREHOSE_TOKEN")
                .context("FIREHOSE_TOKEN must be set")?,
            aggregator_port: env::var("MS_AGGREGATOR_PORT")
                .unwrap_or_else(|_| "8768".to_string())
                .parse()
                .context("MS_AGGREGATOR_PORT must be a valid port number")?,
            min_interval_ms: env::var("MIN_INTERVAL_MS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("MIN_INTERVAL_MS must be a valid number")?,
            max_interval_ms: env::var("MAX_INTERVAL_MS")
                .unwrap_or_else(|_| "60000".to_string())
                .parse()
                .context("MAX_INTERVAL_MS must be a valid number")?,
            timer_interval_ms: env::var("TIMER_INTERVAL_MS")
                .unwrap_or_else(|_| "250".to_string())
                .parse()
                .context("TIMER_INTERVAL_MS must be a valid number")?,
            replay_window_seconds: env::var("REPLAY_WINDOW_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("REPLAY_WINDOW_SECONDS must be a valid number")?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            max_client_queue: env::var("MAX_CLIENT_QUEUE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("MAX_CLIENT_QUEUE must be a valid number")?,
            reconnect_backoff_max_ms: env::var("RECONNECT_BACKOFF_MAX_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("RECONNECT_BACKOFF_MAX_MS must be a valid number")?,
            client_queue_deadline_ms: env::var("CLIENT_QUEUE_DEADLINE_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("CLIENT_QUEUE_DEADLINE_MS must be a valid number")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 {
            anyhow::bail!("MIN_INTERVAL_MS must be at least 1");
        }
        if self.max_interval_ms < self.min_interval_ms {
            anyhow::bail!("MAX_INTERVAL_MS must be >= MIN_INTERVAL_MS");
        }
        if self.firehose_token.is_empty() {
            anyhow::bail!("FIREHOSE_TOKEN must not be empty");
        }
        if self.replay_window_seconds == 0 {
            anyhow::bail!("REPLAY_WINDOW_SECONDS must be greater than zero");
        }
        if self.max_client_queue == 0 {
            anyhow::bail!("MAX_CLIENT_QUEUE must be greater than zero");
        }
        Ok(())
    }

    pub fn interval_in_range(&self, interval_ms: u64) -> bool {
        (self.min_interval_ms..=self.max_interval_ms).contains(&interval_ms)
    }
}
