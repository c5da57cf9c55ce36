use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use polygon_wire::{Metrics, ReconnectBackoff};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::Config;

const AUTH_RESPONSE_DEADLINE: Duration = Duration::from_secs(5);

/// Marks the distinction between "reconnect and retry" and "the deployment
/// is misconfigured, exit the process" failures from the upstream link.
pub enum UpstreamOutcome {
    Reconnect,
    Fatal(anyhow::Error),
}

pub struct PolygonConnection {
    config: Config,
    broadcast_tx: mpsc::Sender<String>,
    metrics: Arc<Metrics>,
}

impl PolygonConnection {
    pub fn new(config: Config, broadcast_tx: mpsc::Sender<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            broadcast_tx,
            metrics,
        }
    }

    /// Runs until Polygon rejects authentication, at which point the
    /// process exits non-zero: the deployment is misconfigured and no
    /// amount of reconnecting will fix a bad API key.
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = ReconnectBackoff::new(self.config.reconnect_backoff_max_ms);

        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    // Clean disconnect (e.g. Polygon closed the socket); reconnect.
                }
                Err(UpstreamOutcome::Fatal(e)) => {
                    error!(error = %e, "upstream authentication rejected by Polygon, exiting");
                    return Err(e);
                }
                Err(UpstreamOutcome::Reconnect) => {}
            }

            self.metrics.record_reconnect();
            let delay = backoff.next_delay();
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "reconnecting to Polygon");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_stream(&mut self) -> Result<(), UpstreamOutcome> {
        info!(url = %self.config.polygon_ws_url, "connecting to Polygon");

        let (ws_stream, _) = connect_async(&self.config.polygon_ws_url)
            .await
            .map_err(|e| UpstreamOutcome::Reconnect.with_context(e))?;
        let (mut write, mut read) = ws_stream.split();

        info!("connected to Polygon, authenticating");

        let auth_msg = serde_json::json!({
            "action": "auth",
            "params": self.config.polygon_api_key,
        })
        .to_string();
        write
            .send(Message::Text(auth_msg))
            .await
            .map_err(|e| UpstreamOutcome::Reconnect.with_context(e))?;

        match timeout(AUTH_RESPONSE_DEADLINE, read.next()).await {
            Ok(Some(Ok(Message::Text(msg)))) => {
                debug!(response = %msg, "auth response");
                if msg.contains("auth_failed") || msg.contains("unauthorized") {
                    return Err(UpstreamOutcome::Fatal(anyhow::anyhow!(
                        "Polygon rejected authentication: {msg}"
                    )));
                }
            }
            Ok(Some(Ok(_))) | Ok(None) => {
                return Err(UpstreamOutcome::Reconnect);
            }
            Ok(Some(Err(e))) => return Err(UpstreamOutcome::Reconnect.with_context(e)),
            Err(_) => {
                warn!("timed out waiting for Polygon auth response");
                return Err(UpstreamOutcome::Reconnect);
            }
        }

        let subscription = self.config.get_subscription_string();
        info!(subscription = %subscription, "subscribing");
        let sub_msg = serde_json::json!({
            "action": "subscribe",
            "params": subscription,
        })
        .to_string();
        write
            .send(Message::Text(sub_msg))
            .await
            .map_err(|e| UpstreamOutcome::Reconnect.with_context(e))?;

        let mut ping_interval = interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.metrics.record_frame();
                            if self.broadcast_tx.send(text).await.is_err() {
                                warn!("broadcast channel closed");
                                return Ok(());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Polygon connection closed");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream read error");
                            return Ok(());
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        warn!("failed to send ping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl UpstreamOutcome {
    fn with_context(self, err: impl std::fmt::Display) -> Self {
        match self {
            UpstreamOutcome::Reconnect => {
                debug!(error = %err, "upstream transient error");
                UpstreamOutcome::Reconnect
            }
            other => other,
        }
    }
}
