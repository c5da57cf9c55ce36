use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use polygon_wire::{Metrics, PolygonMessage, ReconnectBackoff};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::bar_engine::BarEngine;
use crate::config::Config;
use crate::subscription_manager::SubscriptionManager;

/// Connects to the firehose proxy, authenticates, subscribes to `T.*`, and
/// feeds every trade into the bar engine once for each interval that
/// currently has at least one subscriber. Closed bars are handed to the
/// subscription manager for dispatch.
pub struct UpstreamConnection {
    config: Config,
    engine: Arc<BarEngine>,
    subscriptions: Arc<SubscriptionManager>,
    metrics: Arc<Metrics>,
}

impl UpstreamConnection {
    pub fn new(
        config: Config,
        engine: Arc<BarEngine>,
        subscriptions: Arc<SubscriptionManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        UpstreamConnection {
            config,
            engine,
            subscriptions,
            metrics,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut backoff = ReconnectBackoff::new(self.config.reconnect_backoff_max_ms);

        loop {
            if let Err(e) = self.connect_and_run().await {
                warn!(error = %e, "firehose connection dropped");
            }

            self.metrics.record_reconnect();
            let delay = backoff.next_delay();
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "reconnecting to firehose");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_run(&self) -> Result<()> {
        info!(url = %self.config.firehose_url, "connecting to firehose");

        let (ws_stream, _) = connect_async(&self.config.firehose_url)
            .await
            .context("failed to connect to firehose")?;
        let (mut write, mut read) = ws_stream.split();

        // greeting ("connected" status) arrives unsolicited
        let auth_msg = serde_json::json!({
            "action": "auth",
            "token": self.config.firehose_token,
        })
        .to_string();
        write.send(Message::Text(auth_msg)).await.context("failed to send auth frame")?;

        let subscribe_msg = serde_json::json!({
            "action": "subscribe",
            "params": "T.*",
        })
        .to_string();
        write.send(Message::Text(subscribe_msg)).await.context("failed to send subscribe frame")?;

        info!("subscribed to T.* from firehose");

        let mut ping_interval = interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.metrics.record_frame();
                            self.handle_frame(&text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("firehose connection closed");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "firehose read error");
                            return Ok(());
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    if write.send(Message::Ping(vec![])).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let messages: Vec<PolygonMessage> = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(_) => match serde_json::from_str::<PolygonMessage>(text) {
                Ok(single) => vec![single],
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable firehose frame");
                    return;
                }
            },
        };

        for message in messages {
            let PolygonMessage::Trade(trade) = message else {
                continue;
            };

            for interval_ms in self.subscriptions.active_intervals() {
                if let Some(bar) = self
                    .engine
                    .ingest_trade(&trade.symbol, interval_ms, trade.timestamp, trade.price, trade.size)
                    .await
                {
                    let key = crate::bar_engine::BarKey {
                        symbol: trade.symbol.clone(),
                        interval_ms,
                    };
                    self.subscriptions.dispatch_bar(&key, &bar).await;
                }
            }
        }
    }
}
