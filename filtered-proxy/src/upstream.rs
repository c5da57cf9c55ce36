use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use polygon_wire::ReconnectBackoff;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::aggregator_subs::AggregatorSubscriptions;
use crate::roster::ClientRoster;

/// Holds the single upstream session to the firehose. Authenticates with
/// the shared token, subscribes to everything (the firehose never filters
/// anyway), and hands every received frame to the roster for per-client
/// dispatch. Reconnects with backoff on any transient failure; forever,
/// since a misconfigured firehose token is detected at firehose-side
/// startup, not here.
pub struct FirehoseUpstream {
    url: String,
    token: String,
    backoff_max_ms: u64,
    roster: Arc<ClientRoster>,
    include_extended_hours: bool,
}

impl FirehoseUpstream {
    pub fn new(
        url: String,
        token: String,
        backoff_max_ms: u64,
        roster: Arc<ClientRoster>,
        include_extended_hours: bool,
    ) -> Self {
        FirehoseUpstream { url, token, backoff_max_ms, roster, include_extended_hours }
    }

    pub async fn run(self) -> Result<()> {
        let mut backoff = ReconnectBackoff::new(self.backoff_max_ms);
        loop {
            if let Err(e) = self.connect_and_stream().await {
                warn!(error = %e, "firehose link dropped");
            }
            let delay = backoff.next_delay();
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "reconnecting to firehose");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!(url = %self.url, "connecting to firehose");
        let (ws_stream, _) = connect_async(&self.url).await.context("failed to connect to firehose")?;
        let (mut write, mut read) = ws_stream.split();

        let auth_msg = serde_json::json!({"action": "auth", "token": self.token}).to_string();
        write.send(Message::Text(auth_msg)).await.context("failed to send auth frame")?;

        let subscribe_msg = serde_json::json!({"action": "subscribe", "params": "*"}).to_string();
        write.send(Message::Text(subscribe_msg)).await.context("failed to send subscribe frame")?;

        let mut ping_interval = interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.roster.dispatch_frame(&text, self.include_extended_hours).await;
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
}

/// Holds the single upstream session to the ms-aggregator. Unlike the
/// firehose link, what this connection is subscribed to changes at
/// runtime: `cmd_rx` carries subscribe/unsubscribe control frames the
/// client handler produces on refcount transitions (first subscriber /
/// last unsubscribe of a `<N>Ms.<SYM>` key), forwarded upstream verbatim.
/// On reconnect, every key still holding a positive refcount is re-sent as
/// a fresh subscribe before the read loop starts, mirroring
/// `FirehoseUpstream`'s permanent wildcard resubscribe — otherwise clients
/// already subscribed to a bar key would see the gap spec.md promises is
/// transparent turn into a permanent silence.
pub struct AggregatorUpstream {
    url: String,
    backoff_max_ms: u64,
    roster: Arc<ClientRoster>,
    include_extended_hours: bool,
    cmd_rx: mpsc::Receiver<String>,
    aggregator_subs: Arc<AggregatorSubscriptions>,
}

impl AggregatorUpstream {
    pub fn new(
        url: String,
        backoff_max_ms: u64,
        roster: Arc<ClientRoster>,
        include_extended_hours: bool,
        cmd_rx: mpsc::Receiver<String>,
        aggregator_subs: Arc<AggregatorSubscriptions>,
    ) -> Self {
        AggregatorUpstream { url, backoff_max_ms, roster, include_extended_hours, cmd_rx, aggregator_subs }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut backoff = ReconnectBackoff::new(self.backoff_max_ms);
        loop {
            if let Err(e) = self.connect_and_stream().await {
                warn!(error = %e, "ms-aggregator link dropped");
            }
            let delay = backoff.next_delay();
            warn!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "reconnecting to ms-aggregator");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        info!(url = %self.url, "connecting to ms-aggregator");
        let (ws_stream, _) =
            connect_async(&self.url).await.context("failed to connect to ms-aggregator")?;
        let (mut write, mut read) = ws_stream.split();

        let auth_msg = serde_json::json!({"action": "auth", "token": "filtered-proxy"}).to_string();
        write.send(Message::Text(auth_msg)).await.context("failed to send auth frame")?;

        for key in self.aggregator_subs.active_selector_strings() {
            let subscribe_msg = serde_json::json!({"action": "subscribe", "params": key}).to_string();
            write
                .send(Message::Text(subscribe_msg))
                .await
                .context("failed to resubscribe ms-aggregator key after reconnect")?;
        }

        let mut ping_interval = interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.roster.dispatch_frame(&text, self.include_extended_hours).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("ms-aggregator connection closed");
                            return Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if write.send(Message::Pong(data)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "ms-aggregator read error");
                            return Ok(());
                        }
                    }
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    debug!(cmd = %cmd, "forwarding subscription change to ms-aggregator");
                    if write.send(Message::Text(cmd)).await.is_err() {
                        return Ok(());
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
}
