use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use polygon_wire::{
    parse_selectors, ControlAction, ControlRequest, DropReason, Metrics, Selector, StatusFrame,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator_subs::{AggregatorSubscriptions, RefcountTransition};
use crate::config::Config;
use crate::roster::ClientRoster;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

const MAX_MALFORMED_FRAMES: u32 = 10;

/// Terminates public client connections. Reproduces Polygon's handshake
/// shape exactly (§4.3): any non-empty auth credential passes, since the
/// proxy — not each client — owns the real upstream sessions.
pub struct ClientHandler {
    port: u16,
    roster: Arc<ClientRoster>,
    aggregator_subs: Arc<AggregatorSubscriptions>,
    aggregator_cmd_tx: mpsc::Sender<String>,
    max_client_queue: usize,
    metrics: Arc<Metrics>,
}

impl ClientHandler {
    pub fn new(
        config: &Config,
        roster: Arc<ClientRoster>,
        aggregator_subs: Arc<AggregatorSubscriptions>,
        aggregator_cmd_tx: mpsc::Sender<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ClientHandler {
            port: config.proxy_port,
            roster,
            aggregator_subs,
            aggregator_cmd_tx,
            max_client_queue: config.max_client_queue,
            metrics,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "filtered proxy listening");
        Arc::new(self).serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        while let Ok((stream, addr)) = listener.accept().await {
            let handler = self.clone();
            let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
            let task = tokio::spawn(async move {
                let abort = abort_rx.await.ok();
                if let Err(e) = handler.handle_client(stream, addr, abort).await {
                    error!(error = %e, "client handler error");
                }
            });
            let _ = abort_tx.send(task.abort_handle());
        }
        Ok(())
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        abort: Option<tokio::task::AbortHandle>,
    ) -> Result<()> {
        let client_id = Uuid::new_v4();
        info!(client_id = %client_id, %addr, "client connected");

        let ws_stream = accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        ws_tx.send(Message::Text(StatusFrame::connected().to_json())).await.ok();

        if !self.authenticate(client_id, &mut ws_tx, &mut ws_rx).await? {
            self.metrics.record_drop(DropReason::AuthFailed);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<String>(self.max_client_queue);
        let abort = abort.expect("abort handle set synchronously right after spawn");
        self.roster.register(client_id, tx, abort);

        let mut malformed = 0u32;
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    if ws_tx.send(Message::Text(msg)).await.is_err() {
                        debug!(client_id = %client_id, "disconnected mid-send");
                        break;
                    }
                }
                Some(msg) = ws_rx.next() => {
                    match msg {
                        Ok(Message::Close(_)) => {
                            info!(client_id = %client_id, "client closed connection");
                            break;
                        }
                        Ok(Message::Ping(data)) => {
                            if ws_tx.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Text(text)) => {
                            if !self.handle_control_frame(client_id, &text, &mut ws_tx).await {
                                malformed += 1;
                                if malformed >= MAX_MALFORMED_FRAMES {
                                    warn!(client_id = %client_id, "too many malformed frames, dropping session");
                                    self.metrics.record_drop(DropReason::ProtocolError);
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(client_id = %client_id, error = %e, "websocket error");
                            break;
                        }
                        _ => {}
                    }
                }
                else => break,
            }
        }

        // Every selector this client held is one fewer subscriber of its
        // aggregator key, if any; a session close is just an implicit
        // unsubscribe-everything.
        let held = self.roster.selectors_of(client_id);
        self.apply_unsubscribe_refcounts(&held).await;
        self.roster.remove(client_id);
        info!(client_id = %client_id, "client handler terminated");
        Ok(())
    }

    /// `{action: "auth", params: "<anything-non-empty>"}` — matches §4.3:
    /// the proxy's own upstream sessions are the ones that actually
    /// authenticate against Polygon; a downstream credential only has to
    /// be present.
    async fn authenticate(
        &self,
        client_id: Uuid,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsSource,
    ) -> Result<bool> {
        let frame = match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => text,
            _ => {
                debug!(client_id = %client_id, "client disconnected before auth");
                return Ok(false);
            }
        };

        let request = match ControlRequest::parse(&frame) {
            Ok(r) if r.action == ControlAction::Auth => r,
            _ => {
                ws_tx
                    .send(Message::Text(StatusFrame::auth_failed("expected auth frame").to_json()))
                    .await
                    .ok();
                return Ok(false);
            }
        };

        let credential = request.params.as_deref().or(request.token.as_deref()).unwrap_or("");
        if credential.is_empty() {
            ws_tx
                .send(Message::Text(StatusFrame::auth_failed("credential must not be empty").to_json()))
                .await
                .ok();
            return Ok(false);
        }

        ws_tx.send(Message::Text(StatusFrame::auth_success().to_json())).await.ok();
        info!(client_id = %client_id, "client authenticated");
        Ok(true)
    }

    /// Returns `false` for a malformed frame (counted toward the
    /// drop-after-N-strikes budget), `true` otherwise.
    async fn handle_control_frame(&self, client_id: Uuid, text: &str, ws_tx: &mut WsSink) -> bool {
        let request = match ControlRequest::parse(text) {
            Ok(r) => r,
            Err(_) => {
                ws_tx
                    .send(Message::Text(StatusFrame::error("malformed control frame").to_json()))
                    .await
                    .ok();
                return false;
            }
        };

        match request.action {
            ControlAction::Auth => {
                ws_tx.send(Message::Text(StatusFrame::auth_success().to_json())).await.ok();
                true
            }
            ControlAction::Subscribe => {
                let raw = request.params.clone().unwrap_or_default();
                match parse_selectors(&raw) {
                    Ok(selectors) => {
                        let added = self.roster.add_selectors(client_id, &selectors);
                        self.apply_subscribe_refcounts(&added, request.since).await;
                        ws_tx
                            .send(Message::Text(StatusFrame::subscribed(raw).to_json()))
                            .await
                            .ok();
                        self.metrics.subscription_added();
                        true
                    }
                    Err(errors) => {
                        let summary = errors
                            .iter()
                            .map(|(part, e)| format!("{part}: {e}"))
                            .collect::<Vec<_>>()
                            .join("; ");
                        ws_tx.send(Message::Text(StatusFrame::error(summary).to_json())).await.ok();
                        false
                    }
                }
            }
            ControlAction::Unsubscribe => {
                let raw = request.params.clone().unwrap_or_default();
                match parse_selectors(&raw) {
                    Ok(selectors) => {
                        let removed = self.roster.remove_selectors(client_id, &selectors);
                        self.apply_unsubscribe_refcounts(&removed).await;
                        ws_tx
                            .send(Message::Text(StatusFrame::unsubscribed(raw).to_json()))
                            .await
                            .ok();
                        self.metrics.subscription_removed();
                        true
                    }
                    Err(errors) => {
                        let summary = errors
                            .iter()
                            .map(|(part, e)| format!("{part}: {e}"))
                            .collect::<Vec<_>>()
                            .join("; ");
                        ws_tx.send(Message::Text(StatusFrame::error(summary).to_json())).await.ok();
                        false
                    }
                }
            }
        }
    }

    /// Forward newly-activated `<N>Ms.<SYM>` selectors upstream to the
    /// aggregator only on the first subscriber of that key; other
    /// selectors (`T`, `Q`, `A`, `AM`, or repeat subscribers) need no
    /// upstream change since the firehose is permanently wildcarded.
    async fn apply_subscribe_refcounts(&self, added: &[Selector], since: Option<i64>) {
        for sel in added {
            if let RefcountTransition::FirstSubscriber(key) = self.aggregator_subs.increment(sel) {
                let mut params = serde_json::json!({"action": "subscribe", "params": key});
                if let Some(since_ts) = since {
                    params["since"] = serde_json::json!(since_ts);
                }
                let _ = self.aggregator_cmd_tx.send(params.to_string()).await;
            }
        }
    }

    async fn apply_unsubscribe_refcounts(&self, removed: &[Selector]) {
        for sel in removed {
            if let RefcountTransition::LastUnsubscribed(key) = self.aggregator_subs.decrement(sel) {
                let cmd = serde_json::json!({"action": "unsubscribe", "params": key}).to_string();
                let _ = self.aggregator_cmd_tx.send(cmd).await;
            }
        }
    }
}
