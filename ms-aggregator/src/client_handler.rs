use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use polygon_wire::{
    ChannelSelector, Channel, ControlAction, ControlRequest, DropReason, Metrics, Selector,
    StatusFrame, SymbolSelector, WireError,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::subscription_manager::{BarSelector, SubscriptionManager};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

const MAX_MALFORMED_FRAMES: u32 = 10;

/// Terminates client connections for the millisecond-bar aggregator. The
/// auth handshake has the same shape as the firehose's but the token is
/// optional — any non-empty `action: "auth"` frame authenticates.
pub struct ClientHandler {
    port: u16,
    subscriptions: Arc<SubscriptionManager>,
    max_client_queue: usize,
    metrics: Arc<Metrics>,
    min_interval_ms: u64,
    max_interval_ms: u64,
}

impl ClientHandler {
    pub fn new(
        config: &Config,
        subscriptions: Arc<SubscriptionManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        ClientHandler {
            port: config.aggregator_port,
            subscriptions,
            max_client_queue: config.max_client_queue,
            metrics,
            min_interval_ms: config.min_interval_ms,
            max_interval_ms: config.max_interval_ms,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "ms-aggregator listening");
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
        self.subscriptions.register_client(client_id, tx, abort);

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

        self.subscriptions.remove_client(client_id);
        info!(client_id = %client_id, "client handler terminated");
        Ok(())
    }

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

        match ControlRequest::parse(&frame) {
            Ok(r) if r.action == ControlAction::Auth => {
                ws_tx.send(Message::Text(StatusFrame::auth_success().to_json())).await.ok();
                info!(client_id = %client_id, "client authenticated");
                Ok(true)
            }
            _ => {
                ws_tx
                    .send(Message::Text(StatusFrame::auth_failed("expected auth frame").to_json()))
                    .await
                    .ok();
                Ok(false)
            }
        }
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
                // already authenticated; a repeated auth frame is harmless
                ws_tx.send(Message::Text(StatusFrame::auth_success().to_json())).await.ok();
                true
            }
            ControlAction::Subscribe => {
                let raw_selectors = request.selector_strings();
                match self.parse_bar_selectors(&raw_selectors) {
                    Ok(selectors) => {
                        let replay = self
                            .subscriptions
                            .subscribe(client_id, &selectors, request.since)
                            .await;
                        ws_tx
                            .send(Message::Text(
                                StatusFrame::subscribed(raw_selectors.join(",")).to_json(),
                            ))
                            .await
                            .ok();
                        for bar in replay {
                            let payload = serde_json::to_string(&[bar]).unwrap_or_else(|_| "[]".to_string());
                            if ws_tx.send(Message::Text(payload)).await.is_err() {
                                break;
                            }
                        }
                        true
                    }
                    Err(e) => {
                        ws_tx.send(Message::Text(StatusFrame::error(e).to_json())).await.ok();
                        false
                    }
                }
            }
            ControlAction::Unsubscribe => {
                let raw_selectors = request.selector_strings();
                match self.parse_bar_selectors(&raw_selectors) {
                    Ok(selectors) => {
                        self.subscriptions.unsubscribe(client_id, &selectors);
                        ws_tx
                            .send(Message::Text(
                                StatusFrame::unsubscribed(raw_selectors.join(",")).to_json(),
                            ))
                            .await
                            .ok();
                        true
                    }
                    Err(e) => {
                        ws_tx.send(Message::Text(StatusFrame::error(e).to_json())).await.ok();
                        false
                    }
                }
            }
        }
    }

    /// Each selector must name one `<N>Ms` interval (channel wildcards are
    /// not meaningful here — the aggregator doesn't serve `T`/`Q`/`A`/`AM`)
    /// and a concrete symbol or the symbol wildcard.
    fn parse_bar_selectors(&self, raw: &[&str]) -> Result<Vec<BarSelector>, String> {
        let mut out = Vec::new();
        for part in raw {
            let selector = Selector::parse(part).map_err(|e: WireError| e.to_string())?;
            let interval_ms = match selector.channel {
                ChannelSelector::Concrete(Channel::MsBar(n)) => n,
                _ => {
                    return Err(format!(
                        "{part:?}: ms-aggregator only serves <N>Ms channels"
                    ))
                }
            };
            if interval_ms < self.min_interval_ms || interval_ms > self.max_interval_ms {
                return Err(format!(
                    "{part:?}: interval {interval_ms}ms outside configured range [{}, {}]",
                    self.min_interval_ms, self.max_interval_ms
                ));
            }
            let bar_selector = match selector.symbol {
                SymbolSelector::Wildcard => BarSelector::Wildcard { interval_ms },
                SymbolSelector::Concrete(symbol) => BarSelector::Symbol { interval_ms, symbol },
            };
            out.push(bar_selector);
        }
        Ok(out)
    }
}
