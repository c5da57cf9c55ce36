use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use polygon_wire::{ControlAction, ControlRequest, DropReason, Metrics, StatusFrame};
use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcaster::Broadcaster;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Consecutive malformed control frames tolerated before a session is
/// dropped as a downstream protocol error.
const MAX_MALFORMED_FRAMES: u32 = 10;

pub struct ClientHandler {
    port: u16,
    broadcaster: Arc<Broadcaster>,
    auth_token: String,
    max_client_queue: usize,
    metrics: Arc<Metrics>,
}

impl ClientHandler {
    pub fn new(
        port: u16,
        broadcaster: Arc<Broadcaster>,
        auth_token: String,
        max_client_queue: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            port,
            broadcaster,
            auth_token,
            max_client_queue,
            metrics,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "firehose proxy listening");
        Arc::new(self).serve(listener).await
    }

    /// Accept loop over an already-bound listener, split out so tests can
    /// bind to an ephemeral port (0) and read back the assigned address.
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

        if !self.authenticate(client_id, &mut ws_tx, &mut ws_rx).await? {
            self.metrics.record_drop(DropReason::AuthFailed);
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<String>(self.max_client_queue);
        let mut abort = Some(abort.expect("abort handle set synchronously right after spawn"));
        // Registration (and therefore the start of frame delivery) waits for
        // the client's own `{"action":"subscribe"}` frame per the public
        // contract — auth alone does not start the stream.
        let mut registered = false;

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
                            // The firehose ignores subscribe parameters (no filtering)
                            // but still acknowledges the action, and still validates
                            // frame shape to police malformed clients.
                            match ControlRequest::parse(&text) {
                                Ok(req) if req.action == ControlAction::Subscribe => {
                                    if let Some(handle) = abort.take() {
                                        self.broadcaster.add_client(client_id, tx.clone(), handle).await;
                                        registered = true;
                                    }
                                    let _ = ws_tx.send(Message::Text(StatusFrame::subscribed("*").to_json())).await;
                                }
                                Ok(req) if req.action == ControlAction::Unsubscribe => {
                                    let _ = ws_tx.send(Message::Text(StatusFrame::unsubscribed("*").to_json())).await;
                                }
                                Ok(_) => {
                                    let _ = ws_tx.send(Message::Text(StatusFrame::auth_success().to_json())).await;
                                }
                                Err(_) => {
                                    malformed += 1;
                                    let _ = ws_tx.send(Message::Text(
                                        StatusFrame::error("malformed control frame").to_json(),
                                    )).await;
                                    if malformed >= MAX_MALFORMED_FRAMES {
                                        warn!(client_id = %client_id, "too many malformed frames, dropping session");
                                        self.metrics.record_drop(DropReason::ProtocolError);
                                        break;
                                    }
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

        if registered {
            self.broadcaster.remove_client(client_id).await;
        }
        info!(client_id = %client_id, "client handler terminated");
        Ok(())
    }

    /// `{action: "auth", token}` → `{status: "authenticated"}` on match or
    /// the socket is closed with a protocol-error status frame.
    async fn authenticate(
        &self,
        client_id: Uuid,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsSource,
    ) -> Result<bool> {
        ws_tx.send(Message::Text(StatusFrame::connected().to_json())).await.ok();

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

        let presented = request.token.as_deref().unwrap_or("");
        if presented == self.auth_token {
            ws_tx
                .send(Message::Text(StatusFrame::auth_success().to_json()))
                .await
                .ok();
            info!(client_id = %client_id, "client authenticated");
            Ok(true)
        } else {
            warn!(client_id = %client_id, "client presented invalid token");
            ws_tx
                .send(Message::Text(StatusFrame::auth_failed("invalid token").to_json()))
                .await
                .ok();
            Ok(false)
        }
    }
}
