use std::sync::Arc;

use anyhow::Result;
use firehose_proxy::broadcaster::Broadcaster;
use firehose_proxy::client_handler::ClientHandler;
use firehose_proxy::config::Config;
use firehose_proxy::upstream::PolygonConnection;
use polygon_wire::Metrics;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!(data_types = ?config.subscribe_data_types, port = config.proxy_port, "starting firehose proxy");

    let metrics = Arc::new(Metrics::new());
    let broadcaster = Arc::new(Broadcaster::new(metrics.clone(), config.client_queue_deadline_ms));

    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<String>(100_000);

    let polygon_conn = PolygonConnection::new(config.clone(), broadcast_tx, metrics.clone());
    let upstream_handle = tokio::spawn(async move { polygon_conn.run().await });

    let client_handler = ClientHandler::new(
        config.proxy_port,
        broadcaster.clone(),
        config.firehose_token.clone(),
        config.max_client_queue,
        metrics.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = client_handler.run().await {
            tracing::error!(error = %e, "client handler error");
        }
    });

    let metrics_for_log = metrics.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let snapshot = metrics_for_log.snapshot();
            info!(?snapshot, "metrics snapshot");
        }
    });

    info!("broadcast loop started");
    tokio::select! {
        result = upstream_handle => {
            // A fatal auth rejection surfaces here and the process exits non-zero.
            result??;
        }
        _ = async {
            while let Some(message) = broadcast_rx.recv().await {
                broadcaster.broadcast(message).await;
            }
        } => {}
    }

    Ok(())
}
