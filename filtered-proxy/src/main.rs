use std::sync::Arc;

use anyhow::Result;
use filtered_proxy::aggregator_subs::AggregatorSubscriptions;
use filtered_proxy::client_handler::ClientHandler;
use filtered_proxy::config::Config;
use filtered_proxy::roster::ClientRoster;
use filtered_proxy::upstream::{AggregatorUpstream, FirehoseUpstream};
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

    info!(
        port = config.proxy_port,
        firehose_url = %config.firehose_url,
        ms_aggregator_url = %config.ms_aggregator_url,
        include_extended_hours = config.include_extended_hours,
        "starting filtered proxy"
    );

    let metrics = Arc::new(Metrics::new());
    let roster = Arc::new(ClientRoster::new(metrics.clone(), config.client_queue_deadline_ms));
    let aggregator_subs = Arc::new(AggregatorSubscriptions::new());

    let firehose = FirehoseUpstream::new(
        config.firehose_url.clone(),
        config.firehose_token.clone(),
        config.reconnect_backoff_max_ms,
        roster.clone(),
        config.include_extended_hours,
    );
    let firehose_handle = tokio::spawn(async move { firehose.run().await });

    let (aggregator_cmd_tx, aggregator_cmd_rx) = mpsc::channel::<String>(100);
    let aggregator = AggregatorUpstream::new(
        config.ms_aggregator_url.clone(),
        config.reconnect_backoff_max_ms,
        roster.clone(),
        config.include_extended_hours,
        aggregator_cmd_rx,
        aggregator_subs.clone(),
    );
    let aggregator_handle = tokio::spawn(async move { aggregator.run().await });

    let metrics_for_log = metrics.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let snapshot = metrics_for_log.snapshot();
            info!(?snapshot, "metrics snapshot");
        }
    });

    let client_handler =
        ClientHandler::new(&config, roster.clone(), aggregator_subs.clone(), aggregator_cmd_tx, metrics.clone());
    let client_handle = tokio::spawn(async move {
        if let Err(e) = client_handler.run().await {
            tracing::error!(error = %e, "client handler error");
        }
    });

    tokio::select! {
        result = firehose_handle => { result??; }
        result = aggregator_handle => { result??; }
        _ = client_handle => {}
    }

    Ok(())
}
