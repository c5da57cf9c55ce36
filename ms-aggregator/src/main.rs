use std::sync::Arc;

use anyhow::Result;
use ms_aggregator::bar_engine::BarEngine;
use ms_aggregator::client_handler::ClientHandler;
use ms_aggregator::config::Config;
use ms_aggregator::subscription_manager::SubscriptionManager;
use ms_aggregator::upstream::UpstreamConnection;
use polygon_wire::Metrics;
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
        port = config.aggregator_port,
        min_interval_ms = config.min_interval_ms,
        max_interval_ms = config.max_interval_ms,
        "starting millisecond-bar aggregator"
    );

    let metrics = Arc::new(Metrics::new());
    let engine = Arc::new(BarEngine::new(config.replay_window_seconds, metrics.clone()));
    let subscriptions = Arc::new(SubscriptionManager::with_queue_deadline(
        engine.clone(),
        metrics.clone(),
        config.client_queue_deadline_ms,
    ));

    let upstream = UpstreamConnection::new(
        config.clone(),
        engine.clone(),
        subscriptions.clone(),
        metrics.clone(),
    );
    let upstream_handle = tokio::spawn(async move { upstream.run().await });

    // Closes bars whose window has elapsed with no new trade — the only
    // source of bar closes other than the next incoming trade rolling the
    // bucket forward.
    let engine_for_timer = engine.clone();
    let subscriptions_for_timer = subscriptions.clone();
    let timer_interval_ms = config.timer_interval_ms;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(timer_interval_ms));
        loop {
            ticker.tick().await;
            let now = ms_aggregator::bar_engine::now_ms();
            for (key, bar) in engine_for_timer.close_idle_bars(now).await {
                subscriptions_for_timer.dispatch_bar(&key, &bar).await;
            }
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

    let client_handler = ClientHandler::new(&config, subscriptions.clone(), metrics.clone());
    let client_handle = tokio::spawn(async move {
        if let Err(e) = client_handler.run().await {
            tracing::error!(error = %e, "client handler error");
        }
    });

    tokio::select! {
        result = upstream_handle => { result??; }
        _ = client_handle => {}
    }

    Ok(())
}
