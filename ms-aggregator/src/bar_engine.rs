use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use polygon_wire::{Bar, Metrics};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarKey {
    pub symbol: String,
    pub interval_ms: u64,
}

/// The bar currently being accumulated for a key, before it closes and
/// becomes an immutable `Bar`.
#[derive(Debug, Clone)]
struct BarBuilder {
    start_ts: i64,
    end_ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: u64,
}

impl BarBuilder {
    fn open_at(bucket: i64, interval_ms: u64, price: f64, size: f64) -> Self {
        BarBuilder {
            start_ts: bucket,
            end_ts: bucket + interval_ms as i64,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
            trade_count: 1,
        }
    }

    fn accumulate(&mut self, price: f64, size: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
        self.trade_count += 1;
    }

    fn finalize(&self, symbol: &str, interval_ms: u64) -> Bar {
        Bar::new(
            interval_ms,
            symbol,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.trade_count,
            self.start_ts,
            self.end_ts,
        )
    }
}

/// Per-`(symbol, interval)` state: the bar being built (if any) and a
/// time-ordered ring buffer of already-closed bars, trimmed by age.
struct KeyState {
    current: Option<BarBuilder>,
    ring: VecDeque<Bar>,
}

impl KeyState {
    fn new() -> Self {
        KeyState {
            current: None,
            ring: VecDeque::new(),
        }
    }

    fn push_closed(&mut self, bar: Bar, max_age_ms: i64, now_ms: i64) {
        self.ring.push_back(bar);
        while let Some(front) = self.ring.front() {
            if now_ms - front.end_timestamp > max_age_ms {
                self.ring.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Owns all per-key bar state. One writer per key in practice (the trade
/// ingestion task), many readers (client replay on subscribe) — each
/// key's state sits behind its own short-held lock rather than one global
/// mutex, so replay on one symbol never blocks aggregation on another.
pub struct BarEngine {
    keys: DashMap<BarKey, Mutex<KeyState>>,
    replay_window_ms: i64,
    metrics: Arc<Metrics>,
}

impl BarEngine {
    pub fn new(replay_window_seconds: u64, metrics: Arc<Metrics>) -> Self {
        BarEngine {
            keys: DashMap::new(),
            replay_window_ms: (replay_window_seconds * 1000) as i64,
            metrics,
        }
    }

    /// Feed one trade into the bar for `(symbol, interval_ms)`. Returns the
    /// bar that closed as a result, if any (either because this trade
    /// rolled the window forward, or — never from this path — a timer
    /// close). NaN/non-finite inputs and trades that predate the currently
    /// open bar are discarded as aggregation anomalies.
    pub async fn ingest_trade(
        &self,
        symbol: &str,
        interval_ms: u64,
        ts: i64,
        price: f64,
        size: f64,
    ) -> Option<Bar> {
        if !price.is_finite() || !size.is_finite() || price < 0.0 || size < 0.0 {
            warn!(symbol, interval_ms, "discarding trade with non-finite price/size");
            self.metrics.record_aggregation_anomaly();
            return None;
        }

        let key = BarKey {
            symbol: symbol.to_string(),
            interval_ms,
        };
        let entry = self.keys.entry(key).or_insert_with(|| Mutex::new(KeyState::new()));
        let mut state = entry.value().lock().await;

        let bucket = (ts / interval_ms as i64) * interval_ms as i64;

        match &mut state.current {
            None => {
                state.current = Some(BarBuilder::open_at(bucket, interval_ms, price, size));
                None
            }
            Some(builder) if ts < builder.start_ts => {
                debug!(symbol, interval_ms, ts, "discarding out-of-order trade");
                self.metrics.record_aggregation_anomaly();
                None
            }
            Some(builder) if bucket == builder.start_ts => {
                builder.accumulate(price, size);
                None
            }
            Some(builder) => {
                let closed = builder.finalize(symbol, interval_ms);
                let now = now_ms();
                state.push_closed(closed.clone(), self.replay_window_ms, now);
                state.current = Some(BarBuilder::open_at(bucket, interval_ms, price, size));
                Some(closed)
            }
        }
    }

    /// Sweep every key and close any bar whose window has elapsed with no
    /// new trade. Returns the bars that closed this sweep.
    pub async fn close_idle_bars(&self, now_ms_value: i64) -> Vec<(BarKey, Bar)> {
        let mut closed = Vec::new();
        for entry in self.keys.iter() {
            let key = entry.key().clone();
            let mut state = entry.value().lock().await;
            let should_close = matches!(&state.current, Some(b) if now_ms_value > b.end_ts);
            if should_close {
                if let Some(builder) = state.current.take() {
                    let bar = builder.finalize(&key.symbol, key.interval_ms);
                    state.push_closed(bar.clone(), self.replay_window_ms, now_ms_value);
                    closed.push((key, bar));
                }
            }
        }
        closed
    }

    /// All ring-buffered bars for `key` with `end_ts >= since`, in
    /// ascending order, plus the in-progress bar's close-so-far is never
    /// included — replay only ever returns *closed* bars.
    pub async fn replay_since(&self, key: &BarKey, since: i64) -> Vec<Bar> {
        match self.keys.get(key) {
            None => Vec::new(),
            Some(entry) => {
                let state = entry.lock().await;
                state
                    .ring
                    .iter()
                    .filter(|b| b.end_timestamp >= since)
                    .cloned()
                    .collect()
            }
        }
    }

    /// All known symbols currently tracked for `interval_ms` — used to
    /// replay a wildcard-symbol subscription across every symbol that has
    /// seen activity.
    pub fn symbols_for_interval(&self, interval_ms: u64) -> Vec<String> {
        self.keys
            .iter()
            .filter(|entry| entry.key().interval_ms == interval_ms)
            .map(|entry| entry.key().symbol.clone())
            .collect()
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accumulates_trades_within_one_bucket() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        assert!(engine.ingest_trade("TSLA", 500, 0, 10.0, 5.0).await.is_none());
        assert!(engine.ingest_trade("TSLA", 500, 200, 11.0, 3.0).await.is_none());
        let closed = engine.ingest_trade("TSLA", 500, 600, 12.0, 2.0).await.unwrap();
        assert_eq!(closed.open, 10.0);
        assert_eq!(closed.high, 11.0);
        assert_eq!(closed.low, 10.0);
        assert_eq!(closed.close, 11.0);
        assert_eq!(closed.volume, 8.0);
        assert_eq!(closed.trade_count, 2);
        assert_eq!(closed.start_timestamp, 0);
        assert_eq!(closed.end_timestamp, 500);
    }

    #[tokio::test]
    async fn matches_spec_walkthrough_exactly() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        engine.ingest_trade("TSLA", 500, 1_700_000_000_000, 10.0, 5.0).await;
        engine.ingest_trade("TSLA", 500, 1_700_000_000_200, 11.0, 3.0).await;
        let first = engine.ingest_trade("TSLA", 500, 1_700_000_000_600, 12.0, 2.0).await.unwrap();
        assert_eq!(first.start_timestamp, 1_700_000_000_000);
        assert_eq!(first.end_timestamp, 1_700_000_000_500);
        assert_eq!(first.open, 10.0);
        assert_eq!(first.high, 11.0);
        assert_eq!(first.low, 10.0);
        assert_eq!(first.close, 11.0);
        assert_eq!(first.volume, 8.0);
        assert_eq!(first.trade_count, 2);
    }

    #[tokio::test]
    async fn trade_on_boundary_belongs_to_next_bar() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        engine.ingest_trade("TSLA", 500, 0, 10.0, 1.0).await;
        // ts == end_ts of the first bucket: belongs to the next bar, not this one.
        let closed = engine.ingest_trade("TSLA", 500, 500, 20.0, 1.0).await.unwrap();
        assert_eq!(closed.start_timestamp, 0);
        assert_eq!(closed.end_timestamp, 500);
        assert_eq!(closed.close, 10.0);
    }

    #[tokio::test]
    async fn discards_out_of_order_trade() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        engine.ingest_trade("TSLA", 500, 1000, 10.0, 1.0).await;
        // predates the bucket start of the currently open bar
        assert!(engine.ingest_trade("TSLA", 500, 500, 99.0, 1.0).await.is_none());
    }

    #[tokio::test]
    async fn discards_non_finite_price() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        assert!(engine.ingest_trade("TSLA", 500, 0, f64::NAN, 1.0).await.is_none());
        assert!(engine.symbols_for_interval(500).is_empty());
    }

    #[tokio::test]
    async fn discarded_trades_count_as_aggregation_anomalies() {
        let metrics = Arc::new(Metrics::new());
        let engine = BarEngine::new(300, metrics.clone());

        engine.ingest_trade("TSLA", 500, 0, f64::NAN, 1.0).await;
        engine.ingest_trade("TSLA", 500, 1000, 10.0, 1.0).await;
        engine.ingest_trade("TSLA", 500, 500, 99.0, 1.0).await;

        assert_eq!(metrics.snapshot().aggregation_anomalies, 2);
    }

    #[tokio::test]
    async fn replay_filters_by_since_and_stays_ordered() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        engine.ingest_trade("TSLA", 500, 0, 10.0, 1.0).await;
        engine.ingest_trade("TSLA", 500, 500, 11.0, 1.0).await;
        engine.ingest_trade("TSLA", 500, 1000, 12.0, 1.0).await;

        let key = BarKey { symbol: "TSLA".to_string(), interval_ms: 500 };
        let bars = engine.replay_since(&key, 500).await;
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].start_timestamp, 0);
        assert_eq!(bars[0].end_timestamp, 500);
    }

    #[tokio::test]
    async fn idle_timer_closes_stale_bar() {
        let engine = BarEngine::new(300, Arc::new(Metrics::new()));
        engine.ingest_trade("TSLA", 500, 0, 10.0, 1.0).await;
        let closed = engine.close_idle_bars(600).await;
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1.end_timestamp, 500);
    }
}
