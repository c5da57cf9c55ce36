use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use dashmap::DashMap;
use polygon_wire::{is_regular_session, Channel, DropReason, Metrics, PolygonMessage, Selector};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

pub type ClientId = Uuid;

/// `Idle` means the fast `try_send` path is in effect. `Retrying` means a
/// background task already owns sending to this client in order; any frame
/// that arrives while a client is `Retrying` is appended to the queue
/// instead of using `try_send`, so a later frame can never overtake one
/// still waiting on its retry.
enum RetryState {
    Idle,
    Retrying(VecDeque<String>),
}

struct ClientEntry {
    tx: mpsc::Sender<String>,
    abort: AbortHandle,
    selectors: StdMutex<HashSet<Selector>>,
    retry: StdMutex<RetryState>,
}

/// The client-facing half of the proxy: a read-mostly registry of connected
/// sessions plus their subscription sets, and the per-frame fan-out pass
/// over it. Per-client subscription sets are expected small (1-10), so
/// dispatch walks the whole roster rather than maintaining a symbol index —
/// cheaper at the client counts this proxy expects (a few hundred) and
/// avoids a second structure that would need to stay in sync with the
/// roster on every add/remove.
pub struct ClientRoster {
    clients: Arc<DashMap<ClientId, ClientEntry>>,
    metrics: Arc<Metrics>,
    queue_deadline: Duration,
}

impl ClientRoster {
    pub fn new(metrics: Arc<Metrics>, queue_deadline_ms: u64) -> Self {
        ClientRoster {
            clients: Arc::new(DashMap::new()),
            metrics,
            queue_deadline: Duration::from_millis(queue_deadline_ms),
        }
    }

    pub fn register(&self, client_id: ClientId, tx: mpsc::Sender<String>, abort: AbortHandle) {
        self.clients.insert(
            client_id,
            ClientEntry {
                tx,
                abort,
                selectors: StdMutex::new(HashSet::new()),
                retry: StdMutex::new(RetryState::Idle),
            },
        );
        self.metrics.client_connected();
    }

    pub fn remove(&self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            self.metrics.client_disconnected();
        }
    }

    /// Add selectors to a client's set; returns only the ones that were not
    /// already present (the caller uses this to decide which selectors need
    /// an upstream subscription refcount bump).
    pub fn add_selectors(&self, client_id: ClientId, selectors: &[Selector]) -> Vec<Selector> {
        let Some(entry) = self.clients.get(&client_id) else { return Vec::new() };
        let mut set = entry.selectors.lock().unwrap();
        let mut added = Vec::new();
        for sel in selectors {
            if set.insert(sel.clone()) {
                added.push(sel.clone());
            }
        }
        added
    }

    /// Remove selectors from a client's set; returns the ones actually
    /// held (mirrors `add_selectors`, for refcount decrements).
    pub fn remove_selectors(&self, client_id: ClientId, selectors: &[Selector]) -> Vec<Selector> {
        let Some(entry) = self.clients.get(&client_id) else { return Vec::new() };
        let mut set = entry.selectors.lock().unwrap();
        let mut removed = Vec::new();
        for sel in selectors {
            if set.remove(sel) {
                removed.push(sel.clone());
            }
        }
        removed
    }

    pub fn selectors_of(&self, client_id: ClientId) -> Vec<Selector> {
        self.clients
            .get(&client_id)
            .map(|entry| entry.selectors.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Decode one upstream frame once, drop any message outside regular
    /// hours when extended-hours are excluded, then walk the roster and
    /// deliver each client the subset of inner messages it subscribes to —
    /// each message delivered to a given client at most once even if more
    /// than one of its selectors matches.
    pub async fn dispatch_frame(&self, text: &str, include_extended_hours: bool) {
        let messages: Vec<PolygonMessage> = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(_) => match serde_json::from_str::<PolygonMessage>(text) {
                Ok(single) => vec![single],
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable upstream frame");
                    return;
                }
            },
        };

        let mut candidates: Vec<(Channel, String, &PolygonMessage)> = Vec::new();
        for message in &messages {
            let (Some(channel), Some(symbol)) = (message.channel(), message.symbol()) else {
                continue;
            };
            if !include_extended_hours {
                if let Some(ts) = message.timestamp_ms() {
                    if !is_regular_session(ts) {
                        continue;
                    }
                }
            }
            candidates.push((channel, symbol.to_string(), message));
        }
        if candidates.is_empty() {
            return;
        }

        let mut to_spawn: Vec<ClientId> = Vec::new();
        for entry in self.clients.iter() {
            let client_id = *entry.key();
            let matched: Vec<&PolygonMessage> = {
                let selectors = entry.selectors.lock().unwrap();
                if selectors.is_empty() {
                    continue;
                }
                candidates
                    .iter()
                    .filter(|(channel, symbol, _)| {
                        selectors.iter().any(|s| s.matches(*channel, symbol))
                    })
                    .map(|(_, _, m)| *m)
                    .collect()
            };
            if matched.is_empty() {
                continue;
            }

            let payload = serde_json::to_string(&matched).unwrap_or_else(|_| "[]".to_string());
            let mut retry = entry.retry.lock().unwrap();
            match &mut *retry {
                RetryState::Retrying(queue) => {
                    queue.push_back(payload);
                }
                RetryState::Idle => {
                    if entry.tx.try_send(payload.clone()).is_err() {
                        let mut queue = VecDeque::new();
                        queue.push_back(payload);
                        *retry = RetryState::Retrying(queue);
                        to_spawn.push(client_id);
                    }
                }
            }
        }

        for client_id in to_spawn {
            self.spawn_slow_retry(client_id);
        }
    }

    /// Drains one client's retry queue in order, one `send_timeout` at a
    /// time, until it is empty (returning the client to the fast path) or a
    /// send misses its deadline (the client is dropped outright). A later
    /// frame can never overtake an earlier one still queued for the same
    /// client, since every caller of `dispatch_frame` appends to this same
    /// queue while the client is `Retrying` rather than racing `try_send`.
    fn spawn_slow_retry(&self, client_id: ClientId) {
        let deadline = self.queue_deadline;
        let metrics = self.metrics.clone();
        let clients = self.clients.clone();
        tokio::spawn(async move {
            loop {
                let (next, tx) = {
                    let Some(entry) = clients.get(&client_id) else { return };
                    let mut retry = entry.retry.lock().unwrap();
                    let RetryState::Retrying(queue) = &mut *retry else { return };
                    match queue.pop_front() {
                        Some(msg) => (Some(msg), entry.tx.clone()),
                        None => {
                            *retry = RetryState::Idle;
                            (None, entry.tx.clone())
                        }
                    }
                };
                let Some(payload) = next else { return };

                match tx.send_timeout(payload, deadline).await {
                    Ok(()) => continue,
                    Err(_) => {
                        metrics.record_drop(DropReason::SlowConsumer);
                        if let Some((_, entry)) = clients.remove(&client_id) {
                            entry.abort.abort();
                            metrics.client_disconnected();
                        }
                        debug!(client_id = %client_id, "slow consumer dropped past deadline");
                        return;
                    }
                }
            }
        });
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(roster: &ClientRoster, capacity: usize) -> (ClientId, mpsc::Receiver<String>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(capacity);
        let task = tokio::spawn(async {});
        roster.register(client_id, tx, task.abort_handle());
        (client_id, rx)
    }

    fn trade_frame(symbol: &str, ts: i64) -> String {
        format!(r#"[{{"ev":"T","sym":"{symbol}","p":10.0,"s":1.0,"t":{ts}}}]"#)
    }

    #[tokio::test]
    async fn exact_selector_receives_matching_symbol_only() {
        let roster = ClientRoster::new(Arc::new(Metrics::new()), 1_000);
        let (client_id, mut rx) = register(&roster, 10);
        roster.add_selectors(client_id, &[Selector::parse("T.TSLA").unwrap()]);

        roster.dispatch_frame(&trade_frame("AAPL", 1_700_000_000_000), true).await;
        roster.dispatch_frame(&trade_frame("TSLA", 1_700_000_000_000), true).await;

        let received = rx.try_recv().unwrap();
        assert!(received.contains("TSLA"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_selector_receives_every_symbol() {
        let roster = ClientRoster::new(Arc::new(Metrics::new()), 1_000);
        let (client_id, mut rx) = register(&roster, 10);
        roster.add_selectors(client_id, &[Selector::parse("*").unwrap()]);

        roster.dispatch_frame(&trade_frame("GOOGL", 1_700_000_000_000), true).await;
        let received = rx.try_recv().unwrap();
        assert!(received.contains("GOOGL"));
    }

    #[tokio::test]
    async fn message_delivered_once_even_with_overlapping_selectors() {
        let roster = ClientRoster::new(Arc::new(Metrics::new()), 1_000);
        let (client_id, mut rx) = register(&roster, 10);
        roster.add_selectors(
            client_id,
            &[Selector::parse("T.TSLA").unwrap(), Selector::parse("T.*").unwrap()],
        );

        roster.dispatch_frame(&trade_frame("TSLA", 1_700_000_000_000), true).await;
        let received = rx.try_recv().unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&received).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn extended_hours_exclusion_drops_out_of_session_messages() {
        let roster = ClientRoster::new(Arc::new(Metrics::new()), 1_000);
        let (client_id, mut rx) = register(&roster, 10);
        roster.add_selectors(client_id, &[Selector::parse("*").unwrap()]);

        // midnight UTC: outside the 14:30-21:00 regular session
        roster.dispatch_frame(&trade_frame("TSLA", 0), false).await;
        assert!(rx.try_recv().is_err());

        // 15:00 UTC: inside the regular session
        let in_session_ts = 15 * 3600 * 1000;
        roster.dispatch_frame(&trade_frame("TSLA", in_session_ts), false).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_past_deadline() {
        let roster = ClientRoster::new(Arc::new(Metrics::new()), 50);
        let (client_id, rx) = register(&roster, 1);
        roster.add_selectors(client_id, &[Selector::parse("*").unwrap()]);

        // fill the one-slot queue, then never drain it
        roster.dispatch_frame(&trade_frame("TSLA", 1_700_000_000_000), true).await;
        roster.dispatch_frame(&trade_frame("TSLA", 1_700_000_000_100), true).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(roster.client_count(), 0);
        drop(rx);
    }
}
