use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use polygon_wire::{Bar, DropReason, Metrics};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bar_engine::{BarEngine, BarKey};

pub type ClientId = Uuid;

/// One subscribed `(interval, symbol-or-wildcard)` entry for a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BarSelector {
    Symbol { interval_ms: u64, symbol: String },
    Wildcard { interval_ms: u64 },
}

/// `Idle` means the fast `try_send` path is in effect. `Retrying` means a
/// background task already owns sending to this client in order; any bar
/// that arrives while a client is `Retrying` is appended to the queue
/// instead of using `try_send`, so a later bar can never overtake one still
/// waiting on its retry.
enum RetryState {
    Idle,
    Retrying(VecDeque<String>),
}

struct ClientSender {
    tx: mpsc::Sender<String>,
    abort: AbortHandle,
    retry: StdMutex<RetryState>,
}

/// Tracks which clients want which `(interval, symbol)` bars, refcounts
/// interval-level activity so the trade loop knows which intervals to
/// bother bucketing at all, and dispatches closed bars to the clients
/// whose subscription matches.
pub struct SubscriptionManager {
    engine: Arc<BarEngine>,
    metrics: Arc<Metrics>,
    queue_deadline: Duration,
    client_subs: DashMap<ClientId, HashSet<BarSelector>>,
    client_senders: Arc<DashMap<ClientId, ClientSender>>,
    /// clients subscribed to an exact (symbol, interval)
    symbol_subscribers: DashMap<BarKey, HashSet<ClientId>>,
    /// clients subscribed to `<N>Ms.*`
    wildcard_subscribers: DashMap<u64, HashSet<ClientId>>,
}

impl SubscriptionManager {
    pub fn new(engine: Arc<BarEngine>, metrics: Arc<Metrics>) -> Self {
        Self::with_queue_deadline(engine, metrics, 1_000)
    }

    pub fn with_queue_deadline(engine: Arc<BarEngine>, metrics: Arc<Metrics>, queue_deadline_ms: u64) -> Self {
        SubscriptionManager {
            engine,
            metrics,
            queue_deadline: Duration::from_millis(queue_deadline_ms),
            client_subs: DashMap::new(),
            client_senders: Arc::new(DashMap::new()),
            symbol_subscribers: DashMap::new(),
            wildcard_subscribers: DashMap::new(),
        }
    }

    pub fn register_client(&self, client_id: ClientId, sender: mpsc::Sender<String>, abort: AbortHandle) {
        self.client_senders.insert(
            client_id,
            ClientSender { tx: sender, abort, retry: StdMutex::new(RetryState::Idle) },
        );
        self.client_subs.insert(client_id, HashSet::new());
        self.metrics.client_connected();
    }

    pub fn remove_client(&self, client_id: ClientId) {
        if let Some((_, subs)) = self.client_subs.remove(&client_id) {
            for sel in subs {
                self.unindex(client_id, &sel);
            }
        }
        self.client_senders.remove(&client_id);
        self.metrics.client_disconnected();
    }

    /// Every interval with at least one active subscriber — this is the
    /// set the trade loop buckets incoming trades against.
    pub fn active_intervals(&self) -> Vec<u64> {
        let mut intervals: HashSet<u64> = self
            .symbol_subscribers
            .iter()
            .map(|entry| entry.key().interval_ms)
            .collect();
        intervals.extend(self.wildcard_subscribers.iter().map(|entry| *entry.key()));
        intervals.into_iter().collect()
    }

    /// Subscribe `client_id` to `selectors`; returns the replay bars to
    /// send immediately, keyed in subscribe order, each already sorted
    /// ascending by `end_ts`.
    pub async fn subscribe(
        &self,
        client_id: ClientId,
        selectors: &[BarSelector],
        since: Option<i64>,
    ) -> Vec<Bar> {
        let mut replay = Vec::new();

        for sel in selectors {
            let is_new = self
                .client_subs
                .get_mut(&client_id)
                .map(|mut subs| subs.insert(sel.clone()))
                .unwrap_or(false);
            if !is_new {
                continue;
            }
            self.index(client_id, sel);
            self.metrics.subscription_added();

            if let Some(since_ts) = since {
                replay.extend(self.replay_for_selector(sel, since_ts).await);
            }
        }

        replay
    }

    pub fn unsubscribe(&self, client_id: ClientId, selectors: &[BarSelector]) {
        if let Some(mut subs) = self.client_subs.get_mut(&client_id) {
            for sel in selectors {
                if subs.remove(sel) {
                    self.unindex(client_id, sel);
                    self.metrics.subscription_removed();
                }
            }
        }
    }

    /// Dispatch a just-closed bar to every client whose subscription set
    /// matches it (exact symbol or `<N>Ms.*`), each receiving it exactly
    /// once even if both selectors would otherwise match. A client whose
    /// queue is still full after `queue_deadline` is dropped outright —
    /// removed and its reader task aborted — rather than left to silently
    /// miss bars forever. A client already being retried has this and every
    /// subsequent bar appended to its retry queue rather than raced through
    /// `try_send`, so delivery order to that client is preserved.
    pub async fn dispatch_bar(&self, key: &BarKey, bar: &Bar) {
        let mut targets: HashSet<ClientId> = HashSet::new();
        if let Some(subs) = self.symbol_subscribers.get(key) {
            targets.extend(subs.iter().copied());
        }
        if let Some(subs) = self.wildcard_subscribers.get(&key.interval_ms) {
            targets.extend(subs.iter().copied());
        }
        if targets.is_empty() {
            return;
        }

        let payload = serde_json::to_string(&[bar]).unwrap_or_else(|_| "[]".to_string());
        let mut to_spawn: Vec<ClientId> = Vec::new();
        for client_id in targets {
            if let Some(entry) = self.client_senders.get(&client_id) {
                let mut retry = entry.retry.lock().unwrap();
                match &mut *retry {
                    RetryState::Retrying(queue) => {
                        queue.push_back(payload.clone());
                    }
                    RetryState::Idle => {
                        if entry.tx.try_send(payload.clone()).is_err() {
                            let mut queue = VecDeque::new();
                            queue.push_back(payload.clone());
                            *retry = RetryState::Retrying(queue);
                            to_spawn.push(client_id);
                        }
                    }
                }
            }
        }
        info!(symbol = %key.symbol, interval_ms = key.interval_ms, "bar dispatched");

        for client_id in to_spawn {
            let deadline = self.queue_deadline;
            let metrics = self.metrics.clone();
            let client_senders = self.client_senders.clone();
            tokio::spawn(async move {
                Self::drain_retry(client_senders, metrics, client_id, deadline).await
            });
        }
    }

    /// Drains one client's retry queue in order, one `send_timeout` at a
    /// time, until it is empty (returning the client to the fast path) or a
    /// send misses its deadline (the client is dropped outright).
    async fn drain_retry(
        client_senders: Arc<DashMap<ClientId, ClientSender>>,
        metrics: Arc<Metrics>,
        client_id: ClientId,
        deadline: Duration,
    ) {
        loop {
            let (next, tx) = {
                let Some(entry) = client_senders.get(&client_id) else { return };
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
                    if let Some((_, entry)) = client_senders.remove(&client_id) {
                        entry.abort.abort();
                        metrics.client_disconnected();
                    }
                    debug!(client_id = %client_id, "slow consumer dropped past deadline");
                    return;
                }
            }
        }
    }

    async fn replay_for_selector(&self, sel: &BarSelector, since: i64) -> Vec<Bar> {
        match sel {
            BarSelector::Symbol { interval_ms, symbol } => {
                let key = BarKey { symbol: symbol.clone(), interval_ms: *interval_ms };
                self.engine.replay_since(&key, since).await
            }
            BarSelector::Wildcard { interval_ms } => {
                let mut bars = Vec::new();
                for symbol in self.engine.symbols_for_interval(*interval_ms) {
                    let key = BarKey { symbol, interval_ms: *interval_ms };
                    bars.extend(self.engine.replay_since(&key, since).await);
                }
                bars.sort_by_key(|b| b.end_timestamp);
                bars
            }
        }
    }

    fn index(&self, client_id: ClientId, sel: &BarSelector) {
        match sel {
            BarSelector::Symbol { interval_ms, symbol } => {
                let key = BarKey { symbol: symbol.clone(), interval_ms: *interval_ms };
                self.symbol_subscribers.entry(key).or_default().insert(client_id);
            }
            BarSelector::Wildcard { interval_ms } => {
                self.wildcard_subscribers.entry(*interval_ms).or_default().insert(client_id);
            }
        }
    }

    fn unindex(&self, client_id: ClientId, sel: &BarSelector) {
        match sel {
            BarSelector::Symbol { interval_ms, symbol } => {
                let key = BarKey { symbol: symbol.clone(), interval_ms: *interval_ms };
                if let Some(mut set) = self.symbol_subscribers.get_mut(&key) {
                    set.remove(&client_id);
                }
            }
            BarSelector::Wildcard { interval_ms } => {
                if let Some(mut set) = self.wildcard_subscribers.get_mut(interval_ms) {
                    set.remove(&client_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SubscriptionManager {
        let metrics = Arc::new(Metrics::new());
        SubscriptionManager::new(Arc::new(BarEngine::new(300, metrics.clone())), metrics)
    }

    #[tokio::test]
    async fn subscribe_activates_interval() {
        let mgr = manager();
        let client = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(10);
        let task = tokio::spawn(async {});
        mgr.register_client(client, tx, task.abort_handle());

        mgr.subscribe(
            client,
            &[BarSelector::Symbol { interval_ms: 500, symbol: "TSLA".to_string() }],
            None,
        )
        .await;

        assert_eq!(mgr.active_intervals(), vec![500]);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let mgr = manager();
        let client = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(10);
        let task = tokio::spawn(async {});
        mgr.register_client(client, tx, task.abort_handle());

        let sel = BarSelector::Symbol { interval_ms: 500, symbol: "TSLA".to_string() };
        mgr.subscribe(client, &[sel.clone()], None).await;
        mgr.subscribe(client, &[sel], None).await;

        assert_eq!(mgr.client_subs.get(&client).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_from_index() {
        let mgr = manager();
        let client = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(10);
        let task = tokio::spawn(async {});
        mgr.register_client(client, tx, task.abort_handle());

        let sel = BarSelector::Symbol { interval_ms: 500, symbol: "TSLA".to_string() };
        mgr.subscribe(client, &[sel.clone()], None).await;
        mgr.unsubscribe(client, &[sel]);

        assert!(mgr.active_intervals().is_empty());
    }

    #[tokio::test]
    async fn remove_client_clears_all_subscriptions() {
        let mgr = manager();
        let client = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(10);
        let task = tokio::spawn(async {});
        mgr.register_client(client, tx, task.abort_handle());
        mgr.subscribe(
            client,
            &[BarSelector::Wildcard { interval_ms: 250 }],
            None,
        )
        .await;

        mgr.remove_client(client);
        assert!(mgr.active_intervals().is_empty());
    }
}
