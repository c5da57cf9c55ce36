use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use polygon_wire::{DropReason, Metrics};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info};
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
    retry: StdMutex<RetryState>,
}

/// Fans every upstream frame out to every connected client verbatim. No
/// filtering happens here — that is the filtered proxy's job. A client
/// whose queue is still full after `queue_deadline` is dropped outright
/// (socket closed, session destroyed); the upstream is never slowed for a
/// slow downstream. Dropping just removes the client's sender from the
/// broadcast map, which alone does not interrupt a reader task blocked
/// waiting on the client's socket — `abort` forcibly tears down that task
/// (and its socket) so "dropped" actually closes the connection rather
/// than merely muting it.
pub struct Broadcaster {
    clients: Arc<Mutex<HashMap<ClientId, ClientEntry>>>,
    metrics: Arc<Metrics>,
    queue_deadline: Duration,
}

impl Broadcaster {
    pub fn new(metrics: Arc<Metrics>, queue_deadline_ms: u64) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            queue_deadline: Duration::from_millis(queue_deadline_ms),
        }
    }

    pub async fn add_client(&self, client_id: ClientId, tx: mpsc::Sender<String>, abort: AbortHandle) {
        let mut clients = self.clients.lock().await;
        clients.insert(client_id, ClientEntry { tx, abort, retry: StdMutex::new(RetryState::Idle) });
        self.metrics.client_connected();
        info!(client_id = %client_id, total = clients.len(), "client added to broadcast list");
    }

    pub async fn remove_client(&self, client_id: ClientId) {
        let mut clients = self.clients.lock().await;
        if clients.remove(&client_id).is_some() {
            self.metrics.client_disconnected();
        }
        info!(client_id = %client_id, remaining = clients.len(), "client removed from broadcast list");
    }

    /// Broadcast one upstream frame. The fast path is `try_send`; a client
    /// whose queue is already full gets one more `queue_deadline`-bounded
    /// chance (on its own task, so a single slow client never stalls the
    /// broadcast to everyone else) before being dropped. A client already
    /// being retried has this and every subsequent frame appended to its
    /// retry queue rather than raced through `try_send`, so delivery order
    /// to that client is preserved.
    pub async fn broadcast(&self, message: String) {
        let clients = self.clients.lock().await;
        if clients.is_empty() {
            return;
        }

        debug!(client_count = clients.len(), "broadcasting frame");

        let mut to_spawn: Vec<ClientId> = Vec::new();
        for (client_id, entry) in clients.iter() {
            let mut retry = entry.retry.lock().unwrap();
            match &mut *retry {
                RetryState::Retrying(queue) => {
                    queue.push_back(message.clone());
                }
                RetryState::Idle => {
                    if entry.tx.try_send(message.clone()).is_err() {
                        let mut queue = VecDeque::new();
                        queue.push_back(message.clone());
                        *retry = RetryState::Retrying(queue);
                        to_spawn.push(*client_id);
                    }
                }
            }
        }
        drop(clients);

        for client_id in to_spawn {
            let deadline = self.queue_deadline;
            let metrics = self.metrics.clone();
            let clients = self.clients.clone();
            tokio::spawn(async move { Self::drain_retry(clients, metrics, client_id, deadline).await });
        }
    }

    /// Drains one client's retry queue in order, one `send_timeout` at a
    /// time, until it is empty (returning the client to the fast path) or a
    /// send misses its deadline (the client is dropped outright).
    async fn drain_retry(
        clients: Arc<Mutex<HashMap<ClientId, ClientEntry>>>,
        metrics: Arc<Metrics>,
        client_id: ClientId,
        deadline: Duration,
    ) {
        loop {
            let (next, tx) = {
                let guard = clients.lock().await;
                let Some(entry) = guard.get(&client_id) else { return };
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
            let Some(msg) = next else { return };

            match tx.send_timeout(msg, deadline).await {
                Ok(()) => continue,
                Err(_) => {
                    metrics.record_drop(DropReason::SlowConsumer);
                    let mut guard = clients.lock().await;
                    if let Some(entry) = guard.remove(&client_id) {
                        entry.abort.abort();
                        metrics.client_disconnected();
                    }
                    debug!(client_id = %client_id, "slow consumer dropped past deadline");
                    return;
                }
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}
