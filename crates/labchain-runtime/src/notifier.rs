use crate::recent::RecentMap;
use labchain_types::{BizCode, BlockchainTransaction, Notification, TxHash};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

const BUFFER_CAPACITY: usize = 4096;
const BUFFER_TTL: Duration = Duration::from_secs(30 * 60);
const DELIVERED_CAPACITY: usize = 16384;
const DELIVERED_TTL: Duration = Duration::from_secs(6 * 60 * 60);

struct NotifierState {
    listeners: HashMap<TxHash, oneshot::Sender<Notification>>,
    buffered: RecentMap<Notification>,
    delivered: RecentMap<()>,
}

/// Hands each transaction's terminal result to whoever is waiting on it.
///
/// A payload pushed before anyone registers is buffered and handed to the
/// first listener for that hash. Each hash is delivered at most once while
/// it is remembered; unclaimed payloads and delivery marks age out.
pub struct NotifierHub {
    state: Mutex<NotifierState>,
}

impl Default for NotifierHub {
    fn default() -> Self {
        Self::with_limits(BUFFER_CAPACITY, BUFFER_TTL, DELIVERED_CAPACITY, DELIVERED_TTL)
    }
}

impl NotifierHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(
        buffer_capacity: usize,
        buffer_ttl: Duration,
        delivered_capacity: usize,
        delivered_ttl: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(NotifierState {
                listeners: HashMap::new(),
                buffered: RecentMap::new(buffer_capacity, buffer_ttl),
                delivered: RecentMap::new(delivered_capacity, delivered_ttl),
            }),
        }
    }

    pub async fn register(&self, tx_hash: &str) -> oneshot::Receiver<Notification> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        if state.delivered.contains(tx_hash) {
            // Already delivered: the receiver resolves to a closed channel.
            return rx;
        }
        match state.buffered.remove(tx_hash) {
            Some(notification) => {
                if tx.send(notification).is_ok() {
                    state.delivered.insert(tx_hash, ());
                }
            }
            None => {
                state.listeners.retain(|_, listener| !listener.is_closed());
                state.listeners.insert(tx_hash.to_string(), tx);
            }
        }
        rx
    }

    pub async fn push_tx_result(&self, tx_hash: &str, data: Option<BlockchainTransaction>) {
        self.deliver(tx_hash, Notification::success(data)).await;
    }

    pub async fn push_error(&self, tx_hash: &str, code: BizCode) {
        self.deliver(tx_hash, Notification::error(code)).await;
    }

    async fn deliver(&self, tx_hash: &str, notification: Notification) {
        let mut state = self.state.lock().await;
        if state.delivered.contains(tx_hash) || state.buffered.contains(tx_hash) {
            debug!(tx_hash, code = ?notification.code, "Dropping repeat notification");
            return;
        }

        let notification = match state.listeners.remove(tx_hash) {
            Some(listener) => match listener.send(notification) {
                Ok(()) => {
                    state.delivered.insert(tx_hash, ());
                    debug!(tx_hash, "🔔 Notified listener");
                    return;
                }
                // Listener went away; keep the payload for the next one.
                Err(notification) => notification,
            },
            None => notification,
        };
        state.buffered.insert(tx_hash, notification);
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.buffered.len()
    }

    /// Hashes remembered as already delivered.
    pub async fn delivered_count(&self) -> usize {
        self.state.lock().await.delivered.len()
    }
}
