//! Change fan-out to live subscriptions.
//!
//! Built on a bounded `tokio::sync::broadcast` channel. Changes for one key are
//! published under that key's lock, so they enter the channel in version order.
//! A subscriber that falls behind the channel resyncs from the store; the
//! per-key cursor drops anything it has already seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use voxbus_core::{StateChange, StateKey};

use crate::pattern::KeyPattern;
use crate::store::StateStore;

pub struct ChangeNotifier {
    sender: broadcast::Sender<StateChange>,
    published: AtomicU64,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
        }
    }

    /// Publish a change. Returns the number of receivers it reached.
    pub fn publish(&self, change: StateChange) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let key = change.key().clone();
        let version = change.version();
        match self.sender.send(change) {
            Ok(receivers) => {
                debug!(key = %key, version, receivers, "Published state change");
                receivers
            }
            // No live subscriptions; the store already holds the change.
            Err(_) => 0,
        }
    }

    pub fn receiver(&self) -> broadcast::Receiver<StateChange> {
        self.sender.subscribe()
    }

    /// Total changes published since startup.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live feed of changes for keys matching a pattern.
///
/// Dropping it releases the underlying receiver immediately.
pub struct Subscription {
    id: String,
    pattern: KeyPattern,
    receiver: broadcast::Receiver<StateChange>,
    store: Arc<StateStore>,
    cursor: HashMap<StateKey, u64>,
    pending: VecDeque<StateChange>,
}

impl Subscription {
    /// Open a subscription. The receiver is taken before the replay snapshot
    /// is read so nothing published in between is lost.
    pub(crate) async fn open(
        pattern: KeyPattern,
        notifier: &ChangeNotifier,
        store: Arc<StateStore>,
        replay: bool,
    ) -> Self {
        let receiver = notifier.receiver();
        let mut sub = Self {
            id: Uuid::new_v4().to_string(),
            pattern,
            receiver,
            store,
            cursor: HashMap::new(),
            pending: VecDeque::new(),
        };
        if replay {
            sub.load_current().await;
        }
        sub
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    /// Last version delivered for a key.
    pub fn cursor(&self, key: &StateKey) -> Option<u64> {
        self.cursor.get(key).copied()
    }

    /// Next change for a matching key, in per-key version order.
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<StateChange> {
        loop {
            if let Some(change) = self.pending.pop_front() {
                if self.admit(&change) {
                    return Some(change);
                }
                continue;
            }

            match self.receiver.recv().await {
                Ok(change) => {
                    if self.pattern.matches(change.key()) && self.admit(&change) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(subscription = %self.id, missed, "Subscriber lagged, resyncing from store");
                    self.load_current().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a `Stream` of changes.
    pub fn into_stream(self) -> impl Stream<Item = StateChange> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|change| (change, sub))
        })
    }

    fn admit(&mut self, change: &StateChange) -> bool {
        let last = self.cursor.entry(change.key().clone()).or_insert(0);
        if change.version() > *last {
            *last = change.version();
            true
        } else {
            false
        }
    }

    async fn load_current(&mut self) {
        for change in self.store.snapshot().await {
            if self.pattern.matches(change.key()) {
                self.pending.push_back(change);
            }
        }
    }
}
