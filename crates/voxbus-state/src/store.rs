//! Key-addressed state store.
//!
//! One slot per registered key, created up front. Each slot has its own lock,
//! so compare-and-set on one key never waits on another.

use std::collections::BTreeMap;

use tokio::sync::Mutex;
use tracing::warn;

use voxbus_core::{StateChange, StateEntry, StateKey};

/// The stored state of one key.
#[derive(Debug, Default)]
pub struct Slot {
    current: Option<StateChange>,
}

impl Slot {
    /// The live entry, if the key is set.
    pub fn entry(&self) -> Option<&StateEntry> {
        self.current.as_ref().and_then(StateChange::entry)
    }

    /// Highest version this key has reached; 0 if it never changed.
    pub fn version(&self) -> u64 {
        self.current.as_ref().map_or(0, StateChange::version)
    }

    /// The last change applied to this key, including clears.
    pub fn change(&self) -> Option<&StateChange> {
        self.current.as_ref()
    }

    /// Record a change. Stale or duplicate versions are refused.
    pub fn record(&mut self, change: StateChange) -> bool {
        if change.version() <= self.version() {
            return false;
        }
        self.current = Some(change);
        true
    }
}

pub struct StateStore {
    slots: BTreeMap<StateKey, Mutex<Slot>>,
}

impl StateStore {
    pub fn new(keys: impl IntoIterator<Item = StateKey>) -> Self {
        Self {
            slots: keys.into_iter().map(|k| (k, Mutex::new(Slot::default()))).collect(),
        }
    }

    /// Run `f` with exclusive access to the key's slot.
    ///
    /// Returns `None` when the key has no slot.
    pub async fn update<R>(&self, key: &StateKey, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let slot = self.slots.get(key)?;
        let mut guard = slot.lock().await;
        Some(f(&mut guard))
    }

    pub async fn get(&self, key: &StateKey) -> Option<StateEntry> {
        let slot = self.slots.get(key)?;
        slot.lock().await.entry().cloned()
    }

    /// Latest change for a key, including a clear.
    pub async fn current(&self, key: &StateKey) -> Option<StateChange> {
        let slot = self.slots.get(key)?;
        slot.lock().await.change().cloned()
    }

    /// Latest change of every key that has one, ordered by key.
    pub async fn snapshot(&self) -> Vec<StateChange> {
        let mut changes = Vec::new();
        for slot in self.slots.values() {
            if let Some(change) = slot.lock().await.change() {
                changes.push(change.clone());
            }
        }
        changes
    }

    /// Load previously persisted changes. Returns how many were applied.
    pub async fn restore(&self, changes: Vec<StateChange>) -> usize {
        let mut applied = 0;
        for change in changes {
            let Some(slot) = self.slots.get(change.key()) else {
                warn!(key = %change.key(), "Dropping restored state for unregistered key");
                continue;
            };
            if slot.lock().await.record(change) {
                applied += 1;
            }
        }
        applied
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StateKey> {
        self.slots.keys()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
