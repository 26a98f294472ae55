//! The in-process state bus: rules, store, arbitration, and fan-out wired together.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use voxbus_core::{
    ClearOutcome, Decision, Proposal, Rejection, RuleRegistry, SourceId, StateChange, StateEntry,
    StateKey,
};

use crate::arbitration::evaluate;
use crate::notifier::{ChangeNotifier, Subscription};
use crate::pattern::{KeyPattern, PatternError};
use crate::store::StateStore;

pub struct StateBus {
    registry: Arc<RuleRegistry>,
    store: Arc<StateStore>,
    notifier: ChangeNotifier,
    /// Identifies the version lineage. Versions are only comparable
    /// between changes of the same epoch.
    epoch: RwLock<Uuid>,
}

impl StateBus {
    /// Build a bus over an immutable rule set. One slot is created per rule.
    pub fn new(registry: RuleRegistry, channel_capacity: usize) -> Self {
        let store = StateStore::new(registry.keys().cloned());
        Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
            notifier: ChangeNotifier::new(channel_capacity),
            epoch: RwLock::new(Uuid::new_v4()),
        }
    }

    pub fn epoch(&self) -> Uuid {
        *self.epoch.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Continue a lineage restored from disk.
    pub(crate) fn adopt_epoch(&self, epoch: Uuid) {
        *self.epoch.write().unwrap_or_else(PoisonError::into_inner) = epoch;
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Arbitrate a proposal and, if accepted, store and publish it.
    ///
    /// Evaluation, write, and publish all happen under the key's lock.
    pub async fn propose(&self, proposal: Proposal) -> Decision {
        let policy = self.registry.policy_for(&proposal.key);

        let decision = self
            .store
            .update(&proposal.key, |slot| {
                // Stamped under the lock so arrival order matches lock order.
                let arrival = Utc::now();
                let decision = evaluate(&proposal, policy, slot.entry(), slot.version(), arrival);
                if let Decision::Accepted { entry } = &decision {
                    slot.record(StateChange::Updated {
                        entry: entry.clone(),
                    });
                    self.notifier.publish(StateChange::Updated {
                        entry: entry.clone(),
                    });
                }
                decision
            })
            .await
            .unwrap_or(Decision::Rejected {
                reason: Rejection::UnknownKey,
            });

        match &decision {
            Decision::Accepted { entry } => info!(
                key = %entry.key,
                source = %entry.source,
                priority = entry.priority,
                version = entry.version,
                "State accepted"
            ),
            Decision::Rejected { reason } => debug!(
                key = %proposal.key,
                source = %proposal.source,
                priority = proposal.priority,
                %reason,
                "State rejected"
            ),
        }

        decision
    }

    /// Current entry for a key, if set.
    pub async fn get(&self, key: &StateKey) -> Option<StateEntry> {
        self.store.get(key).await
    }

    /// Remove a key's entry, dropping whatever priority it held.
    ///
    /// Allowed for the key's writers and for `system`. The clear consumes a
    /// version so subscribers can order it against updates.
    pub async fn clear(&self, key: &StateKey, source: SourceId) -> ClearOutcome {
        let Some(policy) = self.registry.policy_for(key) else {
            return ClearOutcome::Rejected {
                reason: Rejection::UnknownKey,
            };
        };
        if source != SourceId::System && !policy.allows(source) {
            return ClearOutcome::Rejected {
                reason: Rejection::Unauthorized,
            };
        }

        let outcome = self
            .store
            .update(key, |slot| {
                if slot.entry().is_none() {
                    return ClearOutcome::NotSet;
                }
                let change = StateChange::Cleared {
                    key: key.clone(),
                    source,
                    timestamp: Utc::now(),
                    version: slot.version() + 1,
                };
                let version = change.version();
                slot.record(change.clone());
                self.notifier.publish(change);
                ClearOutcome::Cleared { version }
            })
            .await
            .unwrap_or(ClearOutcome::Rejected {
                reason: Rejection::UnknownKey,
            });

        if let ClearOutcome::Cleared { version } = &outcome {
            info!(key = %key, source = %source, version, "State cleared");
        }
        outcome
    }

    /// All currently set entries, ordered by key.
    pub async fn snapshot(&self) -> Vec<StateEntry> {
        self.store
            .snapshot()
            .await
            .into_iter()
            .filter_map(|change| match change {
                StateChange::Updated { entry } => Some(entry),
                StateChange::Cleared { .. } => None,
            })
            .collect()
    }

    /// Subscribe to changes for keys matching `pattern`.
    pub async fn subscribe(&self, pattern: &str, replay: bool) -> Result<Subscription, PatternError> {
        let pattern = KeyPattern::parse(pattern)?;
        let sub = Subscription::open(pattern, &self.notifier, self.store.clone(), replay).await;
        debug!(subscription = %sub.id(), pattern = %sub.pattern(), replay, "Subscription opened");
        Ok(sub)
    }
}
