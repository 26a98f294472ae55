//! Rule registry: per-key write policies, fixed for the process lifetime.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;

use crate::config::RuleConfig;
use crate::types::{Priority, SourceId, StateKey};

/// Malformed rule configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("Rule with empty key name")]
    EmptyKey,

    #[error("Duplicate rule for key '{0}'")]
    DuplicateKey(String),

    #[error("Rule '{0}' has no allowed_sources")]
    EmptySources(String),

    #[error("Rule '{key}' has negative min_priority {min_priority}")]
    NegativePriority { key: String, min_priority: Priority },
}

/// Authorization policy attached to a single key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    allowed_sources: BTreeSet<SourceId>,
    min_priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_if: Option<serde_json::Value>,
}

impl Policy {
    pub fn new(allowed_sources: impl IntoIterator<Item = SourceId>, min_priority: Priority) -> Self {
        Self {
            allowed_sources: allowed_sources.into_iter().collect(),
            min_priority,
            allow_if: None,
        }
    }

    /// Only accept writes whose value matches `expected`.
    pub fn with_allow_if(mut self, expected: serde_json::Value) -> Self {
        self.allow_if = Some(expected);
        self
    }

    pub fn allowed_sources(&self) -> &BTreeSet<SourceId> {
        &self.allowed_sources
    }

    pub fn min_priority(&self) -> Priority {
        self.min_priority
    }

    pub fn allow_if(&self) -> Option<&serde_json::Value> {
        self.allow_if.as_ref()
    }

    pub fn allows(&self, source: SourceId) -> bool {
        self.allowed_sources.contains(&source)
    }

    /// Check the `allow_if` guard. Values compare by their text form,
    /// case-insensitively, so `true` matches `"True"`.
    pub fn permits_value(&self, value: &serde_json::Value) -> bool {
        match &self.allow_if {
            None => true,
            Some(expected) => value_text(value).eq_ignore_ascii_case(&value_text(expected)),
        }
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Immutable mapping from key to policy.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    policies: BTreeMap<StateKey, Policy>,
}

impl RuleRegistry {
    /// Build a registry from config entries, rejecting malformed rule sets.
    pub fn from_rules(rules: &[RuleConfig]) -> Result<Self, RuleError> {
        let mut policies = BTreeMap::new();

        for rule in rules {
            let name = rule.key.trim();
            if name.is_empty() {
                return Err(RuleError::EmptyKey);
            }
            if rule.allowed_sources.is_empty() {
                return Err(RuleError::EmptySources(name.to_string()));
            }
            if rule.min_priority < 0 {
                return Err(RuleError::NegativePriority {
                    key: name.to_string(),
                    min_priority: rule.min_priority,
                });
            }

            let mut policy = Policy::new(rule.allowed_sources.iter().copied(), rule.min_priority);
            if let Some(expected) = &rule.allow_if {
                policy = policy.with_allow_if(expected.clone());
            }

            if policies.insert(StateKey::new(name), policy).is_some() {
                return Err(RuleError::DuplicateKey(name.to_string()));
            }
        }

        Ok(Self { policies })
    }

    pub fn policy_for(&self, key: &StateKey) -> Option<&Policy> {
        self.policies.get(key)
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.policies.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StateKey> {
        self.policies.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &Policy)> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
