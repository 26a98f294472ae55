use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Write priority. Higher wins.
pub type Priority = i64;

/// Name of a conversational state slot (e.g. `ai_speaking`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StateKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Declared identity of a collaborator process.
///
/// The set is closed: rule files naming anything else fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Gui,
    Terminal,
    Web,
    Stt,
    Tts,
    Llm,
    ListeningController,
    System,
}

impl SourceId {
    pub const ALL: [SourceId; 8] = [
        SourceId::Gui,
        SourceId::Terminal,
        SourceId::Web,
        SourceId::Stt,
        SourceId::Tts,
        SourceId::Llm,
        SourceId::ListeningController,
        SourceId::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Gui => "gui",
            SourceId::Terminal => "terminal",
            SourceId::Web => "web",
            SourceId::Stt => "stt",
            SourceId::Tts => "tts",
            SourceId::Llm => "llm",
            SourceId::ListeningController => "listening_controller",
            SourceId::System => "system",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a source name outside the known collaborator set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .into_iter()
            .find(|src| src.as_str() == s)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// A candidate write submitted by a collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub key: StateKey,
    pub value: serde_json::Value,
    pub source: SourceId,
    pub priority: Priority,
    /// Client-side time of the write. The bus stamps arrival time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Proposal {
    pub fn new(
        key: impl Into<StateKey>,
        value: impl Into<serde_json::Value>,
        source: SourceId,
        priority: Priority,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source,
            priority,
            timestamp: None,
        }
    }

    /// Pin the proposal to an explicit timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// The latest accepted write for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub key: StateKey,
    pub value: serde_json::Value,
    pub source: SourceId,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

/// A transition fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    Updated { entry: StateEntry },
    /// The key's entry was removed. Consumes a version like an update does.
    Cleared {
        key: StateKey,
        source: SourceId,
        timestamp: DateTime<Utc>,
        version: u64,
    },
}

impl StateChange {
    pub fn key(&self) -> &StateKey {
        match self {
            StateChange::Updated { entry } => &entry.key,
            StateChange::Cleared { key, .. } => key,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            StateChange::Updated { entry } => entry.version,
            StateChange::Cleared { version, .. } => *version,
        }
    }

    pub fn entry(&self) -> Option<&StateEntry> {
        match self {
            StateChange::Updated { entry } => Some(entry),
            StateChange::Cleared { .. } => None,
        }
    }
}

/// Why a proposal was turned down. These are expected outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    UnknownKey,
    Unauthorized,
    PriorityTooLow,
    ValueNotAllowed,
    Superseded,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UnknownKey => "unknown_key",
            Rejection::Unauthorized => "unauthorized",
            Rejection::PriorityTooLow => "priority_too_low",
            Rejection::ValueNotAllowed => "value_not_allowed",
            Rejection::Superseded => "superseded",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of arbitrating one proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Decision {
    Accepted { entry: StateEntry },
    Rejected { reason: Rejection },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }

    pub fn entry(&self) -> Option<&StateEntry> {
        match self {
            Decision::Accepted { entry } => Some(entry),
            Decision::Rejected { .. } => None,
        }
    }

    pub fn version(&self) -> Option<u64> {
        self.entry().map(|e| e.version)
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Decision::Accepted { .. } => None,
            Decision::Rejected { reason } => Some(*reason),
        }
    }
}

/// Outcome of clearing a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClearOutcome {
    /// The entry was removed under this version.
    Cleared { version: u64 },
    /// Nothing was stored for the key.
    NotSet,
    Rejected { reason: Rejection },
}
