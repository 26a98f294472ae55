//! Core types, rules, config, errors, and wire protocol for voxbus.

pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod types;

pub use registry::{Policy, RuleError, RuleRegistry};
pub use types::{
    ClearOutcome, Decision, Priority, Proposal, Rejection, SourceId, StateChange, StateEntry,
    StateKey,
};
