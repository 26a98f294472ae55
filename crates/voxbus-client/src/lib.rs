//! Client facade for the voxbus state bus.
//!
//! Components talk to the bus through [`BusClient`]. [`LocalClient`] calls an
//! in-process [`voxbus_state::StateBus`] directly; [`RemoteClient`] speaks the
//! gateway's WebSocket protocol and survives reconnects.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use voxbus_core::{ClearOutcome, Decision, Proposal, SourceId, StateChange, StateEntry, StateKey};

pub mod error;
pub mod local;
pub mod remote;

pub use error::ClientError;
pub use local::LocalClient;
pub use remote::{RemoteClient, RemoteOptions};

/// Live feed of changes. Ends only when the client shuts down.
pub type ChangeStream = Pin<Box<dyn Stream<Item = StateChange> + Send>>;

/// Transport-agnostic access to the state bus.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Submit a proposal. Rejections are returned as `Ok(Decision::Rejected)`.
    async fn propose(&self, proposal: Proposal) -> Result<Decision, ClientError>;

    async fn get(&self, key: &StateKey) -> Result<Option<StateEntry>, ClientError>;

    async fn clear(&self, key: &StateKey, source: SourceId) -> Result<ClearOutcome, ClientError>;

    async fn snapshot(&self) -> Result<Vec<StateEntry>, ClientError>;

    /// Watch keys matching a glob pattern. With `replay`, the current state of
    /// every matching key is delivered first. Dropping the stream unsubscribes.
    async fn subscribe(&self, pattern: &str, replay: bool) -> Result<ChangeStream, ClientError>;
}
