//! In-process client over a shared [`StateBus`].

use std::sync::Arc;

use async_trait::async_trait;

use voxbus_core::{ClearOutcome, Decision, Proposal, SourceId, StateEntry, StateKey};
use voxbus_state::StateBus;

use crate::{BusClient, ChangeStream, ClientError};

#[derive(Clone)]
pub struct LocalClient {
    bus: Arc<StateBus>,
}

impl LocalClient {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<StateBus> {
        &self.bus
    }
}

#[async_trait]
impl BusClient for LocalClient {
    async fn propose(&self, proposal: Proposal) -> Result<Decision, ClientError> {
        Ok(self.bus.propose(proposal).await)
    }

    async fn get(&self, key: &StateKey) -> Result<Option<StateEntry>, ClientError> {
        Ok(self.bus.get(key).await)
    }

    async fn clear(&self, key: &StateKey, source: SourceId) -> Result<ClearOutcome, ClientError> {
        Ok(self.bus.clear(key, source).await)
    }

    async fn snapshot(&self) -> Result<Vec<StateEntry>, ClientError> {
        Ok(self.bus.snapshot().await)
    }

    async fn subscribe(&self, pattern: &str, replay: bool) -> Result<ChangeStream, ClientError> {
        let sub = self.bus.subscribe(pattern, replay).await?;
        Ok(Box::pin(sub.into_stream()))
    }
}
