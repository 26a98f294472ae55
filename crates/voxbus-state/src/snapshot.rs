//! On-disk snapshot of the store so versions survive a bus restart.
//!
//! Writes are debounced: the first change after a save opens a window, and
//! the store is written once when the window closes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use voxbus_core::StateChange;
use voxbus_core::error::{Result, VoxbusError};

use crate::bus::StateBus;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDoc {
    format: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    epoch: Option<Uuid>,
    changes: Vec<StateChange>,
}

/// JSON snapshot file holding the latest change per key.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty snapshot.
    pub async fn load(&self) -> Result<Vec<StateChange>> {
        Ok(self.read().await?.map(|doc| doc.changes).unwrap_or_default())
    }

    async fn read(&self) -> Result<Option<SnapshotDoc>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.path).await?;
        let doc: SnapshotDoc = serde_json::from_str(&data)?;
        if doc.format != FORMAT_VERSION {
            return Err(VoxbusError::Snapshot(format!(
                "Unsupported snapshot format {} in {}",
                doc.format,
                self.path.display()
            )));
        }
        Ok(Some(doc))
    }

    /// Write the changes of the bus lineage `epoch`.
    pub async fn save(&self, epoch: Uuid, changes: Vec<StateChange>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let doc = SnapshotDoc {
            format: FORMAT_VERSION,
            saved_at: Utc::now(),
            epoch: Some(epoch),
            changes,
        };
        let data = serde_json::to_string_pretty(&doc)?;
        // Atomic write: write to temp then rename
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Load the snapshot into the bus. Returns how many keys were restored.
///
/// The bus takes over the snapshot's epoch, so clients see restored
/// versions as a continuation of what they already saw.
pub async fn restore(bus: &StateBus, file: &SnapshotFile) -> Result<usize> {
    let Some(doc) = file.read().await? else {
        info!(path = %file.path().display(), "No state snapshot to restore");
        return Ok(0);
    };
    if let Some(epoch) = doc.epoch {
        bus.adopt_epoch(epoch);
    }
    let applied = bus.store().restore(doc.changes).await;
    info!(path = %file.path().display(), applied, "Restored state snapshot");
    Ok(applied)
}

/// Persist the store whenever it changes, until `cancel` fires.
///
/// A final write is made on cancellation if changes are pending.
pub fn spawn_writer(
    bus: Arc<StateBus>,
    file: SnapshotFile,
    debounce: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = match bus.subscribe("*", false).await {
            Ok(sub) => sub,
            Err(e) => {
                error!(%e, "Snapshot writer could not subscribe");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = sub.recv() => if next.is_none() { break },
            }

            let deadline = Instant::now() + debounce;
            let mut stop = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = cancel.cancelled() => { stop = true; break }
                    next = sub.recv() => if next.is_none() { stop = true; break },
                }
            }

            write(&bus, &file).await;
            if stop {
                return;
            }
        }
        debug!("Snapshot writer stopped");
    })
}

async fn write(bus: &StateBus, file: &SnapshotFile) {
    let changes = bus.store().snapshot().await;
    let count = changes.len();
    match file.save(bus.epoch(), changes).await {
        Ok(()) => debug!(path = %file.path().display(), count, "Saved state snapshot"),
        Err(e) => error!(path = %file.path().display(), %e, "Failed to save state snapshot"),
    }
}
