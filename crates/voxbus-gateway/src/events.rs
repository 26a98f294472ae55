//! Pushing state changes to a connection.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use voxbus_core::StateChange;
use voxbus_core::protocol::{BusFrame, StateChangedEvent, events};
use voxbus_state::Subscription;

/// Serialize a `state.changed` event frame.
pub fn change_frame(subscription_id: &str, change: StateChange, seq: u64) -> Option<String> {
    let payload = StateChangedEvent {
        subscription_id: subscription_id.to_string(),
        change,
    };
    let frame = BusFrame::event(events::STATE_CHANGED, serde_json::to_value(&payload).ok(), Some(seq));
    match serde_json::to_string(&frame) {
        Ok(m) => Some(m),
        Err(e) => {
            error!(%e, "Failed to serialize event");
            None
        }
    }
}

/// Forward a subscription's changes to a connection's outbound queue.
///
/// Waits while the queue is full; the subscription lags meanwhile and
/// catches up from the store. Ends when the connection's queue is closed
/// or the bus goes away.
pub fn forward_subscription(
    mut sub: Subscription,
    event_tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = sub.id().to_string();
        let mut seq = 0u64;
        while let Some(change) = sub.recv().await {
            seq += 1;
            let Some(msg) = change_frame(&id, change, seq) else {
                continue;
            };
            if event_tx.send(msg).await.is_err() {
                break;
            }
        }
        debug!(subscription = %id, delivered = seq, "Subscription forwarder ended");
    })
}
