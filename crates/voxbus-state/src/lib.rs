//! Priority-gated state store with per-key arbitration and change fan-out.
//!
//! [`StateBus`] is the in-process core: every proposal is checked against the
//! key's [`Policy`](voxbus_core::Policy), compared with the stored entry, and
//! on acceptance written and published to matching [`Subscription`]s.

pub mod arbitration;
pub mod bus;
pub mod notifier;
pub mod pattern;
pub mod snapshot;
pub mod store;

pub use bus::StateBus;
pub use notifier::{ChangeNotifier, Subscription};
pub use pattern::{KeyPattern, PatternError};
pub use snapshot::SnapshotFile;
pub use store::StateStore;
