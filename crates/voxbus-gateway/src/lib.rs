//! WebSocket gateway exposing the state bus to out-of-process components.
//!
//! Clients propose, read, clear, and subscribe to state keys over JSON
//! frames on `/ws`. Plain HTTP serves `/health` and `/state`.

pub mod connection;
pub mod events;
pub mod methods;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{serve, start_gateway};
pub use state::GatewayState;
