//! Client connections for turn-based AI game servers.
//!
//! This crate provides the transport-independent half of a connection:
//! - `Client` - identity, RPC dispatch, exactly-once teardown
//! - `Transport` - the capability a wire transport implements
//! - Wire protocol types (`SentEvent`, `Outbound`, `Fatal`)
//! - Compute-budget timing and the `Player` it charges
//! - `Config`

pub mod client;
pub mod config;
pub mod player;
pub mod protocol;
pub mod timing;
pub mod transport;

pub use client::{Client, ClientError, ClientEvents, ClientInfo, HandOff, Lifecycle};
pub use config::Config;
pub use player::{Player, TimeBudget};
pub use protocol::{Outbound, Payload, SentEvent};
pub use transport::{Transport, TransportError};
