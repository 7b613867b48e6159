//! Operator communications for roombad.
//!
//! Two WebSocket surfaces: the bidirectional control session (JSON
//! commands in, ack strings out, safety-arbitrated) and the one-way
//! telemetry stream.

pub mod broadcast;
pub mod safety;
pub mod session;

pub use broadcast::{BroadcastConfig, Broadcaster, Telemetry, TelemetryServer};
pub use safety::{arbitrate_drive, Arbitrated};
pub use session::{SessionConfig, SessionServer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TeleopError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
