//! Signaling - call-control messages between participants
//!
//! - Message envelope and body types
//! - `SignalingChannel` seam with an in-process relay
//! - WebSocket client for the relay server
//! - Duplicate suppression

mod channel;
mod client;
mod dedup;
mod messages;

pub use channel::{MemoryRelay, RelayEndpoint, SignalingChannel, SignalingError};
pub use client::SignalingClient;
pub use dedup::SeenMessages;
pub use messages::*;
