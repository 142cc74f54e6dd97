//! Peer Transport Pool - one negotiated transport per remote participant
//!
//! - `PeerTransport` / `TransportFactory`: the seam to the media stack
//! - `PeerTransportPool`: offer/answer/candidate choreography, reconnection
//! - `WebRtcTransportFactory`: production transports on the `webrtc` crate

mod backoff;
mod pool;
#[cfg(test)]
pub(crate) mod testing;
mod rtc;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::{MediaKind, ParticipantId, SessionId};

pub use backoff::ReconnectPolicy;
pub use pool::{LocalDescription, PeerTransportPool, PoolEnvelope, PoolNotice, PoolOutput, Role};
pub use rtc::WebRtcTransportFactory;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Transport setup failed: {0}")]
    Setup(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// What a live transport reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered (JSON `RTCIceCandidateInit`)
    LocalCandidate(String),
    Connected,
    Disconnected,
    Failed(String),
}

/// Where a transport posts its events. Tagged so stale events from a
/// replaced or torn-down transport can be recognised and dropped.
#[derive(Clone)]
pub struct TransportEventSink {
    session_id: SessionId,
    participant_id: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<PoolEnvelope>,
}

impl TransportEventSink {
    pub(crate) fn new(
        session_id: SessionId,
        participant_id: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<PoolEnvelope>,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            generation,
            tx,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let envelope = PoolEnvelope {
            session_id: self.session_id,
            notice: PoolNotice::Transport {
                participant_id: self.participant_id.clone(),
                generation: self.generation,
                event,
            },
        };
        // The session is gone when the receiver is closed.
        let _ = self.tx.send(envelope);
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// One negotiated media path to one remote participant.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates and applies a local offer; `ice_restart` on reconnection.
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError>;

    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError>;

    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        media: MediaKind,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
