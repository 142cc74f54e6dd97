//! Signaling channel seam
//!
//! The session manager only needs a non-blocking, addressed `send`; inbound
//! messages are pushed into the manager's queue by whoever owns the
//! connection. [`MemoryRelay`] is an in-process relay with the same
//! at-most-once semantics as the WebSocket server.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::SignalingMessage;
use crate::session::ParticipantId;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Signaling server did not answer in time")]
    Timeout,

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Outbound half of the signaling path.
pub trait SignalingChannel: Send + Sync {
    /// Hands one message to the relay. Never blocks; delivery is not
    /// guaranteed once this returns `Ok`.
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;

    /// Id this endpoint is registered under.
    fn local_id(&self) -> &str;
}

// ============================================================================
// IN-PROCESS RELAY
// ============================================================================

/// In-process stand-in for the relay server.
///
/// Each registered user gets an inbox; sends to unknown or departed users
/// are dropped and logged. Every send attempt is kept in the history.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

#[derive(Default)]
struct RelayInner {
    inboxes: Mutex<HashMap<ParticipantId, mpsc::Sender<SignalingMessage>>>,
    history: Mutex<Vec<SignalingMessage>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `user_id` and returns its outbound endpoint plus inbox.
    pub fn endpoint(
        &self,
        user_id: impl Into<ParticipantId>,
    ) -> (RelayEndpoint, mpsc::Receiver<SignalingMessage>) {
        let user_id = user_id.into();
        let (tx, rx) = mpsc::channel(256);
        self.inner.inboxes.lock().insert(user_id.clone(), tx);
        (
            RelayEndpoint {
                user_id,
                relay: self.clone(),
            },
            rx,
        )
    }

    pub fn disconnect(&self, user_id: &str) {
        self.inner.inboxes.lock().remove(user_id);
    }

    /// Every message handed to the relay, delivered or not.
    pub fn history(&self) -> Vec<SignalingMessage> {
        self.inner.history.lock().clone()
    }

    fn route(&self, message: SignalingMessage) {
        self.inner.history.lock().push(message.clone());

        let inbox = self.inner.inboxes.lock().get(&message.target_id).cloned();
        match inbox {
            Some(tx) => {
                if let Err(e) = tx.try_send(message) {
                    tracing::warn!("Relay dropped message: {}", e);
                }
            }
            None => {
                tracing::debug!(
                    target_id = %message.target_id,
                    kind = ?message.kind(),
                    "Relay has no recipient, message dropped"
                );
            }
        }
    }
}

/// Outbound endpoint for one user on a [`MemoryRelay`].
#[derive(Clone)]
pub struct RelayEndpoint {
    user_id: ParticipantId,
    relay: MemoryRelay,
}

impl SignalingChannel for RelayEndpoint {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.relay.inner.inboxes.lock().contains_key(&self.user_id) {
            return Err(SignalingError::NotConnected);
        }
        self.relay.route(message);
        Ok(())
    }

    fn local_id(&self) -> &str {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionId;
    use crate::signaling::SignalBody;

    #[tokio::test]
    async fn test_relay_delivers_to_registered_user() {
        let relay = MemoryRelay::new();
        let (alice, _alice_rx) = relay.endpoint("alice");
        let (_bob, mut bob_rx) = relay.endpoint("bob");

        let msg = SignalingMessage::new(SessionId::new(), "alice", "bob", SignalBody::Accept);
        alice.send(msg.clone()).unwrap();

        assert_eq!(bob_rx.recv().await.unwrap(), msg);
        assert_eq!(relay.history().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped_but_recorded() {
        let relay = MemoryRelay::new();
        let (alice, _rx) = relay.endpoint("alice");

        let msg = SignalingMessage::new(SessionId::new(), "alice", "nobody", SignalBody::Accept);
        assert!(alice.send(msg).is_ok());
        assert_eq!(relay.history().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_sender_cannot_send() {
        let relay = MemoryRelay::new();
        let (alice, _rx) = relay.endpoint("alice");
        relay.disconnect("alice");

        let msg = SignalingMessage::new(SessionId::new(), "alice", "bob", SignalBody::Accept);
        assert!(matches!(alice.send(msg), Err(SignalingError::NotConnected)));
        assert!(relay.history().is_empty());
    }
}
