//! Signaling message types
//!
//! One envelope type for every call-control message; the body is a tagged
//! union so each message kind carries exactly the fields it needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::session::{CallKind, MediaKind, ParticipantId, SessionId};

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An addressed, immutable call-control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    /// Participant id, or the conference (session) id for conference-wide messages
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: SignalBody,
}

impl SignalingMessage {
    pub fn new(
        session_id: SessionId,
        sender_id: impl Into<ParticipantId>,
        target_id: impl Into<String>,
        body: SignalBody,
    ) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

// ============================================================================
// BODY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalBody {
    Invite(InvitePayload),
    Accept,
    Reject { reason: RejectReason },
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    Bye { reason: Option<ByeReason> },
}

impl SignalBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalBody::Invite(_) => MessageKind::Invite,
            SignalBody::Accept => MessageKind::Accept,
            SignalBody::Reject { .. } => MessageKind::Reject,
            SignalBody::Offer { .. } => MessageKind::Offer,
            SignalBody::Answer { .. } => MessageKind::Answer,
            SignalBody::Candidate { .. } => MessageKind::Candidate,
            SignalBody::Bye { .. } => MessageKind::Bye,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub call_type: MediaKind,
    pub kind: CallKind,
    pub caller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Declined,
    Busy,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByeReason {
    Hangup,
    Timeout,
    Failed,
}

/// Discriminant of [`SignalBody`], handy for logging and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Invite,
    Accept,
    Reject,
    Offer,
    Answer,
    Candidate,
    Bye,
}

// ============================================================================
// TESTS
// ============================================================================
