//! Session data model
//!
//! Plain data owned by the session actor. Snapshots of these types are
//! handed to observers; the live resources (local stream handle, peer
//! transports) stay inside the actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::CallError;
use crate::media::LocalStreamInfo;

/// Identity of a portal user taking part in calls.
pub type ParticipantId = String;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Identifies one call or conference across both ends of the signaling path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// CALL KIND / MEDIA
// ============================================================================

/// Direct (1:1) call or multi-party conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Direct,
    Conference,
}

/// What the call carries. Serialized as `callType` in invites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn has_video(self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Which side created the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle of a session.
///
/// Transitions only move forward (see [`CallState::rank`]); `Ended` is
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No session exists
    Idle,
    /// Invite(s) sent, waiting for an answer
    Outgoing,
    /// Invite received, not yet shown
    Incoming,
    /// Invite shown to the user
    Ringing,
    /// Accepted, transports negotiating
    Connecting,
    /// At least one transport is up
    Connected,
    /// Terminal
    Ended,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            CallState::Idle => 0,
            CallState::Outgoing | CallState::Incoming => 1,
            CallState::Ringing => 2,
            CallState::Connecting => 3,
            CallState::Connected => 4,
            CallState::Ended => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    /// Waiting for the local user to answer.
    pub fn is_awaiting_answer(self) -> bool {
        matches!(self, CallState::Incoming | CallState::Ringing)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == CallState::Ended {
            return true;
        }
        next.rank() > self.rank()
    }
}

// ============================================================================
// END REASONS
// ============================================================================

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    LocalHangup,
    LocalRejected,
    RemoteHangup,
    RemoteRejected,
    RemoteBusy,
    RemoteUnreachable,
    PeerConnectionFailed,
    AllParticipantsLeft,
    Missed,
}

/// Coarse classification shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Declined,
    Failed,
}

impl EndReason {
    pub fn outcome(self) -> CallOutcome {
        match self {
            EndReason::LocalHangup
            | EndReason::RemoteHangup
            | EndReason::AllParticipantsLeft => CallOutcome::Completed,
            EndReason::LocalRejected
            | EndReason::RemoteRejected
            | EndReason::RemoteBusy
            | EndReason::Missed => CallOutcome::Declined,
            EndReason::RemoteUnreachable | EndReason::PeerConnectionFailed => CallOutcome::Failed,
        }
    }

    /// The error a caller sees when a session ends for this reason.
    pub fn as_error(self) -> Option<CallError> {
        match self {
            EndReason::RemoteRejected => Some(CallError::RemoteRejected),
            EndReason::RemoteBusy => Some(CallError::RemoteBusy),
            EndReason::RemoteUnreachable => Some(CallError::RemoteUnreachable),
            EndReason::PeerConnectionFailed => Some(CallError::PeerConnectionFailed),
            _ => None,
        }
    }
}

// ============================================================================
// PARTICIPANTS
// ============================================================================

/// Who is on this side of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// A resolved identity to invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitee {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl Invitee {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar: None,
        }
    }
}

/// Where a participant's leg stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegStatus {
    Invited,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub muted: bool,
    pub video_off: bool,
    pub status: LegStatus,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn invited(invitee: Invitee, media: MediaKind) -> Self {
        Self {
            id: invitee.id,
            display_name: invitee.display_name,
            avatar: invitee.avatar,
            muted: false,
            video_off: !media.has_video(),
            status: LegStatus::Invited,
            joined_at: None,
        }
    }
}

/// Remote media arriving over a connected transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    pub participant_id: ParticipantId,
    pub media: MediaKind,
}

/// Local control flags. Mutated only through the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControls {
    pub muted: bool,
    pub video_off: bool,
    pub speaker_on: bool,
}

impl CallControls {
    pub fn for_media(media: MediaKind) -> Self {
        Self {
            muted: false,
            video_off: !media.has_video(),
            speaker_on: true,
        }
    }
}

impl Default for CallControls {
    fn default() -> Self {
        Self::for_media(MediaKind::Audio)
    }
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: SessionId,
    pub kind: CallKind,
    pub media: MediaKind,
    pub direction: Direction,
    pub state: CallState,
    /// Keyed by participant id; iteration order is stable.
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub local_stream: Option<LocalStreamInfo>,
    pub remote_streams: BTreeMap<ParticipantId, RemoteStream>,
    pub controls: CallControls,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    pub fn new(id: SessionId, kind: CallKind, media: MediaKind, direction: Direction) -> Self {
        Self {
            id,
            kind,
            media,
            direction,
            state: match direction {
                Direction::Outgoing => CallState::Outgoing,
                Direction::Incoming => CallState::Incoming,
            },
            participants: BTreeMap::new(),
            local_stream: None,
            remote_streams: BTreeMap::new(),
            controls: CallControls::for_media(media),
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
        }
    }

    /// Moves the session forward. Returns `false` (and leaves the state
    /// untouched) for backward moves or anything after `Ended`.
    pub fn advance(&mut self, next: CallState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn is_conference(&self) -> bool {
        self.kind == CallKind::Conference
    }

    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.status == LegStatus::Connected)
            .count()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CallState; 7] = [
        CallState::Idle,
        CallState::Outgoing,
        CallState::Incoming,
        CallState::Ringing,
        CallState::Connecting,
        CallState::Connected,
        CallState::Ended,
    ];

    #[test]
    fn test_ended_is_absorbing() {
        for next in ALL {
            assert!(!CallState::Ended.can_advance_to(next));
        }

        let mut session = CallSession::new(
            SessionId::new(),
            CallKind::Direct,
            MediaKind::Audio,
            Direction::Outgoing,
        );
        assert!(session.advance(CallState::Ended));
        for next in ALL {
            assert!(!session.advance(next));
            assert_eq!(session.state, CallState::Ended);
        }
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let mut session = CallSession::new(
            SessionId::new(),
            CallKind::Direct,
            MediaKind::Video,
            Direction::Incoming,
        );
        assert!(session.advance(CallState::Ringing));
        assert!(session.advance(CallState::Connecting));
        assert!(!session.advance(CallState::Ringing));
        assert!(!session.advance(CallState::Connecting));
        assert!(session.advance(CallState::Connected));
        assert_eq!(session.state, CallState::Connected);
    }

    #[test]
    fn test_outcomes_separate_declined_from_failed() {
        assert_eq!(EndReason::RemoteBusy.outcome(), CallOutcome::Declined);
        assert_eq!(EndReason::RemoteRejected.outcome(), CallOutcome::Declined);
        assert_eq!(EndReason::PeerConnectionFailed.outcome(), CallOutcome::Failed);
        assert_eq!(EndReason::RemoteUnreachable.outcome(), CallOutcome::Failed);
        assert!(matches!(
            EndReason::RemoteBusy.as_error(),
            Some(CallError::RemoteBusy)
        ));
        assert!(EndReason::LocalHangup.as_error().is_none());
    }

    #[test]
    fn test_audio_call_starts_with_video_off() {
        let controls = CallControls::for_media(MediaKind::Audio);
        assert!(controls.video_off);
        assert!(controls.speaker_on);
        assert!(!CallControls::for_media(MediaKind::Video).video_off);
    }
}
