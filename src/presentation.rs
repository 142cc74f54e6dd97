//! Incoming Call Presentation
//!
//! Read-only views derived from the session snapshot, plus the only
//! mutation path a UI gets: the `on_*` handlers of [`CallSurface`], which
//! forward to the `CallService`. Nothing here keeps state of its own, so a
//! surface can be dropped and rebuilt at any time.

use serde::Serialize;
use std::fmt;

use crate::error::CallError;
use crate::media::LocalStreamInfo;
use crate::session::{
    CallControls, CallKind, CallService, CallSession, CallState, Direction, MediaKind,
    ParticipantId, RemoteStream, SessionId,
};

/// What an incoming-call prompt shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallView {
    pub session_id: SessionId,
    pub caller_id: ParticipantId,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
    pub media: MediaKind,
    pub kind: CallKind,
}

impl IncomingCallView {
    /// `None` unless the session is an invite still waiting for an answer.
    pub fn from_session(session: &CallSession) -> Option<Self> {
        if session.direction != Direction::Incoming || !session.state.is_awaiting_answer() {
            return None;
        }
        let caller = session.participants.values().next()?;
        Some(Self {
            session_id: session.id,
            caller_id: caller.id.clone(),
            caller_name: caller.display_name.clone(),
            caller_avatar: caller.avatar.clone(),
            media: session.media,
            kind: session.kind,
        })
    }
}

impl fmt::Display for IncomingCallView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match (self.kind, self.media) {
            (CallKind::Conference, _) => "conference",
            (CallKind::Direct, MediaKind::Video) => "video call",
            (CallKind::Direct, MediaKind::Audio) => "call",
        };
        write!(f, "Incoming {} from {}", what, self.caller_name)
    }
}

/// Everything a call screen renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub session_id: SessionId,
    pub state: CallState,
    pub kind: CallKind,
    pub media: MediaKind,
    pub participants: Vec<ParticipantView>,
    pub local_stream: Option<LocalStreamInfo>,
    pub remote_streams: Vec<RemoteStream>,
    pub controls: CallControls,
    pub incoming: Option<IncomingCallView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub name: String,
    pub connected: bool,
}

impl CallView {
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            session_id: session.id,
            state: session.state,
            kind: session.kind,
            media: session.media,
            participants: session
                .participants
                .values()
                .map(|p| ParticipantView {
                    id: p.id.clone(),
                    name: p.display_name.clone(),
                    connected: session.remote_streams.contains_key(&p.id),
                })
                .collect(),
            local_stream: session.local_stream.clone(),
            remote_streams: session.remote_streams.values().cloned().collect(),
            controls: session.controls,
            incoming: IncomingCallView::from_session(session),
        }
    }
}

/// UI-facing handle. Cheap to construct per screen.
#[derive(Clone, Debug)]
pub struct CallSurface {
    service: CallService,
}

impl CallSurface {
    pub fn new(service: CallService) -> Self {
        Self { service }
    }

    pub fn view(&self) -> Option<CallView> {
        self.service.snapshot().map(|s| CallView::from_session(&s))
    }

    pub fn incoming(&self) -> Option<IncomingCallView> {
        self.service
            .snapshot()
            .and_then(|s| IncomingCallView::from_session(&s))
    }

    /// The prompt is on screen.
    pub async fn on_shown(&self) -> Result<(), CallError> {
        self.service.mark_presented().await
    }

    pub async fn on_accept(&self) -> Result<(), CallError> {
        self.service.accept_call().await
    }

    pub async fn on_reject(&self) -> Result<(), CallError> {
        self.service.reject_call().await
    }

    pub async fn on_toggle_mute(&self) -> Result<Option<CallControls>, CallError> {
        self.service.toggle_mute().await
    }

    pub async fn on_toggle_video(&self) -> Result<Option<CallControls>, CallError> {
        self.service.toggle_video().await
    }

    pub async fn on_toggle_speaker(&self) -> Result<Option<CallControls>, CallError> {
        self.service.toggle_speaker().await
    }

    pub async fn on_end_call(&self) -> Result<(), CallError> {
        self.service.end_call().await
    }
}
