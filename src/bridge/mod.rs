//! Event Bridge - assistant-triggered call actions
//!
//! Other subsystems publish [`BridgeEvent`]s on an [`EventBus`]; the bridge
//! resolves names through the [`Directory`] and drives the [`CallService`].
//!
//! Wire shape: `{"event": "start-call", "payload": {"recipientName": "Anna", "video": true}}`

mod bus;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::directory::Directory;
use crate::error::CallError;
use crate::session::{CallService, Invitee, MediaKind, SessionId};

pub use bus::{EventBus, Subscription};

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    StartCall {
        recipient_name: String,
        #[serde(default)]
        video: bool,
    },
    EndCall {},
    ScheduleMeeting {
        subject: String,
        time: String,
        participants: Vec<String>,
    },
    JoinMeeting {
        subject: String,
    },
}

// ============================================================================
// MEETINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub subject: String,
    pub time: String,
    pub participants: Vec<Invitee>,
    pub session_id: Option<SessionId>,
}

/// Where scheduled meetings are remembered for `join-meeting`.
pub trait MeetingRegistry: Send + Sync {
    fn record(&self, meeting: Meeting);
    /// Case-insensitive lookup by subject.
    fn find(&self, subject: &str) -> Option<Meeting>;
}

#[derive(Default)]
pub struct InMemoryMeetings {
    meetings: Mutex<Vec<Meeting>>,
}

impl InMemoryMeetings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeetingRegistry for InMemoryMeetings {
    fn record(&self, meeting: Meeting) {
        let mut meetings = self.meetings.lock();
        meetings.retain(|m| !m.subject.eq_ignore_ascii_case(&meeting.subject));
        meetings.push(meeting);
    }

    fn find(&self, subject: &str) -> Option<Meeting> {
        self.meetings
            .lock()
            .iter()
            .find(|m| m.subject.eq_ignore_ascii_case(subject.trim()))
            .cloned()
    }
}

// ============================================================================
// BRIDGE
// ============================================================================

#[derive(Clone)]
pub struct EventBridge {
    service: CallService,
    directory: Arc<dyn Directory>,
    meetings: Arc<dyn MeetingRegistry>,
}

impl EventBridge {
    pub fn new(
        service: CallService,
        directory: Arc<dyn Directory>,
        meetings: Arc<dyn MeetingRegistry>,
    ) -> Self {
        Self {
            service,
            directory,
            meetings,
        }
    }

    /// Runs one event. Returns the session it started or joined, if any.
    pub async fn dispatch(&self, event: BridgeEvent) -> Result<Option<SessionId>, CallError> {
        match event {
            BridgeEvent::StartCall {
                recipient_name,
                video,
            } => {
                let invitee = self.resolve(&recipient_name)?;
                let media = if video { MediaKind::Video } else { MediaKind::Audio };
                tracing::info!(recipient = %invitee.id, %media, "Bridge: start call");
                self.service.initiate_call(invitee, media).await.map(Some)
            }
            BridgeEvent::EndCall {} => {
                tracing::info!("Bridge: end call");
                self.service.end_call().await.map(|_| None)
            }
            BridgeEvent::ScheduleMeeting {
                subject,
                time,
                participants,
            } => {
                let invitees = participants
                    .iter()
                    .map(|name| self.resolve(name))
                    .collect::<Result<Vec<_>, _>>()?;
                tracing::info!(%subject, %time, participants = invitees.len(), "Bridge: schedule meeting");

                let session_id = self
                    .service
                    .create_conference(invitees.clone(), MediaKind::Video)
                    .await?;
                self.meetings.record(Meeting {
                    subject,
                    time,
                    participants: invitees,
                    session_id: Some(session_id),
                });
                Ok(Some(session_id))
            }
            BridgeEvent::JoinMeeting { subject } => {
                let meeting = self
                    .meetings
                    .find(&subject)
                    .ok_or_else(|| CallError::MeetingNotFound(subject.clone()))?;

                let current = self.service.snapshot().filter(|s| !s.state.is_terminal());
                if let (Some(current), Some(id)) = (current, meeting.session_id) {
                    if current.id == id {
                        return Ok(Some(id));
                    }
                }

                tracing::info!(subject = %meeting.subject, "Bridge: restarting meeting");
                let session_id = self
                    .service
                    .create_conference(meeting.participants.clone(), MediaKind::Video)
                    .await?;
                self.meetings.record(Meeting {
                    session_id: Some(session_id),
                    ..meeting
                });
                Ok(Some(session_id))
            }
        }
    }

    /// First directory match for `name`.
    fn resolve(&self, name: &str) -> Result<Invitee, CallError> {
        self.directory
            .search(name)?
            .first()
            .map(|entry| entry.to_invitee())
            .ok_or_else(|| CallError::RecipientNotFound(name.to_string()))
    }

    /// Handles bus events on a background task until the handle is dropped.
    pub fn spawn(self, bus: &EventBus<BridgeEvent>) -> BridgeHandle {
        let mut subscription = bus.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let name = event_name(&event);
                match self.dispatch(event).await {
                    Ok(session) => tracing::debug!(event = name, ?session, "Bridge event handled"),
                    Err(e) => tracing::warn!(event = name, "Bridge event failed: {}", e),
                }
            }
        });
        BridgeHandle { task }
    }
}

fn event_name(event: &BridgeEvent) -> &'static str {
    match event {
        BridgeEvent::StartCall { .. } => "start-call",
        BridgeEvent::EndCall {} => "end-call",
        BridgeEvent::ScheduleMeeting { .. } => "schedule-meeting",
        BridgeEvent::JoinMeeting { .. } => "join-meeting",
    }
}

/// Keeps the bridge loop alive. Dropping it stops the loop and releases
/// its bus subscription.
pub struct BridgeHandle {
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops the loop now instead of at drop.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================
