//! Call Session Manager
//!
//! A single actor task owns the live session, its local stream and its
//! transport pool. `CallService` handles talk to it over a command
//! channel; inbound signaling, transport notices and timers arrive on
//! their own channels and are processed one at a time, so per-session
//! ordering follows arrival order and no locking is needed.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::model::{
    CallControls, CallKind, CallSession, CallState, Direction, EndReason, Invitee, LegStatus,
    LocalUser, MediaKind, Participant, ParticipantId, RemoteStream, SessionId,
};
use crate::config::{BusyPolicy, CallConfig};
use crate::error::CallError;
use crate::media::{LocalStream, MediaDeviceController, OutputDevice};
use crate::signaling::{
    ByeReason, InvitePayload, RejectReason, SeenMessages, SignalBody, SignalingChannel,
    SignalingError, SignalingMessage,
};
use crate::transport::{
    PeerTransportPool, PoolEnvelope, PoolOutput, ReconnectPolicy, TransportFactory,
};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

/// Events for observers (presentation, bridge, CLI).
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    IncomingCall {
        session_id: SessionId,
        caller: Invitee,
        media: MediaKind,
        kind: CallKind,
    },
    /// An invite was turned away with `busy`
    InviteAutoRejected {
        session_id: SessionId,
        from: ParticipantId,
    },
    /// An invite is waiting for the current call to end
    InviteQueued {
        session_id: SessionId,
        from: ParticipantId,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ParticipantLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    Reconnecting {
        session_id: SessionId,
        participant_id: ParticipantId,
        attempt: u32,
    },
    ControlsChanged(CallControls),
    Ended {
        session_id: SessionId,
        reason: EndReason,
    },
}

/// Resource counters, mostly for tests and the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub transports: usize,
    pub live_tracks: usize,
    pub outstanding_streams: usize,
    pub queued_invites: usize,
}

/// Collaborators handed to the session actor.
pub struct CallDeps {
    pub local: LocalUser,
    pub config: CallConfig,
    pub reconnect: ReconnectPolicy,
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: MediaDeviceController,
    pub transports: Arc<dyn TransportFactory>,
}

// ============================================================================
// COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Initiate {
        invitees: Vec<Invitee>,
        media: MediaKind,
        kind: CallKind,
        reply: Reply<Result<SessionId, CallError>>,
    },
    Accept(Reply<Result<(), CallError>>),
    Reject(Reply<Result<(), CallError>>),
    End(Reply<()>),
    Toggle(Toggle, Reply<Option<CallControls>>),
    OutputDevices(Reply<Result<Vec<OutputDevice>, CallError>>),
    SelectOutput(String, Reply<Result<(), CallError>>),
    MarkPresented(Reply<()>),
    Diagnostics(Reply<Diagnostics>),
}

#[derive(Debug, Clone, Copy)]
enum Toggle {
    Mute,
    Video,
    Speaker,
}

enum Timer {
    InviteExpired {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    RingExpired {
        session_id: SessionId,
    },
}

// ============================================================================
// CALL SERVICE
// ============================================================================

/// Handle to the session actor. Cheap to clone; the actor stops (ending
/// any live call) once every handle is gone.
#[derive(Clone)]
pub struct CallService {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Option<CallSession>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallService {
    /// Starts the actor. `inbound` carries relayed signaling messages
    /// addressed to `deps.local`.
    pub fn spawn(deps: CallDeps, inbound: mpsc::Receiver<SignalingMessage>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (timers, timer_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            ctx: Ctx {
                local: deps.local,
                config: deps.config,
                reconnect: deps.reconnect,
                signaling: deps.signaling,
                media: deps.media,
                transports: deps.transports,
                notices,
                timers,
                events: events.clone(),
            },
            live: None,
            last: None,
            answered: None,
            queue: VecDeque::new(),
            seen: SeenMessages::new(),
            snapshot: snapshot_tx,
        };
        tokio::spawn(actor.run(command_rx, inbound, notice_rx, timer_rx));

        Self {
            commands,
            snapshot,
            events,
        }
    }

    /// Calls one participant. Local media is acquired before anything is
    /// sent; on failure no session exists afterwards.
    pub async fn initiate_call(
        &self,
        invitee: Invitee,
        media: MediaKind,
    ) -> Result<SessionId, CallError> {
        self.request(|reply| Command::Initiate {
            invitees: vec![invitee],
            media,
            kind: CallKind::Direct,
            reply,
        })
        .await?
    }

    /// Invites every participant into one conference hosted here.
    pub async fn create_conference(
        &self,
        invitees: Vec<Invitee>,
        media: MediaKind,
    ) -> Result<SessionId, CallError> {
        self.request(|reply| Command::Initiate {
            invitees,
            media,
            kind: CallKind::Conference,
            reply,
        })
        .await?
    }

    /// Accepts the pending invite. A repeat call is a no-op.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await?
    }

    /// Declines the pending invite. A repeat call is a no-op.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await?
    }

    /// Ends the live session, if any. Resolves after local media is
    /// released and all transports are closed.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::End).await
    }

    pub async fn leave_conference(&self) -> Result<(), CallError> {
        self.request(Command::End).await
    }

    /// Returns the new controls, or `None` without a live session.
    pub async fn toggle_mute(&self) -> Result<Option<CallControls>, CallError> {
        self.request(|reply| Command::Toggle(Toggle::Mute, reply)).await
    }

    pub async fn toggle_video(&self) -> Result<Option<CallControls>, CallError> {
        self.request(|reply| Command::Toggle(Toggle::Video, reply)).await
    }

    pub async fn toggle_speaker(&self) -> Result<Option<CallControls>, CallError> {
        self.request(|reply| Command::Toggle(Toggle::Speaker, reply)).await
    }

    pub async fn output_devices(&self) -> Result<Vec<OutputDevice>, CallError> {
        self.request(Command::OutputDevices).await?
    }

    pub async fn select_output_device(&self, name: impl Into<String>) -> Result<(), CallError> {
        let name = name.into();
        self.request(|reply| Command::SelectOutput(name, reply)).await?
    }

    /// Acknowledges that the incoming invite is on screen.
    pub async fn mark_presented(&self) -> Result<(), CallError> {
        self.request(Command::MarkPresented).await
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, CallError> {
        self.request(Command::Diagnostics).await
    }

    /// Live session, or the most recent ended one.
    pub fn snapshot(&self) -> Option<CallSession> {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.snapshot
            .borrow()
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    pub fn watch(&self) -> watch::Receiver<Option<CallSession>> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::ServiceStopped)?;
        rx.await.map_err(|_| CallError::ServiceStopped)
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct Ctx {
    local: LocalUser,
    config: CallConfig,
    reconnect: ReconnectPolicy,
    signaling: Arc<dyn SignalingChannel>,
    media: MediaDeviceController,
    transports: Arc<dyn TransportFactory>,
    notices: mpsc::UnboundedSender<PoolEnvelope>,
    timers: mpsc::UnboundedSender<Timer>,
    events: broadcast::Sender<CallEvent>,
}

impl Ctx {
    fn send(&self, session_id: SessionId, to: &str, body: SignalBody) -> Result<(), SignalingError> {
        let kind = body.kind();
        let message = SignalingMessage::new(session_id, self.local.id.clone(), to, body);
        self.signaling.send(message).inspect_err(|e| {
            tracing::warn!(session = %session_id, to = %to, ?kind, "Signaling send failed: {}", e)
        })
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn arm(&self, delay: Duration, timer: Timer) {
        let tx = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(timer);
        });
    }

    fn new_pool(&self, session_id: SessionId, media: MediaKind) -> PeerTransportPool {
        PeerTransportPool::new(
            session_id,
            media,
            Arc::clone(&self.transports),
            self.reconnect.clone(),
            self.config.negotiation_timeout(),
            self.notices.clone(),
        )
    }
}

/// The non-terminal session and the resources it owns.
struct Live {
    session: CallSession,
    stream: Option<LocalStream>,
    pool: PeerTransportPool,
    /// Who invited us (incoming sessions only)
    host: Option<ParticipantId>,
}

impl Live {
    fn awaiting_answer(&self) -> bool {
        self.session.direction == Direction::Incoming && self.session.state.is_awaiting_answer()
    }

    fn set_state(&mut self, next: CallState, ctx: &Ctx) -> bool {
        let from = self.session.state;
        if !self.session.advance(next) {
            return false;
        }
        tracing::info!(session = %self.session.id, ?from, to = ?next, "Call state changed");
        ctx.emit(CallEvent::StateChanged {
            session_id: self.session.id,
            state: next,
        });
        true
    }
}

struct QueuedInvite {
    session_id: SessionId,
    from: ParticipantId,
    payload: InvitePayload,
    received_at: Instant,
}

struct Actor {
    ctx: Ctx,
    live: Option<Live>,
    last: Option<CallSession>,
    /// Incoming session the local user accepted or rejected most recently.
    answered: Option<SessionId>,
    queue: VecDeque<QueuedInvite>,
    seen: SeenMessages,
    snapshot: watch::Sender<Option<CallSession>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<SignalingMessage>,
        mut notices: mpsc::UnboundedReceiver<PoolEnvelope>,
        mut timers: mpsc::UnboundedReceiver<Timer>,
    ) {
        tracing::debug!(user = %self.ctx.local.id, "Call session actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(message) = inbound.recv() => self.on_signal(message).await,
                Some(envelope) = notices.recv() => self.on_pool(envelope).await,
                Some(timer) = timers.recv() => self.on_timer(timer).await,
            }
        }

        if self.live.is_some() {
            self.finish(EndReason::LocalHangup, Some(ByeReason::Hangup)).await;
        }
        tracing::debug!(user = %self.ctx.local.id, "Call session actor stopped");
    }

    fn publish(&self) {
        let view = self
            .live
            .as_ref()
            .map(|live| live.session.clone())
            .or_else(|| self.last.clone());
        self.snapshot.send_replace(view);
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initiate {
                invitees,
                media,
                kind,
                reply,
            } => {
                let _ = reply.send(self.start(invitees, media, kind));
            }
            Command::Accept(reply) => {
                let _ = reply.send(self.accept());
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.reject().await);
            }
            Command::End(reply) => {
                if self.live.is_some() {
                    self.finish(EndReason::LocalHangup, Some(ByeReason::Hangup)).await;
                }
                let _ = reply.send(());
            }
            Command::Toggle(which, reply) => {
                let _ = reply.send(self.toggle(which));
            }
            Command::OutputDevices(reply) => {
                let _ = reply.send(self.ctx.media.output_devices().map_err(CallError::from));
            }
            Command::SelectOutput(name, reply) => {
                let _ = reply.send(self.ctx.media.select_output(&name).map_err(CallError::from));
            }
            Command::MarkPresented(reply) => {
                if let Some(live) = self.live.as_mut() {
                    if live.session.state == CallState::Incoming {
                        live.set_state(CallState::Ringing, &self.ctx);
                        self.publish();
                    }
                }
                let _ = reply.send(());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(Diagnostics {
                    transports: self.live.as_ref().map_or(0, |live| live.pool.len()),
                    live_tracks: self.ctx.media.live_tracks(),
                    outstanding_streams: self.ctx.media.outstanding(),
                    queued_invites: self.queue.len(),
                });
            }
        }
    }

    fn start(
        &mut self,
        invitees: Vec<Invitee>,
        media: MediaKind,
        kind: CallKind,
    ) -> Result<SessionId, CallError> {
        if self.live.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let mut unique: Vec<Invitee> = Vec::with_capacity(invitees.len());
        for invitee in invitees {
            if invitee.id.trim().is_empty() || invitee.id == self.ctx.local.id {
                return Err(CallError::InvalidRecipient(invitee.id));
            }
            if !unique.iter().any(|u| u.id == invitee.id) {
                unique.push(invitee);
            }
        }
        if unique.is_empty() {
            return Err(CallError::InvalidRecipient("no participants".into()));
        }

        let id = SessionId::new();
        let stream = self.ctx.media.acquire(id, media)?;

        let mut session = CallSession::new(id, kind, media, Direction::Outgoing);
        session.local_stream = self.ctx.media.describe(&stream);
        for invitee in &unique {
            session
                .participants
                .insert(invitee.id.clone(), Participant::invited(invitee.clone(), media));
        }

        let payload = InvitePayload {
            call_type: media,
            kind,
            caller_name: self.ctx.local.display_name.clone(),
            caller_avatar: self.ctx.local.avatar.clone(),
        };

        let mut invited: Vec<&str> = Vec::with_capacity(unique.len());
        for invitee in &unique {
            if let Err(e) = self
                .ctx
                .send(id, &invitee.id, SignalBody::Invite(payload.clone()))
            {
                for pid in invited {
                    let _ = self.ctx.send(
                        id,
                        pid,
                        SignalBody::Bye {
                            reason: Some(ByeReason::Hangup),
                        },
                    );
                }
                self.ctx.media.release(stream);
                return Err(e.into());
            }
            invited.push(&invitee.id);
        }

        for invitee in &unique {
            self.ctx.arm(
                self.ctx.config.invite_timeout(),
                Timer::InviteExpired {
                    session_id: id,
                    participant_id: invitee.id.clone(),
                },
            );
        }

        tracing::info!(session = %id, ?kind, %media, participants = unique.len(), "Call started");
        self.live = Some(Live {
            session,
            stream: Some(stream),
            pool: self.ctx.new_pool(id, media),
            host: None,
        });
        self.ctx.emit(CallEvent::StateChanged {
            session_id: id,
            state: CallState::Outgoing,
        });
        self.publish();
        Ok(id)
    }

    /// The local user already accepted or rejected the current (or last)
    /// incoming session. A missed invite was never answered.
    fn already_answered(&self) -> bool {
        let answered = |id: SessionId| self.answered == Some(id);
        match &self.live {
            Some(live) => {
                live.session.direction == Direction::Incoming
                    && !live.awaiting_answer()
                    && answered(live.session.id)
            }
            None => self.last.as_ref().is_some_and(|s| answered(s.id)),
        }
    }

    fn accept(&mut self) -> Result<(), CallError> {
        let answered = self.already_answered();
        let ctx = &self.ctx;
        let Some(live) = self.live.as_mut().filter(|live| live.awaiting_answer()) else {
            return if answered {
                Ok(())
            } else {
                Err(CallError::NoIncomingCall)
            };
        };
        let Some(host) = live.host.clone() else {
            return Err(CallError::NoIncomingCall);
        };
        let session_id = live.session.id;

        let stream = ctx.media.acquire(session_id, live.session.media)?;
        if let Err(e) = ctx.send(session_id, &host, SignalBody::Accept) {
            ctx.media.release(stream);
            return Err(e.into());
        }

        let controls = live.session.controls;
        ctx.media.set_muted(&stream, controls.muted);
        ctx.media.set_video_off(&stream, controls.video_off);
        live.session.local_stream = ctx.media.describe(&stream);
        live.stream = Some(stream);
        self.answered = Some(session_id);
        live.pool.expect_offer(&host);
        if let Some(participant) = live.session.participants.get_mut(&host) {
            participant.status = LegStatus::Connecting;
        }
        live.set_state(CallState::Connecting, ctx);
        self.publish();
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        let answered = self.already_answered();
        let Some(live) = self.live.as_ref().filter(|live| live.awaiting_answer()) else {
            return if answered {
                Ok(())
            } else {
                Err(CallError::NoIncomingCall)
            };
        };

        self.answered = Some(live.session.id);
        if let Some(host) = &live.host {
            let _ = self.ctx.send(
                live.session.id,
                host,
                SignalBody::Reject {
                    reason: RejectReason::Declined,
                },
            );
        }
        self.finish(EndReason::LocalRejected, None).await;
        Ok(())
    }

    fn toggle(&mut self, which: Toggle) -> Option<CallControls> {
        let live = self.live.as_mut()?;
        let controls = &mut live.session.controls;
        match which {
            Toggle::Mute => {
                controls.muted = !controls.muted;
                if let Some(stream) = &live.stream {
                    self.ctx.media.set_muted(stream, controls.muted);
                }
            }
            Toggle::Video => {
                controls.video_off = !controls.video_off;
                if let Some(stream) = &live.stream {
                    self.ctx.media.set_video_off(stream, controls.video_off);
                }
            }
            Toggle::Speaker => {
                controls.speaker_on = !controls.speaker_on;
                self.ctx.media.set_speaker(controls.speaker_on);
            }
        }
        if let Some(stream) = &live.stream {
            live.session.local_stream = self.ctx.media.describe(stream);
        }

        let controls = live.session.controls;
        tracing::debug!(session = %live.session.id, ?which, ?controls, "Controls toggled");
        self.ctx.emit(CallEvent::ControlsChanged(controls));
        self.publish();
        Some(controls)
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    async fn on_signal(&mut self, message: SignalingMessage) {
        if message.sender_id == self.ctx.local.id {
            return;
        }
        if message.target_id != self.ctx.local.id
            && message.target_id != message.session_id.to_string()
        {
            tracing::debug!(target_id = %message.target_id, "Message for someone else dropped");
            return;
        }
        if !self.seen.first_sighting(message.id) {
            tracing::debug!(id = %message.id, kind = ?message.kind(), "Duplicate message dropped");
            return;
        }
        if self.seen.is_closed(&message.session_id) {
            tracing::debug!(
                session = %message.session_id,
                kind = ?message.kind(),
                "Message for closed session dropped"
            );
            return;
        }

        let session_id = message.session_id;
        let from = message.sender_id;
        tracing::debug!(session = %session_id, from = %from, kind = ?message.body.kind(), "Signal received");

        let is_live = self
            .live
            .as_ref()
            .is_some_and(|live| live.session.id == session_id);

        match message.body {
            SignalBody::Invite(payload) => {
                if is_live {
                    tracing::debug!(session = %session_id, "Repeated invite dropped");
                } else {
                    self.on_invite(session_id, from, payload);
                }
            }
            body if is_live => self.on_session_signal(from, body).await,
            SignalBody::Bye { .. } | SignalBody::Reject { .. } => {
                let before = self.queue.len();
                self.queue
                    .retain(|q| !(q.session_id == session_id && q.from == from));
                if self.queue.len() < before {
                    tracing::info!(session = %session_id, from = %from, "Queued invite withdrawn");
                    self.seen.mark_closed(session_id);
                } else {
                    tracing::debug!(session = %session_id, "Message for unknown session dropped");
                }
            }
            _ => {
                tracing::debug!(session = %session_id, "Message for unknown session dropped");
            }
        }
    }

    fn on_invite(&mut self, session_id: SessionId, from: ParticipantId, payload: InvitePayload) {
        if self.live.is_none() {
            self.present_invite(session_id, from, payload, self.ctx.config.invite_timeout());
            return;
        }

        if self.queue.iter().any(|q| q.session_id == session_id) {
            return;
        }
        if self.ctx.config.busy_policy == BusyPolicy::Queue
            && self.queue.len() < self.ctx.config.max_queued_invites
        {
            tracing::info!(session = %session_id, from = %from, "Invite queued behind active call");
            self.ctx.emit(CallEvent::InviteQueued {
                session_id,
                from: from.clone(),
            });
            self.queue.push_back(QueuedInvite {
                session_id,
                from,
                payload,
                received_at: Instant::now(),
            });
            return;
        }

        tracing::info!(session = %session_id, from = %from, "Busy, invite auto-rejected");
        let _ = self.ctx.send(
            session_id,
            &from,
            SignalBody::Reject {
                reason: RejectReason::Busy,
            },
        );
        self.seen.mark_closed(session_id);
        self.ctx
            .emit(CallEvent::InviteAutoRejected { session_id, from });
    }

    fn present_invite(
        &mut self,
        session_id: SessionId,
        from: ParticipantId,
        payload: InvitePayload,
        ring_for: Duration,
    ) {
        let media = payload.call_type;
        let kind = payload.kind;
        let caller = Invitee {
            id: from.clone(),
            display_name: payload.caller_name,
            avatar: payload.caller_avatar,
        };

        let mut session = CallSession::new(session_id, kind, media, Direction::Incoming);
        session
            .participants
            .insert(from.clone(), Participant::invited(caller.clone(), media));

        tracing::info!(session = %session_id, from = %from, %media, ?kind, "Incoming call");
        self.live = Some(Live {
            session,
            stream: None,
            pool: self.ctx.new_pool(session_id, media),
            host: Some(from),
        });
        self.ctx.arm(ring_for, Timer::RingExpired { session_id });

        self.ctx.emit(CallEvent::StateChanged {
            session_id,
            state: CallState::Incoming,
        });
        self.ctx.emit(CallEvent::IncomingCall {
            session_id,
            caller,
            media,
            kind,
        });
        self.publish();
    }

    async fn on_session_signal(&mut self, from: ParticipantId, body: SignalBody) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let Some(status) = live.session.participants.get(&from).map(|p| p.status) else {
            tracing::debug!(from = %from, "Message from non-participant dropped");
            return;
        };
        let outgoing = live.session.direction == Direction::Outgoing;

        match body {
            SignalBody::Accept => {
                if !outgoing || status != LegStatus::Invited {
                    return;
                }
                if let Some(participant) = live.session.participants.get_mut(&from) {
                    participant.status = LegStatus::Connecting;
                }
                tracing::info!(session = %live.session.id, participant = %from, "Invite accepted");
                live.pool.open_offerer(&from);
                live.set_state(CallState::Connecting, &self.ctx);
                self.publish();
            }
            SignalBody::Reject { reason } => {
                if !outgoing || status != LegStatus::Invited {
                    return;
                }
                let end = match reason {
                    RejectReason::Busy => EndReason::RemoteBusy,
                    RejectReason::Declined => EndReason::RemoteRejected,
                    RejectReason::Timeout => EndReason::RemoteUnreachable,
                };
                tracing::info!(session = %live.session.id, participant = %from, ?reason, "Invite rejected");
                self.drop_participant(&from, end).await;
            }
            SignalBody::Offer { sdp } => live.pool.on_remote_offer(&from, sdp),
            SignalBody::Answer { sdp } => live.pool.on_remote_answer(&from, sdp),
            SignalBody::Candidate { candidate } => live.pool.on_remote_candidate(&from, candidate),
            SignalBody::Bye { reason } => {
                let end = if live.awaiting_answer() {
                    EndReason::Missed
                } else if reason == Some(ByeReason::Failed) {
                    EndReason::PeerConnectionFailed
                } else if live.session.is_conference() {
                    EndReason::AllParticipantsLeft
                } else {
                    EndReason::RemoteHangup
                };
                tracing::info!(session = %live.session.id, participant = %from, ?reason, "Participant hung up");
                self.drop_participant(&from, end).await;
            }
            SignalBody::Invite(_) => {}
        }
    }

    // ========================================================================
    // TRANSPORT NOTICES
    // ========================================================================

    async fn on_pool(&mut self, envelope: PoolEnvelope) {
        let session_id = envelope.session_id;
        let Some(live) = self
            .live
            .as_mut()
            .filter(|live| live.session.id == session_id)
        else {
            // Result of work started for a session that is gone.
            if let Some(transport) = envelope.notice.into_transport() {
                tokio::spawn(async move { transport.close().await });
            }
            return;
        };

        let outputs = live.pool.handle(envelope.notice);
        for output in outputs {
            self.on_pool_output(output).await;
        }
    }

    async fn on_pool_output(&mut self, output: PoolOutput) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let session_id = live.session.id;

        match output {
            PoolOutput::Signal { to, body } => {
                let _ = self.ctx.send(session_id, &to, body);
            }
            PoolOutput::Connected(participant_id) => {
                let media = live.session.media;
                let Some(participant) = live.session.participants.get_mut(&participant_id) else {
                    return;
                };
                let first = participant.joined_at.is_none();
                participant.status = LegStatus::Connected;
                if first {
                    participant.joined_at = Some(Utc::now());
                }
                live.session.remote_streams.insert(
                    participant_id.clone(),
                    RemoteStream {
                        participant_id: participant_id.clone(),
                        media,
                    },
                );
                live.set_state(CallState::Connected, &self.ctx);
                if first {
                    self.ctx.emit(CallEvent::ParticipantJoined {
                        session_id,
                        participant_id,
                    });
                }
                self.publish();
            }
            PoolOutput::Reconnecting {
                participant_id,
                attempt,
            } => {
                if let Some(participant) = live.session.participants.get_mut(&participant_id) {
                    if participant.status != LegStatus::Invited {
                        participant.status = LegStatus::Reconnecting;
                    }
                }
                live.session.remote_streams.remove(&participant_id);
                self.ctx.emit(CallEvent::Reconnecting {
                    session_id,
                    participant_id,
                    attempt,
                });
                self.publish();
            }
            PoolOutput::Failed {
                participant_id,
                error,
            } => {
                tracing::error!(
                    session = %session_id,
                    participant = %participant_id,
                    %error,
                    "Peer connection failed"
                );
                let _ = self.ctx.send(
                    session_id,
                    &participant_id,
                    SignalBody::Bye {
                        reason: Some(ByeReason::Failed),
                    },
                );
                self.drop_participant(&participant_id, EndReason::PeerConnectionFailed)
                    .await;
            }
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::InviteExpired {
                session_id,
                participant_id,
            } => {
                let still_invited = self
                    .live
                    .as_ref()
                    .filter(|live| live.session.id == session_id)
                    .and_then(|live| live.session.participants.get(&participant_id))
                    .is_some_and(|p| p.status == LegStatus::Invited);
                if !still_invited {
                    return;
                }

                tracing::info!(session = %session_id, participant = %participant_id, "Invite timed out");
                let _ = self.ctx.send(
                    session_id,
                    &participant_id,
                    SignalBody::Bye {
                        reason: Some(ByeReason::Timeout),
                    },
                );
                self.drop_participant(&participant_id, EndReason::RemoteUnreachable)
                    .await;
            }
            Timer::RingExpired { session_id } => {
                let ringing = self
                    .live
                    .as_ref()
                    .is_some_and(|live| live.session.id == session_id && live.awaiting_answer());
                if ringing {
                    tracing::info!(session = %session_id, "Incoming call not answered");
                    self.finish(EndReason::Missed, None).await;
                }
            }
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Removes one participant and its transport together. The session
    /// ends with `reason_if_empty` when nobody is left.
    async fn drop_participant(&mut self, participant_id: &str, reason_if_empty: EndReason) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if live.session.participants.remove(participant_id).is_none() {
            return;
        }
        live.pool.remove(participant_id);
        live.session.remote_streams.remove(participant_id);
        self.ctx.emit(CallEvent::ParticipantLeft {
            session_id: live.session.id,
            participant_id: participant_id.to_string(),
        });

        if live.session.participants.is_empty() {
            self.finish(reason_if_empty, None).await;
        } else {
            self.publish();
        }
    }

    /// Ends the live session and releases everything it owns. With
    /// `bye`, remaining participants are told first.
    async fn finish(&mut self, reason: EndReason, bye: Option<ByeReason>) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        let session_id = live.session.id;

        if let Some(bye) = bye {
            for participant_id in live.session.participants.keys() {
                let _ = self.ctx.send(
                    session_id,
                    participant_id,
                    SignalBody::Bye { reason: Some(bye) },
                );
            }
        }

        let transports = live.pool.close_all();
        if !transports.is_empty() {
            let closes = join_all(transports.iter().map(|t| t.close()));
            if tokio::time::timeout(self.ctx.config.teardown_timeout(), closes)
                .await
                .is_err()
            {
                tracing::warn!(session = %session_id, "Transport shutdown timed out");
            }
        }

        if let Some(stream) = live.stream.take() {
            self.ctx.media.release(stream);
        }

        let session = &mut live.session;
        session.local_stream = None;
        session.remote_streams.clear();
        session.participants.clear();
        session.advance(CallState::Ended);
        session.ended_at = Some(Utc::now());
        session.end_reason = Some(reason);
        self.seen.mark_closed(session_id);

        tracing::info!(session = %session_id, ?reason, outcome = ?reason.outcome(), "Call ended");
        self.last = Some(live.session);
        self.publish();
        self.ctx.emit(CallEvent::StateChanged {
            session_id,
            state: CallState::Ended,
        });
        self.ctx.emit(CallEvent::Ended { session_id, reason });

        self.present_next_queued();
    }

    fn present_next_queued(&mut self) {
        let window = self.ctx.config.invite_timeout();
        while let Some(queued) = self.queue.pop_front() {
            let waited = queued.received_at.elapsed();
            if waited >= window || self.seen.is_closed(&queued.session_id) {
                tracing::debug!(session = %queued.session_id, "Queued invite expired");
                continue;
            }
            self.present_invite(queued.session_id, queued.from, queued.payload, window - waited);
            break;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{SyntheticDevices, TrackKind};
    use crate::signaling::{MemoryRelay, RelayEndpoint};
    use crate::transport::testing::ScriptedFactory;
    use crate::transport::TransportEvent;

    const ALICE: &str = "alice";

    struct Harness {
        service: CallService,
        relay: MemoryRelay,
        factory: Arc<ScriptedFactory>,
        devices: Arc<SyntheticDevices>,
    }

    struct Peer {
        id: &'static str,
        endpoint: RelayEndpoint,
        _inbox: mpsc::Receiver<SignalingMessage>,
    }

    fn local(id: &str) -> LocalUser {
        LocalUser {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            avatar: None,
        }
    }

    fn spawn_user(
        relay: &MemoryRelay,
        id: &str,
        config: CallConfig,
        reconnect: ReconnectPolicy,
        factory: Arc<ScriptedFactory>,
        devices: Arc<SyntheticDevices>,
    ) -> CallService {
        let (endpoint, inbound) = relay.endpoint(id);
        CallService::spawn(
            CallDeps {
                local: local(id),
                config,
                reconnect,
                signaling: Arc::new(endpoint),
                media: MediaDeviceController::new(devices),
                transports: factory,
            },
            inbound,
        )
    }

    fn harness_with(config: CallConfig, reconnect: ReconnectPolicy, factory: ScriptedFactory) -> Harness {
        let relay = MemoryRelay::new();
        let factory = Arc::new(factory);
        let devices = Arc::new(SyntheticDevices::new());
        let service = spawn_user(
            &relay,
            ALICE,
            config,
            reconnect,
            factory.clone(),
            devices.clone(),
        );
        Harness {
            service,
            relay,
            factory,
            devices,
        }
    }

    fn harness() -> Harness {
        harness_with(CallConfig::default(), ReconnectPolicy::default(), ScriptedFactory::new())
    }

    /// Lets spawned tasks and the actor drain their queues.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    impl Harness {
        fn peer(&self, id: &'static str) -> Peer {
            let (endpoint, inbox) = self.relay.endpoint(id);
            Peer {
                id,
                endpoint,
                _inbox: inbox,
            }
        }

        /// Bodies alice sent to `to`, in order.
        fn sent_to(&self, to: &str) -> Vec<SignalBody> {
            self.relay
                .history()
                .into_iter()
                .filter(|m| m.sender_id == ALICE && m.target_id == to)
                .map(|m| m.body)
                .collect()
        }

        fn sent_by_alice(&self) -> usize {
            self.relay
                .history()
                .iter()
                .filter(|m| m.sender_id == ALICE)
                .count()
        }

        fn invite_session(&self, to: &str) -> SessionId {
            self.relay
                .history()
                .into_iter()
                .find(|m| m.sender_id == ALICE && m.target_id == to)
                .map(|m| m.session_id)
                .expect("invite sent")
        }

        async fn connected_with(&self, bob: &Peer) -> SessionId {
            let id = self
                .service
                .initiate_call(Invitee::new(bob.id, "Bob"), MediaKind::Audio)
                .await
                .unwrap();
            bob.send(id, SignalBody::Accept);
            settle().await;
            bob.send(id, SignalBody::Answer { sdp: "answer".into() });
            settle().await;
            assert_eq!(self.service.state(), CallState::Connected);
            id
        }

        fn end_reason(&self) -> Option<EndReason> {
            self.service.snapshot().and_then(|s| s.end_reason)
        }
    }

    impl Peer {
        fn send(&self, session_id: SessionId, body: SignalBody) -> SignalingMessage {
            let message = SignalingMessage::new(session_id, self.id, ALICE, body);
            self.endpoint.send(message.clone()).unwrap();
            message
        }

        fn resend(&self, message: &SignalingMessage) {
            self.endpoint.send(message.clone()).unwrap();
        }

        fn invite(&self, media: MediaKind) -> SessionId {
            let session_id = SessionId::new();
            self.send(
                session_id,
                SignalBody::Invite(InvitePayload {
                    call_type: media,
                    kind: CallKind::Direct,
                    caller_name: self.id.to_uppercase(),
                    caller_avatar: None,
                }),
            );
            session_id
        }
    }

    // ------------------------------------------------------------------
    // Outgoing
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_initiate_sends_exactly_one_invite() {
        let h = harness();
        let _bob = h.peer("bob");

        let id = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();

        assert_eq!(h.service.state(), CallState::Outgoing);
        let sent = h.sent_to("bob");
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            SignalBody::Invite(payload) => {
                assert_eq!(payload.call_type, MediaKind::Audio);
                assert_eq!(payload.kind, CallKind::Direct);
                assert_eq!(payload.caller_name, "ALICE");
            }
            other => panic!("expected invite, got {other:?}"),
        }
        assert_eq!(h.invite_session("bob"), id);

        let second = h
            .service
            .initiate_call(Invitee::new("carol", "Carol"), MediaKind::Audio)
            .await;
        assert!(matches!(second, Err(CallError::AlreadyInCall)));
        assert_eq!(h.sent_by_alice(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_denied_sends_nothing() {
        let h = harness();
        h.devices.deny_permission();

        let result = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Video)
            .await;

        assert!(matches!(result, Err(CallError::MediaAccessDenied(_))));
        assert!(h.relay.history().is_empty());
        assert!(h.service.snapshot().is_none());
        assert_eq!(h.service.diagnostics().await.unwrap().outstanding_streams, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_recipient_creates_no_session() {
        let h = harness();
        let result = h
            .service
            .initiate_call(Invitee::new(ALICE, "Me"), MediaKind::Audio)
            .await;
        assert!(matches!(result, Err(CallError::InvalidRecipient(_))));

        let result = h.service.create_conference(Vec::new(), MediaKind::Audio).await;
        assert!(matches!(result, Err(CallError::InvalidRecipient(_))));
        assert!(h.service.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_invite_ends_unreachable() {
        let h = harness();
        let _bob = h.peer("bob");
        h.service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(h.service.state(), CallState::Ended);
        let reason = h.end_reason().unwrap();
        assert_eq!(reason, EndReason::RemoteUnreachable);
        assert!(matches!(reason.as_error(), Some(CallError::RemoteUnreachable)));
        assert_eq!(
            h.sent_to("bob").last(),
            Some(&SignalBody::Bye {
                reason: Some(ByeReason::Timeout)
            })
        );
        assert_eq!(h.service.diagnostics().await.unwrap().live_tracks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_reply_is_reported_distinctly() {
        let h = harness();
        let bob = h.peer("bob");
        let id = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();

        bob.send(
            id,
            SignalBody::Reject {
                reason: RejectReason::Busy,
            },
        );
        settle().await;

        let reason = h.end_reason().unwrap();
        assert_eq!(reason, EndReason::RemoteBusy);
        assert_eq!(reason.outcome(), crate::session::CallOutcome::Declined);
        assert_eq!(h.factory.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_accept_opens_one_transport() {
        let h = harness();
        let bob = h.peer("bob");
        let id = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();

        let accept = bob.send(id, SignalBody::Accept);
        bob.resend(&accept);
        bob.send(id, SignalBody::Accept);
        settle().await;

        assert_eq!(h.service.state(), CallState::Connecting);
        assert_eq!(h.factory.created(), 1);
        let offers = h
            .sent_to("bob")
            .into_iter()
            .filter(|b| matches!(b, SignalBody::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    // ------------------------------------------------------------------
    // Incoming
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_reject_incoming_sends_one_reject_and_no_transport() {
        let h = harness();
        let bob = h.peer("bob");
        let mut events = h.service.subscribe();

        let id = bob.invite(MediaKind::Audio);
        settle().await;
        assert_eq!(h.service.state(), CallState::Incoming);

        let mut saw_incoming = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::IncomingCall { session_id, caller, .. } = event {
                assert_eq!(session_id, id);
                assert_eq!(caller.id, "bob");
                saw_incoming = true;
            }
        }
        assert!(saw_incoming);

        h.service.reject_call().await.unwrap();
        h.service.reject_call().await.unwrap();

        assert_eq!(
            h.sent_to("bob"),
            vec![SignalBody::Reject {
                reason: RejectReason::Declined
            }]
        );
        assert_eq!(h.service.state(), CallState::Ended);
        assert_eq!(h.end_reason(), Some(EndReason::LocalRejected));
        assert_eq!(h.factory.created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_twice_equals_once() {
        let h = harness();
        let bob = h.peer("bob");
        let id = bob.invite(MediaKind::Video);
        settle().await;

        h.service.mark_presented().await.unwrap();
        assert_eq!(h.service.state(), CallState::Ringing);

        h.service.accept_call().await.unwrap();
        h.service.accept_call().await.unwrap();
        assert_eq!(h.sent_to("bob"), vec![SignalBody::Accept]);
        assert_eq!(h.service.state(), CallState::Connecting);

        let diag = h.service.diagnostics().await.unwrap();
        assert_eq!(diag.outstanding_streams, 1);
        assert_eq!(diag.live_tracks, 2);

        bob.send(id, SignalBody::Offer { sdp: "offer".into() });
        settle().await;
        assert_eq!(h.service.state(), CallState::Connected);
        assert_eq!(
            h.sent_to("bob").last(),
            Some(&SignalBody::Answer {
                sdp: "answer".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_without_invite_fails() {
        let h = harness();
        assert!(matches!(
            h.service.accept_call().await,
            Err(CallError::NoIncomingCall)
        ));
        assert!(matches!(
            h.service.reject_call().await,
            Err(CallError::NoIncomingCall)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_with_denied_media_keeps_invite() {
        let h = harness();
        let bob = h.peer("bob");
        bob.invite(MediaKind::Audio);
        settle().await;

        h.devices.deny_permission();
        assert!(matches!(
            h.service.accept_call().await,
            Err(CallError::MediaAccessDenied(_))
        ));
        assert_eq!(h.service.state(), CallState::Incoming);
        assert!(h.sent_to("bob").is_empty());

        h.devices.grant_permission();
        h.service.accept_call().await.unwrap();
        assert_eq!(h.service.state(), CallState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_incoming_call_is_missed() {
        let h = harness();
        let bob = h.peer("bob");
        bob.invite(MediaKind::Audio);

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(h.end_reason(), Some(EndReason::Missed));
        assert_eq!(h.sent_by_alice(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_hangup_while_ringing_is_missed() {
        let h = harness();
        let bob = h.peer("bob");
        let id = bob.invite(MediaKind::Audio);
        settle().await;

        bob.send(id, SignalBody::Bye { reason: Some(ByeReason::Hangup) });
        settle().await;

        assert_eq!(h.end_reason(), Some(EndReason::Missed));
        assert!(matches!(
            h.service.accept_call().await,
            Err(CallError::NoIncomingCall)
        ));
        assert!(matches!(
            h.service.reject_call().await,
            Err(CallError::NoIncomingCall)
        ));
        assert_eq!(h.service.state(), CallState::Ended);
        assert_eq!(h.sent_by_alice(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_repeat_after_decline_is_noop() {
        let h = harness();
        let bob = h.peer("bob");
        bob.invite(MediaKind::Audio);
        settle().await;

        h.service.reject_call().await.unwrap();
        h.service.reject_call().await.unwrap();
        h.service.accept_call().await.unwrap();

        assert_eq!(h.end_reason(), Some(EndReason::LocalRejected));
        assert_eq!(h.sent_by_alice(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controls_set_before_accept_reach_media() {
        let h = harness();
        let bob = h.peer("bob");
        bob.invite(MediaKind::Video);
        settle().await;

        let controls = h.service.toggle_mute().await.unwrap().unwrap();
        assert!(controls.muted);
        h.service.toggle_video().await.unwrap();

        h.service.accept_call().await.unwrap();

        let session = h.service.snapshot().unwrap();
        assert!(session.controls.muted);
        assert!(session.controls.video_off);
        let tracks = session.local_stream.unwrap().tracks;
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| !t.enabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_updates_local_stream_view() {
        let h = harness();
        let bob = h.peer("bob");
        h.connected_with(&bob).await;

        h.service.toggle_mute().await.unwrap();
        let audio_enabled = |session: CallSession| {
            session
                .local_stream
                .unwrap()
                .tracks
                .iter()
                .filter(|t| t.kind == TrackKind::Audio)
                .map(|t| t.enabled)
                .collect::<Vec<_>>()
        };
        assert_eq!(audio_enabled(h.service.snapshot().unwrap()), vec![false]);

        h.service.toggle_mute().await.unwrap();
        assert_eq!(audio_enabled(h.service.snapshot().unwrap()), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_session_ignores_late_messages() {
        let h = harness();
        let bob = h.peer("bob");
        let id = bob.invite(MediaKind::Audio);
        settle().await;
        h.service.reject_call().await.unwrap();

        bob.send(id, SignalBody::Offer { sdp: "late".into() });
        bob.send(
            id,
            SignalBody::Invite(InvitePayload {
                call_type: MediaKind::Audio,
                kind: CallKind::Direct,
                caller_name: "BOB".into(),
                caller_avatar: None,
            }),
        );
        settle().await;

        assert_eq!(h.service.state(), CallState::Ended);
        assert_eq!(h.service.snapshot().unwrap().id, id);
        assert_eq!(h.sent_by_alice(), 1);
        assert_eq!(h.factory.created(), 0);
    }

    // ------------------------------------------------------------------
    // Busy policy
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_invite_during_call_is_rejected_busy() {
        let h = harness();
        let bob = h.peer("bob");
        let carol = h.peer("carol");
        let id = h.connected_with(&bob).await;
        let mut events = h.service.subscribe();

        let carol_session = carol.invite(MediaKind::Video);
        settle().await;

        assert_eq!(
            h.sent_to("carol"),
            vec![SignalBody::Reject {
                reason: RejectReason::Busy
            }]
        );
        let snapshot = h.service.snapshot().unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.participant_ids(), vec!["bob".to_string()]);
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::InviteAutoRejected {
                session_id: carol_session,
                from: "carol".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_invite_is_presented_after_call() {
        let config = CallConfig {
            busy_policy: BusyPolicy::Queue,
            ..CallConfig::default()
        };
        let h = harness_with(config, ReconnectPolicy::default(), ScriptedFactory::new());
        let bob = h.peer("bob");
        let carol = h.peer("carol");
        h.connected_with(&bob).await;

        let carol_session = carol.invite(MediaKind::Audio);
        settle().await;
        assert!(h.sent_to("carol").is_empty());
        assert_eq!(h.service.diagnostics().await.unwrap().queued_invites, 1);

        // Capacity is one; the next caller is turned away.
        let dave = h.peer("dave");
        dave.invite(MediaKind::Audio);
        settle().await;
        assert_eq!(h.sent_to("dave").len(), 1);

        h.service.end_call().await.unwrap();

        let snapshot = h.service.snapshot().unwrap();
        assert_eq!(snapshot.id, carol_session);
        assert_eq!(snapshot.state, CallState::Incoming);
        assert_eq!(h.service.diagnostics().await.unwrap().queued_invites, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_queued_invite_is_dropped() {
        let config = CallConfig {
            busy_policy: BusyPolicy::Queue,
            ..CallConfig::default()
        };
        let h = harness_with(config, ReconnectPolicy::default(), ScriptedFactory::new());
        let bob = h.peer("bob");
        let carol = h.peer("carol");
        h.connected_with(&bob).await;

        let carol_session = carol.invite(MediaKind::Audio);
        settle().await;
        carol.send(carol_session, SignalBody::Bye { reason: Some(ByeReason::Timeout) });
        settle().await;

        h.service.end_call().await.unwrap();
        assert_eq!(h.service.state(), CallState::Ended);
    }

    // ------------------------------------------------------------------
    // Conference
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_conference_keeps_answering_participant() {
        let h = harness();
        let bob = h.peer("bob");
        let _carol = h.peer("carol");

        let id = h
            .service
            .create_conference(
                vec![Invitee::new("bob", "Bob"), Invitee::new("carol", "Carol")],
                MediaKind::Video,
            )
            .await
            .unwrap();

        for to in ["bob", "carol"] {
            let sent = h.sent_to(to);
            assert_eq!(sent.len(), 1);
            assert!(matches!(
                &sent[0],
                SignalBody::Invite(p) if p.call_type == MediaKind::Video && p.kind == CallKind::Conference
            ));
        }

        bob.send(id, SignalBody::Accept);
        settle().await;
        bob.send(id, SignalBody::Answer { sdp: "answer".into() });
        settle().await;
        assert_eq!(h.service.state(), CallState::Connected);

        tokio::time::sleep(Duration::from_secs(31)).await;

        let snapshot = h.service.snapshot().unwrap();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.participant_ids(), vec!["bob".to_string()]);
        assert_eq!(
            h.sent_to("carol").last(),
            Some(&SignalBody::Bye {
                reason: Some(ByeReason::Timeout)
            })
        );
        assert_eq!(h.service.diagnostics().await.unwrap().transports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conference_ends_when_everyone_leaves() {
        let h = harness();
        let bob = h.peer("bob");
        let carol = h.peer("carol");
        let id = h
            .service
            .create_conference(
                vec![Invitee::new("bob", "Bob"), Invitee::new("carol", "Carol")],
                MediaKind::Audio,
            )
            .await
            .unwrap();

        for peer in [&bob, &carol] {
            peer.send(id, SignalBody::Accept);
        }
        settle().await;
        for peer in [&bob, &carol] {
            peer.send(id, SignalBody::Answer { sdp: "answer".into() });
        }
        settle().await;
        assert_eq!(h.service.snapshot().unwrap().connected_count(), 2);

        bob.send(id, SignalBody::Bye { reason: Some(ByeReason::Hangup) });
        settle().await;
        assert_eq!(h.service.state(), CallState::Connected);

        carol.send(id, SignalBody::Bye { reason: Some(ByeReason::Hangup) });
        settle().await;

        assert_eq!(h.service.state(), CallState::Ended);
        assert_eq!(h.end_reason(), Some(EndReason::AllParticipantsLeft));
        assert_eq!(h.factory.open(), 0);
        let diag = h.service.diagnostics().await.unwrap();
        assert_eq!(diag.transports, 0);
        assert_eq!(diag.live_tracks, 0);
    }

    // ------------------------------------------------------------------
    // Controls / teardown
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_toggles_are_involutions() {
        let h = harness();
        assert_eq!(h.service.toggle_mute().await.unwrap(), None);

        let bob = h.peer("bob");
        h.connected_with(&bob).await;

        let before = h.service.snapshot().unwrap().controls;
        let once = h.service.toggle_mute().await.unwrap().unwrap();
        assert_eq!(once.muted, !before.muted);
        let twice = h.service.toggle_mute().await.unwrap().unwrap();
        assert_eq!(twice, before);

        h.service.toggle_speaker().await.unwrap();
        assert!(!h.devices.output_enabled());
        h.service.toggle_speaker().await.unwrap();
        assert!(h.devices.output_enabled());

        h.service.toggle_video().await.unwrap();
        let back = h.service.toggle_video().await.unwrap().unwrap();
        assert_eq!(back, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_releases_everything() {
        let h = harness();
        let bob = h.peer("bob");
        h.connected_with(&bob).await;
        assert_eq!(h.factory.open(), 1);

        h.service.end_call().await.unwrap();

        assert_eq!(h.service.state(), CallState::Ended);
        assert_eq!(h.end_reason(), Some(EndReason::LocalHangup));
        assert_eq!(h.factory.open(), 0);
        assert_eq!(
            h.service.diagnostics().await.unwrap(),
            Diagnostics::default()
        );
        assert_eq!(
            h.sent_to("bob").last(),
            Some(&SignalBody::Bye {
                reason: Some(ByeReason::Hangup)
            })
        );

        let sent = h.sent_by_alice();
        h.service.end_call().await.unwrap();
        h.service.leave_conference().await.unwrap();
        assert_eq!(h.sent_by_alice(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_device_selection() {
        let h = harness();
        let names: Vec<String> = h
            .service
            .output_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"Headset".to_string()));

        h.service.select_output_device("Headset").await.unwrap();
        assert_eq!(h.devices.routed_output().as_deref(), Some("Headset"));
        assert!(h.service.select_output_device("HDMI").await.is_err());
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_lost_transport_ends_call_after_retries() {
        let reconnect = ReconnectPolicy {
            max_attempts: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        };
        let h = harness_with(CallConfig::default(), reconnect, ScriptedFactory::manual());
        let bob = h.peer("bob");
        let mut events = h.service.subscribe();

        let id = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();
        bob.send(id, SignalBody::Accept);
        settle().await;
        bob.send(id, SignalBody::Answer { sdp: "answer".into() });
        settle().await;
        h.factory.emit("bob", TransportEvent::Connected);
        settle().await;
        assert_eq!(h.service.state(), CallState::Connected);

        h.factory.emit("bob", TransportEvent::Disconnected);
        settle().await;
        assert_eq!(
            h.service.snapshot().unwrap().participants["bob"].status,
            LegStatus::Reconnecting
        );

        tokio::time::sleep(Duration::from_secs(40)).await;

        assert_eq!(h.end_reason(), Some(EndReason::PeerConnectionFailed));
        assert_eq!(
            h.sent_to("bob").last(),
            Some(&SignalBody::Bye {
                reason: Some(ByeReason::Failed)
            })
        );
        assert_eq!(h.factory.open(), 0);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Reconnecting { attempt, .. } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers() {
        let h = harness_with(
            CallConfig::default(),
            ReconnectPolicy::default(),
            ScriptedFactory::manual(),
        );
        let bob = h.peer("bob");
        let id = h
            .service
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Audio)
            .await
            .unwrap();
        bob.send(id, SignalBody::Accept);
        settle().await;
        bob.send(id, SignalBody::Answer { sdp: "answer".into() });
        settle().await;
        h.factory.emit("bob", TransportEvent::Connected);
        settle().await;

        h.factory.emit("bob", TransportEvent::Disconnected);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // ICE restart offer went out on the same transport.
        let transport = h.factory.last_for("bob").unwrap();
        assert_eq!(transport.offers(), vec![false, true]);

        h.factory.emit("bob", TransportEvent::Connected);
        settle().await;
        let snapshot = h.service.snapshot().unwrap();
        assert_eq!(snapshot.state, CallState::Connected);
        assert_eq!(snapshot.participants["bob"].status, LegStatus::Connected);
    }

    // ------------------------------------------------------------------
    // Two live services
    // ------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_two_party_call_end_to_end() {
        let relay = MemoryRelay::new();
        let factory = Arc::new(ScriptedFactory::new());
        let alice = spawn_user(
            &relay,
            "alice",
            CallConfig::default(),
            ReconnectPolicy::default(),
            factory.clone(),
            Arc::new(SyntheticDevices::new()),
        );
        let bob = spawn_user(
            &relay,
            "bob",
            CallConfig::default(),
            ReconnectPolicy::default(),
            factory.clone(),
            Arc::new(SyntheticDevices::new()),
        );

        let id = alice
            .initiate_call(Invitee::new("bob", "Bob"), MediaKind::Video)
            .await
            .unwrap();
        settle().await;

        let incoming = bob.snapshot().unwrap();
        assert_eq!(incoming.id, id);
        assert_eq!(incoming.state, CallState::Incoming);
        assert_eq!(incoming.media, MediaKind::Video);

        bob.mark_presented().await.unwrap();
        bob.accept_call().await.unwrap();
        settle().await;

        assert_eq!(alice.state(), CallState::Connected);
        assert_eq!(bob.state(), CallState::Connected);
        assert_eq!(factory.open(), 2);

        alice.end_call().await.unwrap();
        settle().await;

        assert_eq!(bob.snapshot().unwrap().end_reason, Some(EndReason::RemoteHangup));
        assert_eq!(factory.open(), 0);
    }
}
