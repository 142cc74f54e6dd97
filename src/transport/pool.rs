//! Peer Transport Pool
//!
//! Owned by one session. Holds one entry per remote participant and drives
//! the offer/answer/candidate exchange for it. Nothing here awaits network
//! I/O directly: transport work runs on spawned tasks that report back as
//! [`PoolNotice`]s through the session's notice channel, and the session
//! feeds them to [`PeerTransportPool::handle`]. Results that arrive for an
//! entry that was removed or replaced are discarded (and their transport
//! closed).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    PeerTransport, ReconnectPolicy, TransportError, TransportEvent, TransportEventSink,
    TransportFactory,
};
use crate::session::{MediaKind, ParticipantId, SessionId};
use crate::signaling::SignalBody;

// ============================================================================
// NOTICES / OUTPUTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer (the side that received the accept)
    Offerer,
    /// Waits for the offer (the side that accepted)
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalDescription {
    Offer(String),
    Answer(String),
}

/// A pool notice addressed to the session that owns the pool.
pub struct PoolEnvelope {
    pub session_id: SessionId,
    pub notice: PoolNotice,
}

pub enum PoolNotice {
    /// A local offer or answer is ready (or failed)
    Negotiated {
        participant_id: ParticipantId,
        generation: u64,
        transport: Option<Arc<dyn PeerTransport>>,
        outcome: Result<LocalDescription, TransportError>,
    },
    AnswerApplied {
        participant_id: ParticipantId,
        generation: u64,
        outcome: Result<(), TransportError>,
    },
    Transport {
        participant_id: ParticipantId,
        generation: u64,
        event: TransportEvent,
    },
    RetryDue {
        participant_id: ParticipantId,
        generation: u64,
        epoch: u64,
    },
    Deadline {
        participant_id: ParticipantId,
        generation: u64,
        epoch: u64,
    },
}

impl PoolNotice {
    /// Transport carried by the notice, if any. Used to close it when the
    /// notice turns out to be stale.
    pub fn into_transport(self) -> Option<Arc<dyn PeerTransport>> {
        match self {
            PoolNotice::Negotiated { transport, .. } => transport,
            _ => None,
        }
    }
}

/// What the session has to act on after a pool step.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolOutput {
    Signal {
        to: ParticipantId,
        body: SignalBody,
    },
    Connected(ParticipantId),
    Reconnecting {
        participant_id: ParticipantId,
        attempt: u32,
    },
    Failed {
        participant_id: ParticipantId,
        error: String,
    },
}

// ============================================================================
// ENTRIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Negotiating,
    Connected,
    Reconnecting,
}

struct TransportEntry {
    generation: u64,
    role: Role,
    transport: Option<Arc<dyn PeerTransport>>,
    phase: Phase,
    /// Retries since the last successful connect
    attempt: u32,
    /// Bumped whenever pending timers must stop counting
    epoch: u64,
    remote_described: bool,
    pending_candidates: Vec<String>,
    creating: bool,
}

impl TransportEntry {
    fn new(generation: u64, role: Role) -> Self {
        Self {
            generation,
            role,
            transport: None,
            phase: Phase::Negotiating,
            attempt: 0,
            epoch: 0,
            remote_described: false,
            pending_candidates: Vec::new(),
            creating: false,
        }
    }
}

enum Step {
    Offer { ice_restart: bool },
    Answer { sdp: String },
}

// ============================================================================
// POOL
// ============================================================================

pub struct PeerTransportPool {
    session_id: SessionId,
    media: MediaKind,
    factory: Arc<dyn TransportFactory>,
    policy: ReconnectPolicy,
    negotiation_timeout: Duration,
    notices: mpsc::UnboundedSender<PoolEnvelope>,
    entries: HashMap<ParticipantId, TransportEntry>,
    next_generation: u64,
}

impl PeerTransportPool {
    pub fn new(
        session_id: SessionId,
        media: MediaKind,
        factory: Arc<dyn TransportFactory>,
        policy: ReconnectPolicy,
        negotiation_timeout: Duration,
        notices: mpsc::UnboundedSender<PoolEnvelope>,
    ) -> Self {
        Self {
            session_id,
            media,
            factory,
            policy,
            negotiation_timeout,
            notices,
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.entries.contains_key(participant_id)
    }

    pub fn is_connected(&self, participant_id: &str) -> bool {
        self.entries
            .get(participant_id)
            .is_some_and(|e| e.phase == Phase::Connected)
    }

    /// Starts a leg on the offering side: create transport, send offer.
    pub fn open_offerer(&mut self, participant_id: &str) {
        if self.entries.contains_key(participant_id) {
            tracing::debug!(participant = %participant_id, "Transport already open");
            return;
        }
        let generation = self.take_generation();
        let mut entry = TransportEntry::new(generation, Role::Offerer);
        entry.creating = true;
        self.entries.insert(participant_id.to_string(), entry);

        self.spawn_step(participant_id, generation, None, Step::Offer { ice_restart: false });
        self.arm_deadline(participant_id, generation, 0);
    }

    /// Starts a leg on the answering side; the transport is created when
    /// the offer arrives.
    pub fn expect_offer(&mut self, participant_id: &str) {
        if self.entries.contains_key(participant_id) {
            return;
        }
        let generation = self.take_generation();
        self.entries.insert(
            participant_id.to_string(),
            TransportEntry::new(generation, Role::Answerer),
        );
        self.arm_deadline(participant_id, generation, 0);
    }

    pub fn on_remote_offer(&mut self, participant_id: &str, sdp: String) {
        let Some(entry) = self.entries.get_mut(participant_id) else {
            tracing::warn!(participant = %participant_id, "Offer for unknown leg dropped");
            return;
        };
        if entry.role != Role::Answerer {
            tracing::warn!(participant = %participant_id, "Offer received on offering leg, dropped");
            return;
        }
        if entry.transport.is_none() && entry.creating {
            tracing::warn!(participant = %participant_id, "Offer while transport is being created, dropped");
            return;
        }

        entry.remote_described = false;
        entry.creating = entry.transport.is_none();
        let existing = entry.transport.clone();
        let generation = entry.generation;
        self.spawn_step(participant_id, generation, existing, Step::Answer { sdp });
    }

    pub fn on_remote_answer(&mut self, participant_id: &str, sdp: String) {
        let Some(entry) = self.entries.get(participant_id) else {
            tracing::warn!(participant = %participant_id, "Answer for unknown leg dropped");
            return;
        };
        let (Role::Offerer, Some(transport)) = (entry.role, entry.transport.clone()) else {
            tracing::warn!(participant = %participant_id, "Answer without a pending offer dropped");
            return;
        };

        let generation = entry.generation;
        let envelope_tx = self.notices.clone();
        let session_id = self.session_id;
        let participant_id = participant_id.to_string();
        tokio::spawn(async move {
            let outcome = transport.apply_answer(sdp).await;
            let _ = envelope_tx.send(PoolEnvelope {
                session_id,
                notice: PoolNotice::AnswerApplied {
                    participant_id,
                    generation,
                    outcome,
                },
            });
        });
    }

    /// Remote candidates are held back until the remote description is in
    /// place.
    pub fn on_remote_candidate(&mut self, participant_id: &str, candidate: String) {
        let Some(entry) = self.entries.get_mut(participant_id) else {
            tracing::debug!(participant = %participant_id, "Candidate for unknown leg dropped");
            return;
        };
        match (&entry.transport, entry.remote_described) {
            (Some(transport), true) => spawn_add_candidates(transport.clone(), vec![candidate]),
            _ => entry.pending_candidates.push(candidate),
        }
    }

    /// Applies one notice. Stale notices are dropped.
    pub fn handle(&mut self, notice: PoolNotice) -> Vec<PoolOutput> {
        match notice {
            PoolNotice::Negotiated {
                participant_id,
                generation,
                transport,
                outcome,
            } => self.on_negotiated(participant_id, generation, transport, outcome),

            PoolNotice::AnswerApplied {
                participant_id,
                generation,
                outcome,
            } => {
                let Some(entry) = self.live_entry(&participant_id, generation) else {
                    return Vec::new();
                };
                match outcome {
                    Ok(()) => {
                        entry.remote_described = true;
                        flush_candidates(entry);
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::warn!(participant = %participant_id, "Applying answer failed: {}", e);
                        self.retry(&participant_id, e.to_string())
                    }
                }
            }

            PoolNotice::Transport {
                participant_id,
                generation,
                event,
            } => self.on_transport_event(participant_id, generation, event),

            PoolNotice::RetryDue {
                participant_id,
                generation,
                epoch,
            } => {
                let Some(entry) = self.live_entry(&participant_id, generation) else {
                    return Vec::new();
                };
                if entry.epoch != epoch || entry.phase != Phase::Reconnecting {
                    return Vec::new();
                }

                if entry.role == Role::Offerer && !entry.creating {
                    entry.remote_described = false;
                    entry.creating = entry.transport.is_none();
                    let existing = entry.transport.clone();
                    let ice_restart = existing.is_some();
                    tracing::info!(
                        participant = %participant_id,
                        attempt = entry.attempt,
                        ice_restart,
                        "Renegotiating transport"
                    );
                    self.spawn_step(&participant_id, generation, existing, Step::Offer { ice_restart });
                }
                self.arm_deadline(&participant_id, generation, epoch);
                Vec::new()
            }

            PoolNotice::Deadline {
                participant_id,
                generation,
                epoch,
            } => {
                let Some(entry) = self.live_entry(&participant_id, generation) else {
                    return Vec::new();
                };
                if entry.epoch != epoch || entry.phase == Phase::Connected {
                    return Vec::new();
                }
                tracing::warn!(participant = %participant_id, "Negotiation timed out");
                self.retry(&participant_id, "negotiation timed out".to_string())
            }
        }
    }

    /// Tears down one leg. The entry is gone when this returns; the
    /// transport close runs in the background.
    pub fn remove(&mut self, participant_id: &str) -> bool {
        match self.entries.remove(participant_id) {
            Some(entry) => {
                if let Some(transport) = entry.transport {
                    spawn_close(transport);
                }
                true
            }
            None => false,
        }
    }

    /// Empties the pool and hands back the transports so the caller can
    /// await their shutdown.
    pub fn close_all(&mut self) -> Vec<Arc<dyn PeerTransport>> {
        self.entries
            .drain()
            .filter_map(|(_, entry)| entry.transport)
            .collect()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn on_negotiated(
        &mut self,
        participant_id: ParticipantId,
        generation: u64,
        transport: Option<Arc<dyn PeerTransport>>,
        outcome: Result<LocalDescription, TransportError>,
    ) -> Vec<PoolOutput> {
        let Some(entry) = self.live_entry(&participant_id, generation) else {
            if let Some(transport) = transport {
                spawn_close(transport);
            }
            return Vec::new();
        };

        entry.creating = false;
        if entry.transport.is_none() {
            entry.transport = transport;
        }

        match outcome {
            Ok(LocalDescription::Offer(sdp)) => vec![PoolOutput::Signal {
                to: participant_id,
                body: SignalBody::Offer { sdp },
            }],
            Ok(LocalDescription::Answer(sdp)) => {
                entry.remote_described = true;
                flush_candidates(entry);
                vec![PoolOutput::Signal {
                    to: participant_id,
                    body: SignalBody::Answer { sdp },
                }]
            }
            Err(e) => {
                tracing::warn!(participant = %participant_id, "Negotiation step failed: {}", e);
                self.retry(&participant_id, e.to_string())
            }
        }
    }

    fn on_transport_event(
        &mut self,
        participant_id: ParticipantId,
        generation: u64,
        event: TransportEvent,
    ) -> Vec<PoolOutput> {
        let Some(entry) = self.live_entry(&participant_id, generation) else {
            return Vec::new();
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => vec![PoolOutput::Signal {
                to: participant_id,
                body: SignalBody::Candidate { candidate },
            }],
            TransportEvent::Connected => {
                if entry.phase == Phase::Connected {
                    return Vec::new();
                }
                entry.phase = Phase::Connected;
                entry.attempt = 0;
                entry.epoch += 1;
                tracing::info!(participant = %participant_id, "Transport connected");
                vec![PoolOutput::Connected(participant_id)]
            }
            TransportEvent::Disconnected | TransportEvent::Failed(_) => {
                if entry.phase == Phase::Reconnecting {
                    return Vec::new();
                }
                let reason = match event {
                    TransportEvent::Failed(reason) => reason,
                    _ => "disconnected".to_string(),
                };
                tracing::warn!(participant = %participant_id, %reason, "Transport lost");
                self.retry(&participant_id, reason)
            }
        }
    }

    /// Counts one retry; past the ceiling the leg is removed and reported
    /// as failed.
    fn retry(&mut self, participant_id: &str, reason: String) -> Vec<PoolOutput> {
        let Some(entry) = self.entries.get_mut(participant_id) else {
            return Vec::new();
        };
        entry.attempt += 1;
        entry.epoch += 1;
        let (attempt, epoch, generation) = (entry.attempt, entry.epoch, entry.generation);

        if !self.policy.allows(attempt) {
            tracing::error!(
                participant = %participant_id,
                attempts = attempt - 1,
                "Giving up on transport"
            );
            self.remove(participant_id);
            return vec![PoolOutput::Failed {
                participant_id: participant_id.to_string(),
                error: reason,
            }];
        }

        entry.phase = Phase::Reconnecting;
        let delay = self.policy.delay(attempt);
        tracing::info!(participant = %participant_id, attempt, ?delay, "Scheduling reconnect");

        self.post_after(
            delay,
            PoolNotice::RetryDue {
                participant_id: participant_id.to_string(),
                generation,
                epoch,
            },
        );

        vec![PoolOutput::Reconnecting {
            participant_id: participant_id.to_string(),
            attempt,
        }]
    }

    fn live_entry(&mut self, participant_id: &str, generation: u64) -> Option<&mut TransportEntry> {
        self.entries
            .get_mut(participant_id)
            .filter(|entry| entry.generation == generation)
    }

    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn arm_deadline(&self, participant_id: &str, generation: u64, epoch: u64) {
        self.post_after(
            self.negotiation_timeout,
            PoolNotice::Deadline {
                participant_id: participant_id.to_string(),
                generation,
                epoch,
            },
        );
    }

    fn post_after(&self, delay: Duration, notice: PoolNotice) {
        let tx = self.notices.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PoolEnvelope { session_id, notice });
        });
    }

    fn spawn_step(
        &self,
        participant_id: &str,
        generation: u64,
        existing: Option<Arc<dyn PeerTransport>>,
        step: Step,
    ) {
        let factory = Arc::clone(&self.factory);
        let media = self.media;
        let tx = self.notices.clone();
        let session_id = self.session_id;
        let sink = TransportEventSink::new(
            session_id,
            participant_id.to_string(),
            generation,
            tx.clone(),
        );
        let participant_id = participant_id.to_string();

        tokio::spawn(async move {
            let transport = match existing {
                Some(transport) => Ok(transport),
                None => factory.create(media, sink).await,
            };

            let (transport, outcome) = match transport {
                Ok(transport) => {
                    let outcome = match step {
                        Step::Offer { ice_restart } => transport
                            .create_offer(ice_restart)
                            .await
                            .map(LocalDescription::Offer),
                        Step::Answer { sdp } => transport
                            .accept_offer(sdp)
                            .await
                            .map(LocalDescription::Answer),
                    };
                    (Some(transport), outcome)
                }
                Err(e) => (None, Err(e)),
            };

            let _ = tx.send(PoolEnvelope {
                session_id,
                notice: PoolNotice::Negotiated {
                    participant_id,
                    generation,
                    transport,
                    outcome,
                },
            });
        });
    }
}

fn flush_candidates(entry: &mut TransportEntry) {
    if entry.pending_candidates.is_empty() {
        return;
    }
    if let Some(transport) = &entry.transport {
        let candidates = std::mem::take(&mut entry.pending_candidates);
        spawn_add_candidates(transport.clone(), candidates);
    }
}

fn spawn_add_candidates(transport: Arc<dyn PeerTransport>, candidates: Vec<String>) {
    tokio::spawn(async move {
        for candidate in candidates {
            if let Err(e) = transport.add_remote_candidate(candidate).await {
                tracing::warn!("Failed to add ICE candidate: {}", e);
            }
        }
    });
}

fn spawn_close(transport: Arc<dyn PeerTransport>) {
    tokio::spawn(async move {
        transport.close().await;
    });
}

// ============================================================================
// TESTS
// ============================================================================
