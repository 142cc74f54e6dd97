//! Scripted transports for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{PeerTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory};
use crate::session::MediaKind;

pub(crate) struct ScriptedFactory {
    auto_connect: bool,
    fail_creates: AtomicUsize,
    created: AtomicUsize,
    closed: Arc<AtomicUsize>,
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedFactory {
    /// Transports report `Connected` as soon as both descriptions are set.
    pub(crate) fn new() -> Self {
        Self::with_auto_connect(true)
    }

    /// Transports never connect on their own; drive them with [`emit`].
    ///
    /// [`emit`]: ScriptedFactory::emit
    pub(crate) fn manual() -> Self {
        Self::with_auto_connect(false)
    }

    fn with_auto_connect(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            fail_creates: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `n` creates fail.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Transports created and not yet closed.
    pub(crate) fn open(&self) -> usize {
        self.created() - self.closed()
    }

    pub(crate) fn last_for(&self, participant_id: &str) -> Option<Arc<ScriptedTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|t| t.sink.participant_id() == participant_id)
            .cloned()
    }

    /// Pushes an event through the newest transport for `participant_id`.
    pub(crate) fn emit(&self, participant_id: &str, event: TransportEvent) {
        if let Some(transport) = self.last_for(participant_id) {
            transport.sink.emit(event);
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(
        &self,
        _media: MediaKind,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Setup("scripted failure".into()));
        }

        self.created.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(ScriptedTransport {
            sink: events,
            auto_connect: self.auto_connect,
            offers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            is_closed: AtomicBool::new(false),
            closed_counter: Arc::clone(&self.closed),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

pub(crate) struct ScriptedTransport {
    sink: TransportEventSink,
    auto_connect: bool,
    offers: Mutex<Vec<bool>>,
    candidates: Mutex<Vec<String>>,
    is_closed: AtomicBool,
    closed_counter: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// `ice_restart` flag of every offer created so far.
    pub(crate) fn offers(&self) -> Vec<bool> {
        self.offers.lock().clone()
    }

    pub(crate) fn candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        let mut offers = self.offers.lock();
        offers.push(ice_restart);
        Ok(format!("offer-{}", offers.len()))
    }

    async fn accept_offer(&self, _sdp: String) -> Result<String, TransportError> {
        if self.auto_connect {
            self.sink.emit(TransportEvent::Connected);
        }
        Ok("answer".to_string())
    }

    async fn apply_answer(&self, _sdp: String) -> Result<(), TransportError> {
        if self.auto_connect {
            self.sink.emit(TransportEvent::Connected);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        if !self.is_closed.swap(true, Ordering::SeqCst) {
            self.closed_counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}
