//! Media Device Controller
//!
//! Hands out local capture streams and keeps a ledger of what is checked
//! out. Each session may hold at most one stream; the stream handle is
//! move-only, so it is released exactly once.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{MediaKind, SessionId};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Device permission refused")]
    PermissionDenied,

    #[error("No {0} capture device available")]
    NoDevice(MediaKind),

    #[error("Session {0} already holds a local stream")]
    AlreadyAcquired(SessionId),

    #[error("Unknown output device: {0}")]
    UnknownOutput(String),

    #[error("Device backend error: {0}")]
    Backend(String),
}

// ============================================================================
// TRACKS / STREAMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a backend opened for one capture track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTrack {
    pub kind: TrackKind,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
    pub enabled: bool,
}

/// Observable view of a checked-out local stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStreamInfo {
    pub id: StreamId,
    pub media: MediaKind,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDevice {
    pub name: String,
    pub is_default: bool,
}

// ============================================================================
// BACKEND
// ============================================================================

/// Platform device access.
pub trait MediaBackend: Send + Sync {
    /// Opens capture for `media`. Audio calls get one audio track, video
    /// calls an audio and a video track.
    fn open_capture(&self, media: MediaKind) -> Result<Vec<CaptureTrack>, MediaError>;

    fn stop_track(&self, track: &TrackInfo);

    fn set_track_enabled(&self, track: &TrackInfo, enabled: bool);

    fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError>;

    fn route_output(&self, device: &OutputDevice) -> Result<(), MediaError>;

    /// Speaker on/off for remote audio.
    fn set_output_enabled(&self, enabled: bool);
}

// ============================================================================
// CONTROLLER
// ============================================================================

struct CheckedOut {
    owner: SessionId,
    media: MediaKind,
    tracks: Vec<TrackInfo>,
}

struct ControllerInner {
    backend: Arc<dyn MediaBackend>,
    ledger: Mutex<HashMap<StreamId, CheckedOut>>,
}

impl ControllerInner {
    fn check_in(&self, id: StreamId) {
        let Some(entry) = self.ledger.lock().remove(&id) else {
            return;
        };
        for track in &entry.tracks {
            self.backend.stop_track(track);
        }
        tracing::debug!(stream = %id, session = %entry.owner, "Local stream released");
    }
}

/// Exclusive handle to a checked-out local stream.
///
/// Not `Clone`. Give it back with [`MediaDeviceController::release`];
/// dropping it unreleased checks it in anyway and logs a warning.
pub struct LocalStream {
    id: StreamId,
    owner: SessionId,
    media: MediaKind,
    controller: Weak<ControllerInner>,
    checked_in: bool,
}

impl LocalStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn owner(&self) -> SessionId {
        self.owner
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    fn check_in(&mut self) {
        if self.checked_in {
            return;
        }
        self.checked_in = true;
        if let Some(inner) = self.controller.upgrade() {
            inner.check_in(self.id);
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        if !self.checked_in {
            tracing::warn!(stream = %self.id, session = %self.owner, "Local stream dropped without release");
            self.check_in();
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("media", &self.media)
            .finish()
    }
}

#[derive(Clone)]
pub struct MediaDeviceController {
    inner: Arc<ControllerInner>,
}

impl MediaDeviceController {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                backend,
                ledger: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Checks out a capture stream for `owner`.
    pub fn acquire(&self, owner: SessionId, media: MediaKind) -> Result<LocalStream, MediaError> {
        let mut ledger = self.inner.ledger.lock();
        if ledger.values().any(|entry| entry.owner == owner) {
            return Err(MediaError::AlreadyAcquired(owner));
        }

        let captured = self.inner.backend.open_capture(media)?;
        let tracks = captured
            .into_iter()
            .map(|track| TrackInfo {
                id: Uuid::new_v4().to_string(),
                kind: track.kind,
                label: track.label,
                enabled: true,
            })
            .collect();

        let id = StreamId(Uuid::new_v4());
        ledger.insert(
            id,
            CheckedOut {
                owner,
                media,
                tracks,
            },
        );
        tracing::debug!(stream = %id, session = %owner, %media, "Local stream acquired");

        Ok(LocalStream {
            id,
            owner,
            media,
            controller: Arc::downgrade(&self.inner),
            checked_in: false,
        })
    }

    /// Stops the stream's tracks and checks it back in.
    pub fn release(&self, mut stream: LocalStream) {
        stream.check_in();
    }

    pub fn set_muted(&self, stream: &LocalStream, muted: bool) {
        self.set_enabled(stream, TrackKind::Audio, !muted);
    }

    pub fn set_video_off(&self, stream: &LocalStream, video_off: bool) {
        self.set_enabled(stream, TrackKind::Video, !video_off);
    }

    pub fn set_speaker(&self, on: bool) {
        self.inner.backend.set_output_enabled(on);
    }

    pub fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError> {
        self.inner.backend.output_devices()
    }

    /// Routes remote audio to the output device called `name`.
    pub fn select_output(&self, name: &str) -> Result<(), MediaError> {
        let device = self
            .output_devices()?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| MediaError::UnknownOutput(name.to_string()))?;
        self.inner.backend.route_output(&device)
    }

    pub fn describe(&self, stream: &LocalStream) -> Option<LocalStreamInfo> {
        self.inner
            .ledger
            .lock()
            .get(&stream.id)
            .map(|entry| LocalStreamInfo {
                id: stream.id,
                media: entry.media,
                tracks: entry.tracks.clone(),
            })
    }

    /// Tracks currently capturing across all checked-out streams.
    pub fn live_tracks(&self) -> usize {
        self.inner
            .ledger
            .lock()
            .values()
            .map(|entry| entry.tracks.len())
            .sum()
    }

    /// Streams currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.ledger.lock().len()
    }

    fn set_enabled(&self, stream: &LocalStream, kind: TrackKind, enabled: bool) {
        let mut ledger = self.inner.ledger.lock();
        let Some(entry) = ledger.get_mut(&stream.id) else {
            return;
        };
        for track in entry.tracks.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
            self.inner.backend.set_track_enabled(track, enabled);
        }
    }
}

impl fmt::Debug for MediaDeviceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaDeviceController")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

// ============================================================================
// SYNTHETIC BACKEND
// ============================================================================

/// Device backend with no hardware behind it.
///
/// Used by headless deployments and tests; permission can be refused to
/// exercise the denial path.
pub struct SyntheticDevices {
    permission_granted: AtomicBool,
    output_enabled: AtomicBool,
    outputs: Vec<OutputDevice>,
    routed: Mutex<Option<String>>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            permission_granted: AtomicBool::new(true),
            output_enabled: AtomicBool::new(true),
            outputs: vec![
                OutputDevice {
                    name: "Built-in Output".to_string(),
                    is_default: true,
                },
                OutputDevice {
                    name: "Headset".to_string(),
                    is_default: false,
                },
            ],
            routed: Mutex::new(None),
        }
    }

    pub fn deny_permission(&self) {
        self.permission_granted.store(false, Ordering::SeqCst);
    }

    pub fn grant_permission(&self) {
        self.permission_granted.store(true, Ordering::SeqCst);
    }

    pub fn output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    pub fn routed_output(&self) -> Option<String> {
        self.routed.lock().clone()
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for SyntheticDevices {
    fn open_capture(&self, media: MediaKind) -> Result<Vec<CaptureTrack>, MediaError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }

        let mut tracks = vec![CaptureTrack {
            kind: TrackKind::Audio,
            label: "synthetic-microphone".to_string(),
        }];
        if media.has_video() {
            tracks.push(CaptureTrack {
                kind: TrackKind::Video,
                label: "synthetic-camera".to_string(),
            });
        }
        Ok(tracks)
    }

    fn stop_track(&self, _track: &TrackInfo) {}

    fn set_track_enabled(&self, _track: &TrackInfo, _enabled: bool) {}

    fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError> {
        Ok(self.outputs.clone())
    }

    fn route_output(&self, device: &OutputDevice) -> Result<(), MediaError> {
        *self.routed.lock() = Some(device.name.clone());
        Ok(())
    }

    fn set_output_enabled(&self, enabled: bool) {
        self.output_enabled.store(enabled, Ordering::SeqCst);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (MediaDeviceController, Arc<SyntheticDevices>) {
        let devices = Arc::new(SyntheticDevices::new());
        (MediaDeviceController::new(devices.clone()), devices)
    }

    #[test]
    fn test_acquire_and_release() {
        let (media, _) = controller();
        let stream = media.acquire(SessionId::new(), MediaKind::Video).unwrap();
        assert_eq!(media.outstanding(), 1);
        assert_eq!(media.live_tracks(), 2);

        media.release(stream);
        assert_eq!(media.outstanding(), 0);
        assert_eq!(media.live_tracks(), 0);
    }

    #[test]
    fn test_second_acquire_for_same_session_is_refused() {
        let (media, _) = controller();
        let owner = SessionId::new();
        let _stream = media.acquire(owner, MediaKind::Audio).unwrap();

        assert!(matches!(
            media.acquire(owner, MediaKind::Audio),
            Err(MediaError::AlreadyAcquired(id)) if id == owner
        ));
        assert!(media.acquire(SessionId::new(), MediaKind::Audio).is_ok());
    }

    #[test]
    fn test_dropped_stream_is_checked_in() {
        let (media, _) = controller();
        {
            let _stream = media.acquire(SessionId::new(), MediaKind::Audio).unwrap();
            assert_eq!(media.live_tracks(), 1);
        }
        assert_eq!(media.live_tracks(), 0);
    }

    #[test]
    fn test_permission_refused() {
        let (media, devices) = controller();
        devices.deny_permission();
        assert!(matches!(
            media.acquire(SessionId::new(), MediaKind::Audio),
            Err(MediaError::PermissionDenied)
        ));
        assert_eq!(media.outstanding(), 0);
    }

    #[test]
    fn test_mute_disables_audio_track_only() {
        let (media, _) = controller();
        let stream = media.acquire(SessionId::new(), MediaKind::Video).unwrap();
        media.set_muted(&stream, true);

        let info = media.describe(&stream).unwrap();
        let audio = info.tracks.iter().find(|t| t.kind == TrackKind::Audio).unwrap();
        let video = info.tracks.iter().find(|t| t.kind == TrackKind::Video).unwrap();
        assert!(!audio.enabled);
        assert!(video.enabled);

        media.release(stream);
    }

    #[test]
    fn test_output_switching() {
        let (media, devices) = controller();
        media.select_output("Headset").unwrap();
        assert_eq!(devices.routed_output().as_deref(), Some("Headset"));

        assert!(matches!(
            media.select_output("HDMI"),
            Err(MediaError::UnknownOutput(_))
        ));

        media.set_speaker(false);
        assert!(!devices.output_enabled());
    }
}
