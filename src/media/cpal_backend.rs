//! Device backend on top of cpal.
//!
//! Capture availability and output enumeration come from the default host.
//! Audio frames are not pumped here; the transport layer owns media flow.

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::device::{CaptureTrack, MediaBackend, MediaError, OutputDevice, TrackInfo, TrackKind};
use crate::session::MediaKind;

pub struct CpalDevices {
    host: cpal::Host,
    routed: Mutex<Option<String>>,
    output_enabled: AtomicBool,
}

// cpal::Host is only touched behind &self for enumeration
unsafe impl Send for CpalDevices {}
unsafe impl Sync for CpalDevices {}

impl CpalDevices {
    pub fn new() -> Self {
        let host = cpal::default_host();
        tracing::info!(host = ?host.id(), "Using cpal audio host");
        Self {
            host,
            routed: Mutex::new(None),
            output_enabled: AtomicBool::new(true),
        }
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for CpalDevices {
    fn open_capture(&self, media: MediaKind) -> Result<Vec<CaptureTrack>, MediaError> {
        if media.has_video() {
            // cpal has no camera access
            return Err(MediaError::NoDevice(MediaKind::Video));
        }

        let device = self
            .host
            .default_input_device()
            .ok_or(MediaError::NoDevice(MediaKind::Audio))?;

        // A refused microphone permission surfaces as a config query failure.
        device
            .default_input_config()
            .map_err(|_| MediaError::PermissionDenied)?;

        let label = device
            .name()
            .unwrap_or_else(|_| "default microphone".to_string());
        tracing::info!(device = %label, "Opened capture device");

        Ok(vec![CaptureTrack {
            kind: TrackKind::Audio,
            label,
        }])
    }

    fn stop_track(&self, track: &TrackInfo) {
        tracing::debug!(track = %track.id, label = %track.label, "Capture track stopped");
    }

    fn set_track_enabled(&self, track: &TrackInfo, enabled: bool) {
        tracing::debug!(track = %track.id, enabled, "Capture track toggled");
    }

    fn output_devices(&self) -> Result<Vec<OutputDevice>, MediaError> {
        let default_name = self
            .host
            .default_output_device()
            .and_then(|d| d.name().ok());

        let devices = self
            .host
            .output_devices()
            .map_err(|e| MediaError::Backend(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| OutputDevice {
                    is_default: Some(&name) == default_name.as_ref(),
                    name,
                })
            })
            .collect();

        Ok(devices)
    }

    fn route_output(&self, device: &OutputDevice) -> Result<(), MediaError> {
        tracing::info!(device = %device.name, "Routing output");
        *self.routed.lock() = Some(device.name.clone());
        Ok(())
    }

    fn set_output_enabled(&self, enabled: bool) {
        self.output_enabled.store(enabled, Ordering::SeqCst);
    }
}
