//! Media Device Controller - local capture and output routing
//!
//! - Checkout/checkin ledger for local streams (one per session)
//! - Mute / video-off / speaker toggles
//! - Output device listing and switching

#[cfg(feature = "cpal")]
mod cpal_backend;
mod device;

#[cfg(feature = "cpal")]
pub use cpal_backend::CpalDevices;
pub use device::{
    CaptureTrack, LocalStream, LocalStreamInfo, MediaBackend, MediaDeviceController, MediaError,
    OutputDevice, StreamId, SyntheticDevices, TrackInfo, TrackKind,
};
