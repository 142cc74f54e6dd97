//! Crate-level error type
//!
//! Module errors (signaling, media, directory) convert into [`CallError`],
//! which is what `CallService` and the event bridge hand back to callers.

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::media::MediaError;
use crate::signaling::SignalingError;

#[derive(Error, Debug, Clone)]
pub enum CallError {
    // ------------------------------------------------------------------
    // Call outcomes
    // ------------------------------------------------------------------
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Signaling server did not respond in time")]
    SignalingTimeout,

    #[error("Remote participant is unreachable")]
    RemoteUnreachable,

    #[error("Remote participant is busy")]
    RemoteBusy,

    #[error("Remote participant rejected the call")]
    RemoteRejected,

    #[error("Peer connection failed")]
    PeerConnectionFailed,

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("No directory entry matches '{0}'")]
    RecipientNotFound(String),

    #[error("No meeting with subject '{0}'")]
    MeetingNotFound(String),

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------
    #[error("Signaling error: {0}")]
    Signaling(SignalingError),

    #[error("Media error: {0}")]
    Media(MediaError),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Call service has stopped")]
    ServiceStopped,
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::Timeout => CallError::SignalingTimeout,
            other => CallError::Signaling(other),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied | MediaError::NoDevice(_) => {
                CallError::MediaAccessDenied(err.to_string())
            }
            other => CallError::Media(other),
        }
    }
}

impl From<DirectoryError> for CallError {
    fn from(err: DirectoryError) -> Self {
        CallError::Directory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MediaKind;

    #[test]
    fn test_permission_errors_become_media_access_denied() {
        assert!(matches!(
            CallError::from(MediaError::PermissionDenied),
            CallError::MediaAccessDenied(_)
        ));
        assert!(matches!(
            CallError::from(MediaError::NoDevice(MediaKind::Video)),
            CallError::MediaAccessDenied(_)
        ));
        assert!(matches!(
            CallError::from(MediaError::UnknownOutput("hdmi".into())),
            CallError::Media(_)
        ));
    }

    #[test]
    fn test_signaling_timeout_is_surfaced_as_taxonomy_error() {
        assert!(matches!(
            CallError::from(SignalingError::Timeout),
            CallError::SignalingTimeout
        ));
        assert!(matches!(
            CallError::from(SignalingError::NotConnected),
            CallError::Signaling(SignalingError::NotConnected)
        ));
    }
}
