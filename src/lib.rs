//! Portal Call - call signaling and session orchestration
//!
//! Real-time 1:1 and conference calls for the citizen services portal:
//! - Call session state machine (`session`)
//! - Server-relayed signaling over WebSocket with Ed25519-signed frames
//! - One WebRTC peer transport per remote participant, with reconnection
//! - Local media device checkout and output routing
//! - Typed event bridge for assistant-triggered call actions

pub mod app;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
pub mod media;
pub mod presentation;
pub mod session;
pub mod signaling;
pub mod transport;

pub use app::CallApp;
pub use config::AppConfig;
pub use error::CallError;
pub use session::{CallEvent, CallService, CallSession, CallState, EndReason};

const DEFAULT_LOG_FILTER: &str = "portal_call=debug,webrtc=warn";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
