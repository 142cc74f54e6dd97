//! Application wiring
//!
//! Builds every collaborator from an [`AppConfig`] and hands them to each
//! other explicitly. Whoever needs the call service gets it from here.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bridge::{BridgeEvent, BridgeHandle, EventBridge, EventBus, InMemoryMeetings};
use crate::config::{AppConfig, MediaBackendKind, StorageConfig};
use crate::crypto::KeyPair;
use crate::directory::SqliteDirectory;
use crate::error::CallError;
use crate::media::{MediaBackend, MediaDeviceController, SyntheticDevices};
use crate::presentation::CallSurface;
use crate::session::{CallDeps, CallService, LocalUser, SessionId};
use crate::signaling::SignalingClient;
use crate::transport::WebRtcTransportFactory;

const KEY_FILE: &str = "signing.key";
const INBOUND_CAPACITY: usize = 256;

pub struct CallApp {
    local: LocalUser,
    service: CallService,
    directory: Arc<SqliteDirectory>,
    signaling: Arc<SignalingClient>,
    bus: EventBus<BridgeEvent>,
    bridge: EventBridge,
    _bridge_loop: BridgeHandle,
}

impl CallApp {
    /// Connects to the relay as `local` and starts the call service.
    pub async fn start(config: AppConfig, local: LocalUser) -> anyhow::Result<Self> {
        let data_dir = data_dir(&config.storage)?;

        let keypair = KeyPair::load_or_create(&data_dir.join(KEY_FILE))
            .context("Failed to load signing key")?;
        tracing::info!(public_key = %keypair.public_key_base64(), "Loaded signing key");

        let directory = Arc::new(
            SqliteDirectory::open(&data_dir).context("Failed to open directory database")?,
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let signaling = Arc::new(
            SignalingClient::connect(&config.signaling, Arc::new(keypair), &local, inbound_tx)
                .await
                .with_context(|| format!("Failed to register with {}", config.signaling.url))?,
        );

        let transports = Arc::new(
            WebRtcTransportFactory::new(&config.ice).context("Failed to set up WebRTC")?,
        );
        let media = MediaDeviceController::new(media_backend(config.media.backend));

        let service = CallService::spawn(
            CallDeps {
                local: local.clone(),
                config: config.call.clone(),
                reconnect: config.reconnect.clone(),
                signaling: signaling.clone(),
                media,
                transports,
            },
            inbound_rx,
        );

        let bus = EventBus::new();
        let bridge = EventBridge::new(
            service.clone(),
            directory.clone(),
            Arc::new(InMemoryMeetings::new()),
        );
        let bridge_loop = bridge.clone().spawn(&bus);

        tracing::info!(user = %local.id, "Call app ready");
        Ok(Self {
            local,
            service,
            directory,
            signaling,
            bus,
            bridge,
            _bridge_loop: bridge_loop,
        })
    }

    /// Opens the local directory without touching the network.
    pub fn open_directory(storage: &StorageConfig) -> anyhow::Result<SqliteDirectory> {
        let data_dir = data_dir(storage)?;
        SqliteDirectory::open(&data_dir).context("Failed to open directory database")
    }

    pub fn local(&self) -> &LocalUser {
        &self.local
    }

    pub fn service(&self) -> &CallService {
        &self.service
    }

    pub fn directory(&self) -> &SqliteDirectory {
        &self.directory
    }

    /// Bus other subsystems publish call actions on.
    pub fn bus(&self) -> &EventBus<BridgeEvent> {
        &self.bus
    }

    pub fn surface(&self) -> CallSurface {
        CallSurface::new(self.service.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Runs a bridge event directly and reports its result.
    pub async fn dispatch(&self, event: BridgeEvent) -> Result<Option<SessionId>, CallError> {
        self.bridge.dispatch(event).await
    }

    /// Ends any active call before the app goes away.
    pub async fn shutdown(self) {
        if let Err(e) = self.service.end_call().await {
            tracing::warn!("Failed to end call on shutdown: {}", e);
        }
        tracing::info!(user = %self.local.id, "Call app stopped");
    }
}

fn data_dir(storage: &StorageConfig) -> anyhow::Result<PathBuf> {
    storage
        .resolve_data_dir()
        .context("No data directory available; set storage.data_dir")
}

fn media_backend(kind: MediaBackendKind) -> Arc<dyn MediaBackend> {
    match kind {
        MediaBackendKind::Synthetic => Arc::new(SyntheticDevices::new()),
        #[cfg(feature = "cpal")]
        MediaBackendKind::Cpal => Arc::new(crate::media::CpalDevices::new()),
        #[cfg(not(feature = "cpal"))]
        MediaBackendKind::Cpal => {
            tracing::warn!("Built without the `cpal` feature, using synthetic devices");
            Arc::new(SyntheticDevices::new())
        }
    }
}
