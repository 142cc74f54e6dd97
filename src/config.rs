//! Configuration
//!
//! Layered: built-in defaults < `portal-call.toml` < `.env` < environment
//! variables (`PORTAL_CALL__CALL__INVITE_TIMEOUT_SECS=45`, ...).
//! The loaded [`AppConfig`] is passed to constructors explicitly.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::ReconnectPolicy;

pub use config::ConfigError;

const ENV_PREFIX: &str = "PORTAL_CALL";
const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub signaling: SignalingConfig,
    pub call: CallConfig,
    pub reconnect: ReconnectPolicy,
    pub ice: IceConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Loads configuration from `portal-call.toml` (optional) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`AppConfig::load`], with an explicit config file.
    pub fn load_from(file: Option<PathBuf>) -> Result<Self, ConfigError> {
        // .env is optional; missing file is not an error
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("signaling.url", "http://127.0.0.1:8787")?
            .set_default("signaling.heartbeat_secs", 25)?
            .set_default("signaling.register_timeout_secs", 10)?
            .set_default("call.invite_timeout_secs", 30)?
            .set_default("call.negotiation_timeout_secs", 15)?
            .set_default("call.busy_policy", "reject")?
            .set_default("call.max_queued_invites", 1)?
            .set_default("call.teardown_timeout_ms", 2000)?
            .set_default("reconnect.max_attempts", 5)?
            .set_default("reconnect.initial_backoff_ms", 500)?
            .set_default("reconnect.max_backoff_ms", 8000)?
            .set_default("reconnect.multiplier", 2.0)?
            .set_default("ice.stun_urls", vec![DEFAULT_STUN.to_string()])?
            .set_default("media.backend", "synthetic")?;

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("portal-call").required(false)),
        };

        let cfg = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ice.stun_urls")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Relay server base URL; `http(s)` is rewritten to `ws(s)`.
    pub url: String,
    pub heartbeat_secs: u64,
    pub register_timeout_secs: u64,
}

impl SignalingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }
}

/// What to do with an invite that arrives while another call is active.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Reject immediately with reason `busy`
    Reject,
    /// Hold it until the current call ends
    Queue,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    pub invite_timeout_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub busy_policy: BusyPolicy,
    pub max_queued_invites: usize,
    pub teardown_timeout_ms: u64,
}

impl CallConfig {
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: 30,
            negotiation_timeout_secs: 15,
            busy_policy: BusyPolicy::Reject,
            max_queued_invites: 1,
            teardown_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![DEFAULT_STUN.to_string()],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaBackendKind {
    Synthetic,
    Cpal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    pub backend: MediaBackendKind,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Directory for the key file and the directory database.
    /// Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(|| {
            directories::ProjectDirs::from("org", "portal", "portal-call")
                .map(|dirs| dirs.data_dir().to_path_buf())
        })
    }
}
