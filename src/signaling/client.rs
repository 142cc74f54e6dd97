//! WebSocket client for the relay server
//!
//! - Register frame carrying the public key
//! - Every outbound frame signed (timestamp + Ed25519 over canonical JSON)
//! - Split reader/writer tasks, periodic heartbeat
//! - Relayed call-control messages forwarded into the inbound queue

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::channel::{SignalingChannel, SignalingError};
use super::messages::{MessageId, SignalingMessage};
use crate::config::SignalingConfig;
use crate::crypto::KeyPair;
use crate::session::LocalUser;

const OUTBOUND_CAPACITY: usize = 100;

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Client → server
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Register {
        user_id: String,
        display_name: String,
        public_key: String,
    },
    Relay {
        message: SignalingMessage,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat { user_id: String },
}

/// Server → client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Registered { user_id: String },
    Relay {
        message: SignalingMessage,
    },
    #[serde(rename_all = "camelCase")]
    Undeliverable {
        message_id: MessageId,
        target_id: String,
    },
    Error {
        code: i32,
        message: String,
    },
    Pong,
}

/// Adds `timestamp` and `signature` to a frame and serializes it.
fn seal(keypair: &KeyPair, frame: &ClientFrame) -> Result<String, SignalingError> {
    let mut value =
        serde_json::to_value(frame).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

    let Some(obj) = value.as_object_mut() else {
        return Err(SignalingError::SendFailed("frame is not an object".into()));
    };
    obj.insert(
        "timestamp".to_string(),
        Value::Number(Utc::now().timestamp_millis().into()),
    );

    let signature = keypair.sign_frame(&value);
    if let Some(obj) = value.as_object_mut() {
        obj.insert("signature".to_string(), Value::String(signature));
    }

    serde_json::to_string(&value).map_err(|e| SignalingError::SendFailed(e.to_string()))
}

/// `http(s)://host` → `ws(s)://host/ws`
fn ws_url(base: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(base).map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::ConnectionFailed(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::ConnectionFailed("cannot rewrite scheme".into()))?;
    url.set_path("/ws");
    Ok(url)
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

pub struct SignalingClient {
    local_id: String,
    keypair: Arc<KeyPair>,
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SignalingClient {
    /// Connects, registers `local` and starts the background tasks.
    /// Relayed messages are pushed into `inbound`.
    pub async fn connect(
        config: &SignalingConfig,
        keypair: Arc<KeyPair>,
        local: &LocalUser,
        inbound: mpsc::Sender<SignalingMessage>,
    ) -> Result<Self, SignalingError> {
        let url = ws_url(&config.url)?;
        tracing::info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let (reg_tx, reg_rx) = oneshot::channel::<Result<String, SignalingError>>();

        let reader = {
            let connected = Arc::clone(&connected);
            tokio::spawn(async move {
                let mut registration = Some(reg_tx);
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => {
                                if !on_server_frame(frame, &mut registration, &inbound).await {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("Unparseable server frame: {}", e),
                        },
                        Ok(Message::Close(_)) => {
                            tracing::info!("WebSocket closed by server");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                connected.store(false, Ordering::SeqCst);
                tracing::info!("Signaling connection closed");
            })
        };

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let mut client = Self {
            local_id: local.id.clone(),
            keypair,
            outbound,
            connected,
            tasks: vec![reader, writer],
        };

        let register = ClientFrame::Register {
            user_id: local.id.clone(),
            display_name: local.display_name.clone(),
            public_key: client.keypair.public_key_base64(),
        };
        client.push(&register).await?;

        match tokio::time::timeout(config.register_timeout(), reg_rx).await {
            Ok(Ok(Ok(user_id))) => tracing::info!("Registered as {}", user_id),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(SignalingError::RegistrationFailed(
                    "connection closed before registration".into(),
                ))
            }
            Err(_) => {
                tracing::warn!("No registration reply within {:?}", config.register_timeout());
                return Err(SignalingError::Timeout);
            }
        }

        client.start_heartbeat(config);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn push(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        let sealed = seal(&self.keypair, frame)?;
        self.outbound
            .send(sealed)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn start_heartbeat(&mut self, config: &SignalingConfig) {
        let keypair = Arc::clone(&self.keypair);
        let outbound = self.outbound.clone();
        let connected = Arc::clone(&self.connected);
        let period = config.heartbeat_interval();
        let frame = ClientFrame::Heartbeat {
            user_id: self.local_id.clone(),
        };

        self.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                let sealed = match seal(&keypair, &frame) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        tracing::warn!("Failed to seal heartbeat: {}", e);
                        continue;
                    }
                };
                if outbound.send(sealed).await.is_err() {
                    break;
                }
            }
        }));
    }
}

/// Returns `false` when the reader should stop.
async fn on_server_frame(
    frame: ServerFrame,
    registration: &mut Option<oneshot::Sender<Result<String, SignalingError>>>,
    inbound: &mpsc::Sender<SignalingMessage>,
) -> bool {
    match frame {
        ServerFrame::Registered { user_id } => {
            if let Some(tx) = registration.take() {
                let _ = tx.send(Ok(user_id));
            }
        }
        ServerFrame::Relay { message } => {
            tracing::debug!(
                id = %message.id,
                kind = ?message.kind(),
                from = %message.sender_id,
                "Relayed message received"
            );
            if inbound.send(message).await.is_err() {
                tracing::info!("Inbound queue closed, stopping reader");
                return false;
            }
        }
        ServerFrame::Undeliverable {
            message_id,
            target_id,
        } => {
            tracing::warn!(%message_id, target = %target_id, "Relay could not deliver message");
        }
        ServerFrame::Error { code, message } => {
            tracing::error!("Server error {}: {}", code, message);
            if let Some(tx) = registration.take() {
                let _ = tx.send(Err(SignalingError::ServerError { code, message }));
            }
        }
        ServerFrame::Pong => tracing::trace!("Heartbeat acknowledged"),
    }
    true
}

impl SignalingChannel for SignalingClient {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let sealed = seal(&self.keypair, &ClientFrame::Relay { message })?;
        self.outbound
            .try_send(sealed)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("local_id", &self.local_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
