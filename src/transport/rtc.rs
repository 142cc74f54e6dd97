//! Production transports on the `webrtc` crate.

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::{PeerTransport, TransportError, TransportEvent, TransportEventSink, TransportFactory};
use crate::config::IceConfig;
use crate::session::MediaKind;

const AUDIO_CLOCK_RATE: u32 = 48_000;
const VIDEO_CLOCK_RATE: u32 = 90_000;
const STREAM_ID: &str = "portal-call";

fn setup_err(e: webrtc::Error) -> TransportError {
    TransportError::Setup(e.to_string())
}

fn negotiation_err(e: webrtc::Error) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// STUN servers from the config, plus the TURN relay when one is set.
pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if let Some(url) = &config.turn_url {
        servers.push(RTCIceServer {
            urls: vec![url.clone()],
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }
    servers
}

// ============================================================================
// FACTORY
// ============================================================================

pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(config: &IceConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_err)?;

        // RTCP reports, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers(config),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        media: MediaKind,
        events: TransportEventSink,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(setup_err)?,
        );

        let audio = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ));
        pc.add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(setup_err)?;

        if media.has_video() {
            let video = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                "video".to_string(),
                STREAM_ID.to_string(),
            ));
            pc.add_track(video as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(setup_err)?;
        }

        install_handlers(&pc, events);
        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: TransportEventSink) {
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!(participant = %sink.participant_id(), "Peer connection state: {:?}", s);
        match s {
            RTCPeerConnectionState::Connected => sink.emit(TransportEvent::Connected),
            RTCPeerConnectionState::Disconnected => sink.emit(TransportEvent::Disconnected),
            RTCPeerConnectionState::Failed => {
                sink.emit(TransportEvent::Failed("peer connection failed".to_string()))
            }
            _ => {}
        }
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|init| serde_json::to_string(&init)) {
                Ok(Ok(json)) => sink.emit(TransportEvent::LocalCandidate(json)),
                Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                Err(e) => tracing::warn!("Failed to read ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let participant = events.participant_id().to_string();
    pc.on_track(Box::new(move |track, _, _| {
        let participant = participant.clone();
        Box::pin(async move {
            tracing::info!(%participant, "Received track: {:?}", track.codec());
        })
    }));
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<String, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: String) -> Result<String, TransportError> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation_err)?;

        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(negotiation_err)
    }

    async fn add_remote_candidate(&self, candidate: String) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(init).await.map_err(negotiation_err)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_include_turn_when_configured() {
        let mut config = IceConfig::default();
        assert_eq!(ice_servers(&config).len(), 1);

        config.turn_url = Some("turn:relay.example.org:3478".into());
        config.turn_username = Some("portal".into());
        config.turn_credential = Some("secret".into());
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "portal");
    }

    #[test]
    fn test_no_stun_servers() {
        let config = IceConfig {
            stun_urls: Vec::new(),
            ..IceConfig::default()
        };
        assert!(ice_servers(&config).is_empty());
    }
}
