//! Negotiation engine backed by `webrtc-rs`.
//!
//! [`WebRtcEngineFactory`] builds one `RTCPeerConnection` per call, with the
//! default codecs and interceptors registered. Peer connection callbacks are
//! forwarded as [`EngineEvent`]s:
//!
//! - `on_ice_candidate` → [`EngineEvent::LocalCandidate`] (end-of-candidates on `None`)
//! - `on_track` → [`EngineEvent::RemoteTrack`]
//! - `on_peer_connection_state_change` → [`EngineEvent::ConnectionStateChanged`]
//!
//! Local audio is sent as Opus through a [`TrackLocalStaticSample`] per local
//! track; look it up with [`WebRtcEngine::local_sample_track`] to write samples.

use crate::config::IceServer;
use crate::error::{Result, WebCallError};
use crate::media::{MediaTrack, SharedTrack, TrackKind};
use crate::negotiation::{
    BoxedEngine, EngineEvent, EngineEvents, EngineFactory, IceCandidate, NegotiationEngine,
    SdpType, SessionDescription, TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

/// Opus clock rate.
const OPUS_CLOCK_RATE: u32 = 48000;

/// Creates [`WebRtcEngine`]s.
#[derive(Debug, Clone, Default)]
pub struct WebRtcEngineFactory {
    _private: (),
}

impl WebRtcEngineFactory {
    /// Create a factory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<(BoxedEngine, EngineEvents)> {
        let (engine, events) = WebRtcEngine::new(ice_servers).await?;
        Ok((Arc::new(engine), events))
    }
}

/// A `webrtc-rs` peer connection.
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    closed: AtomicBool,
}

impl WebRtcEngine {
    /// Create a peer connection and wire its callbacks to an event channel.
    pub async fn new(ice_servers: &[IceServer]) -> Result<(Self, EngineEvents)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            WebCallError::negotiation(format!("Failed to register codecs: {}", e))
        })?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| {
                WebCallError::negotiation(format!("Failed to register interceptors: {}", e))
            })?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(|e| {
            WebCallError::negotiation(format!("Failed to create peer connection: {}", e))
        })?);

        let (tx, rx) = mpsc::unbounded_channel();

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            debug!(state = ?s, "Peer connection state changed");
            let _ = state_tx.send(EngineEvent::ConnectionStateChanged(transport_state(s)));
            Box::pin(async {})
        }));

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                        Err(e) => {
                            debug!(error = %e, "Dropping unserializable local candidate");
                            return;
                        }
                    },
                    None => IceCandidate::end_of_candidates(),
                };
                let _ = tx.send(EngineEvent::LocalCandidate(candidate));
            })
        }));

        let track_tx = tx;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            info!(track_id = %track.id(), kind = ?track.kind(), "Remote track received");
            let remote: SharedTrack = Arc::new(WebRtcRemoteTrack::new(track));
            let _ = track_tx.send(EngineEvent::RemoteTrack(remote));
            Box::pin(async {})
        }));

        let engine =
            Self { pc, local_tracks: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) };
        Ok((engine, rx))
    }

    /// The sample track carrying the local track `id`, once added.
    pub fn local_sample_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }

    /// Current connection state of the peer connection.
    pub fn connection_state(&self) -> TransportState {
        transport_state(self.pc.connection_state())
    }

    /// The underlying peer connection.
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(WebCallError::negotiation("Rollback descriptions are not supported"));
        }
    };
    parsed.map_err(|e| WebCallError::negotiation(format!("Invalid session description: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(WebCallError::negotiation("Engine produced an untyped description"));
        }
    };
    Ok(SessionDescription { sdp_type, sdp: desc.sdp })
}

#[async_trait]
impl NegotiationEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| WebCallError::negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| WebCallError::negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await.map_err(|e| {
            WebCallError::negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await.map_err(|e| {
            WebCallError::negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.is_end_of_candidates() {
            debug!("Remote end-of-candidates");
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| WebCallError::negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_local_track(&self, track: SharedTrack, stream_id: &str) -> Result<()> {
        if track.kind() != TrackKind::Audio {
            return Err(WebCallError::media(format!(
                "Only audio tracks are supported, got {:?}",
                track.kind()
            )));
        }
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            track.id().to_owned(),
            stream_id.to_owned(),
        ));
        self.pc
            .add_track(sample_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| WebCallError::negotiation(format!("Failed to add audio track: {}", e)))?;
        self.local_tracks.lock().insert(track.id().to_owned(), sample_track);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.local_tracks.lock().clear();
        self.pc.close().await.map_err(|e| {
            WebCallError::negotiation(format!("Failed to close peer connection: {}", e))
        })
    }
}

impl std::fmt::Debug for WebRtcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEngine")
            .field("state", &self.connection_state())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// An inbound `webrtc-rs` track.
pub struct WebRtcRemoteTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcRemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            id: track.id(),
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// The RTP track, for reading packets.
    pub fn rtp_track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl MediaTrack for WebRtcRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
