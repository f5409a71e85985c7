use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{CallConfig, LocalMedia, ServerConfig};
use crate::error::MediaError;
use crate::logger::dump_candidate;
use crate::peer::ice::{to_candidate, to_candidate_init};
use crate::peer::types::{
    Candidate, EndpointEvent, MediaConnectionState, RemoteTrack, SdpType, SessionDescription,
};
use crate::peer::{EndpointEventSink, EndpointFactory, MediaEndpoint};
use crate::utils::add_ice_url_scheme;

const LOCAL_STREAM_ID: &str = "p2pcall-local";

/// Фабрика endpoint на webrtc-rs.
pub struct RtcEndpointFactory {
    ice_servers: Vec<ServerConfig>,
    local_media: LocalMedia,
}

impl RtcEndpointFactory {
    pub fn new(ice_servers: Vec<ServerConfig>, local_media: LocalMedia) -> Self {
        Self {
            ice_servers,
            local_media,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.ice_servers.clone(), config.local_media)
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(&self, events: EndpointEventSink) -> Result<Arc<dyn MediaEndpoint>, MediaError> {
        let endpoint = new_peer(rtc_config(&self.ice_servers), self.local_media, events).await?;
        Ok(Arc::new(endpoint))
    }
}

/// Один `RTCPeerConnection` с локальными и удалёнными треками.
pub struct RtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    local_media: LocalMedia,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    /// Кандидаты, полученные до установки remote description
    pending_candidates: Mutex<Vec<Candidate>>,
}

/// Создаём peer connection и подключаем его колбэки к `events`.
pub async fn new_peer(
    config: RTCConfiguration,
    local_media: LocalMedia,
    events: EndpointEventSink,
) -> Result<RtcEndpoint, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(negotiation_error)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(negotiation_error)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(config)
            .await
            .map_err(negotiation_error)?,
    );

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                debug!("ICE gathering complete");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let candidate = to_candidate(init);
                    dump_candidate("LOCAL", &candidate);
                    sink(EndpointEvent::LocalCandidate(candidate));
                }
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("ICE gathering state changed to: {state:?}");
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!("Peer connection state changed to: {st:?}");
        if let Some(state) = map_connection_state(st) {
            sink(EndpointEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events;
    let tracks = remote_tracks.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let remote = RemoteTrack {
            id: track.id(),
            kind: track.kind().to_string(),
            stream_id: track.stream_id(),
        };
        info!("Remote track received: {} ({})", remote.id, remote.kind);
        tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track);
        sink(EndpointEvent::RemoteTrack(remote));
        Box::pin(async {})
    }));

    Ok(RtcEndpoint {
        pc,
        local_media,
        local_tracks: Mutex::new(Vec::new()),
        remote_tracks,
        pending_candidates: Mutex::new(Vec::new()),
    })
}

impl RtcEndpoint {
    /// Локальные треки, в которые пишет захват.
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Удалённые треки для рендера.
    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn connection_state(&self) -> Option<MediaConnectionState> {
        map_connection_state(self.pc.connection_state())
    }

    async fn apply_pending_candidates(&self) {
        let pending: Vec<Candidate> = self
            .pending_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(to_candidate_init(candidate)).await {
                warn!("Failed to apply pending candidate: {e}");
            }
        }
    }

    async fn add_local_track(&self, mime_type: &str, track_id: &str) -> Result<(), MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::AccessDenied {
                reason: format!("{track_id}: {e}"),
            })?;
        self.local_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track);
        Ok(())
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn attach_local_tracks(&self) -> Result<(), MediaError> {
        if !self.local_tracks().is_empty() {
            return Ok(());
        }
        if self.local_media.audio {
            self.add_local_track(MIME_TYPE_OPUS, "audio").await?;
        }
        if self.local_media.video {
            self.add_local_track(MIME_TYPE_VP8, "video").await?;
        }
        debug!("Attached {} local track(s)", self.local_tracks().len());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(negotiation_error)?;
        self.apply_pending_candidates().await;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), MediaError> {
        if self.pc.remote_description().await.is_none() {
            debug!("Remote description not set yet, queuing candidate");
            self.pending_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(candidate);
            return Ok(());
        }
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| MediaError::Candidate {
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), MediaError> {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                warn!("Failed to stop local sender: {e}");
            }
        }
        self.local_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.remote_tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.pending_candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.pc.close().await.map_err(negotiation_error)
    }
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<MediaConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(MediaConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(MediaConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(MediaConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(MediaConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(MediaConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(MediaConnectionState::Closed),
        _ => None,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    match desc.r#type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation_error)
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
        other => Err(MediaError::Negotiation {
            reason: format!("unexpected description type {other}"),
        }),
    }
}

fn negotiation_error(e: webrtc::Error) -> MediaError {
    MediaError::Negotiation {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "a".into(),
                r#type: "stun".into(),
                url: "stun.example.org:3478".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "relay.example.org:3478".into(),
                username: Some("user".into()),
                credential: Some("secret".into()),
            },
        ];
        let ice = get_user_ice_servers(&servers);
        assert_eq!(ice[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(ice[1].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(ice[1].username, "user");
        assert_eq!(ice[1].credential, "secret");
    }

    #[test]
    fn config_uses_bundle_and_rtcp_mux() {
        let cfg = rtc_config(&CallConfig::default().ice_servers);
        assert_eq!(cfg.ice_servers.len(), 2);
        assert_eq!(cfg.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(cfg.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[tokio::test]
    async fn offer_round_trips_through_stored_form() {
        let sink: EndpointEventSink = Arc::new(|_| {});
        let endpoint = new_peer(rtc_config(&[]), LocalMedia::default(), sink)
            .await
            .expect("peer connection");
        assert_eq!(endpoint.connection_state(), Some(MediaConnectionState::New));
        endpoint.attach_local_tracks().await.expect("local tracks");
        assert_eq!(endpoint.local_tracks().len(), 2);
        assert!(endpoint.remote_tracks().is_empty());

        let offer = endpoint.create_offer().await.expect("offer");
        assert_eq!(offer.r#type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        endpoint.set_local_description(offer).await.expect("local description");
        endpoint.close().await.expect("close");
        assert!(endpoint.local_tracks().is_empty());
    }
}
