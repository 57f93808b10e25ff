//! webrtc-rs negotiator
//!
//! Owns exactly one `RTCPeerConnection` for the lifetime of a call. After
//! [`MediaNegotiator::close`] every operation fails with
//! [`NegotiationError::NoPeerConnection`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use relaycall_core::config::MediaConfig;
use relaycall_core::error::NegotiationError;
use relaycall_core::traits::{MediaNegotiator, TransceiverDirection, TransceiverInfo};
use relaycall_proto::relay::{SdpType, SessionDescription};
use relaycall_proto::TrackKind;

const REMOTE_TRACK_CAPACITY: usize = 16;

/// A remote track delivered by the relay, keyed by its transceiver mid
#[derive(Clone)]
pub struct RemoteTrack {
    pub mid: Option<String>,
    pub track: Arc<TrackRemote>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("mid", &self.mid)
            .field("id", &self.track.id())
            .field("kind", &self.track.kind())
            .finish()
    }
}

pub struct WebRtcNegotiator {
    peer: RwLock<Option<Arc<RTCPeerConnection>>>,
    /// Logical kind per local track id; the engine only knows audio/video
    local_kinds: Mutex<HashMap<String, TrackKind>>,
    remote_tracks: broadcast::Sender<RemoteTrack>,
}

impl WebRtcNegotiator {
    pub async fn new(config: &MediaConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(engine)?);

        let (remote_tracks, _) = broadcast::channel(REMOTE_TRACK_CAPACITY);
        let on_track_tx = remote_tracks.clone();
        pc.on_track(Box::new(move |track, _receiver, transceiver| {
            let remote = RemoteTrack {
                mid: transceiver.mid().map(|mid| mid.to_string()),
                track,
            };
            debug!(mid = ?remote.mid, kind = %remote.track.kind(), "Remote track arrived");
            // No subscriber yet is fine; the renderer picks tracks up by mid later
            let _ = on_track_tx.send(remote);
            Box::pin(async {})
        }));

        pc.on_peer_connection_state_change(Box::new(|state| {
            info!(state = %state, "Peer connection state changed");
            Box::pin(async {})
        }));

        Ok(Self {
            peer: RwLock::new(Some(pc)),
            local_kinds: Mutex::new(HashMap::new()),
            remote_tracks,
        })
    }

    fn peer(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        self.peer
            .read()
            .clone()
            .ok_or(NegotiationError::NoPeerConnection)
    }

    /// Attach a captured local track; it is published by the next push round
    pub async fn add_local_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
        kind: TrackKind,
    ) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        let track_id = track.id().to_string();

        let sender = pc.add_track(track).await.map_err(engine)?;
        self.local_kinds.lock().insert(track_id.clone(), kind);
        info!(track_id = %track_id, ?kind, "Local track added");

        // Interceptors only work while RTCP is being read
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        Ok(())
    }

    /// Remote tracks as the relay delivers them
    #[must_use]
    pub fn subscribe_remote_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.remote_tracks.subscribe()
    }

    fn kind_of(&self, track_id: Option<&str>, codec: RTPCodecType) -> TrackKind {
        track_id
            .and_then(|id| self.local_kinds.lock().get(id).copied())
            .unwrap_or_else(|| kind_from_codec(codec))
    }
}

#[async_trait]
impl MediaNegotiator for WebRtcNegotiator {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.peer()?.create_offer(None).await.map_err(engine)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.peer()?.create_answer(None).await.map_err(rejected)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        let kind = desc.kind;
        pc.set_local_description(to_rtc(desc)?)
            .await
            .map_err(rejected)?;
        debug!(?kind, "Local description applied");
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        let kind = desc.kind;
        pc.set_remote_description(to_rtc(desc)?)
            .await
            .map_err(rejected)?;
        debug!(?kind, "Remote description applied");
        Ok(())
    }

    async fn local_transceivers(&self) -> Result<Vec<TransceiverInfo>, NegotiationError> {
        let pc = self.peer()?;
        let mut infos = Vec::new();

        for transceiver in pc.get_transceivers().await {
            let sender = transceiver.sender().await;
            let track_id = sender.track().await.map(|track| track.id().to_string());
            let kind = self.kind_of(track_id.as_deref(), transceiver.kind());

            infos.push(TransceiverInfo {
                direction: map_direction(transceiver.direction()),
                mid: transceiver.mid().map(|mid| mid.to_string()),
                track_id,
                kind,
            });
        }

        Ok(infos)
    }

    async fn close(&self) {
        let Some(pc) = self.peer.write().take() else {
            return;
        };
        self.local_kinds.lock().clear();
        if let Err(e) = pc.close().await {
            warn!(error = %e, "Closing peer connection failed");
        }
        info!("Peer connection closed");
    }
}

fn engine(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Engine(e.to_string())
}

fn rejected(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Rejected(e.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(rejected)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(NegotiationError::Engine(format!(
            "unexpected description type {other}"
        ))),
    }
}

/// Screen share is indistinguishable from camera video at this level
fn kind_from_codec(codec: RTPCodecType) -> TrackKind {
    match codec {
        RTPCodecType::Audio => TrackKind::Audio,
        _ => TrackKind::Video,
    }
}

fn map_direction(direction: RTCRtpTransceiverDirection) -> TransceiverDirection {
    match direction {
        RTCRtpTransceiverDirection::Sendrecv => TransceiverDirection::SendRecv,
        RTCRtpTransceiverDirection::Sendonly => TransceiverDirection::SendOnly,
        RTCRtpTransceiverDirection::Recvonly => TransceiverDirection::RecvOnly,
        _ => TransceiverDirection::Inactive,
    }
}
