//! webrtc-rs backing for [`PeerConnection`] and [`MediaDevices`].
//!
//! Local tracks are `TrackLocalStaticSample`s; whatever captures audio or
//! video pushes samples through [`RtcTrack::write_sample`], which drops them
//! while the track is disabled or stopped.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::peer::{
    LocalTrack, MediaDevices, MediaRequest, PeerConnection, PeerEvent, PeerState, SignalingState, TrackKind,
};
use crate::error::{Result, SyncError};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

/// A webrtc-rs peer connection.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    /// Build a peer connection with default codecs and interceptors.
    ///
    /// Returns the peer plus the stream of gathered candidates and
    /// connection state changes.
    pub async fn new(ice_servers: &[String]) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let candidate_tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => log::warn!("Failed to serialize local candidate: {e}"),
                }
            })
        }));

        let state_tx = event_tx;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let state = match s {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                };
                let _ = tx.send(PeerEvent::StateChanged(state));
            })
        }));

        pc.on_track(Box::new(
            |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                log::info!("Remote {} track {} arrived", track.kind(), track.id());
                Box::pin(async {})
            },
        ));

        Ok((
            Self {
                pc,
                senders: Mutex::new(HashMap::new()),
            },
            event_rx,
        ))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(from_rtc_description(self.pc.create_offer(None).await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(from_rtc_description(self.pc.create_answer(None).await?))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let rtc_track = track
            .as_any()
            .downcast_ref::<RtcTrack>()
            .ok_or_else(|| SyncError::Media(format!("track {} is not a webrtc track", track.id())))?;
        let sender = self
            .pc
            .add_track(rtc_track.sample.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.senders.lock().await.insert(track.id().to_string(), sender);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self.senders.lock().await.remove(track_id);
        match sender {
            Some(sender) => {
                self.pc.remove_track(&sender).await?;
                Ok(())
            }
            None => Err(SyncError::Media(format!("track {track_id} is not attached"))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))?,
    };
    Ok(rtc)
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpKind::Offer,
    };
    SessionDescription { kind, sdp: desc.sdp }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

// ─── Local media ─────────────────────────────────────────────────────

/// A local track backed by a `TrackLocalStaticSample`.
pub struct RtcTrack {
    id: String,
    kind: TrackKind,
    sample: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl RtcTrack {
    fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (mime_type, clock_rate, channels) = match kind {
            TrackKind::Audio => ("audio/opus", 48_000, 2),
            TrackKind::Video => ("video/VP8", 90_000, 0),
        };
        let id = format!("{}-{}", mime_type.split('/').next().unwrap_or("track"), uuid::Uuid::new_v4());
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            sample,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    /// Push one encoded sample. Silently skipped while muted or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        self.sample
            .write_sample(sample)
            .await
            .map_err(|e| SyncError::Media(e.to_string()))
    }
}

impl LocalTrack for RtcTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Relaxed);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out sample-fed tracks under one stream id.
pub struct RtcMediaDevices {
    stream_id: String,
}

impl RtcMediaDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaDevices for RtcMediaDevices {
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<Arc<dyn LocalTrack>>> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if request.audio {
            tracks.push(Arc::new(RtcTrack::new(TrackKind::Audio, &self.stream_id)));
        }
        if request.video {
            tracks.push(Arc::new(RtcTrack::new(TrackKind::Video, &self.stream_id)));
        }
        Ok(tracks)
    }
}
