//! Capabilities the signaling state machine drives but does not implement:
//! the peer connection itself and local capture devices.
//!
//! [`crate::signaling::rtc`] backs both with webrtc-rs; tests use scripted
//! doubles.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{IceCandidate, SessionDescription};

/// Offer/answer state of the underlying connection, as in the WebRTC spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Transport-level (ICE/DTLS) state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by the peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and must be sent right away.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which devices to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

/// A captured local track. Stopping releases the device for good;
/// disabling only silences it.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_live(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested devices.
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<Arc<dyn LocalTrack>>>;
}

/// One WebRTC peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Applying [`SessionDescription::rollback`] discards a pending local offer.
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
