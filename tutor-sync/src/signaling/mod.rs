//! Caller/callee negotiation of the session's single peer connection.
//!
//! ```text
//!            ready (caller, stable)         answer applied / answer sent
//!   Idle ──────────────────────────► Negotiating ─────────────────────► Connected
//!    │        offer received               ▲                              │   ▲
//!    └─────────────────────────────────────┘          new offer         ▼   │
//!                                                              Renegotiating ┘
//!   any state ── dispose() ──► Closed
//! ```
//!
//! Roles are fixed for the life of the session: `user1` calls, `user2`
//! answers. A callee never produces an offer. A failing step is logged and
//! leaves the machine where it was; the peer's next `ready` retries.

pub mod peer;
pub mod rtc;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::protocol::{IceCandidate, MonotonicStamp, Role, SessionDescription, Signal, SignalMessage};
use peer::{LocalTrack, MediaDevices, MediaRequest, PeerConnection, PeerState, SignalingState, TrackKind};

/// Negotiation progress as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Renegotiating,
    Closed,
}

/// Per-session capture preferences. A fresh session starts with the
/// microphone on and the camera off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPreferences {
    pub muted: bool,
    pub video_off: bool,
}

impl Default for MediaPreferences {
    fn default() -> Self {
        Self {
            muted: false,
            video_off: true,
        }
    }
}

/// Drives one peer connection through offer/answer.
///
/// Every handler returns the signals to send, in order. Sending is the
/// caller's job, which keeps the machine free of transport concerns.
pub struct SignalingStateMachine {
    peer: Arc<dyn PeerConnection>,
    media: Arc<dyn MediaDevices>,
    role: Option<Role>,
    state: NegotiationState,
    peer_state: PeerState,
    prefs: MediaPreferences,
    tracks: Vec<Arc<dyn LocalTrack>>,
    started: bool,
    stamp: MonotonicStamp,
}

impl SignalingStateMachine {
    pub fn new(peer: Arc<dyn PeerConnection>, media: Arc<dyn MediaDevices>, prefs: MediaPreferences) -> Self {
        Self {
            peer,
            media,
            role: None,
            state: NegotiationState::Idle,
            peer_state: PeerState::New,
            prefs,
            tracks: Vec::new(),
            started: false,
            stamp: MonotonicStamp::new(),
        }
    }

    /// Fix the role. Only the first assignment counts.
    pub fn assign_role(&mut self, role: Role) -> bool {
        match self.role {
            Some(current) => {
                if current != role {
                    log::warn!("Ignoring role change {current:?} -> {role:?}");
                }
                false
            }
            None => {
                self.role = Some(role);
                true
            }
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn peer_state(&self) -> PeerState {
        self.peer_state
    }

    pub fn preferences(&self) -> MediaPreferences {
        self.prefs
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn local_tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Acquire local media, attach it, and announce `ready`.
    ///
    /// Returns nothing if the role is not known yet, the machine already
    /// started, or acquisition failed (a later call retries).
    pub async fn start(&mut self) -> Vec<SignalMessage> {
        if self.started || self.state == NegotiationState::Closed {
            return Vec::new();
        }
        let Some(role) = self.role else {
            log::debug!("Media start deferred until role is known");
            return Vec::new();
        };

        let request = MediaRequest {
            audio: true,
            video: !self.prefs.video_off,
        };
        let tracks = match self.media.acquire(request).await {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("Local media acquisition failed: {e}");
                return Vec::new();
            }
        };

        for track in tracks {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(!self.prefs.muted);
            }
            if let Err(e) = self.peer.add_track(track.clone()).await {
                log::warn!("Failed to attach {:?} track {}: {e}", track.kind(), track.id());
            }
            self.tracks.push(track);
        }

        self.started = true;
        log::info!("Local media ready as {role:?} ({} tracks)", self.tracks.len());
        vec![self.envelope(Signal::Ready)]
    }

    /// Re-announce `ready` after the signaling channel reconnected.
    pub fn reannounce(&mut self) -> Vec<SignalMessage> {
        if self.started && self.state != NegotiationState::Closed && self.role.is_some() {
            vec![self.envelope(Signal::Ready)]
        } else {
            Vec::new()
        }
    }

    /// Stop every local track and close the connection.
    pub async fn dispose(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        for track in self.tracks.drain(..) {
            track.stop();
        }
        if let Err(e) = self.peer.close().await {
            log::warn!("Error closing peer connection: {e}");
        }
        self.state = NegotiationState::Closed;
        self.peer_state = PeerState::Closed;
        log::info!("Signaling disposed");
    }

    // ─── Inbound signals ─────────────────────────────────────────────

    /// React to a signal from the counterpart.
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Vec<SignalMessage> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }
        let Some(role) = self.role else {
            log::debug!("Dropping {} signal: role not assigned", msg.signal.name());
            return Vec::new();
        };
        if msg.role == Some(role) {
            log::debug!("Dropping {} signal echoed from own role", msg.signal.name());
            return Vec::new();
        }

        match msg.signal {
            Signal::Ready => self.on_ready(role).await,
            Signal::Offer { sdp } => self.on_offer(sdp).await,
            Signal::Answer { sdp } => {
                self.on_answer(sdp).await;
                Vec::new()
            }
            Signal::Candidate { candidate } => {
                self.on_candidate(candidate).await;
                Vec::new()
            }
        }
    }

    async fn on_ready(&mut self, role: Role) -> Vec<SignalMessage> {
        let signaling = self.peer.signaling_state();
        if signaling != SignalingState::Stable {
            log::debug!("Ignoring ready in signaling state {signaling:?}");
            return Vec::new();
        }
        match role {
            Role::Caller => self.make_offer().await,
            Role::Callee => vec![self.envelope(Signal::Ready)],
        }
    }

    async fn make_offer(&mut self) -> Vec<SignalMessage> {
        let offer = match self.peer.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                log::warn!("create_offer failed: {e}");
                return Vec::new();
            }
        };
        if let Err(e) = self.peer.set_local_description(offer.clone()).await {
            log::warn!("set_local_description(offer) failed: {e}");
            return Vec::new();
        }
        self.state = match self.state {
            NegotiationState::Connected | NegotiationState::Renegotiating => NegotiationState::Renegotiating,
            _ => NegotiationState::Negotiating,
        };
        vec![self.envelope(Signal::Offer { sdp: offer })]
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Vec<SignalMessage> {
        if self.peer.signaling_state() != SignalingState::Stable {
            if let Err(e) = self.peer.set_local_description(SessionDescription::rollback()).await {
                log::warn!("Rollback before applying remote offer failed: {e}");
                return Vec::new();
            }
            log::debug!("Rolled back pending local description");
        }
        if let Err(e) = self.peer.set_remote_description(offer).await {
            log::warn!("set_remote_description(offer) failed: {e}");
            return Vec::new();
        }
        let answer = match self.peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("create_answer failed: {e}");
                return Vec::new();
            }
        };
        if let Err(e) = self.peer.set_local_description(answer.clone()).await {
            log::warn!("set_local_description(answer) failed: {e}");
            return Vec::new();
        }
        self.state = NegotiationState::Connected;
        vec![self.envelope(Signal::Answer { sdp: answer })]
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        match self.peer.set_remote_description(answer).await {
            Ok(()) => self.state = NegotiationState::Connected,
            Err(e) => log::warn!("set_remote_description(answer) failed: {e}"),
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            log::debug!("add_ice_candidate failed (non-fatal): {e}");
        }
    }

    // ─── Peer events ─────────────────────────────────────────────────

    /// Wrap a freshly gathered local candidate for immediate sending.
    pub fn local_candidate(&mut self, candidate: IceCandidate) -> Option<SignalMessage> {
        if self.state == NegotiationState::Closed || self.role.is_none() {
            return None;
        }
        Some(self.envelope(Signal::Candidate { candidate }))
    }

    pub fn set_peer_state(&mut self, state: PeerState) {
        if self.peer_state != state {
            log::info!("Peer connection {:?} -> {state:?}", self.peer_state);
            self.peer_state = state;
        }
    }

    // ─── Local media controls ────────────────────────────────────────

    /// Mute or unmute the microphone. Audio tracks stay attached.
    pub fn set_muted(&mut self, muted: bool) {
        self.prefs.muted = muted;
        for track in self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio) {
            track.set_enabled(!muted);
        }
    }

    /// Turn the camera off (stop and detach video) or back on (acquire a
    /// new video track, attach it, and renegotiate).
    pub async fn set_video_off(&mut self, video_off: bool) -> Vec<SignalMessage> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }
        if video_off {
            self.stop_video().await;
            self.prefs.video_off = true;
            return Vec::new();
        }

        let has_live_video = self
            .tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Video && t.is_live());
        if has_live_video {
            self.prefs.video_off = false;
            return Vec::new();
        }
        if !self.started {
            self.prefs.video_off = false;
            return Vec::new();
        }

        let request = MediaRequest { audio: false, video: true };
        let fresh = match self.media.acquire(request).await {
            Ok(tracks) => tracks,
            Err(e) => {
                log::warn!("Camera re-acquisition failed: {e}");
                return Vec::new();
            }
        };
        for track in fresh.into_iter().filter(|t| t.kind() == TrackKind::Video) {
            if let Err(e) = self.peer.add_track(track.clone()).await {
                log::warn!("Failed to attach video track {}: {e}", track.id());
                track.stop();
                continue;
            }
            self.tracks.push(track);
        }
        self.prefs.video_off = false;

        match self.role {
            Some(Role::Caller) if self.peer.signaling_state() == SignalingState::Stable => {
                self.make_offer().await
            }
            Some(Role::Callee) => vec![self.envelope(Signal::Ready)],
            _ => Vec::new(),
        }
    }

    async fn stop_video(&mut self) {
        let (video, rest): (Vec<_>, Vec<_>) = self
            .tracks
            .drain(..)
            .partition(|t| t.kind() == TrackKind::Video);
        self.tracks = rest;
        for track in video {
            track.stop();
            if let Err(e) = self.peer.remove_track(track.id()).await {
                log::debug!("remove_track {} failed: {e}", track.id());
            }
        }
    }

    fn envelope(&mut self, signal: Signal) -> SignalMessage {
        let role = self.role.unwrap_or(Role::Callee);
        SignalMessage::new(signal, role, self.stamp.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scripted peer that follows the offer/answer state rules and records
    /// every call.
    struct ScriptedPeer {
        state: Mutex<SignalingState>,
        calls: Mutex<Vec<String>>,
        fail_create_offer: AtomicBool,
    }

    impl ScriptedPeer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(SignalingState::Stable),
                calls: Mutex::new(Vec::new()),
                fail_create_offer: AtomicBool::new(false),
            })
        }

        fn force_state(&self, state: SignalingState) {
            *self.state.lock().unwrap() = state;
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    #[async_trait]
    impl PeerConnection for ScriptedPeer {
        fn signaling_state(&self) -> SignalingState {
            *self.state.lock().unwrap()
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            self.record("create_offer");
            if self.fail_create_offer.load(Ordering::SeqCst) {
                return Err(SyncError::Signaling("no transceivers".into()));
            }
            Ok(SessionDescription::offer("offer-sdp"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record("create_answer");
            Ok(SessionDescription::answer("answer-sdp"))
        }

        async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
            self.record(&format!("set_local:{:?}", desc.kind));
            let mut state = self.state.lock().unwrap();
            *state = match desc.kind {
                crate::protocol::SdpKind::Offer => SignalingState::HaveLocalOffer,
                _ => SignalingState::Stable,
            };
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            self.record(&format!("set_remote:{:?}", desc.kind));
            let mut state = self.state.lock().unwrap();
            match (desc.kind, *state) {
                (crate::protocol::SdpKind::Offer, SignalingState::Stable) => {
                    *state = SignalingState::HaveRemoteOffer;
                    Ok(())
                }
                (crate::protocol::SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    *state = SignalingState::Stable;
                    Ok(())
                }
                (kind, current) => Err(SyncError::Signaling(format!("{kind:?} in {current:?}"))),
            }
        }

        async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            self.record("add_ice_candidate");
            Err(SyncError::Signaling("remote description not set".into()))
        }

        async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
            self.record(&format!("add_track:{:?}", track.kind()));
            Ok(())
        }

        async fn remove_track(&self, _track_id: &str) -> Result<()> {
            self.record("remove_track");
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.record("close");
            Ok(())
        }
    }

    struct FakeTrack {
        id: String,
        kind: TrackKind,
        enabled: AtomicBool,
        live: AtomicBool,
    }

    impl LocalTrack for FakeTrack {
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
            self.live.store(false, Ordering::SeqCst);
        }
        fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct FakeDevices;

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn acquire(&self, request: MediaRequest) -> Result<Vec<Arc<dyn LocalTrack>>> {
            let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
            for (wanted, kind) in [(request.audio, TrackKind::Audio), (request.video, TrackKind::Video)] {
                if wanted {
                    tracks.push(Arc::new(FakeTrack {
                        id: format!("{kind:?}").to_lowercase(),
                        kind,
                        enabled: AtomicBool::new(true),
                        live: AtomicBool::new(true),
                    }));
                }
            }
            Ok(tracks)
        }
    }

    fn machine(role: Role, peer: Arc<ScriptedPeer>) -> SignalingStateMachine {
        let mut m = SignalingStateMachine::new(peer, Arc::new(FakeDevices), MediaPreferences::default());
        m.assign_role(role);
        m
    }

    fn from(signal: Signal, role: Role) -> SignalMessage {
        SignalMessage::new(signal, role, 1)
    }

    fn names(out: &[SignalMessage]) -> Vec<&'static str> {
        out.iter().map(|m| m.signal.name()).collect()
    }

    #[tokio::test]
    async fn test_start_attaches_audio_and_announces_ready() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer.clone());

        let out = m.start().await;
        assert_eq!(names(&out), vec!["ready"]);
        assert_eq!(out[0].role, Some(Role::Caller));
        assert_eq!(peer.calls(), vec!["add_track:Audio"]);
        assert!(m.start().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_role() {
        let peer = ScriptedPeer::new();
        let mut m = SignalingStateMachine::new(peer, Arc::new(FakeDevices), MediaPreferences::default());
        assert!(m.start().await.is_empty());
        assert!(!m.is_started());
    }

    #[tokio::test]
    async fn test_role_is_assigned_once() {
        let mut m = machine(Role::Callee, ScriptedPeer::new());
        assert!(!m.assign_role(Role::Caller));
        assert_eq!(m.role(), Some(Role::Callee));
    }

    #[tokio::test]
    async fn test_callee_never_offers() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Callee, peer.clone());
        let sequence = vec![
            Signal::Ready,
            Signal::Offer { sdp: SessionDescription::offer("o1") },
            Signal::Ready,
            Signal::Answer { sdp: SessionDescription::answer("a1") },
            Signal::Ready,
            Signal::Offer { sdp: SessionDescription::offer("o2") },
        ];
        for signal in sequence {
            let out = m.handle_signal(from(signal, Role::Caller)).await;
            assert!(!names(&out).contains(&"offer"));
        }
        assert!(!peer.calls().contains(&"create_offer".to_string()));
    }

    #[tokio::test]
    async fn test_callee_echoes_ready_when_stable() {
        let mut m = machine(Role::Callee, ScriptedPeer::new());
        let out = m.handle_signal(from(Signal::Ready, Role::Caller)).await;
        assert_eq!(names(&out), vec!["ready"]);
    }

    #[tokio::test]
    async fn test_caller_offers_only_when_stable() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer.clone());

        let out = m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        assert_eq!(names(&out), vec!["offer"]);
        assert_eq!(m.state(), NegotiationState::Negotiating);

        // Offer outstanding: signaling is have-local-offer, a second ready is ignored.
        let out = m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        assert!(out.is_empty());
        assert_eq!(peer.calls().iter().filter(|c| *c == "create_offer").count(), 1);
    }

    #[tokio::test]
    async fn test_offer_while_not_stable_rolls_back_first() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Callee, peer.clone());
        peer.force_state(SignalingState::HaveLocalOffer);

        let out = m.handle_signal(from(Signal::Offer { sdp: SessionDescription::offer("o") }, Role::Caller)).await;
        assert_eq!(names(&out), vec!["answer"]);

        let calls = peer.calls();
        let rollback = calls.iter().position(|c| c == "set_local:Rollback").unwrap();
        let remote = calls.iter().position(|c| c == "set_remote:Offer").unwrap();
        assert!(rollback < remote);
        assert_eq!(m.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_offer_when_stable_skips_rollback() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Callee, peer.clone());
        m.handle_signal(from(Signal::Offer { sdp: SessionDescription::offer("o") }, Role::Caller)).await;
        assert!(!peer.calls().contains(&"set_local:Rollback".to_string()));
    }

    #[tokio::test]
    async fn test_failed_offer_keeps_prior_state() {
        let peer = ScriptedPeer::new();
        peer.fail_create_offer.store(true, Ordering::SeqCst);
        let mut m = machine(Role::Caller, peer.clone());

        let out = m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        assert!(out.is_empty());
        assert_eq!(m.state(), NegotiationState::Idle);

        peer.fail_create_offer.store(false, Ordering::SeqCst);
        let out = m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        assert_eq!(names(&out), vec!["offer"]);
    }

    #[tokio::test]
    async fn test_answer_out_of_sequence_is_non_fatal() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer);
        let out = m.handle_signal(from(Signal::Answer { sdp: SessionDescription::answer("a") }, Role::Callee)).await;
        assert!(out.is_empty());
        assert_eq!(m.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn test_early_candidate_is_tolerated() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Callee, peer.clone());
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let out = m.handle_signal(from(Signal::Candidate { candidate }, Role::Caller)).await;
        assert!(out.is_empty());
        assert_eq!(peer.calls(), vec!["add_ice_candidate"]);
    }

    #[tokio::test]
    async fn test_own_role_echo_dropped() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer.clone());
        let out = m.handle_signal(from(Signal::Ready, Role::Caller)).await;
        assert!(out.is_empty());
        assert!(peer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_renegotiation_from_connected() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer.clone());
        m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        m.handle_signal(from(Signal::Answer { sdp: SessionDescription::answer("a") }, Role::Callee)).await;
        assert_eq!(m.state(), NegotiationState::Connected);

        let out = m.handle_signal(from(Signal::Ready, Role::Callee)).await;
        assert_eq!(names(&out), vec!["offer"]);
        assert_eq!(m.state(), NegotiationState::Renegotiating);

        m.handle_signal(from(Signal::Answer { sdp: SessionDescription::answer("a2") }, Role::Callee)).await;
        assert_eq!(m.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_mute_disables_audio_without_stopping() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer);
        m.start().await;

        m.set_muted(true);
        let audio = &m.local_tracks()[0];
        assert!(!audio.is_enabled());
        assert!(audio.is_live());
        assert!(m.preferences().muted);
    }

    #[tokio::test]
    async fn test_video_reacquire_attaches_and_renegotiates() {
        let peer = ScriptedPeer::new();
        let mut m = machine(Role::Caller, peer.clone());
        m.start().await;

        let out = m.set_video_off(false).await;
        assert_eq!(names(&out), vec!["offer"]);
        assert!(peer.calls().contains(&"add_track:Video".to_string()));
        assert!(!m.preferences().video_off);

        let out = m.set_video_off(true).await;
        assert!(out.is_empty());
        assert!(m.local_tracks().iter().all(|t| t.kind() == TrackKind::Audio));
        assert!(peer.calls().contains(&"remove_track".to_string()));
    }

    #[tokio::test]
    async fn test_callee_video_reacquire_requests_offer() {
        let mut m = machine(Role::Callee, ScriptedPeer::new());
        m.start().await;
        let out = m.set_video_off(false).await;
        assert_eq!(names(&out), vec!["ready"]);
    }

    #[tokio::test]
    async fn test_dispose_stops_every_track() {
        let peer = ScriptedPeer::new();
        let mut m = SignalingStateMachine::new(
            peer.clone(),
            Arc::new(FakeDevices),
            MediaPreferences { muted: true, video_off: false },
        );
        m.assign_role(Role::Caller);
        m.start().await;
        let tracks: Vec<Arc<dyn LocalTrack>> = m.local_tracks().to_vec();
        assert_eq!(tracks.len(), 2);

        m.dispose().await;
        assert!(tracks.iter().all(|t| !t.is_live()));
        assert_eq!(m.state(), NegotiationState::Closed);
        assert!(peer.calls().contains(&"close".to_string()));
        assert!(m.handle_signal(from(Signal::Ready, Role::Callee)).await.is_empty());
        assert!(m.reannounce().is_empty());
    }
}
