//! Shared doubles for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use tutor_sync::protocol::{IceCandidate, SdpKind, SessionDescription};
use tutor_sync::signaling::peer::{LocalTrack, MediaRequest, SignalingState, TrackKind};
use tutor_sync::{
    ChannelKind, ConnectionState, Credential, EngineHandle, EngineParts, InboundFrame, MediaDevices,
    MemorySnapshotCache, OutboundFrame, PeerConnection, Result, Session, SessionContext, SessionId,
    SessionSyncEngine, SessionView, SharedProfile, SyncConfig, SyncError, Transport, TransportEvent, TransportKind,
    UserId,
};

pub const SESSION: SessionId = 7;
pub const TEACHER: UserId = 10;
pub const LEARNER: UserId = 20;

// ─── Transport ───────────────────────────────────────────────────────

/// Test-side view of a [`RecordingTransport`].
#[derive(Clone)]
pub struct TransportProbe {
    pub events: mpsc::Sender<TransportEvent>,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    refreshes: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl TransportProbe {
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Make every subsequent send fail as if the channel were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn push(&self, event: TransportEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn frame(&self, frame: InboundFrame) {
        self.push(TransportEvent::Frame {
            channel: ChannelKind::Session,
            session_id: Some(SESSION),
            frame,
        })
        .await;
    }

    /// Wait until a sent frame matches `pred`.
    pub async fn wait_sent(&self, pred: impl Fn(&OutboundFrame) -> bool) -> OutboundFrame {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frame) = self.sent().into_iter().find(|f| pred(f)) {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("frame was never sent")
    }
}

/// Transport that records outbound frames and lets the test inject events.
pub struct RecordingTransport {
    events: Option<mpsc::Receiver<TransportEvent>>,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    refreshes: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new() -> (Self, TransportProbe) {
        let (tx, rx) = mpsc::channel(64);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let refreshes = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicBool::new(false));
        let probe = TransportProbe {
            events: tx,
            sent: sent.clone(),
            refreshes: refreshes.clone(),
            failing: failing.clone(),
        };
        (
            Self {
                events: Some(rx),
                sent,
                refreshes,
                failing,
            },
            probe,
        )
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!("{:?} channel is not connected", frame.channel())));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }

    fn state(&self, _channel: ChannelKind) -> ConnectionState {
        ConnectionState::Connected
    }
}

// ─── Peer connection ─────────────────────────────────────────────────

/// Peer that follows the offer/answer state rules and accepts candidates
/// once a remote description is set.
pub struct LoopbackPeer {
    state: Mutex<SignalingState>,
    has_remote: AtomicBool,
    candidates: AtomicUsize,
    closed: AtomicBool,
    tracks: Mutex<Vec<TrackKind>>,
    label: &'static str,
}

impl LoopbackPeer {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalingState::Stable),
            has_remote: AtomicBool::new(false),
            candidates: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            tracks: Mutex::new(Vec::new()),
            label,
        })
    }

    pub fn candidates(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<TrackKind> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn current_state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    fn signaling_state(&self) -> SignalingState {
        *self.state.lock().unwrap()
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state = match (desc.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (SdpKind::Rollback, _) => SignalingState::Stable,
            (kind, current) => return Err(SyncError::Signaling(format!("local {kind:?} in {current:?}"))),
        };
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state = match (desc.kind, *state) {
            (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => return Err(SyncError::Signaling(format!("remote {kind:?} in {current:?}"))),
        };
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(SyncError::Signaling("remote description not set".into()));
        }
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        self.tracks.lock().unwrap().push(track.kind());
        Ok(())
    }

    async fn remove_track(&self, _track_id: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = SignalingState::Closed;
        Ok(())
    }
}

// ─── Media ───────────────────────────────────────────────────────────

pub struct FakeTrack {
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

#[derive(Default)]
pub struct FakeDevices {
    opened: AtomicUsize,
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, request: MediaRequest) -> Result<Vec<Arc<dyn LocalTrack>>> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        for (wanted, kind) in [(request.audio, TrackKind::Audio), (request.video, TrackKind::Video)] {
            if wanted {
                let n = self.opened.fetch_add(1, Ordering::SeqCst);
                tracks.push(Arc::new(FakeTrack {
                    id: format!("{kind:?}-{n}"),
                    kind,
                    enabled: AtomicBool::new(true),
                    live: AtomicBool::new(true),
                }));
            }
        }
        Ok(tracks)
    }
}

// ─── Engine harness ──────────────────────────────────────────────────

pub fn session_with(timer: Option<serde_json::Value>, active: bool) -> Session {
    serde_json::from_value(json!({
        "id": SESSION,
        "user1": TEACHER,
        "user1_name": "Tara",
        "user2": LEARNER,
        "user2_name": "Leo",
        "is_active": active,
        "user1_teaching_time": 600,
        "user2_teaching_time": 120,
        "active_timer": timer
    }))
    .unwrap()
}

pub fn session() -> Session {
    session_with(None, true)
}

pub fn running_timer(teacher: UserId) -> serde_json::Value {
    json!({"id": 31, "teacher": teacher, "start_time": "2026-03-01T10:00:00Z", "is_running": true})
}

pub struct Harness {
    pub handle: EngineHandle,
    pub probe: TransportProbe,
    pub peer: Arc<LoopbackPeer>,
    pub profile: SharedProfile,
}

impl Harness {
    pub fn spawn(local_user: UserId) -> Self {
        let (transport, probe) = RecordingTransport::new();
        let peer = LoopbackPeer::new(if local_user == TEACHER { "caller" } else { "callee" });
        let config = SyncConfig::for_testing("http://127.0.0.1:9", "ws://127.0.0.1:9");
        let ctx = SessionContext {
            session_id: SESSION,
            local_user,
            credential: Credential::bearer("test-token"),
        };
        let parts = EngineParts {
            transport: Box::new(transport),
            peer: peer.clone(),
            peer_events: None,
            media: Arc::new(FakeDevices::default()),
            cache: Arc::new(MemorySnapshotCache::new()),
        };
        let profile = SharedProfile::new();
        let handle = SessionSyncEngine::new(ctx, &config, parts)
            .with_credit_sink(Arc::new(profile.clone()))
            .spawn();
        Self {
            handle,
            probe,
            peer,
            profile,
        }
    }

    /// Connect the session channel and deliver the initial state.
    pub async fn join(&self, session: Session) -> SessionView {
        self.probe.push(TransportEvent::Connected(ChannelKind::Session)).await;
        self.probe.frame(InboundFrame::SessionState { session }).await;
        self.wait_view(|v| v.session.is_some()).await
    }

    pub async fn wait_view(&self, pred: impl Fn(&SessionView) -> bool) -> SessionView {
        let mut watch = self.handle.watch();
        let view = timeout(Duration::from_secs(2), watch.wait_for(|v| pred(v)))
            .await
            .expect("view never reached the expected state")
            .expect("engine stopped")
            .clone();
        view
    }
}
