//! Whiteboard and code editor synchronization.
//!
//! Both documents travel as complete snapshots; the last one to arrive wins.
//!
//! ```text
//!  local edit ──▶ echo check ──▶ stamp(local, rev) ──▶ throttle ──▶ OutboundFrame
//!                    ▲                                    │ leading edge: now
//!                    │ import guard                       │ trailing edge: at deadline
//!  remote frame ─▶ revision check ──▶ apply ──────────────┘ (pending dropped while importing)
//! ```
//!
//! Every accepted snapshot, local or remote, is written to the
//! [`cache::SnapshotCache`] so a remount restores it before any remote
//! update arrives.

pub mod cache;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::protocol::{CodeWorkspace, MonotonicStamp, OutboundFrame, SessionId, SnapshotSource, WhiteboardScene};
use crate::signaling::MediaPreferences;
use cache::{load_json, store_json, CacheSlot, SnapshotCache};

/// A full-state collaborative document.
pub trait Snapshot: Clone + PartialEq + Serialize + DeserializeOwned {
    const SLOT: CacheSlot;

    fn revision(&self) -> Option<u64>;

    fn stamp(&mut self, source: SnapshotSource, revision: Option<u64>);

    fn into_frame(self) -> OutboundFrame;

    /// Content only, without origin metadata.
    fn content(&self) -> Self {
        let mut bare = self.clone();
        bare.stamp_clear();
        bare
    }

    fn stamp_clear(&mut self);
}

impl Snapshot for WhiteboardScene {
    const SLOT: CacheSlot = CacheSlot::Whiteboard;

    fn revision(&self) -> Option<u64> {
        self.revision
    }

    fn stamp(&mut self, source: SnapshotSource, revision: Option<u64>) {
        self.source = Some(source);
        if revision.is_some() {
            self.revision = revision;
        }
    }

    fn stamp_clear(&mut self) {
        self.source = None;
        self.revision = None;
    }

    fn into_frame(self) -> OutboundFrame {
        OutboundFrame::WhiteboardUpdate { data: self }
    }
}

impl Snapshot for CodeWorkspace {
    const SLOT: CacheSlot = CacheSlot::Code;

    fn revision(&self) -> Option<u64> {
        self.revision
    }

    fn stamp(&mut self, source: SnapshotSource, revision: Option<u64>) {
        self.source = Some(source);
        if revision.is_some() {
            self.revision = revision;
        }
    }

    fn stamp_clear(&mut self) {
        self.source = None;
        self.revision = None;
    }

    fn into_frame(self) -> OutboundFrame {
        OutboundFrame::CodeUpdate { data: self }
    }
}

// ─── Throttle ────────────────────────────────────────────────────────

/// When a throttled broadcast may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Leading edge: send immediately.
    Now,
    /// Inside the window: send the latest state at this deadline.
    Later(Instant),
}

/// Leading + trailing edge throttle.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_sent: Option<Instant>,
    deadline: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            deadline: None,
        }
    }

    pub fn poll(&mut self, now: Instant) -> ThrottleDecision {
        match self.last_sent {
            Some(sent) if now < sent + self.interval => {
                let deadline = sent + self.interval;
                self.deadline = Some(deadline);
                ThrottleDecision::Later(deadline)
            }
            _ => {
                self.last_sent = Some(now);
                self.deadline = None;
                ThrottleDecision::Now
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the trailing edge if it is due.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.last_sent = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

// ─── Lanes ───────────────────────────────────────────────────────────

/// One synchronized document.
struct Lane<S: Snapshot> {
    current: Option<S>,
    pending: Option<S>,
    last_imported: Option<S>,
    last_remote_revision: Option<u64>,
    importing_until: Option<Instant>,
    throttle: Throttle,
}

impl<S: Snapshot> Lane<S> {
    fn new(throttle: Duration) -> Self {
        Self {
            current: None,
            pending: None,
            last_imported: None,
            last_remote_revision: None,
            importing_until: None,
            throttle: Throttle::new(throttle),
        }
    }

    fn is_importing(&self, now: Instant) -> bool {
        self.importing_until.is_some_and(|until| now < until)
    }

    fn local(&mut self, mut snapshot: S, revision: u64, now: Instant) -> LocalOutcome<S> {
        if self.is_importing(now) {
            return LocalOutcome::Suppressed;
        }
        if self.last_imported.as_ref() == Some(&snapshot.content()) {
            return LocalOutcome::Suppressed;
        }
        snapshot.stamp(SnapshotSource::Local, Some(revision));
        self.current = Some(snapshot.clone());
        match self.throttle.poll(now) {
            ThrottleDecision::Now => {
                self.pending = None;
                LocalOutcome::Send(snapshot)
            }
            ThrottleDecision::Later(_) => {
                self.pending = Some(snapshot.clone());
                LocalOutcome::Deferred(snapshot)
            }
        }
    }

    fn remote(&mut self, mut snapshot: S, now: Instant, guard: Duration) -> Option<S> {
        if let (Some(incoming), Some(seen)) = (snapshot.revision(), self.last_remote_revision) {
            if incoming <= seen {
                log::debug!("Dropping {:?} snapshot revision {incoming} (seen {seen})", S::SLOT);
                return None;
            }
        }
        if let Some(incoming) = snapshot.revision() {
            self.last_remote_revision = Some(incoming);
        }
        snapshot.stamp(SnapshotSource::Remote, None);
        self.importing_until = Some(now + guard);
        self.last_imported = Some(snapshot.content());
        self.current = Some(snapshot.clone());
        Some(snapshot)
    }

    fn flush(&mut self, now: Instant) -> Option<S> {
        if !self.throttle.take_due(now) {
            return None;
        }
        let pending = self.pending.take()?;
        if self.is_importing(now) {
            log::debug!("Dropping trailing {:?} broadcast during import", S::SLOT);
            return None;
        }
        Some(pending)
    }
}

enum LocalOutcome<S> {
    Send(S),
    /// Accepted; goes out on the trailing edge.
    Deferred(S),
    Suppressed,
}

// ─── Multiplexer ─────────────────────────────────────────────────────

/// What mounting restored from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Restored {
    pub whiteboard: Option<WhiteboardScene>,
    pub code: CodeWorkspace,
    pub media: MediaPreferences,
}

pub struct CollabChannelMultiplexer {
    session_id: SessionId,
    cache: Arc<dyn SnapshotCache>,
    import_guard: Duration,
    stamp: MonotonicStamp,
    whiteboard: Lane<WhiteboardScene>,
    code: Lane<CodeWorkspace>,
}

impl CollabChannelMultiplexer {
    pub fn new(session_id: SessionId, cache: Arc<dyn SnapshotCache>, config: &SyncConfig) -> Self {
        Self {
            session_id,
            cache,
            import_guard: config.import_guard,
            stamp: MonotonicStamp::new(),
            whiteboard: Lane::new(config.whiteboard_throttle),
            code: Lane::new(config.code_throttle),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Restore cached state. Call before applying any remote update.
    pub fn mount(&mut self) -> Restored {
        let whiteboard = self.load::<WhiteboardScene>();
        let code = self
            .load::<CodeWorkspace>()
            .map(CodeWorkspace::normalized)
            .unwrap_or_else(CodeWorkspace::starter);
        let media = match load_json::<MediaPreferences>(self.cache.as_ref(), self.session_id, CacheSlot::Media) {
            Ok(prefs) => prefs.unwrap_or_default(),
            Err(e) => {
                log::warn!("Failed to read media preferences: {e}");
                MediaPreferences::default()
            }
        };

        self.whiteboard.current = whiteboard.clone();
        self.code.current = Some(code.clone());
        log::debug!(
            "Mounted collab state for session {} (whiteboard cached: {})",
            self.session_id,
            whiteboard.is_some()
        );
        Restored { whiteboard, code, media }
    }

    pub fn whiteboard(&self) -> Option<&WhiteboardScene> {
        self.whiteboard.current.as_ref()
    }

    pub fn code(&self) -> Option<&CodeWorkspace> {
        self.code.current.as_ref()
    }

    /// A local whiteboard edit. Returns the frame to send now, if any.
    pub fn local_whiteboard(&mut self, scene: WhiteboardScene, now: Instant) -> Option<OutboundFrame> {
        let revision = self.stamp.next();
        let outcome = self.whiteboard.local(scene, revision, now);
        self.settle_local(outcome)
    }

    /// A local code edit. Returns the frame to send now, if any.
    pub fn local_code(&mut self, workspace: CodeWorkspace, now: Instant) -> Option<OutboundFrame> {
        let revision = self.stamp.next();
        let outcome = self.code.local(workspace.normalized(), revision, now);
        self.settle_local(outcome)
    }

    fn settle_local<S: Snapshot>(&mut self, outcome: LocalOutcome<S>) -> Option<OutboundFrame> {
        match outcome {
            LocalOutcome::Send(snapshot) => {
                self.persist(&snapshot);
                Some(snapshot.into_frame())
            }
            LocalOutcome::Deferred(snapshot) => {
                self.persist(&snapshot);
                None
            }
            LocalOutcome::Suppressed => None,
        }
    }

    /// A remote whiteboard snapshot. Returns what to render, or `None` for
    /// a duplicate.
    pub fn apply_remote_whiteboard(&mut self, scene: WhiteboardScene, now: Instant) -> Option<WhiteboardScene> {
        let applied = self.whiteboard.remote(scene, now, self.import_guard)?;
        self.persist(&applied);
        Some(applied)
    }

    pub fn apply_remote_code(&mut self, workspace: CodeWorkspace, now: Instant) -> Option<CodeWorkspace> {
        let applied = self.code.remote(workspace.normalized(), now, self.import_guard)?;
        self.persist(&applied);
        Some(applied)
    }

    /// Earliest pending trailing-edge deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.whiteboard.throttle.next_deadline(), self.code.throttle.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Trailing-edge broadcasts due at `now`.
    pub fn flush_due(&mut self, now: Instant) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        if let Some(scene) = self.whiteboard.flush(now) {
            frames.push(scene.into_frame());
        }
        if let Some(workspace) = self.code.flush(now) {
            frames.push(workspace.into_frame());
        }
        frames
    }

    pub fn save_media_preferences(&self, prefs: MediaPreferences) {
        if let Err(e) = store_json(self.cache.as_ref(), self.session_id, CacheSlot::Media, &prefs) {
            log::warn!("Failed to persist media preferences: {e}");
        }
    }

    fn load<S: Snapshot>(&self) -> Option<S> {
        match load_json::<S>(self.cache.as_ref(), self.session_id, S::SLOT) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to restore {:?} snapshot: {e}", S::SLOT);
                None
            }
        }
    }

    fn persist<S: Snapshot>(&self, snapshot: &S) {
        if let Err(e) = store_json(self.cache.as_ref(), self.session_id, S::SLOT, snapshot) {
            log::warn!("Failed to cache {:?} snapshot: {e}", S::SLOT);
        }
    }
}
