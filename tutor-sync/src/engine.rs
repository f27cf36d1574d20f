//! Session sync engine.
//!
//! One tokio task owns every component and handles one input at a time:
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!  TransportEvent ────▶ │                              │ ──▶ OutboundFrame (transport)
//!  PeerEvent      ────▶ │      SessionSyncEngine       │ ──▶ SessionEvent  (bus)
//!  EngineCommand  ────▶ │  signaling · collab · chat   │ ──▶ SessionView   (watch)
//!  throttle timer ────▶ │  presence  · session/timer   │ ──▶ CreditSink
//!                       └──────────────────────────────┘
//! ```
//!
//! Ledger commands never mutate local state: they go to the collaborator
//! and the view follows the next authoritative `session_state`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{EventBus, SessionEvent};
use crate::chat::{ChatChannel, ChatReceipt};
use crate::collab::cache::{CacheConfig, MemorySnapshotCache, RocksSnapshotCache, SnapshotCache};
use crate::collab::CollabChannelMultiplexer;
use crate::config::{Credential, SyncConfig, TransportKind};
use crate::error::{Result, SyncError};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::protocol::{
    credits_earned, format_credits, ChannelKind, CodeWorkspace, CreditSummary, InboundFrame, OutboundFrame, Session,
    SessionId, SignalMessage, Timer, UserId, WhiteboardScene,
};
use crate::signaling::peer::{MediaDevices, PeerConnection, PeerEvent, PeerState};
use crate::signaling::{MediaPreferences, NegotiationState, SignalingStateMachine};
use crate::transport::{PollTransport, PushTransport, Transport, TransportEvent};

/// Who is syncing which session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub local_user: UserId,
    pub credential: Credential,
}

/// Everything the UI renders, republished after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: SessionId,
    /// The session channel is up.
    pub is_connected: bool,
    pub session: Option<Session>,
    pub active_timer: Option<Timer>,
    pub your_credits: Option<f64>,
    /// Last user-facing failure, cleared by the next successful command.
    pub error: Option<String>,
    pub negotiation: NegotiationState,
    pub peer_state: PeerState,
    pub media: MediaPreferences,
    pub counterpart_typing: bool,
    pub ended: bool,
    pub ended_by: Option<UserId>,
    pub credit_summary: Option<CreditSummary>,
}

impl SessionView {
    fn new(session_id: SessionId, media: MediaPreferences) -> Self {
        Self {
            session_id,
            is_connected: false,
            session: None,
            active_timer: None,
            your_credits: None,
            error: None,
            negotiation: NegotiationState::Idle,
            peer_state: PeerState::New,
            media,
            counterpart_typing: false,
            ended: false,
            ended_by: None,
            credit_summary: None,
        }
    }

    pub fn clock(&self) -> Option<TeachingClock<'_>> {
        self.session.as_ref().map(TeachingClock::new)
    }
}

// ─── Teaching clock ──────────────────────────────────────────────────

/// Read-only view of a session's teaching time.
#[derive(Debug, Clone, Copy)]
pub struct TeachingClock<'a> {
    session: &'a Session,
}

impl<'a> TeachingClock<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Accumulated seconds for `user`, plus the live timer if it is theirs.
    pub fn total_seconds(&self, user: UserId, now: DateTime<Utc>) -> u64 {
        let live = self
            .session
            .running_timer()
            .filter(|t| t.teacher == user)
            .map_or(0, |t| t.elapsed_at(now));
        self.session.teaching_time(user) + live
    }

    /// Seconds on the running timer, if any.
    pub fn running_elapsed(&self, now: DateTime<Utc>) -> Option<u64> {
        self.session.running_timer().map(|t| t.elapsed_at(now))
    }

    pub fn credits_display(&self, user: UserId, now: DateTime<Utc>) -> String {
        format_credits(credits_earned(self.total_seconds(user, now)))
    }

    /// Someone else's timer is running.
    pub fn is_locked_for(&self, user: UserId) -> bool {
        self.session.running_timer().is_some_and(|t| t.teacher != user)
    }

    pub fn can_start(&self, user: UserId) -> bool {
        self.session.is_active && self.session.is_participant(user) && self.session.running_timer().is_none()
    }

    pub fn can_stop(&self, user: UserId) -> bool {
        self.session.running_timer().is_some_and(|t| t.teacher == user)
    }

    /// `mm:ss`, or `hh:mm:ss` from one hour up.
    pub fn format(seconds: u64) -> String {
        let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
        if h > 0 {
            format!("{h:02}:{m:02}:{s:02}")
        } else {
            format!("{m:02}:{s:02}")
        }
    }
}

// ─── Credit mirroring ────────────────────────────────────────────────

/// Receives the local user's authoritative balance.
pub trait CreditSink: Send + Sync {
    fn set_credits(&self, user: UserId, credits: f64);
}

/// In-process profile store shared with the UI.
#[derive(Debug, Clone, Default)]
pub struct SharedProfile {
    balances: Arc<RwLock<HashMap<UserId, f64>>>,
}

impl SharedProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credits(&self, user: UserId) -> Option<f64> {
        self.balances.read().ok()?.get(&user).copied()
    }
}

impl CreditSink for SharedProfile {
    fn set_credits(&self, user: UserId, credits: f64) {
        if let Ok(mut balances) = self.balances.write() {
            balances.insert(user, credits);
        }
    }
}

// ─── Commands ────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests accepted by the engine task.
pub enum EngineCommand {
    StartTimer(Reply<()>),
    StopTimer(Reply<()>),
    EndSession(Reply<()>),
    RefreshCredits(Reply<()>),
    /// Replies with the pending entry's local id, `None` for blank input.
    SendMessage(String, Reply<Option<Uuid>>),
    SendWhiteboard(WhiteboardScene),
    SendCode(CodeWorkspace),
    SendTyping(bool),
    SetMuted(bool),
    SetVideoOff(bool),
    Reconnect(Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// External collaborators the engine drives.
pub struct EngineParts {
    pub transport: Box<dyn Transport>,
    pub peer: Arc<dyn PeerConnection>,
    pub peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    pub media: Arc<dyn MediaDevices>,
    pub cache: Arc<dyn SnapshotCache>,
}

/// Pick the transport named by `config.transport`.
pub fn build_transport(config: &SyncConfig, ctx: &SessionContext) -> Result<Box<dyn Transport>> {
    Ok(match config.transport {
        TransportKind::Push => Box::new(PushTransport::new(config.clone(), ctx.credential.clone(), ctx.session_id)),
        TransportKind::Poll => Box::new(PollTransport::new(
            config.clone(),
            ctx.credential.clone(),
            ctx.session_id,
            ctx.local_user,
        )?),
    })
}

/// RocksDB cache under `config.cache_path`, in-memory otherwise.
pub fn open_cache(config: &SyncConfig) -> Result<Arc<dyn SnapshotCache>> {
    Ok(match &config.cache_path {
        Some(path) => Arc::new(RocksSnapshotCache::open(CacheConfig::new(path))?),
        None => Arc::new(MemorySnapshotCache::new()),
    })
}

// ─── Engine ──────────────────────────────────────────────────────────

pub struct SessionSyncEngine {
    ctx: SessionContext,
    transport: Box<dyn Transport>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    signaling: SignalingStateMachine,
    collab: CollabChannelMultiplexer,
    chat: ChatChannel,
    presence: PresenceTracker,
    bus: EventBus,
    view: SessionView,
    view_tx: watch::Sender<SessionView>,
    credit_sink: Option<Arc<dyn CreditSink>>,
    disposed: bool,
}

impl SessionSyncEngine {
    pub fn new(ctx: SessionContext, config: &SyncConfig, mut parts: EngineParts) -> Self {
        let mut collab = CollabChannelMultiplexer::new(ctx.session_id, parts.cache, config);
        let restored = collab.mount();
        let signaling = SignalingStateMachine::new(parts.peer, parts.media, restored.media);
        let view = SessionView::new(ctx.session_id, restored.media);
        let (view_tx, _) = watch::channel(view.clone());
        let events = parts.transport.take_events();

        Self {
            chat: ChatChannel::new(ctx.local_user),
            ctx,
            transport: parts.transport,
            events,
            peer_events: parts.peer_events,
            signaling,
            collab,
            presence: PresenceTracker::new(),
            bus: EventBus::new(config.event_buffer.max(1)),
            view,
            view_tx,
            credit_sink: None,
            disposed: false,
        }
    }

    pub fn with_credit_sink(mut self, sink: Arc<dyn CreditSink>) -> Self {
        self.credit_sink = Some(sink);
        self
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn collab(&self) -> &CollabChannelMultiplexer {
        &self.collab
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> EngineHandle {
        let (commands, command_rx) = mpsc::channel(64);
        let handle = EngineHandle {
            commands,
            view: self.view_tx.subscribe(),
            bus: self.bus.clone(),
        };
        tokio::spawn(self.run(command_rx));
        handle
    }

    /// Process inputs until shut down or every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        if let Err(e) = self.transport.connect().await {
            log::warn!("Transport failed to start: {e}");
            self.view.error = Some(e.to_string());
            self.publish_view();
        }
        log::info!(
            "Sync engine running for session {} as user {} over {:?}",
            self.ctx.session_id,
            self.ctx.local_user,
            self.transport.kind()
        );

        loop {
            tokio::select! {
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => self.events = None,
                },
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown(done)) => {
                        self.dispose().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.execute(command).await,
                    None => {
                        self.dispose().await;
                        return;
                    }
                },
                event = next_peer_event(&mut self.peer_events) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => self.peer_events = None,
                },
                _ = sleep_until_deadline(self.collab.next_deadline()) => self.flush_collab().await,
            }
        }
    }

    // ─── Transport events ────────────────────────────────────────────

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.disposed {
            return;
        }
        match event {
            TransportEvent::Connected(channel) => {
                self.bus.publish(SessionEvent::ChannelConnected(channel));
                if channel == ChannelKind::Session {
                    self.view.is_connected = true;
                    if self.signaling.is_started() {
                        let signals = self.signaling.reannounce();
                        self.send_signals(signals).await;
                    } else {
                        self.start_media().await;
                    }
                }
            }
            TransportEvent::Disconnected(channel) => {
                self.bus.publish(SessionEvent::ChannelDisconnected(channel));
                if channel == ChannelKind::Session {
                    self.view.is_connected = false;
                }
            }
            TransportEvent::Rejected(channel, code) => {
                log::warn!("{channel:?} channel rejected ({code})");
                self.bus.publish(SessionEvent::ChannelRejected(channel));
                if channel == ChannelKind::Session {
                    self.view.is_connected = false;
                    self.view.error = Some(SyncError::Rejected(code).to_string());
                }
            }
            TransportEvent::Frame {
                channel,
                session_id,
                frame,
            } => {
                if session_id.is_some_and(|id| id != self.ctx.session_id) {
                    log::debug!("Dropping {channel:?} frame for stale session {session_id:?}");
                    return;
                }
                self.handle_frame(frame).await;
            }
        }
        self.publish_view();
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::SessionState { session } => self.replace_session(session).await,
            InboundFrame::TimerStarted {
                teacher_id,
                teacher_name,
                start_time,
                timer_id,
            } => {
                let timer = Timer {
                    id: timer_id,
                    teacher: teacher_id,
                    teacher_name,
                    start_time,
                    end_time: None,
                    duration_seconds: None,
                    is_running: true,
                };
                self.timer_started(timer).await;
            }
            InboundFrame::TimerStopped {
                teacher_id,
                duration_seconds,
                new_total_time,
                ..
            } => self.timer_stopped(teacher_id, duration_seconds, new_total_time),
            InboundFrame::SessionEnded {
                ended_by,
                credit_summary,
                your_credits,
            } => {
                self.view.ended = true;
                self.view.ended_by = ended_by.or(self.view.ended_by);
                if credit_summary.is_some() {
                    self.view.credit_summary = credit_summary.clone();
                }
                self.view.active_timer = None;
                if let Some(session) = self.view.session.as_mut() {
                    session.is_active = false;
                    session.active_timer = None;
                }
                if let Some(credits) = your_credits {
                    self.set_credits(credits);
                }
                log::info!("Session {} ended by {ended_by:?}", self.ctx.session_id);
                self.bus.publish(SessionEvent::SessionEnded {
                    ended_by,
                    summary: credit_summary,
                });
                self.signaling.dispose().await;
                self.sync_negotiation();
            }
            InboundFrame::CreditUpdate { user_id, new_balance } => {
                if user_id == self.ctx.local_user {
                    self.set_credits(new_balance);
                } else {
                    log::debug!("Ignoring credit update for user {user_id}");
                }
            }
            InboundFrame::CreditBalance { credits } => self.set_credits(credits),
            InboundFrame::Signal { payload } => {
                if payload.sender_id == Some(self.ctx.local_user) {
                    return;
                }
                let replies = self.signaling.handle_signal(payload).await;
                self.send_signals(replies).await;
                self.sync_negotiation();
            }
            InboundFrame::WhiteboardUpdate { data } => {
                if let Some(applied) = self.collab.apply_remote_whiteboard(data, Instant::now()) {
                    self.bus.publish(SessionEvent::WhiteboardApplied(applied));
                }
            }
            InboundFrame::CodeUpdate { data } => {
                if let Some(applied) = self.collab.apply_remote_code(data, Instant::now()) {
                    self.bus.publish(SessionEvent::CodeApplied(applied));
                }
            }
            InboundFrame::ChatMessage(message) => {
                match self.chat.receive(message) {
                    ChatReceipt::Appended(message) => {
                        self.bus.publish(SessionEvent::ChatAppended(message));
                    }
                    ChatReceipt::Confirmed { local_id, message } => {
                        self.bus.publish(SessionEvent::ChatConfirmed { local_id, message });
                    }
                    ChatReceipt::Duplicate => {}
                }
                self.view.counterpart_typing = self.chat.counterpart_typing();
            }
            InboundFrame::Typing { user, is_typing } => {
                if self.chat.typing(user.id, is_typing) {
                    self.bus.publish(SessionEvent::Typing {
                        user: user.id,
                        is_typing,
                    });
                }
                self.view.counterpart_typing = self.chat.counterpart_typing();
            }
            presence @ (InboundFrame::OnlineUsers { .. } | InboundFrame::PresenceUpdate { .. }) => {
                match self.presence.apply(&presence) {
                    PresenceChange::Replaced(count) => {
                        self.bus.publish(SessionEvent::PresenceReplaced(count));
                    }
                    PresenceChange::Joined(user) => {
                        self.bus.publish(SessionEvent::PresenceChanged { user: user.id, online: true });
                    }
                    PresenceChange::Left(user) => {
                        self.bus.publish(SessionEvent::PresenceChanged { user, online: false });
                    }
                    PresenceChange::Unchanged => {}
                }
            }
            InboundFrame::Error { message } => {
                log::warn!("Collaborator error: {message}");
                self.bus.publish(SessionEvent::CommandFailed(message.clone()));
                self.view.error = Some(message);
            }
            InboundFrame::HeartbeatAck { .. } => log::trace!("Heartbeat acknowledged"),
        }
    }

    async fn replace_session(&mut self, session: Session) {
        if session.id != self.ctx.session_id {
            log::debug!("Dropping state for session {} (tracking {})", session.id, self.ctx.session_id);
            return;
        }
        if let Some(role) = session.role_of(self.ctx.local_user) {
            if self.signaling.assign_role(role) {
                log::info!("Joined session {} as {role:?}", session.id);
            }
        } else {
            log::warn!("User {} is not a participant of session {}", self.ctx.local_user, session.id);
        }
        self.chat.set_counterpart(session.counterpart(self.ctx.local_user));
        self.view.active_timer = session.running_timer().cloned();
        if !session.is_active {
            // Media teardown waits for session_ended, which carries the settlement.
            self.view.ended = true;
        }
        self.view.session = Some(session.clone());
        self.bus.publish(SessionEvent::SessionReplaced(session));

        if self.view.is_connected && !self.view.ended && !self.signaling.is_started() {
            self.start_media().await;
        }
    }

    async fn timer_started(&mut self, timer: Timer) {
        let Some(session) = self.view.session.as_mut() else {
            log::debug!("timer_started before session state; requesting refresh");
            self.transport.refresh().await;
            return;
        };
        if !session.is_participant(timer.teacher) {
            log::warn!("Dropping timer_started for non-participant {}", timer.teacher);
            return;
        }
        session.active_timer = Some(timer.clone());
        self.view.active_timer = Some(timer.clone());
        self.bus.publish(SessionEvent::TimerStarted(timer));
    }

    fn timer_stopped(&mut self, teacher: UserId, duration_seconds: u64, new_total: Option<u64>) {
        let Some(session) = self.view.session.as_mut() else {
            log::debug!("timer_stopped before session state");
            return;
        };
        if !session.is_participant(teacher) {
            log::warn!("Dropping timer_stopped for non-participant {teacher}");
            return;
        }
        let total = new_total.unwrap_or_else(|| session.teaching_time(teacher) + duration_seconds);
        session.set_teaching_time(teacher, total);
        session.active_timer = None;
        self.view.active_timer = None;
        self.bus.publish(SessionEvent::TimerStopped {
            teacher,
            duration_seconds,
            total_seconds: total,
        });
    }

    fn set_credits(&mut self, credits: f64) {
        self.view.your_credits = Some(credits);
        if let Some(sink) = &self.credit_sink {
            sink.set_credits(self.ctx.local_user, credits);
        }
        self.bus.publish(SessionEvent::CreditsChanged(credits));
    }

    // ─── Peer events ─────────────────────────────────────────────────

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(signal) = self.signaling.local_candidate(candidate) {
                    self.send_signals(vec![signal]).await;
                }
            }
            PeerEvent::StateChanged(state) => self.signaling.set_peer_state(state),
        }
        self.sync_negotiation();
        self.publish_view();
    }

    async fn start_media(&mut self) {
        let signals = self.signaling.start().await;
        self.send_signals(signals).await;
        self.sync_negotiation();
    }

    async fn send_signals(&mut self, signals: Vec<SignalMessage>) {
        for payload in signals {
            let name = payload.signal.name();
            if let Err(e) = self.transport.send(OutboundFrame::Signal { payload }).await {
                log::debug!("{name} signal not delivered: {e}");
            }
        }
    }

    fn sync_negotiation(&mut self) {
        let state = self.signaling.state();
        if self.view.negotiation != state {
            self.view.negotiation = state;
            self.bus.publish(SessionEvent::NegotiationChanged(state));
        }
        let peer = self.signaling.peer_state();
        if self.view.peer_state != peer {
            self.view.peer_state = peer;
            self.bus.publish(SessionEvent::PeerStateChanged(peer));
        }
    }

    // ─── Commands ────────────────────────────────────────────────────

    pub async fn execute(&mut self, command: EngineCommand) {
        if self.disposed {
            reject_stopped(command);
            return;
        }
        match command {
            EngineCommand::StartTimer(reply) => {
                let result = self.start_timer().await;
                self.finish_command(reply, result);
            }
            EngineCommand::StopTimer(reply) => {
                let result = self.stop_timer().await;
                self.finish_command(reply, result);
            }
            EngineCommand::EndSession(reply) => {
                let result = self.end_session().await;
                self.finish_command(reply, result);
            }
            EngineCommand::RefreshCredits(reply) => {
                let result = self.transport.send(OutboundFrame::GetCredits).await;
                self.finish_command(reply, result);
            }
            EngineCommand::SendMessage(text, reply) => {
                let result = self.send_message(&text).await;
                self.publish_view();
                let _ = reply.send(result);
            }
            EngineCommand::SendWhiteboard(scene) => {
                if let Some(frame) = self.collab.local_whiteboard(scene, Instant::now()) {
                    self.send_collab(frame).await;
                }
            }
            EngineCommand::SendCode(workspace) => {
                if let Some(frame) = self.collab.local_code(workspace, Instant::now()) {
                    self.send_collab(frame).await;
                }
            }
            EngineCommand::SendTyping(is_typing) => {
                if let Err(e) = self.transport.send(OutboundFrame::Typing { is_typing }).await {
                    log::debug!("Typing indicator not sent: {e}");
                }
            }
            EngineCommand::SetMuted(muted) => {
                self.signaling.set_muted(muted);
                self.save_media();
            }
            EngineCommand::SetVideoOff(video_off) => {
                let signals = self.signaling.set_video_off(video_off).await;
                self.send_signals(signals).await;
                self.save_media();
                self.sync_negotiation();
            }
            EngineCommand::Reconnect(reply) => {
                let result = self.reconnect().await;
                self.finish_command(reply, result);
            }
            EngineCommand::Shutdown(done) => {
                self.dispose().await;
                let _ = done.send(());
            }
        }
        self.publish_view();
    }

    fn loaded_session(&self) -> Result<&Session> {
        self.view
            .session
            .as_ref()
            .ok_or_else(|| SyncError::Command("Session is still loading".into()))
    }

    async fn start_timer(&mut self) -> Result<()> {
        let me = self.ctx.local_user;
        let session = self.loaded_session()?;
        if !session.is_active {
            return Err(SyncError::Command("Session has ended".into()));
        }
        if !session.is_participant(me) {
            return Err(SyncError::Command("You are not a participant of this session".into()));
        }
        if let Some(timer) = session.running_timer() {
            return Err(SyncError::Command(if timer.teacher == me {
                "Your timer is already running".into()
            } else {
                "The other participant is teaching right now".into()
            }));
        }
        self.transport.send(OutboundFrame::TimerStart).await?;
        self.transport.refresh().await;
        Ok(())
    }

    async fn stop_timer(&mut self) -> Result<()> {
        let me = self.ctx.local_user;
        let session = self.loaded_session()?;
        match session.running_timer() {
            None => return Err(SyncError::Command("No timer is running".into())),
            Some(timer) if timer.teacher != me => {
                return Err(SyncError::Command("Only the teacher can stop the timer".into()));
            }
            Some(_) => {}
        }
        self.transport.send(OutboundFrame::TimerStop).await?;
        self.transport.refresh().await;
        Ok(())
    }

    async fn end_session(&mut self) -> Result<()> {
        if !self.loaded_session()?.is_active {
            return Err(SyncError::Command("Session has already ended".into()));
        }
        self.transport.send(OutboundFrame::EndSession).await?;
        self.transport.refresh().await;
        Ok(())
    }

    async fn send_message(&mut self, text: &str) -> Result<Option<Uuid>> {
        let Some((local_id, frame)) = self.chat.compose(text) else {
            return Ok(None);
        };
        match self.transport.send(frame).await {
            Ok(()) => Ok(Some(local_id)),
            Err(e) => {
                let reason = e.to_string();
                self.chat.fail(local_id, reason.clone());
                self.bus.publish(SessionEvent::ChatFailed { local_id, reason });
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        if !self.ctx.credential.is_valid() {
            return Err(SyncError::Transport("credential expired".into()));
        }
        self.transport.disconnect().await;
        self.view.is_connected = false;
        self.transport.connect().await
    }

    fn finish_command(&mut self, reply: Reply<()>, result: Result<()>) {
        match &result {
            Ok(()) => self.view.error = None,
            Err(e) => {
                log::info!("Command failed: {e}");
                self.view.error = Some(e.to_string());
                self.bus.publish(SessionEvent::CommandFailed(e.to_string()));
            }
        }
        self.publish_view();
        let _ = reply.send(result);
    }

    async fn send_collab(&mut self, frame: OutboundFrame) {
        if let Err(e) = self.transport.send(frame).await {
            log::debug!("Collab snapshot not delivered: {e}");
        }
    }

    async fn flush_collab(&mut self) {
        for frame in self.collab.flush_due(Instant::now()) {
            self.send_collab(frame).await;
        }
    }

    fn save_media(&mut self) {
        let prefs = self.signaling.preferences();
        self.collab.save_media_preferences(prefs);
        self.view.media = prefs;
    }

    // ─── Teardown ────────────────────────────────────────────────────

    /// Stop transports, media and timers. Idempotent.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.transport.disconnect().await;
        self.signaling.dispose().await;
        self.presence.clear();
        self.view.is_connected = false;
        self.sync_negotiation();
        self.publish_view();
        log::info!("Sync engine for session {} disposed", self.ctx.session_id);
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.view.clone());
    }
}

fn reject_stopped(command: EngineCommand) {
    match command {
        EngineCommand::StartTimer(reply)
        | EngineCommand::StopTimer(reply)
        | EngineCommand::EndSession(reply)
        | EngineCommand::RefreshCredits(reply)
        | EngineCommand::Reconnect(reply) => {
            let _ = reply.send(Err(SyncError::EngineStopped));
        }
        EngineCommand::SendMessage(_, reply) => {
            let _ = reply.send(Err(SyncError::EngineStopped));
        }
        EngineCommand::Shutdown(done) => {
            let _ = done.send(());
        }
        _ => {}
    }
}

async fn next_event(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(rx: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ─── Handle ──────────────────────────────────────────────────────────

/// Cloneable front door to a spawned engine. Dropping the last handle
/// disposes the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    view: watch::Receiver<SessionView>,
    bus: EventBus,
}

impl EngineHandle {
    /// Latest view snapshot.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub async fn start_timer(&self) -> Result<()> {
        self.request(EngineCommand::StartTimer).await
    }

    pub async fn stop_timer(&self) -> Result<()> {
        self.request(EngineCommand::StopTimer).await
    }

    pub async fn end_session(&self) -> Result<()> {
        self.request(EngineCommand::EndSession).await
    }

    pub async fn refresh_credits(&self) -> Result<()> {
        self.request(EngineCommand::RefreshCredits).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.request(EngineCommand::Reconnect).await
    }

    /// Send a chat message. Returns the pending entry's id, or `None` when
    /// the text was blank.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<Option<Uuid>> {
        let text = text.into();
        self.request(|reply| EngineCommand::SendMessage(text, reply)).await
    }

    pub async fn send_whiteboard(&self, scene: WhiteboardScene) -> Result<()> {
        self.tell(EngineCommand::SendWhiteboard(scene)).await
    }

    pub async fn send_code(&self, workspace: CodeWorkspace) -> Result<()> {
        self.tell(EngineCommand::SendCode(workspace)).await
    }

    pub async fn send_typing(&self, is_typing: bool) -> Result<()> {
        self.tell(EngineCommand::SendTyping(is_typing)).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.tell(EngineCommand::SetMuted(muted)).await
    }

    pub async fn set_video_off(&self, video_off: bool) -> Result<()> {
        self.tell(EngineCommand::SetVideoOff(video_off)).await
    }

    /// Dispose the engine and wait until teardown finished.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tell(EngineCommand::Shutdown(done)).await?;
        wait.await.map_err(|_| SyncError::EngineStopped)
    }

    async fn tell(&self, command: EngineCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| SyncError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tell(make(reply)).await?;
        response.await.map_err(|_| SyncError::EngineStopped)?
    }
}
