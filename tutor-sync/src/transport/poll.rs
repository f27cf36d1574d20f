//! Polling transport: periodic REST fetches turned into frames.
//!
//! ```text
//!  session  every 1.5s  GET /sessions/{id}/updates/  ─┐
//!  chat     every 3s    GET /chat/{id}/messages/      ├─ CursorState ─▶ frames
//!  presence every 30s   GET /presence/online/        ─┘
//!  heartbeat every 30s  POST /presence/heartbeat/
//! ```
//!
//! A channel never has two fetches in flight: a tick that finds the
//! previous fetch still running is skipped. Commands go straight to the
//! REST endpoints and trigger an immediate session poll.
//!
//! Every poll remembers the cursor generation it started under. A
//! disconnect bumps the generation, so a fetch that outlives it neither
//! touches the fresh cursors nor emits anything.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cursor::CursorState;
use super::{ConnectionState, LinkState, Transport, TransportEvent};
use crate::config::{Credential, SyncConfig, TransportKind};
use crate::error::{Result, SyncError};
use crate::protocol::{ChannelKind, InboundFrame, OutboundFrame, SessionId, UserId};
use crate::rest::{RestClient, SyncPayload};

/// At most one holder at a time; entering never waits.
#[derive(Debug, Default)]
pub struct PollGate(AtomicBool);

impl PollGate {
    pub fn try_enter(&self) -> Option<PollGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard(self))
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct PollGuard<'a>(&'a PollGate);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct PollChannel {
    state: Arc<LinkState>,
    gate: Arc<PollGate>,
}

/// Everything a poll task needs, cheap to clone into each task.
#[derive(Clone)]
struct PollContext {
    api: Arc<RestClient>,
    session_id: SessionId,
    local_user: UserId,
    cursors: Arc<Mutex<CursorState>>,
    generation: u64,
    events: mpsc::Sender<TransportEvent>,
}

impl PollContext {
    /// The cursors, unless they were reset after this poll started.
    fn cursors(&self) -> Option<MutexGuard<'_, CursorState>> {
        let cursors = lock(&self.cursors);
        (cursors.generation() == self.generation).then_some(cursors)
    }

    fn is_current(&self) -> bool {
        self.cursors().is_some()
    }

    async fn emit(&self, event: TransportEvent) -> ControlFlow<()> {
        if !self.is_current() {
            return ControlFlow::Break(());
        }
        match self.events.send(event).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn scope(&self, channel: ChannelKind) -> Option<SessionId> {
        (channel != ChannelKind::Presence).then_some(self.session_id)
    }

    /// Fetch one channel and dispatch whatever changed. `Break` stops the
    /// channel task.
    async fn poll_once(&self, channel: ChannelKind, link: &PollChannel) -> ControlFlow<()> {
        let Some(_guard) = link.gate.try_enter() else {
            log::trace!("{channel:?} poll still in flight, skipping tick");
            return ControlFlow::Continue(());
        };

        let fetched = match channel {
            ChannelKind::Session => self
                .api
                .session_updates(self.session_id)
                .await
                .map(|updates| self.cursors().map(|mut c| c.diff_updates(&updates, self.local_user))),
            ChannelKind::Chat => {
                let Some(since) = self.cursors().map(|c| c.last_message_id()) else {
                    return ControlFlow::Break(());
                };
                self.api
                    .chat_messages(self.session_id, since)
                    .await
                    .map(|batch| self.cursors().map(|mut c| c.diff_chat(batch)))
            }
            ChannelKind::Presence => self
                .api
                .online_users()
                .await
                .map(|users| self.is_current().then(|| vec![InboundFrame::OnlineUsers { users }])),
        };

        match fetched {
            Ok(None) => {
                log::debug!("Discarding {channel:?} poll from before a disconnect");
                ControlFlow::Break(())
            }
            Ok(Some(frames)) => {
                if link.state.get() != ConnectionState::Connected {
                    link.state.set(ConnectionState::Connected);
                    self.emit(TransportEvent::Connected(channel)).await?;
                }
                for frame in frames {
                    self.emit(TransportEvent::Frame {
                        channel,
                        session_id: self.scope(channel),
                        frame,
                    })
                    .await?;
                }
                ControlFlow::Continue(())
            }
            Err(_) if !self.is_current() => ControlFlow::Break(()),
            Err(SyncError::Rejected(status)) => {
                let was_connected = link.state.get() == ConnectionState::Connected;
                link.state.set(ConnectionState::Disconnected);
                if was_connected {
                    self.emit(TransportEvent::Disconnected(channel)).await?;
                }
                let _ = self.emit(TransportEvent::Rejected(channel, status)).await;
                ControlFlow::Break(())
            }
            Err(e) => {
                log::debug!("{channel:?} poll failed: {e}");
                if link.state.get() == ConnectionState::Connected {
                    link.state.set(ConnectionState::Reconnecting);
                    self.emit(TransportEvent::Disconnected(channel)).await?;
                }
                ControlFlow::Continue(())
            }
        }
    }
}

pub struct PollTransport {
    config: SyncConfig,
    api: Arc<RestClient>,
    credential: Credential,
    session_id: SessionId,
    local_user: UserId,
    cursors: Arc<Mutex<CursorState>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    channels: HashMap<ChannelKind, Arc<PollChannel>>,
    tasks: Vec<JoinHandle<()>>,
    /// One-off polls started by `refresh`.
    refreshes: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PollTransport {
    pub fn new(config: SyncConfig, credential: Credential, session_id: SessionId, local_user: UserId) -> Result<Self> {
        let api = RestClient::new(config.api_base.clone(), credential.clone(), config.request_timeout)?;
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let channels = [ChannelKind::Session, ChannelKind::Chat, ChannelKind::Presence]
            .into_iter()
            .map(|kind| (kind, Arc::new(PollChannel::default())))
            .collect();
        Ok(Self {
            config,
            api: Arc::new(api),
            credential,
            session_id,
            local_user,
            cursors: Arc::new(Mutex::new(CursorState::new())),
            events_tx,
            events_rx: Some(events_rx),
            channels,
            tasks: Vec::new(),
            refreshes: Mutex::new(Vec::new()),
        })
    }

    fn context(&self) -> PollContext {
        PollContext {
            api: self.api.clone(),
            session_id: self.session_id,
            local_user: self.local_user,
            cursors: self.cursors.clone(),
            generation: lock(&self.cursors).generation(),
            events: self.events_tx.clone(),
        }
    }

    fn channel(&self, kind: ChannelKind) -> Arc<PollChannel> {
        self.channels.get(&kind).cloned().unwrap_or_default()
    }

    fn period(&self, kind: ChannelKind) -> Duration {
        match kind {
            ChannelKind::Session => self.config.session_poll_interval,
            ChannelKind::Chat => self.config.chat_poll_interval,
            ChannelKind::Presence => self.config.presence_poll_interval,
        }
    }

    fn spawn_all(&mut self) {
        for kind in [ChannelKind::Session, ChannelKind::Chat, ChannelKind::Presence] {
            let ctx = self.context();
            let link = self.channel(kind);
            let period = self.period(kind);
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if ctx.poll_once(kind, &link).await.is_break() {
                        return;
                    }
                }
            }));
        }

        let api = self.api.clone();
        let period = self.config.heartbeat_interval;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = api.heartbeat().await {
                    log::debug!("Heartbeat failed: {e}");
                }
            }
        }));
    }

    fn stop_all(&mut self) {
        let refreshes = self.refreshes.get_mut().unwrap_or_else(|p| p.into_inner());
        for task in self.tasks.drain(..).chain(refreshes.drain(..)) {
            task.abort();
        }
        for link in self.channels.values() {
            link.state.set(ConnectionState::Disconnected);
        }
    }

    async fn emit_local(&self, channel: ChannelKind, frame: InboundFrame) -> Result<()> {
        let event = TransportEvent::Frame {
            channel,
            session_id: Some(self.session_id),
            frame,
        };
        self.events_tx.send(event).await.map_err(|_| SyncError::EngineStopped)
    }
}

#[async_trait::async_trait]
impl Transport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.credential.is_valid() {
            return Err(SyncError::Transport("credential expired".into()));
        }
        if self.tasks.is_empty() {
            self.spawn_all();
            log::info!("Poll transport started for session {}", self.session_id);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.stop_all();
        lock(&self.cursors).reset();
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let session = self.session_id;
        match frame {
            OutboundFrame::TimerStart => {
                self.api.start_timer(session).await?;
                self.refresh().await;
            }
            OutboundFrame::TimerStop => {
                self.api.stop_timer(session).await?;
                self.refresh().await;
            }
            OutboundFrame::EndSession => {
                self.api.end_session(session).await?;
                self.refresh().await;
            }
            OutboundFrame::GetCredits => {
                let credits = self.api.credits().await?;
                self.emit_local(ChannelKind::Session, InboundFrame::CreditBalance { credits })
                    .await?;
            }
            OutboundFrame::Signal { payload } => {
                let body = SyncPayload {
                    signal_data: Some(payload),
                    ..Default::default()
                };
                self.api.sync(session, &body).await?;
            }
            OutboundFrame::WhiteboardUpdate { data } => {
                lock(&self.cursors).record_sent_whiteboard(data.clone());
                let body = SyncPayload {
                    whiteboard_data: Some(data),
                    ..Default::default()
                };
                self.api.sync(session, &body).await?;
            }
            OutboundFrame::CodeUpdate { data } => {
                lock(&self.cursors).record_sent_code(data.clone());
                let body = SyncPayload {
                    code_data: Some(data),
                    ..Default::default()
                };
                self.api.sync(session, &body).await?;
            }
            OutboundFrame::ChatMessage { message } => {
                let stored = self.api.send_chat(session, &message).await?;
                self.emit_local(ChannelKind::Chat, InboundFrame::ChatMessage(stored))
                    .await?;
            }
            OutboundFrame::Typing { is_typing } => {
                log::debug!("Typing indicator ({is_typing}) not relayed while polling");
            }
            OutboundFrame::Heartbeat { .. } => self.api.heartbeat().await?,
        }
        Ok(())
    }

    /// Poll the session channel now unless a poll is already in flight.
    async fn refresh(&self) {
        if self.tasks.is_empty() {
            return;
        }
        let ctx = self.context();
        let link = self.channel(ChannelKind::Session);
        let task = tokio::spawn(async move {
            let _ = ctx.poll_once(ChannelKind::Session, &link).await;
        });
        let mut refreshes = lock(&self.refreshes);
        refreshes.retain(|t| !t.is_finished());
        refreshes.push(task);
    }

    fn state(&self, channel: ChannelKind) -> ConnectionState {
        self.channels
            .get(&channel)
            .map_or(ConnectionState::Disconnected, |link| link.state.get())
    }
}

impl Drop for PollTransport {
    fn drop(&mut self) {
        self.stop_all();
    }
}
