//! Push transport: one persistent WebSocket per logical channel.
//!
//! ```text
//! PushTransport
//!   ├── session  ws {ws_base}/ws/session/{id}/?token=..
//!   ├── chat     ws {ws_base}/ws/chat/{id}/?token=..
//!   └── presence ws {ws_base}/ws/presence/?token=..   (+ heartbeat)
//! ```
//!
//! Each channel runs in its own task. A dropped socket is retried after a
//! fixed delay; a refusal (HTTP 403 on upgrade or close code 4003) stops
//! the channel for good. Frames are never queued across reconnects.

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ConnectionState, LinkState, Transport, TransportEvent};
use crate::config::{Credential, SyncConfig, TransportKind};
use crate::error::{Result, SyncError};
use crate::protocol::{ChannelKind, InboundFrame, OutboundFrame, SessionId};

/// Close code the collaborator uses to refuse a participant.
pub const REJECTED_CLOSE_CODE: u16 = 4003;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Where one channel connects and how it behaves.
#[derive(Debug, Clone)]
struct ChannelSpec {
    kind: ChannelKind,
    url: Url,
    /// Stamped on every frame of session-scoped channels.
    session_id: Option<SessionId>,
    heartbeat: Option<Duration>,
}

/// Handle to a running channel task.
struct ChannelLink {
    state: Arc<LinkState>,
    outgoing: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl ChannelLink {
    /// Close gracefully, aborting if the socket does not wind down in time.
    async fn shutdown(self) {
        let ChannelLink { state, outgoing, mut task } = self;
        drop(outgoing);
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
        state.set(ConnectionState::Disconnected);
    }
}

enum PumpExit {
    /// The engine released the channel.
    Shutdown,
    /// Socket lost; reconnect.
    Dropped,
    Rejected(u16),
}

pub struct PushTransport {
    config: SyncConfig,
    credential: Credential,
    session_id: SessionId,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    links: HashMap<ChannelKind, ChannelLink>,
}

impl PushTransport {
    pub fn new(config: SyncConfig, credential: Credential, session_id: SessionId) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            config,
            credential,
            session_id,
            events_tx,
            events_rx: Some(events_rx),
            links: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn spec(&self, kind: ChannelKind) -> Result<ChannelSpec> {
        let base = self.config.ws_base.trim_end_matches('/');
        let (path, session_id, heartbeat) = match kind {
            ChannelKind::Session => (format!("/ws/session/{}/", self.session_id), Some(self.session_id), None),
            ChannelKind::Chat => (format!("/ws/chat/{}/", self.session_id), Some(self.session_id), None),
            ChannelKind::Presence => ("/ws/presence/".to_string(), None, Some(self.config.heartbeat_interval)),
        };
        let url = Url::parse_with_params(&format!("{base}{path}"), &[("token", self.credential.token())])
            .map_err(|e| SyncError::Transport(format!("invalid websocket url: {e}")))?;
        Ok(ChannelSpec {
            kind,
            url,
            session_id,
            heartbeat,
        })
    }

    fn spawn(&mut self, kind: ChannelKind) -> Result<()> {
        let spec = self.spec(kind)?;
        let state = Arc::new(LinkState::default());
        let (outgoing, outgoing_rx) = mpsc::channel(64);
        let task = tokio::spawn(run_channel(
            spec,
            self.credential.clone(),
            state.clone(),
            self.events_tx.clone(),
            outgoing_rx,
            self.config.reconnect_delay,
        ));
        self.links.insert(kind, ChannelLink { state, outgoing, task });
        Ok(())
    }

    async fn stop(&mut self, kind: ChannelKind) {
        if let Some(link) = self.links.remove(&kind) {
            link.shutdown().await;
        }
    }
}

#[async_trait::async_trait]
impl Transport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.credential.is_valid() {
            return Err(SyncError::Transport("credential expired".into()));
        }
        for kind in [ChannelKind::Session, ChannelKind::Chat, ChannelKind::Presence] {
            if !self.links.contains_key(&kind) {
                self.spawn(kind)?;
            }
        }
        log::info!("Push transport started for session {}", self.session_id);
        Ok(())
    }

    async fn disconnect(&mut self) {
        for kind in [ChannelKind::Session, ChannelKind::Chat, ChannelKind::Presence] {
            self.stop(kind).await;
        }
    }

    async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let channel = frame.channel();
        let link = self
            .links
            .get(&channel)
            .filter(|link| link.state.get() == ConnectionState::Connected)
            .ok_or_else(|| SyncError::Transport(format!("{channel:?} channel is not connected")))?;
        let text = frame.encode()?;
        link.outgoing
            .send(text)
            .await
            .map_err(|_| SyncError::Transport(format!("{channel:?} channel closed")))
    }

    /// The collaborator pushes state as it changes.
    async fn refresh(&self) {}

    fn state(&self, channel: ChannelKind) -> ConnectionState {
        self.links
            .get(&channel)
            .map_or(ConnectionState::Disconnected, |link| link.state.get())
    }
}

// ─── Channel task ────────────────────────────────────────────────────

async fn run_channel(
    spec: ChannelSpec,
    credential: Credential,
    state: Arc<LinkState>,
    events: mpsc::Sender<TransportEvent>,
    mut outgoing: mpsc::Receiver<String>,
    reconnect_delay: Duration,
) {
    let kind = spec.kind;
    let mut attempt: u32 = 0;

    loop {
        if !credential.is_valid() {
            log::warn!("{kind:?} channel stopped: credential no longer valid");
            state.set(ConnectionState::Disconnected);
            return;
        }
        state.set(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        match tokio_tungstenite::connect_async(spec.url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                state.set(ConnectionState::Connected);
                log::info!("{kind:?} channel connected");
                if events.send(TransportEvent::Connected(kind)).await.is_err() {
                    return;
                }

                let exit = pump(socket, &spec, &events, &mut outgoing).await;
                state.set(ConnectionState::Disconnected);
                let _ = events.send(TransportEvent::Disconnected(kind)).await;

                match exit {
                    PumpExit::Shutdown => return,
                    PumpExit::Rejected(code) => {
                        log::warn!("{kind:?} channel rejected with close code {code}");
                        let _ = events.send(TransportEvent::Rejected(kind, code)).await;
                        return;
                    }
                    PumpExit::Dropped => log::warn!("{kind:?} channel dropped"),
                }
            }
            Err(e) => match SyncError::from(e) {
                SyncError::Rejected(status) => {
                    log::warn!("{kind:?} channel refused with HTTP {status}");
                    state.set(ConnectionState::Disconnected);
                    let _ = events.send(TransportEvent::Rejected(kind, status)).await;
                    return;
                }
                other => log::debug!("{kind:?} connect attempt {} failed: {other}", attempt + 1),
            },
        }

        attempt = attempt.saturating_add(1);
        state.set(ConnectionState::Reconnecting);

        let mut discarded = 0usize;
        while outgoing.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            log::debug!("Discarded {discarded} {kind:?} frames queued for a dead socket");
        }

        let delay = tokio::time::sleep(reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                frame = outgoing.recv() => match frame {
                    None => {
                        state.set(ConnectionState::Disconnected);
                        return;
                    }
                    Some(_) => log::debug!("Discarded {kind:?} frame while reconnecting"),
                },
            }
        }
    }
}

async fn pump(
    socket: Socket,
    spec: &ChannelSpec,
    events: &mpsc::Sender<TransportEvent>,
    outgoing: &mut mpsc::Receiver<String>,
) -> PumpExit {
    let (mut writer, mut reader) = socket.split();
    let mut heartbeat = spec.heartbeat.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });

    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match InboundFrame::decode(text.as_str()) {
                    Ok(frame) => {
                        let event = TransportEvent::Frame {
                            channel: spec.kind,
                            session_id: spec.session_id,
                            frame,
                        };
                        if events.send(event).await.is_err() {
                            return PumpExit::Shutdown;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable {:?} frame: {e}", spec.kind),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    return match code {
                        Some(REJECTED_CLOSE_CODE) => PumpExit::Rejected(REJECTED_CLOSE_CODE),
                        _ => PumpExit::Dropped,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("{:?} socket error: {e}", spec.kind);
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },
            frame = outgoing.recv() => match frame {
                Some(text) => {
                    if let Err(e) = writer.send(Message::Text(text.into())).await {
                        log::debug!("{:?} write failed: {e}", spec.kind);
                        return PumpExit::Dropped;
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    return PumpExit::Shutdown;
                }
            },
            _ = next_tick(&mut heartbeat) => {
                let Ok(text) = OutboundFrame::heartbeat().encode() else { continue };
                if writer.send(Message::Text(text.into())).await.is_err() {
                    return PumpExit::Dropped;
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
