//! Transport adapters.
//!
//! Both adapters hand the engine the same stream of [`TransportEvent`]s and
//! accept the same [`OutboundFrame`]s, so nothing above this module knows
//! which one is running:
//!
//! ```text
//!                 ┌────────────────────┐
//!   OutboundFrame │                    │ TransportEvent
//!  ─────────────▶ │  PushTransport     │ ─────────────▶  engine
//!                 │   (3 WebSockets)   │
//!                 │  PollTransport     │
//!                 │   (REST + cursors) │
//!                 └────────────────────┘
//! ```

pub mod cursor;
pub mod poll;
pub mod push;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{ChannelKind, InboundFrame, OutboundFrame, SessionId};

pub use poll::PollTransport;
pub use push::PushTransport;

/// Per-channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Lock-free connection state shared between a channel task and the
/// transport handle.
#[derive(Debug, Default)]
pub struct LinkState(AtomicU8);

impl LinkState {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// What a transport reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected(ChannelKind),
    Disconnected(ChannelKind),
    /// The collaborator refused the channel (403 or close code 4003).
    /// The channel stays down until the transport is rebuilt.
    Rejected(ChannelKind, u16),
    Frame {
        channel: ChannelKind,
        /// Session the frame was received for, when the channel is
        /// session-scoped. Lets the engine drop frames for another session.
        session_id: Option<SessionId>,
        frame: InboundFrame,
    },
}

/// A transport adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> crate::config::TransportKind;

    /// Take the event receiver (can only be called once).
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;

    /// Open every channel. Returns once the channel tasks are running, not
    /// once they are connected.
    async fn connect(&mut self) -> Result<()>;

    /// Stop every channel task and release resources.
    async fn disconnect(&mut self);

    /// Deliver one frame. Fails with [`crate::SyncError::Transport`] when
    /// the frame's channel is down; nothing is queued.
    async fn send(&self, frame: OutboundFrame) -> Result<()>;

    /// Ask for fresh session state as soon as possible.
    async fn refresh(&self);

    fn state(&self, channel: ChannelKind) -> ConnectionState;
}
