//! In-process typed event fan-out.
//!
//! The engine publishes every state change here; UI surfaces subscribe.
//! Backed by a tokio broadcast channel, so a slow subscriber lags and
//! skips events instead of stalling the engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ChannelKind, ChatMessage, CodeWorkspace, CreditSummary, Session, Timer, UserId, WhiteboardScene};
use crate::signaling::peer::PeerState;
use crate::signaling::NegotiationState;

/// Everything observable about a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ChannelConnected(ChannelKind),
    ChannelDisconnected(ChannelKind),
    /// The collaborator refused the channel; it will not reconnect.
    ChannelRejected(ChannelKind),
    /// A fresh authoritative snapshot replaced local session state.
    SessionReplaced(Session),
    TimerStarted(Timer),
    TimerStopped {
        teacher: UserId,
        duration_seconds: u64,
        total_seconds: u64,
    },
    SessionEnded {
        ended_by: Option<UserId>,
        summary: Option<CreditSummary>,
    },
    /// The local user's balance changed.
    CreditsChanged(f64),
    WhiteboardApplied(WhiteboardScene),
    CodeApplied(CodeWorkspace),
    ChatAppended(ChatMessage),
    ChatConfirmed { local_id: Uuid, message: ChatMessage },
    ChatFailed { local_id: Uuid, reason: String },
    Typing { user: UserId, is_typing: bool },
    PresenceChanged { user: UserId, online: bool },
    PresenceReplaced(usize),
    NegotiationChanged(NegotiationState),
    PeerStateChanged(PeerState),
    CommandFailed(String),
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    /// Events published while nobody was subscribed.
    pub unobserved: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicBusStats {
    published: AtomicU64,
    unobserved: AtomicU64,
}

/// Cloneable handle to the session event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    capacity: usize,
    stats: Arc<AtomicBusStats>,
}

impl EventBus {
    /// `capacity` events are buffered per subscriber before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBusStats::default()),
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.stats.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.stats.published.load(Ordering::Relaxed),
            unobserved: self.stats.unobserved.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
