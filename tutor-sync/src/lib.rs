//! # tutor-sync - Real-time session sync for peer tutoring
//!
//! Keeps two participants of a tutoring session in lockstep: session
//! ledger and teaching timer, chat, presence, whiteboard and code
//! snapshots, and the media call handshake.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  3 WebSockets / REST polling  ┌──────────────┐
//! │  Transport   │ ◄───────────────────────────► │ Collaborator │
//! │ (push|poll)  │       JSON frames             │  (backend)   │
//! └──────┬───────┘                               └──────────────┘
//!        │ TransportEvent
//!        ▼
//! ┌──────────────────────────────────────────────┐
//! │              SessionSyncEngine               │
//! │  session/timer · chat · presence · collab    │
//! │  signaling ──► PeerConnection (webrtc)       │
//! └──────┬───────────────────────┬───────────────┘
//!        │ SessionEvent (bus)    │ SessionView (watch)
//!        ▼                       ▼
//!     subscribers             UI state
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Session model and JSON wire frames
//! - [`transport`]: Push (WebSocket) and poll (REST) adapters
//! - [`rest`]: REST client used by polling and commands
//! - [`signaling`]: Offer/answer state machine and the webrtc peer
//! - [`collab`]: Throttled whiteboard/code snapshots with a durable cache
//! - [`chat`] / [`presence`]: Chat log and online users
//! - [`engine`]: The single-task engine and its handle
//! - [`bus`]: Typed event fan-out

pub mod bus;
pub mod chat;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod rest;
pub mod signaling;
pub mod transport;

// Re-exports for convenience
pub use bus::{BusStats, EventBus, SessionEvent};
pub use chat::{ChatChannel, ChatEntry, ChatReceipt, DeliveryState};
pub use collab::cache::{CacheConfig, CacheSlot, MemorySnapshotCache, RocksSnapshotCache, SnapshotCache};
pub use collab::{CollabChannelMultiplexer, Restored};
pub use config::{Credential, SyncConfig, TransportKind};
pub use engine::{
    build_transport, open_cache, CreditSink, EngineCommand, EngineHandle, EngineParts, SessionContext,
    SessionSyncEngine, SessionView, SharedProfile, TeachingClock,
};
pub use error::{Result, SyncError};
pub use presence::{PresenceChange, PresenceTracker};
pub use protocol::{
    ChannelKind, ChatMessage, CodeFile, CodeWorkspace, CreditSummary, InboundFrame, OnlineUser, OutboundFrame, Role,
    Session, SessionId, Signal, SignalMessage, Timer, UserId, WhiteboardScene,
};
pub use signaling::peer::{MediaDevices, PeerConnection, PeerEvent, PeerState};
pub use signaling::rtc::{RtcMediaDevices, RtcPeer};
pub use signaling::{MediaPreferences, NegotiationState, SignalingStateMachine};
pub use transport::{ConnectionState, PollTransport, PushTransport, Transport, TransportEvent};
