//! JSON wire protocol shared by both transports.
//!
//! Every frame is an object tagged by `type`:
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────────┐
//! │ type             │ body                                         │
//! ├──────────────────┼──────────────────────────────────────────────┤
//! │ session_state    │ session (authoritative full snapshot)        │
//! │ timer_started    │ teacher_id, start_time, timer_id             │
//! │ timer_stopped    │ teacher_id, duration_seconds, new_total_time │
//! │ session_ended    │ ended_by, credit_summary, your_credits       │
//! │ credit_update    │ user_id, new_balance                         │
//! │ signal           │ payload (ready | offer | answer | candidate) │
//! │ whiteboard_update│ data (full scene)                            │
//! │ code_update      │ data (full workspace)                        │
//! │ chat_message     │ id, sender, sender_name, message, timestamp  │
//! │ online_users     │ users                                        │
//! │ presence_update  │ user, status                                 │
//! └──────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The polling transport synthesizes the same frames from REST responses,
//! so everything above the transport only ever sees [`InboundFrame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, SyncError};

pub type UserId = u64;
pub type SessionId = u64;

/// Seconds of teaching that earn one credit.
pub const SECONDS_PER_CREDIT: f64 = 300.0;

/// Share of every settlement kept by the platform.
pub const PLATFORM_CUT: f64 = 0.10;

/// Negotiation role. `user1` of a session is always the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

// ─── Session & Timer ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user1: UserId,
    #[serde(default)]
    pub user1_name: Option<String>,
    pub user2: UserId,
    #[serde(default)]
    pub user2_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Accumulated teaching seconds for `user1`
    #[serde(default, deserialize_with = "lenient::seconds")]
    pub user1_teaching_time: u64,
    /// Accumulated teaching seconds for `user2`
    #[serde(default, deserialize_with = "lenient::seconds")]
    pub user2_teaching_time: u64,
    #[serde(default)]
    pub active_timer: Option<Timer>,
}

impl Session {
    pub fn is_participant(&self, user: UserId) -> bool {
        user == self.user1 || user == self.user2
    }

    /// Role of `user` in the call, `None` for outsiders.
    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if user == self.user1 {
            Some(Role::Caller)
        } else if user == self.user2 {
            Some(Role::Callee)
        } else {
            None
        }
    }

    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        match self.role_of(user)? {
            Role::Caller => Some(self.user2),
            Role::Callee => Some(self.user1),
        }
    }

    pub fn display_name(&self, user: UserId) -> Option<&str> {
        match self.role_of(user)? {
            Role::Caller => self.user1_name.as_deref(),
            Role::Callee => self.user2_name.as_deref(),
        }
    }

    /// Accumulated teaching seconds of `user` (0 for outsiders).
    pub fn teaching_time(&self, user: UserId) -> u64 {
        match self.role_of(user) {
            Some(Role::Caller) => self.user1_teaching_time,
            Some(Role::Callee) => self.user2_teaching_time,
            None => 0,
        }
    }

    /// Overwrite the accumulated teaching seconds of `user`.
    ///
    /// Returns false (and changes nothing) for non-participants.
    pub fn set_teaching_time(&mut self, user: UserId, seconds: u64) -> bool {
        match self.role_of(user) {
            Some(Role::Caller) => self.user1_teaching_time = seconds,
            Some(Role::Callee) => self.user2_teaching_time = seconds,
            None => return false,
        }
        true
    }

    /// The running timer, if any.
    pub fn running_timer(&self) -> Option<&Timer> {
        self.active_timer.as_ref().filter(|t| t.is_running)
    }
}

/// A teaching timer. At most one runs per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: u64,
    pub teacher: UserId,
    #[serde(default)]
    pub teacher_name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient::opt_seconds")]
    pub duration_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub is_running: bool,
}

impl Timer {
    /// Seconds elapsed since start as of `now`, clamped at zero so a skewed
    /// local clock never shows a negative duration.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> u64 {
        if let Some(secs) = self.duration_seconds.filter(|_| !self.is_running) {
            return secs;
        }
        (now - self.start_time).num_seconds().max(0) as u64
    }
}

/// Per-participant line of a settlement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditLine {
    #[serde(default, deserialize_with = "lenient::amount")]
    pub earned: f64,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub spent: f64,
}

/// Settlement computed by the collaborator when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditSummary {
    #[serde(default)]
    pub user1: CreditLine,
    #[serde(default)]
    pub user2: CreditLine,
    #[serde(default, deserialize_with = "lenient::amount")]
    pub bank_cut: f64,
}

// ─── Credits ─────────────────────────────────────────────────────────

/// Credits earned for `taught_seconds` of teaching (before the platform cut).
pub fn credits_earned(taught_seconds: u64) -> f64 {
    taught_seconds as f64 / SECONDS_PER_CREDIT
}

/// Two-decimal display form used everywhere credits are shown.
pub fn format_credits(credits: f64) -> String {
    format!("{credits:.2}")
}

/// What a participant can expect from settlement for the time taught so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditPreview {
    pub earned: f64,
    pub platform_cut: f64,
    pub net: f64,
}

impl CreditPreview {
    pub fn for_seconds(taught_seconds: u64) -> Self {
        let earned = credits_earned(taught_seconds);
        let platform_cut = earned * PLATFORM_CUT;
        Self {
            earned,
            platform_cut,
            net: earned - platform_cut,
        }
    }
}

// ─── Presence ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
}

impl OnlineUser {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            availability: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

// ─── Chat ────────────────────────────────────────────────────────────

/// A chat message as stored by the collaborator. `id` is monotonic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub sender: UserId,
    #[serde(default)]
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Signaling ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP blob with its type, shaped like `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }

    pub fn rollback() -> Self {
        Self { kind: SdpKind::Rollback, sdp: String::new() }
    }
}

/// An ICE candidate, shaped like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// The negotiation step carried by a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Ready,
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Ready => "ready",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }
}

/// Signal envelope: the step plus sender metadata.
///
/// `sent_at` is a per-sender strictly increasing millisecond stamp (see
/// [`MonotonicStamp`]); the polling transport uses it as its signal cursor.
/// `sender_id` is filled in by the collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(flatten)]
    pub signal: Signal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

impl SignalMessage {
    pub fn new(signal: Signal, role: Role, sent_at: u64) -> Self {
        Self {
            signal,
            role: Some(role),
            sent_at: Some(sent_at),
            sender_id: None,
        }
    }
}

/// Wall-clock millisecond stamps that never repeat or go backwards within a
/// process, and stay ahead of earlier runs as long as the clock does.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: u64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last = now.max(self.last + 1);
        self.last
    }
}

// ─── Collaboration snapshots ─────────────────────────────────────────

/// Which side produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    #[default]
    #[serde(rename = "full_state")]
    FullState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(rename = "viewBackgroundColor", default, skip_serializing_if = "Option::is_none")]
    pub view_background_color: Option<String>,
}

/// Full whiteboard scene. Elements are opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhiteboardScene {
    #[serde(default)]
    pub elements: Vec<serde_json::Value>,
    #[serde(rename = "appState", default)]
    pub app_state: WhiteboardView,
    #[serde(rename = "type", default)]
    pub kind: SnapshotKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SnapshotSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFile {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub content: String,
}

impl CodeFile {
    pub fn new(name: impl Into<String>, language: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: language.into(),
            content: content.into(),
        }
    }
}

/// Full code editor workspace: open files plus the selected tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeWorkspace {
    #[serde(default)]
    pub files: Vec<CodeFile>,
    #[serde(rename = "activeIndex", default)]
    pub active_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SnapshotSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

impl CodeWorkspace {
    /// Workspace shown when nothing is cached for a session yet.
    pub fn starter() -> Self {
        Self {
            files: vec![
                CodeFile::new("main.py", "python", "def main():\n    print(\"Hello, world!\")\n\n\nif __name__ == \"__main__\":\n    main()\n"),
                CodeFile::new("solution.cpp", "cpp", "#include <iostream>\n\nint main() {\n    std::cout << \"Hello, world!\" << std::endl;\n    return 0;\n}\n"),
                CodeFile::new("Main.java", "java", "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello, world!\");\n    }\n}\n"),
            ],
            active_index: 0,
            source: None,
            revision: None,
        }
    }

    /// Clamp `active_index` into range; an empty workspace falls back to
    /// the starter files.
    pub fn normalized(mut self) -> Self {
        if self.files.is_empty() {
            let Self { source, revision, .. } = self;
            return Self { source, revision, ..Self::starter() };
        }
        if self.active_index >= self.files.len() {
            self.active_index = self.files.len() - 1;
        }
        self
    }

    pub fn active_file(&self) -> Option<&CodeFile> {
        self.files.get(self.active_index)
    }
}

// ─── Frames ──────────────────────────────────────────────────────────

/// Every event a transport can deliver to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    SessionState {
        session: Session,
    },
    TimerStarted {
        teacher_id: UserId,
        #[serde(default)]
        teacher_name: Option<String>,
        start_time: DateTime<Utc>,
        timer_id: u64,
    },
    TimerStopped {
        teacher_id: UserId,
        #[serde(default)]
        teacher_name: Option<String>,
        #[serde(default)]
        end_time: Option<DateTime<Utc>>,
        #[serde(default, deserialize_with = "lenient::seconds")]
        duration_seconds: u64,
        timer_id: u64,
        #[serde(default, deserialize_with = "lenient::opt_seconds")]
        new_total_time: Option<u64>,
    },
    SessionEnded {
        #[serde(default)]
        ended_by: Option<UserId>,
        #[serde(default)]
        credit_summary: Option<CreditSummary>,
        #[serde(default, deserialize_with = "lenient::opt_amount")]
        your_credits: Option<f64>,
    },
    CreditUpdate {
        user_id: UserId,
        #[serde(deserialize_with = "lenient::amount")]
        new_balance: f64,
    },
    CreditBalance {
        #[serde(deserialize_with = "lenient::amount")]
        credits: f64,
    },
    Signal {
        payload: SignalMessage,
    },
    WhiteboardUpdate {
        data: WhiteboardScene,
    },
    CodeUpdate {
        data: CodeWorkspace,
    },
    ChatMessage(ChatMessage),
    Typing {
        user: OnlineUser,
        #[serde(default)]
        is_typing: bool,
    },
    OnlineUsers {
        users: Vec<OnlineUser>,
    },
    PresenceUpdate {
        user: OnlineUser,
        status: PresenceStatus,
    },
    Error {
        message: String,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

impl InboundFrame {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SyncError::ProtocolDecode(e.to_string()))
    }
}

/// Which logical channel a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Session,
    Chat,
    Presence,
}

/// Every frame the engine can ask a transport to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    TimerStart,
    TimerStop,
    EndSession,
    GetCredits,
    Signal { payload: SignalMessage },
    WhiteboardUpdate { data: WhiteboardScene },
    CodeUpdate { data: CodeWorkspace },
    ChatMessage { message: String },
    Typing { is_typing: bool },
    Heartbeat { timestamp: i64 },
}

impl OutboundFrame {
    pub fn channel(&self) -> ChannelKind {
        match self {
            OutboundFrame::ChatMessage { .. } | OutboundFrame::Typing { .. } => ChannelKind::Chat,
            OutboundFrame::Heartbeat { .. } => ChannelKind::Presence,
            _ => ChannelKind::Session,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncError::ProtocolDecode(e.to_string()))
    }

    pub fn heartbeat() -> Self {
        OutboundFrame::Heartbeat {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Numeric fields the collaborator sometimes emits as floats or decimal
/// strings.
mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(u64),
        Float(f64),
        Text(String),
    }

    fn to_f64<E: serde::de::Error>(n: Number) -> std::result::Result<f64, E> {
        match n {
            Number::Int(i) => Ok(i as f64),
            Number::Float(f) => Ok(f),
            Number::Text(s) => s.trim().parse().map_err(E::custom),
        }
    }

    pub fn amount<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
        to_f64(Number::deserialize(d)?)
    }

    pub fn opt_amount<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
        Option::<Number>::deserialize(d)?.map(to_f64::<D::Error>).transpose()
    }

    pub fn seconds<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
        Ok(Option::<Number>::deserialize(d)?
            .map(to_f64::<D::Error>)
            .transpose()?
            .map_or(0, |f| f.max(0.0).round() as u64))
    }

    pub fn opt_seconds<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
        Ok(Option::<Number>::deserialize(d)?
            .map(to_f64::<D::Error>)
            .transpose()?
            .map(|f| f.max(0.0).round() as u64))
    }
}
