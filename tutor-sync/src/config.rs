//! Engine configuration and the bearer credential.
//!
//! Intervals and endpoints default to what the tutoring backend expects;
//! deployments override them through `TUTOR_*` environment variables.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Which transport adapter the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One persistent WebSocket per logical channel.
    Push,
    /// Periodic cursor-based REST polling.
    Poll,
}

impl std::str::FromStr for TransportKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" | "ws" | "websocket" => Ok(TransportKind::Push),
            "poll" | "polling" | "http" => Ok(TransportKind::Poll),
            other => Err(SyncError::Command(format!("unknown transport '{other}'"))),
        }
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST base, e.g. `http://127.0.0.1:8000/api`
    pub api_base: String,
    /// WebSocket base, e.g. `ws://127.0.0.1:8000`
    pub ws_base: String,
    /// Transport selection
    pub transport: TransportKind,
    /// Fixed delay between push reconnect attempts (default: 3s)
    pub reconnect_delay: Duration,
    /// Session/collab poll period (default: 1.5s)
    pub session_poll_interval: Duration,
    /// Chat poll period (default: 3s)
    pub chat_poll_interval: Duration,
    /// Presence poll period (default: 30s)
    pub presence_poll_interval: Duration,
    /// Presence heartbeat period, both transports (default: 30s)
    pub heartbeat_interval: Duration,
    /// Whiteboard broadcast throttle (default: 300ms)
    pub whiteboard_throttle: Duration,
    /// Code editor broadcast throttle (default: 500ms)
    pub code_throttle: Duration,
    /// How long local change handlers stay suppressed after a remote import
    pub import_guard: Duration,
    /// HTTP request timeout for polling and commands
    pub request_timeout: Duration,
    /// Durable snapshot cache directory; `None` keeps snapshots in memory
    pub cache_path: Option<PathBuf>,
    /// STUN/TURN urls handed to the peer connection
    pub ice_servers: Vec<String>,
    /// Buffer size of the inbound transport event channel
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000/api".to_string(),
            ws_base: "ws://127.0.0.1:8000".to_string(),
            transport: TransportKind::Push,
            reconnect_delay: Duration::from_secs(3),
            session_poll_interval: Duration::from_millis(1500),
            chat_poll_interval: Duration::from_secs(3),
            presence_poll_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            whiteboard_throttle: Duration::from_millis(300),
            code_throttle: Duration::from_millis(500),
            import_guard: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            cache_path: None,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            event_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Config for tests: local endpoints, short intervals, in-memory cache.
    pub fn for_testing(api_base: impl Into<String>, ws_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ws_base: ws_base.into(),
            reconnect_delay: Duration::from_millis(100),
            session_poll_interval: Duration::from_millis(50),
            chat_poll_interval: Duration::from_millis(50),
            presence_poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TUTOR_API_URL`, `TUTOR_WS_URL`,
    /// `TUTOR_TRANSPORT`, `TUTOR_CACHE_DIR` and `TUTOR_ICE_SERVERS`
    /// (comma separated).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TUTOR_API_URL") {
            config.api_base = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("TUTOR_WS_URL") {
            config.ws_base = url.trim_end_matches('/').to_string();
        }
        if let Ok(kind) = std::env::var("TUTOR_TRANSPORT") {
            config.transport = kind.parse()?;
        }
        if let Ok(dir) = std::env::var("TUTOR_CACHE_DIR") {
            config.cache_path = Some(PathBuf::from(dir));
        }
        if let Ok(servers) = std::env::var("TUTOR_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(config)
    }
}

// ─── Credential ──────────────────────────────────────────────────────

/// Opaque bearer credential.
///
/// When the token is a JWT its `exp` claim is decoded so reconnect loops can
/// stop once the credential has lapsed. Tokens that are not JWTs never expire
/// locally; the collaborator remains the authority.
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ExpClaim {
    exp: Option<i64>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = jwt_expiry(&token);
        Self { token, expires_at }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the credential can still be presented at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.token.is_empty() && self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpClaim = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claim.exp?, 0).single()
}
