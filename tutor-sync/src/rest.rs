//! REST client for the tutoring backend's polling and command endpoints.
//!
//! Every request carries `Authorization: Bearer <token>`. Failures map onto
//! the crate taxonomy: `{error}` bodies on command endpoints become
//! [`SyncError::Command`], 403/404 on a poll becomes
//! [`SyncError::Rejected`], everything else is a transient
//! [`SyncError::Transport`].

use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Credential;
use crate::error::{Result, SyncError};
use crate::protocol::{ChatMessage, CodeWorkspace, OnlineUser, Session, SessionId, SignalMessage, UserId, WhiteboardScene};

/// Response of `GET /sessions/{id}/updates/`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionUpdates {
    pub session: Session,
    #[serde(default)]
    pub whiteboard_data: Option<serde_json::Value>,
    #[serde(default)]
    pub code_data: Option<serde_json::Value>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_by: Option<UserId>,
    #[serde(default)]
    pub your_credits: Option<f64>,
    #[serde(default)]
    pub signal_data: Option<SignalBoard>,
    #[serde(default)]
    pub signal_sender: Option<UserId>,
    #[serde(default)]
    pub signal_timestamp: Option<DateTime<Utc>>,
}

/// The backend's per-session signal mailbox: latest offer, answer and
/// ready plus the last few candidates per role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalBoard {
    #[serde(default)]
    pub offer: Option<SignalMessage>,
    #[serde(default)]
    pub answer: Option<SignalMessage>,
    #[serde(default)]
    pub ready_signal: Option<SignalMessage>,
    #[serde(default)]
    pub candidates_caller: Vec<SignalMessage>,
    #[serde(default)]
    pub candidates_callee: Vec<SignalMessage>,
}

impl SignalBoard {
    /// Every stored signal, unordered.
    pub fn into_messages(self) -> Vec<SignalMessage> {
        self.offer
            .into_iter()
            .chain(self.answer)
            .chain(self.ready_signal)
            .chain(self.candidates_caller)
            .chain(self.candidates_callee)
            .collect()
    }
}

/// Body of `POST /sessions/{id}/sync/`. Exactly one field is set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whiteboard_data: Option<WhiteboardScene>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_data: Option<CodeWorkspace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_data: Option<SignalMessage>,
}

#[derive(Deserialize)]
struct OnlineUsersBody {
    #[serde(default)]
    users: Vec<OnlineUser>,
}

#[derive(Deserialize)]
struct CreditsBody {
    credits: f64,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "detail")]
    error: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    message: &'a str,
}

/// Thin typed wrapper over the backend REST API.
pub struct RestClient {
    http: Client,
    base: String,
    credential: Credential,
}

impl RestClient {
    pub fn new(base: impl Into<String>, credential: Credential, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            credential,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    // ─── Polling ─────────────────────────────────────────────────────

    pub async fn session_updates(&self, session_id: SessionId) -> Result<SessionUpdates> {
        self.get(&format!("sessions/{session_id}/updates/")).await
    }

    /// Messages after `since_id`, or the most recent page when `None`.
    pub async fn chat_messages(&self, session_id: SessionId, since_id: Option<u64>) -> Result<Vec<ChatMessage>> {
        let mut request = self
            .http
            .get(self.url(&format!("chat/{session_id}/messages/")))
            .bearer_auth(self.credential.token());
        if let Some(since) = since_id {
            request = request.query(&[("since_id", since)]);
        }
        let response = request.send().await?;
        read_poll(response).await
    }

    pub async fn online_users(&self) -> Result<Vec<OnlineUser>> {
        let body: OnlineUsersBody = self.get("presence/online/").await?;
        Ok(body.users)
    }

    /// The local user's current balance.
    pub async fn credits(&self) -> Result<f64> {
        let body: CreditsBody = self.get("credits/").await?;
        Ok(body.credits)
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let response = self
            .http
            .post(self.url("presence/heartbeat/"))
            .bearer_auth(self.credential.token())
            .send()
            .await?;
        read_poll::<serde_json::Value>(response).await.map(|_| ())
    }

    // ─── Commands ────────────────────────────────────────────────────

    pub async fn start_timer(&self, session_id: SessionId) -> Result<()> {
        self.command(&format!("sessions/{session_id}/timer/start/"), None::<&()>).await
    }

    pub async fn stop_timer(&self, session_id: SessionId) -> Result<()> {
        self.command(&format!("sessions/{session_id}/timer/stop/"), None::<&()>).await
    }

    pub async fn end_session(&self, session_id: SessionId) -> Result<()> {
        self.command(&format!("sessions/{session_id}/end/"), None::<&()>).await
    }

    pub async fn sync(&self, session_id: SessionId, payload: &SyncPayload) -> Result<()> {
        self.command(&format!("sessions/{session_id}/sync/"), Some(payload)).await
    }

    /// Post a chat message; returns the stored message with its id.
    pub async fn send_chat(&self, session_id: SessionId, text: &str) -> Result<ChatMessage> {
        let response = self
            .http
            .post(self.url(&format!("chat/{session_id}/send/")))
            .bearer_auth(self.credential.token())
            .json(&ChatBody { message: text })
            .send()
            .await?;
        read_command(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.credential.token())
            .send()
            .await?;
        read_poll(response).await
    }

    async fn command<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<()> {
        let mut request = self.http.post(self.url(path)).bearer_auth(self.credential.token());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        read_command::<serde_json::Value>(response).await.map(|_| ())
    }
}

async fn read_poll<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = error_message(response).await;
    Err(match status {
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            log::warn!("Poll rejected with {status}: {message}");
            SyncError::Rejected(status.as_u16())
        }
        _ => SyncError::Transport(format!("{status}: {message}")),
    })
}

async fn read_command<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = error_message(response).await;
    Err(if status.is_client_error() {
        SyncError::Command(message)
    } else {
        SyncError::Transport(format!("{status}: {message}"))
    })
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}
