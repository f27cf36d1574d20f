//! Cursor bookkeeping for the polling transport.
//!
//! Each poll returns full state; [`CursorState`] turns consecutive responses
//! into the same discrete frames the push transport would have delivered,
//! so each change is dispatched exactly once.
//!
//! `last_sync_by` only names whoever touched the sync row last (a signal
//! post counts), so echo suppression for whiteboard and code compares the
//! payload against what this client sent instead.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;

use crate::protocol::{ChatMessage, CodeWorkspace, InboundFrame, Session, UserId, WhiteboardScene};
use crate::rest::SessionUpdates;

/// Snapshots sent but not yet seen echoed back, per lane.
const SENT_HISTORY: usize = 8;

#[derive(Debug, Default)]
pub struct CursorState {
    /// Bumped on every reset; polls started under an older value are stale.
    generation: u64,
    last_session: Option<Session>,
    last_credits: Option<f64>,
    ended_dispatched: bool,
    last_sync_time: Option<DateTime<Utc>>,
    last_whiteboard: Option<Value>,
    last_code: Option<Value>,
    sent_whiteboard: VecDeque<WhiteboardScene>,
    sent_code: VecDeque<CodeWorkspace>,
    /// Newest remote `sent_at` already dispatched.
    last_signal_time: Option<u64>,
    signals_baselined: bool,
    last_message_id: Option<u64>,
}

impl CursorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; the next poll starts from scratch.
    pub fn reset(&mut self) {
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            generation,
            ..Self::default()
        };
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Remember a scene this client pushed so its echo is not replayed.
    pub fn record_sent_whiteboard(&mut self, scene: WhiteboardScene) {
        remember(&mut self.sent_whiteboard, scene);
    }

    pub fn record_sent_code(&mut self, code: CodeWorkspace) {
        remember(&mut self.sent_code, code);
    }

    pub fn last_message_id(&self) -> Option<u64> {
        self.last_message_id
    }

    pub fn last_signal_time(&self) -> Option<u64> {
        self.last_signal_time
    }

    /// Frames implied by a session poll, in dispatch order.
    pub fn diff_updates(&mut self, updates: &SessionUpdates, local_user: UserId) -> Vec<InboundFrame> {
        let mut frames = Vec::new();

        if self.last_session.as_ref() != Some(&updates.session) {
            self.last_session = Some(updates.session.clone());
            frames.push(InboundFrame::SessionState {
                session: updates.session.clone(),
            });
        }

        if let Some(credits) = updates.your_credits {
            if self.last_credits != Some(credits) {
                self.last_credits = Some(credits);
                frames.push(InboundFrame::CreditUpdate {
                    user_id: local_user,
                    new_balance: credits,
                });
            }
        }

        if !updates.session.is_active && !self.ended_dispatched {
            self.ended_dispatched = true;
            frames.push(InboundFrame::SessionEnded {
                ended_by: None,
                credit_summary: None,
                your_credits: updates.your_credits,
            });
        }

        self.diff_collab(updates, &mut frames);
        self.diff_signals(updates, local_user, &mut frames);
        frames
    }

    fn diff_collab(&mut self, updates: &SessionUpdates, frames: &mut Vec<InboundFrame>) {
        let Some(sync_time) = updates.last_sync_time else {
            return;
        };
        if self.last_sync_time.is_some_and(|seen| sync_time <= seen) {
            return;
        }
        self.last_sync_time = Some(sync_time);

        if let Some(data) = fresh_lane(&updates.whiteboard_data, &mut self.last_whiteboard, &mut self.sent_whiteboard) {
            frames.push(InboundFrame::WhiteboardUpdate { data });
        }
        if let Some(data) = fresh_lane(&updates.code_data, &mut self.last_code, &mut self.sent_code) {
            frames.push(InboundFrame::CodeUpdate { data });
        }
    }

    fn diff_signals(&mut self, updates: &SessionUpdates, local_user: UserId, frames: &mut Vec<InboundFrame>) {
        let mut remote: Vec<_> = updates
            .signal_data
            .clone()
            .unwrap_or_default()
            .into_messages()
            .into_iter()
            .filter(|m| m.sender_id != Some(local_user))
            .filter_map(|m| m.sent_at.map(|at| (at, m)))
            .collect();

        // The board keeps signals from earlier attempts; the first poll only
        // establishes where "new" begins.
        if !self.signals_baselined {
            self.signals_baselined = true;
            self.last_signal_time = remote.iter().map(|(at, _)| *at).max().or(self.last_signal_time);
            return;
        }

        remote.retain(|(at, _)| self.last_signal_time.map_or(true, |seen| *at > seen));
        remote.sort_by_key(|(at, _)| *at);
        for (at, payload) in remote {
            self.last_signal_time = Some(at);
            frames.push(InboundFrame::Signal { payload });
        }
    }

    /// Messages not yet dispatched, ascending by id.
    pub fn diff_chat(&mut self, batch: Vec<ChatMessage>) -> Vec<InboundFrame> {
        let mut fresh: Vec<_> = batch
            .into_iter()
            .filter(|m| self.last_message_id.map_or(true, |seen| m.id > seen))
            .collect();
        fresh.sort_by_key(|m| m.id);
        fresh.dedup_by_key(|m| m.id);
        if let Some(last) = fresh.last() {
            self.last_message_id = Some(last.id);
        }
        fresh.into_iter().map(InboundFrame::ChatMessage).collect()
    }
}

fn remember<T>(sent: &mut VecDeque<T>, snapshot: T) {
    if sent.len() == SENT_HISTORY {
        sent.pop_front();
    }
    sent.push_back(snapshot);
}

/// The lane's snapshot when it differs from the last one seen and is not an
/// echo of something this client sent. A matched echo also retires every
/// older send.
fn fresh_lane<T>(raw: &Option<Value>, last: &mut Option<Value>, sent: &mut VecDeque<T>) -> Option<T>
where
    T: DeserializeOwned + PartialEq,
{
    let raw = raw.as_ref().filter(|v| !v.is_null())?;
    if last.as_ref() == Some(raw) {
        return None;
    }
    *last = Some(raw.clone());

    let data = match serde_json::from_value::<T>(raw.clone()) {
        Ok(data) => data,
        Err(e) => {
            log::warn!("Dropping malformed collab snapshot: {e}");
            return None;
        }
    };
    if let Some(pos) = sent.iter().position(|s| *s == data) {
        sent.drain(..=pos);
        return None;
    }
    Some(data)
}
