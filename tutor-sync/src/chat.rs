//! Session chat: an append-only log ordered by the collaborator's message id.
//!
//! Local sends appear immediately as pending entries and are confirmed when
//! the stored message comes back (push echo or poll fetch).

use uuid::Uuid;

use crate::protocol::{ChatMessage, OutboundFrame, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed(String),
}

/// One line of the chat log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    /// Stable id for the UI, assigned locally.
    pub local_id: Uuid,
    /// `None` until the collaborator has stored the message.
    pub message_id: Option<u64>,
    pub sender: UserId,
    pub sender_name: String,
    pub text: String,
    pub delivery: DeliveryState,
    pub message: Option<ChatMessage>,
}

/// What [`ChatChannel::receive`] did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatReceipt {
    Appended(ChatMessage),
    Confirmed { local_id: Uuid, message: ChatMessage },
    /// Already in the log, or older than the last seen id.
    Duplicate,
}

pub struct ChatChannel {
    local_user: UserId,
    counterpart: Option<UserId>,
    entries: Vec<ChatEntry>,
    last_seen_id: Option<u64>,
    counterpart_typing: bool,
}

impl ChatChannel {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            counterpart: None,
            entries: Vec::new(),
            last_seen_id: None,
            counterpart_typing: false,
        }
    }

    pub fn set_counterpart(&mut self, user: Option<UserId>) {
        self.counterpart = user;
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn last_seen_id(&self) -> Option<u64> {
        self.last_seen_id
    }

    pub fn counterpart_typing(&self) -> bool {
        self.counterpart_typing
    }

    /// Append a pending entry for `text` and build the frame to send.
    /// Blank input yields nothing.
    pub fn compose(&mut self, text: &str) -> Option<(Uuid, OutboundFrame)> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let local_id = Uuid::new_v4();
        self.entries.push(ChatEntry {
            local_id,
            message_id: None,
            sender: self.local_user,
            sender_name: String::new(),
            text: text.to_string(),
            delivery: DeliveryState::Pending,
            message: None,
        });
        Some((
            local_id,
            OutboundFrame::ChatMessage {
                message: text.to_string(),
            },
        ))
    }

    /// Take in a message from the collaborator.
    pub fn receive(&mut self, message: ChatMessage) -> ChatReceipt {
        let already_logged = self.entries.iter().any(|e| e.message_id == Some(message.id));
        let behind_cursor = self.last_seen_id.is_some_and(|seen| message.id <= seen);
        if already_logged || (behind_cursor && !self.is_own_pending(&message)) {
            return ChatReceipt::Duplicate;
        }
        self.last_seen_id = Some(self.last_seen_id.map_or(message.id, |seen| seen.max(message.id)));

        if message.sender == self.local_user {
            if let Some(entry) = self
                .entries
                .iter_mut()
                .find(|e| e.delivery == DeliveryState::Pending && e.text == message.message)
            {
                entry.message_id = Some(message.id);
                entry.sender_name = message.sender_name.clone();
                entry.delivery = DeliveryState::Confirmed;
                entry.message = Some(message.clone());
                return ChatReceipt::Confirmed {
                    local_id: entry.local_id,
                    message,
                };
            }
        }

        if message.sender != self.local_user {
            self.counterpart_typing = false;
        }
        self.entries.push(ChatEntry {
            local_id: Uuid::new_v4(),
            message_id: Some(message.id),
            sender: message.sender,
            sender_name: message.sender_name.clone(),
            text: message.message.clone(),
            delivery: DeliveryState::Confirmed,
            message: Some(message.clone()),
        });
        ChatReceipt::Appended(message)
    }

    fn is_own_pending(&self, message: &ChatMessage) -> bool {
        message.sender == self.local_user
            && self
                .entries
                .iter()
                .any(|e| e.delivery == DeliveryState::Pending && e.text == message.message)
    }

    /// Mark a pending send as failed. Returns false for unknown ids.
    pub fn fail(&mut self, local_id: Uuid, reason: impl Into<String>) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.local_id == local_id && e.delivery == DeliveryState::Pending)
        {
            Some(entry) => {
                entry.delivery = DeliveryState::Failed(reason.into());
                true
            }
            None => false,
        }
    }

    /// Record a typing notification. Only the counterpart counts; returns
    /// whether the indicator changed.
    pub fn typing(&mut self, user: UserId, is_typing: bool) -> bool {
        if user == self.local_user || self.counterpart.is_some_and(|peer| peer != user) {
            return false;
        }
        let changed = self.counterpart_typing != is_typing;
        self.counterpart_typing = is_typing;
        changed
    }

    pub fn pending(&self) -> impl Iterator<Item = &ChatEntry> {
        self.entries.iter().filter(|e| e.delivery == DeliveryState::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ME: UserId = 1;
    const PEER: UserId = 2;

    fn msg(id: u64, sender: UserId, text: &str) -> ChatMessage {
        ChatMessage {
            id,
            sender,
            sender_name: if sender == ME { "Me".into() } else { "Peer".into() },
            message: text.into(),
            timestamp: "2026-03-01T10:00:00Z".parse().unwrap(),
        }
    }

    fn channel() -> ChatChannel {
        let mut chat = ChatChannel::new(ME);
        chat.set_counterpart(Some(PEER));
        chat
    }

    #[test]
    fn test_compose_trims_and_rejects_blank() {
        let mut chat = channel();
        assert!(chat.compose("   ").is_none());
        let (_, frame) = chat.compose("  hello ").unwrap();
        assert_eq!(frame, OutboundFrame::ChatMessage { message: "hello".into() });
        assert_eq!(chat.pending().count(), 1);
    }

    #[test]
    fn test_confirmation_reconciles_pending() {
        let mut chat = channel();
        let (local_id, _) = chat.compose("hi").unwrap();
        match chat.receive(msg(5, ME, "hi")) {
            ChatReceipt::Confirmed { local_id: confirmed, message } => {
                assert_eq!(confirmed, local_id);
                assert_eq!(message.id, 5);
            }
            other => panic!("unexpected receipt {other:?}"),
        }
        assert_eq!(chat.entries().len(), 1);
        assert_eq!(chat.entries()[0].delivery, DeliveryState::Confirmed);
        assert_eq!(chat.last_seen_id(), Some(5));
    }

    #[test]
    fn test_batch_filters_seen_ids() {
        let mut chat = channel();
        for id in 1..=3 {
            chat.receive(msg(id, PEER, "x"));
        }
        assert_eq!(chat.receive(msg(2, PEER, "x")), ChatReceipt::Duplicate);
        assert_eq!(chat.receive(msg(3, PEER, "x")), ChatReceipt::Duplicate);
        assert!(matches!(chat.receive(msg(4, PEER, "y")), ChatReceipt::Appended(_)));
        assert_eq!(chat.entries().len(), 4);
    }

    #[test]
    fn test_history_replay_after_reconnect_is_ignored() {
        let mut chat = channel();
        chat.receive(msg(1, PEER, "a"));
        chat.receive(msg(2, ME, "b"));
        let before = chat.entries().len();
        for m in [msg(1, PEER, "a"), msg(2, ME, "b")] {
            assert_eq!(chat.receive(m), ChatReceipt::Duplicate);
        }
        assert_eq!(chat.entries().len(), before);
    }

    #[test]
    fn test_failed_send_is_marked() {
        let mut chat = channel();
        let (local_id, _) = chat.compose("lost").unwrap();
        assert!(chat.fail(local_id, "transport error: not connected"));
        assert!(matches!(chat.entries()[0].delivery, DeliveryState::Failed(_)));
        assert!(!chat.fail(local_id, "again"));
    }

    #[test]
    fn test_typing_tracks_counterpart_only() {
        let mut chat = channel();
        assert!(!chat.typing(ME, true));
        assert!(!chat.typing(3, true));
        assert!(chat.typing(PEER, true));
        assert!(chat.counterpart_typing());
        chat.receive(msg(1, PEER, "done typing"));
        assert!(!chat.counterpart_typing());
    }
}
