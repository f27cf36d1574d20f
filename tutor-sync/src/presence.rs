//! Online-user tracking.
//!
//! ```text
//! online_users {users}        ──► replace_all()   (full set)
//! presence_update {online}    ──► add_user()      (idempotent)
//! presence_update {offline}   ──► remove_user()   (absent id = no-op)
//! ```
//!
//! Whatever event arrived last wins; there is no timestamp arbitration.

use std::collections::HashMap;

use crate::protocol::{InboundFrame, OnlineUser, PresenceStatus, UserId};

/// What a presence event changed.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// The whole set was replaced; carries the new size.
    Replaced(usize),
    /// A user came online (first time seen since they were last removed).
    Joined(OnlineUser),
    /// A user went offline.
    Left(UserId),
    /// The event did not change the set.
    Unchanged,
}

/// The set of currently-online peers, keyed by user id.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: HashMap<UserId, OnlineUser>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with a full snapshot.
    pub fn replace_all(&mut self, users: Vec<OnlineUser>) -> PresenceChange {
        self.online = users.into_iter().map(|u| (u.id, u)).collect();
        PresenceChange::Replaced(self.online.len())
    }

    /// Mark a user online. Adding an already-present user refreshes their
    /// profile but is otherwise a no-op.
    pub fn add_user(&mut self, user: OnlineUser) -> PresenceChange {
        match self.online.insert(user.id, user.clone()) {
            Some(_) => PresenceChange::Unchanged,
            None => PresenceChange::Joined(user),
        }
    }

    /// Mark a user offline. Removing an absent id does nothing.
    pub fn remove_user(&mut self, id: UserId) -> PresenceChange {
        match self.online.remove(&id) {
            Some(_) => PresenceChange::Left(id),
            None => PresenceChange::Unchanged,
        }
    }

    /// Apply a presence frame. Non-presence frames are ignored.
    pub fn apply(&mut self, frame: &InboundFrame) -> PresenceChange {
        match frame {
            InboundFrame::OnlineUsers { users } => self.replace_all(users.clone()),
            InboundFrame::PresenceUpdate { user, status: PresenceStatus::Online } => {
                self.add_user(user.clone())
            }
            InboundFrame::PresenceUpdate { user, status: PresenceStatus::Offline } => {
                self.remove_user(user.id)
            }
            _ => PresenceChange::Unchanged,
        }
    }

    pub fn is_online(&self, id: UserId) -> bool {
        self.online.contains_key(&id)
    }

    pub fn get(&self, id: UserId) -> Option<&OnlineUser> {
        self.online.get(&id)
    }

    /// Online users ordered by id.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self.online.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Forget everyone (channel disposed).
    pub fn clear(&mut self) {
        self.online.clear();
    }
}
