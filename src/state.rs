use std::collections::BTreeMap;

use tokio::sync::{RwLock, RwLockReadGuard};

use crate::api::{DirectMessage, User};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// All messages exchanged with one counterpart.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub user_id: i64,
    pub screen_name: String,
    pub sent: Vec<DirectMessage>,
    pub received: Vec<DirectMessage>,
}

impl Conversation {
    fn new(user_id: i64, screen_name: &str) -> Self {
        Self {
            user_id,
            screen_name: screen_name.to_string(),
            sent: Vec::new(),
            received: Vec::new(),
        }
    }
}

/// Conversations keyed by counterpart id, relative to the authenticated user.
#[derive(Debug, Clone)]
pub struct Conversations {
    user: User,
    chats: BTreeMap<i64, Conversation>,
}

impl Conversations {
    pub fn new(user: User) -> Self {
        Self {
            user,
            chats: BTreeMap::new(),
        }
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn get(&self, counterpart_id: i64) -> Option<&Conversation> {
        self.chats.get(&counterpart_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.chats.values()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn direction(&self, dm: &DirectMessage) -> Direction {
        if dm.sender_id == self.user.id {
            Direction::Sent
        } else {
            Direction::Received
        }
    }

    pub fn insert(&mut self, dm: DirectMessage) -> Direction {
        let direction = self.direction(&dm);
        let (counterpart_id, counterpart_name) = match direction {
            Direction::Sent => (dm.recipient_id, dm.recipient_screen_name.as_str()),
            Direction::Received => (dm.sender_id, dm.sender_screen_name.as_str()),
        };

        let chat = self
            .chats
            .entry(counterpart_id)
            .or_insert_with(|| Conversation::new(counterpart_id, counterpart_name));

        match direction {
            Direction::Sent => chat.sent.push(dm),
            Direction::Received => chat.received.push(dm),
        }
        direction
    }
}

/// Shared, lock-guarded [`Conversations`]. Writers serialize on the lock;
/// readers share it.
#[derive(Debug)]
pub struct ConversationIndex {
    inner: RwLock<Conversations>,
}

impl ConversationIndex {
    pub fn new(user: User) -> Self {
        Self {
            inner: RwLock::new(Conversations::new(user)),
        }
    }

    pub async fn add_message(&self, dm: DirectMessage) -> Direction {
        self.inner.write().await.insert(dm)
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Conversations> {
        self.inner.read().await
    }

    /// Owned copy of the current state; the lock is released on return.
    pub async fn snapshot(&self) -> Conversations {
        self.inner.read().await.clone()
    }

    pub async fn conversation(&self, counterpart_id: i64) -> Option<Conversation> {
        self.inner.read().await.get(counterpart_id).cloned()
    }
}
