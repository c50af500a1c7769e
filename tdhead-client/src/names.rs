//! Display-name cache for users and chats.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::update::{MessageSender, User};

/// Caches user display names and chat titles so messages can be rendered
/// without a round-trip per line.
#[derive(Debug, Default)]
pub struct NameDirectory {
    /// user_id → display name
    users: RwLock<HashMap<i64, String>>,
    /// chat_id → title
    chats: RwLock<HashMap<i64, String>>,
    /// Ids already looked up, so each is fetched once.
    asked: Mutex<HashSet<(bool, i64)>>,
}

impl NameDirectory {
    pub fn new() -> Self { Self::default() }

    pub fn learn_user(&self, user: &User) {
        self.users.write().insert(user.id, user.display_name());
    }

    /// Empty titles are not cached.
    pub fn learn_chat(&self, id: i64, title: &str) {
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        self.chats.write().insert(id, title.to_string());
    }

    pub fn cached_user(&self, id: i64) -> Option<String> {
        self.users.read().get(&id).cloned()
    }

    pub fn cached_chat(&self, id: i64) -> Option<String> {
        self.chats.read().get(&id).cloned()
    }

    /// The cached name, or `user:<id>`.
    pub fn user_name(&self, id: i64) -> String {
        self.cached_user(id).unwrap_or_else(|| format!("user:{id}"))
    }

    /// The cached title, or `chat:<id>`.
    pub fn chat_title(&self, id: i64) -> String {
        self.cached_chat(id).unwrap_or_else(|| format!("chat:{id}"))
    }

    /// `true` the first time an unknown user is claimed for a lookup.
    pub fn claim_user_lookup(&self, id: i64) -> bool {
        !self.users.read().contains_key(&id) && self.asked.lock().insert((true, id))
    }

    /// `true` the first time an unknown chat is claimed for a lookup.
    pub fn claim_chat_lookup(&self, id: i64) -> bool {
        !self.chats.read().contains_key(&id) && self.asked.lock().insert((false, id))
    }

    pub fn sender_name(&self, sender: &MessageSender) -> String {
        match sender {
            MessageSender::User { user_id } => self.user_name(*user_id),
            MessageSender::Chat { chat_id } => self.chat_title(*chat_id),
        }
    }
}
