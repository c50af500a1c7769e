//! Classification of raw native events.
//!
//! Every string the native library emits is decoded into one [`Event`]:
//! replies carry an `@extra` correlation id, everything else is sorted by
//! its `@type`. Types nobody consumes land in [`Event::Other`].

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::AuthUpdate;
use crate::errors::{Error, Result};

// ─── MessageSender ───────────────────────────────────────────────────────────

/// Who sent a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(tag = "@type")]
pub enum MessageSender {
    /// A user account.
    #[serde(rename = "messageSenderUser")]
    User {
        user_id: i64,
    },
    /// A chat posting on its own behalf (channels, anonymous admins).
    #[serde(rename = "messageSenderChat")]
    Chat {
        chat_id: i64,
    },
}

impl MessageSender {
    /// The user or chat id.
    pub fn id(&self) -> i64 {
        match self {
            Self::User { user_id } => *user_id,
            Self::Chat { chat_id } => *chat_id,
        }
    }
}

// ─── IncomingMessage ─────────────────────────────────────────────────────────

/// A new message, decoded from `updateNewMessage`.
#[derive(Clone, Debug, PartialEq)]
pub struct IncomingMessage {
    /// Message id within the chat.
    pub id:        i64,
    pub chat_id:   i64,
    pub sender:    MessageSender,
    /// Plain text, or a placeholder for non-text content.
    pub text:      String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// `true` if sent by the logged-in account.
    pub outgoing:  bool,
    /// The undecoded `message` object.
    pub raw:       Arc<Value>,
}

#[derive(Deserialize)]
struct RawMessage {
    id:          i64,
    chat_id:     i64,
    sender_id:   MessageSender,
    date:        i64,
    #[serde(default)]
    is_outgoing: bool,
    #[serde(default)]
    content:     Value,
}

impl IncomingMessage {
    /// Decode the `message` object of an `updateNewMessage`.
    pub fn from_json(message: Value) -> Result<Self> {
        let parsed: RawMessage = serde_json::from_value(message.clone())
            .map_err(|e| Error::MalformedEvent(format!("updateNewMessage: {e}")))?;
        Ok(Self {
            id:        parsed.id,
            chat_id:   parsed.chat_id,
            sender:    parsed.sender_id,
            text:      content_text(&parsed.content),
            timestamp: parsed.date,
            outgoing:  parsed.is_outgoing,
            raw:       Arc::new(message),
        })
    }
}

fn content_text(content: &Value) -> String {
    match content.get("@type").and_then(Value::as_str) {
        Some("messageText") => content
            .pointer("/text/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(other) => format!("<Unsupported message type {other}>"),
        None        => "<Unsupported message type>".to_string(),
    }
}

// ─── User ─────────────────────────────────────────────────────────────────────

/// A user object (`getMe`, `getUser`, `updateUser`).
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct User {
    pub id:           i64,
    #[serde(default)]
    pub first_name:   String,
    #[serde(default)]
    pub last_name:    String,
    #[serde(default)]
    pub phone_number: String,
    /// Older library versions report a single username here.
    #[serde(default)]
    username:         Option<String>,
    #[serde(default)]
    usernames:        Option<Usernames>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct Usernames {
    #[serde(default)]
    active_usernames: Vec<String>,
}

impl User {
    /// The first active username, if any.
    pub fn username(&self) -> Option<&str> {
        self.usernames
            .as_ref()
            .and_then(|u| u.active_usernames.first())
            .or(self.username.as_ref())
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    /// `@username`, else `first last`, else `user:<id>`.
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username() {
            return format!("@{username}");
        }
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() { format!("user:{}", self.id) } else { name.to_string() }
    }
}

// ─── Event ────────────────────────────────────────────────────────────────────

/// One classified native event.
#[derive(Clone, Debug)]
pub enum Event {
    /// A reply to a submitted request, with `@extra` removed from the payload.
    Reply { extra: String, payload: Value },
    /// The authorization state changed.
    Authorization(AuthUpdate),
    /// A new message arrived.
    NewMessage(IncomingMessage),
    /// A user became known or changed.
    User(User),
    /// A chat became known or was renamed.
    Chat { id: i64, title: String },
    /// Anything else, by `@type`.
    Other(String),
}

/// Decode and classify one raw event.
pub fn classify(raw: &str) -> Result<Event> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(mut object) = value else {
        return Err(Error::MalformedEvent("event is not a JSON object".into()));
    };
    let ty = match object.get("@type") {
        Some(Value::String(ty)) => ty.clone(),
        _ => return Err(Error::MalformedEvent("event has no @type".into())),
    };

    if let Some(extra) = object.remove("@extra") {
        let extra = match extra {
            Value::String(s) => s,
            other            => other.to_string(),
        };
        object.remove("@client_id");
        return Ok(Event::Reply { extra, payload: Value::Object(object) });
    }

    match ty.as_str() {
        "updateAuthorizationState" => {
            let state = field(&object, &ty, "authorization_state")?;
            Ok(match AuthUpdate::from_json(state) {
                Some(update) => Event::Authorization(update),
                None => {
                    let name = state.get("@type").and_then(Value::as_str).unwrap_or("?");
                    Event::Other(format!("{ty}:{name}"))
                }
            })
        }
        "updateNewMessage" => {
            let message = object.remove("message")
                .ok_or_else(|| missing(&ty, "message"))?;
            Ok(Event::NewMessage(IncomingMessage::from_json(message)?))
        }
        "updateUser" => {
            let user = object.remove("user").ok_or_else(|| missing(&ty, "user"))?;
            let user = serde_json::from_value(user)
                .map_err(|e| Error::MalformedEvent(format!("{ty}: {e}")))?;
            Ok(Event::User(user))
        }
        // Answers to uncorrelated lookups arrive as bare objects.
        "user" => {
            let user = serde_json::from_value(Value::Object(object))
                .map_err(|e| Error::MalformedEvent(format!("{ty}: {e}")))?;
            Ok(Event::User(user))
        }
        "chat" => {
            let (id, title) = chat_identity(&Value::Object(object))
                .ok_or_else(|| Error::MalformedEvent(format!("{ty} without id")))?;
            Ok(Event::Chat { id, title })
        }
        "updateNewChat" => {
            let chat = field(&object, &ty, "chat")?;
            let (id, title) = chat_identity(chat)
                .ok_or_else(|| Error::MalformedEvent(format!("{ty}: chat without id")))?;
            Ok(Event::Chat { id, title })
        }
        "updateChatTitle" => {
            let id = field(&object, &ty, "chat_id")?.as_i64()
                .ok_or_else(|| missing(&ty, "chat_id"))?;
            let title = object.get("title").and_then(Value::as_str).unwrap_or_default();
            Ok(Event::Chat { id, title: title.to_string() })
        }
        _ => Ok(Event::Other(ty)),
    }
}

/// `(id, title)` of a chat object.
pub(crate) fn chat_identity(chat: &Value) -> Option<(i64, String)> {
    let id = chat.get("id")?.as_i64()?;
    let title = chat.get("title").and_then(Value::as_str).unwrap_or_default();
    Some((id, title.to_string()))
}

fn field<'a>(object: &'a Map<String, Value>, ty: &str, name: &str) -> Result<&'a Value> {
    object.get(name).ok_or_else(|| missing(ty, name))
}

fn missing(ty: &str, name: &str) -> Error {
    Error::MalformedEvent(format!("{ty} without {name}"))
}
