//! Wire types of the browser-facing socket, and the router that turns
//! inbound commands into client calls.
//!
//! The socket server lives elsewhere. It feeds each text frame to
//! [`CommandRouter::handle`] and writes back the returned events; message
//! events reach it through a [`ChannelDelivery`](crate::ChannelDelivery)
//! subscription, login progress through [`CommandRouter::auth_events`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tdhead_native::NativeLibrary;
use tokio::sync::mpsc;

use crate::Client;
use crate::auth::{AuthorizationState, InputKind, InputRequest, InputSender, input_channel};
use crate::config::Config;
use crate::names::NameDirectory;
use crate::registry::ClientRegistry;
use crate::update::IncomingMessage;

// ─── Outbound ─────────────────────────────────────────────────────────────────

/// An event sent to the browser.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Message {
        chat_id: i64,
        sender:  String,
        text:    String,
        /// Unix seconds.
        ts:      i64,
    },
    AuthState {
        state: AuthorizationState,
    },
    /// The login needs input.
    Prompt {
        kind:  InputKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint:  Option<String>,
    },
    /// Outcome of a `send` command, echoing what was asked.
    SendResult {
        chat:  String,
        text:  String,
        ok:    bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A command could not be carried out.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<Value>,
    },
}

impl OutboundEvent {
    pub fn message(msg: &IncomingMessage, names: &NameDirectory) -> Self {
        Self::Message {
            chat_id: msg.chat_id,
            sender:  names.sender_name(&msg.sender),
            text:    msg.text.clone(),
            ts:      msg.timestamp,
        }
    }

    pub fn prompt(request: &InputRequest) -> Self {
        Self::Prompt {
            kind:  request.kind,
            error: request.error.as_ref().map(ToString::to_string),
            hint:  request.hint.clone(),
        }
    }

    fn error(message: impl Into<String>, command: Option<Value>) -> Self {
        Self::Error { message: message.into(), command }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ─── Inbound ──────────────────────────────────────────────────────────────────

/// A command received from the browser.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundCommand {
    Authenticate {
        #[serde(deserialize_with = "number_or_string")]
        api_id:   i32,
        api_hash: String,
        #[serde(default)]
        phone:    Option<String>,
    },
    Send {
        /// Numeric chat id or `@username`.
        #[serde(deserialize_with = "string_or_number")]
        chat: String,
        text: String,
    },
    Phone {
        value: String,
    },
    Code {
        value: String,
    },
    Password {
        value: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(i64),
    Text(String),
}

/// Form fields often arrive as strings.
fn number_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i32, D::Error> {
    use serde::de::Error as _;
    match Loose::deserialize(d)? {
        Loose::Number(n) => i32::try_from(n).map_err(D::Error::custom),
        Loose::Text(s)   => s.trim().parse().map_err(D::Error::custom),
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Loose::deserialize(d)? {
        Loose::Number(n) => n.to_string(),
        Loose::Text(s)   => s,
    })
}

// ─── Login progress ───────────────────────────────────────────────────────────

/// Map `client`'s authorization states and `input`'s prompts to
/// [`OutboundEvent::AuthState`] and [`OutboundEvent::Prompt`].
///
/// The current state, if any, comes first. The stream ends after `Closed`
/// or once the receiver is dropped.
pub fn auth_events(client: &Client, mut input: InputSender) -> mpsc::UnboundedReceiver<OutboundEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut states = client.auth_states();
    tokio::spawn(async move {
        let current = *states.borrow_and_update();
        if let Some(state) = current {
            if tx.send(OutboundEvent::AuthState { state }).is_err() {
                return;
            }
        }
        let mut prompts_open = true;
        loop {
            tokio::select! {
                biased;
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let Some(state) = *states.borrow_and_update() else { continue };
                    if tx.send(OutboundEvent::AuthState { state }).is_err() || state.is_terminal() {
                        return;
                    }
                }
                prompt = input.next_prompt(), if prompts_open => match prompt {
                    Some(request) => {
                        if tx.send(OutboundEvent::prompt(&request)).is_err() {
                            return;
                        }
                    }
                    None => prompts_open = false,
                },
            }
        }
    });
    rx
}

// ─── CommandRouter ────────────────────────────────────────────────────────────

/// Executes [`InboundCommand`]s against one lazily started [`Client`].
pub struct CommandRouter {
    registry: ClientRegistry,
    library:  Arc<dyn NativeLibrary>,
    base:     Config,
    client:   Mutex<Option<Client>>,
    input:    Mutex<Option<InputSender>>,
}

impl CommandRouter {
    /// `base` supplies everything except the credentials.
    pub fn new(registry: ClientRegistry, library: Arc<dyn NativeLibrary>, base: Config) -> Self {
        Self {
            registry,
            library,
            base,
            client: Mutex::new(None),
            input:  Mutex::new(None),
        }
    }

    /// The client started by `authenticate`, if any.
    pub fn client(&self) -> Option<Client> {
        self.client.lock().clone()
    }

    /// The sender feeding the login prompts, if a login was started.
    pub fn input(&self) -> Option<InputSender> {
        self.input.lock().clone()
    }

    /// Parse and execute one raw frame; the returned events go back to the
    /// socket that sent it.
    pub async fn handle(&self, raw: &str) -> Vec<OutboundEvent> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return vec![OutboundEvent::error(format!("invalid JSON: {e}"), None)],
        };
        match InboundCommand::deserialize(&value) {
            Ok(command) => self.dispatch(command, value).await,
            Err(e) => vec![OutboundEvent::error(format!("unrecognised command: {e}"), Some(value))],
        }
    }

    /// Execute a parsed command. `original` is echoed back with failures.
    pub async fn dispatch(&self, command: InboundCommand, original: Value) -> Vec<OutboundEvent> {
        match command {
            InboundCommand::Authenticate { api_id, api_hash, phone } => {
                self.authenticate(api_id, api_hash, phone, original).await
            }
            InboundCommand::Phone { value }    => self.answer(InputKind::PhoneNumber, value, original),
            InboundCommand::Code { value }     => self.answer(InputKind::Code, value, original),
            InboundCommand::Password { value } => self.answer(InputKind::Password, value, original),
            InboundCommand::Send { chat, text } => {
                let Some(client) = self.client() else {
                    return vec![OutboundEvent::error("not authenticated", Some(original))];
                };
                let result = client.send_to(&chat, &text).await;
                if let Err(e) = &result {
                    tracing::warn!("[tdhead] send to {chat} failed: {e}");
                }
                vec![OutboundEvent::SendResult {
                    ok:    result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    chat,
                    text,
                }]
            }
        }
    }

    /// Supply `value` to the waiting prompt, which must be asking for `kind`.
    fn answer(&self, kind: InputKind, value: String, original: Value) -> Vec<OutboundEvent> {
        let Some(input) = self.input() else {
            return vec![OutboundEvent::error("no login in progress", Some(original))];
        };
        let error = match input.pending() {
            Some(request) if request.kind == kind => match input.supply(value) {
                Ok(()) => return Vec::new(),
                Err(e) => e.to_string(),
            },
            Some(request) => format!("expected {}, not {kind}", request.kind),
            None          => format!("no {kind} requested"),
        };
        vec![OutboundEvent::error(error, Some(original))]
    }

    /// Login progress of the current client as socket events: every state
    /// change and every prompt. `None` before `authenticate`.
    pub fn auth_events(&self) -> Option<mpsc::UnboundedReceiver<OutboundEvent>> {
        Some(auth_events(&self.client()?, self.input()?))
    }

    /// Start the client. Its states and prompts are reported through
    /// [`auth_events`](Self::auth_events), not in the reply.
    async fn authenticate(
        &self,
        api_id:   i32,
        api_hash: String,
        phone:    Option<String>,
        original: Value,
    ) -> Vec<OutboundEvent> {
        if let Some(client) = self.client() {
            if !client.handle().is_closed() {
                return vec![OutboundEvent::error("client already started", Some(original))];
            }
        }
        let config = Config { api_id, api_hash, phone, ..self.base.clone() };
        let (provider, sender) = input_channel();
        match Client::start(&self.registry, self.library.as_ref(), config, Arc::new(provider)).await {
            Ok(client) => {
                *self.client.lock() = Some(client);
                *self.input.lock() = Some(sender);
                Vec::new()
            }
            Err(e) => vec![OutboundEvent::error(format!("could not start client: {e}"), Some(original))],
        }
    }
}
