//! # tdhead-client
//!
//! Headless Telegram client core over the TDLib JSON interface.
//!
//! ## Features
//! - One [`ClientHandle`] per native instance, tracked in a [`ClientRegistry`]
//! - Request/reply correlation through `@extra` ids, with per-request timeouts
//! - A dedicated receive loop per instance that never blocks on consumers
//! - Login handshake driven by an injected [`InputProvider`]; wrong codes and
//!   passwords are asked for again
//! - Message fan-out to any number of subscribers with bounded queues
//! - Console and socket-channel deliveries, plus the socket wire types
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tdhead_client::{Client, ClientRegistry, Config, input_channel};
//! use tdhead_native::TdJsonLibrary;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let library = TdJsonLibrary::load_default()?;
//! let (provider, input) = input_channel();
//! let config = Config { api_id: 12345, api_hash: "hash".into(), ..Default::default() };
//! let client = Client::start(ClientRegistry::global(), &library, config, Arc::new(provider)).await?;
//!
//! input.supply("+15550001111")?;
//! client.wait_authenticated().await?;
//! client.send_to("@durov", "hello").await?;
//! client.destroy().await;
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod errors;
mod handle;
mod receiver;
mod registry;
pub mod auth;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod names;
pub mod request;
pub mod session;
pub mod update;
pub mod web;

pub use auth::{
    AuthStateMachine, AuthStatus, AuthUpdate, AuthorizationState, ChannelInputProvider,
    InputKind, InputProvider, InputRequest, InputSender, Transition, input_channel,
};
pub use bus::{MessageBus, OverflowPolicy, SubscriberId, Subscription};
pub use config::Config;
pub use delivery::{ChannelDelivery, ConsoleDelivery, Delivery, render, spawn_delivery};
pub use errors::{DeliveryError, Error, RemoteError, Result};
pub use handle::{ClientHandle, Routes};
pub use names::NameDirectory;
pub use registry::ClientRegistry;
pub use request::{Command, PendingRequest, RequestChannel};
pub use session::SessionStore;
pub use update::{IncomingMessage, MessageSender, User};
pub use web::{CommandRouter, InboundCommand, OutboundEvent};

use std::sync::Arc;

use serde_json::{Value, json};
use tdhead_native::NativeLibrary;
use tokio::sync::{mpsc, watch};

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    handle: ClientHandle,
    bus:    MessageBus,
    names:  Arc<NameDirectory>,
    auth:   AuthStatus,
}

/// A running client: handle, login machine, message bus and name cache
/// wired together. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create the native instance and start logging in.
    ///
    /// Returns as soon as the receive loop runs; use
    /// [`wait_authenticated`](Self::wait_authenticated) to wait for the login.
    pub async fn start(
        registry: &ClientRegistry,
        library:  &dyn NativeLibrary,
        config:   Config,
        provider: Arc<dyn InputProvider>,
    ) -> Result<Self> {
        let session = &config.session;
        if session.has_session().await {
            tracing::info!("[tdhead] Resuming session in {}", session.database_directory().display());
        } else if let Err(e) = session.ensure().await {
            tracing::warn!("[tdhead] Could not create {}: {e}", session.database_directory().display());
        }

        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let bus = MessageBus::new(config.subscriber_capacity, config.overflow, config.history_len);
        let names = Arc::new(NameDirectory::new());
        let routes = Routes::new()
            .auth(auth_tx)
            .messages(bus.clone())
            .names(names.clone());

        let handle = ClientHandle::create(registry, library, &config, routes)?;
        let (machine, auth) = AuthStateMachine::new(handle.requests().clone(), provider, &config);
        tokio::spawn(machine.run(auth_rx));

        Ok(Self { inner: Arc::new(ClientInner { handle, bus, names, auth }) })
    }

    pub fn handle(&self) -> &ClientHandle { &self.inner.handle }

    pub fn messages(&self) -> &MessageBus { &self.inner.bus }

    pub fn names(&self) -> &Arc<NameDirectory> { &self.inner.names }

    /// A new message subscription with the configured queue settings.
    pub fn subscribe(&self) -> Subscription { self.inner.bus.subscribe() }

    pub fn auth(&self) -> &AuthStatus { &self.inner.auth }

    pub fn authorization_state(&self) -> Option<AuthorizationState> {
        self.inner.auth.current()
    }

    pub fn auth_states(&self) -> watch::Receiver<Option<AuthorizationState>> {
        self.inner.auth.subscribe()
    }

    /// Resolve once logged in; [`Error::Closed`] if the login ends instead.
    pub async fn wait_authenticated(&self) -> Result<()> {
        self.inner.auth.wait_authenticated().await
    }

    // ── Users and chats ────────────────────────────────────────────────────

    /// The logged-in user.
    pub async fn get_me(&self) -> Result<User> {
        let me: User = self.inner.handle.submit("getMe", Value::Null).decode().await?;
        self.inner.names.learn_user(&me);
        Ok(me)
    }

    /// Display name of a user, fetched if not cached. Falls back to `user:<id>`.
    pub async fn user_name(&self, user_id: i64) -> String {
        if let Some(name) = self.inner.names.cached_user(user_id) {
            return name;
        }
        let fetched = self.inner.handle
            .submit("getUser", json!({ "user_id": user_id }))
            .decode::<User>()
            .await;
        match fetched {
            Ok(user) => {
                self.inner.names.learn_user(&user);
                user.display_name()
            }
            Err(e) => {
                tracing::debug!("[tdhead] getUser {user_id} failed: {e}");
                self.inner.names.user_name(user_id)
            }
        }
    }

    /// Title of a chat, fetched if not cached. Falls back to `chat:<id>`.
    pub async fn chat_title(&self, chat_id: i64) -> String {
        if let Some(title) = self.inner.names.cached_chat(chat_id) {
            return title;
        }
        match self.inner.handle.submit("getChat", json!({ "chat_id": chat_id })).await {
            Ok(chat) => {
                if let Some((id, title)) = update::chat_identity(&chat) {
                    self.inner.names.learn_chat(id, &title);
                }
            }
            Err(e) => tracing::debug!("[tdhead] getChat {chat_id} failed: {e}"),
        }
        self.inner.names.chat_title(chat_id)
    }

    /// A numeric chat id, or `@username` looked up with `searchPublicChat`.
    pub async fn resolve_chat(&self, target: &str) -> Result<i64> {
        let target = target.trim();
        if let Some(username) = target.strip_prefix('@') {
            if username.is_empty() {
                return Err(Error::InvalidTarget(target.to_string()));
            }
            let chat = self.inner.handle
                .submit("searchPublicChat", json!({ "username": username }))
                .await?;
            let (id, title) = update::chat_identity(&chat)
                .ok_or_else(|| Error::MalformedEvent("searchPublicChat: chat without id".into()))?;
            self.inner.names.learn_chat(id, &title);
            return Ok(id);
        }
        target.parse().map_err(|_| Error::InvalidTarget(target.to_string()))
    }

    // ── Messages ───────────────────────────────────────────────────────────

    /// Send plain text to `chat_id`. Returns the (pending) message object.
    pub async fn send_text(&self, chat_id: i64, text: &str) -> Result<Value> {
        let content = json!({
            "@type": "inputMessageText",
            "text": {
                "@type":    "formattedText",
                "text":     text,
                "entities": [],
            },
        });
        let command = Command::new("sendMessage")
            .param("chat_id", chat_id)
            .param("input_message_content", content);
        self.inner.handle.submit_command(command).await
    }

    /// [`resolve_chat`](Self::resolve_chat) then [`send_text`](Self::send_text).
    /// Returns the chat id.
    pub async fn send_to(&self, target: &str, text: &str) -> Result<i64> {
        let chat_id = self.resolve_chat(target).await?;
        self.send_text(chat_id, text).await?;
        Ok(chat_id)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Log out. The library moves through `LoggingOut` to `Closed`.
    pub async fn log_out(&self) -> Result<()> {
        self.inner.handle.submit("logOut", Value::Null).await?;
        tracing::info!("[tdhead] Logged out");
        Ok(())
    }

    /// Close the native instance. See [`ClientHandle::destroy`].
    pub async fn destroy(&self) {
        self.inner.handle.destroy().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("handle", &self.inner.handle)
            .field("state", &self.authorization_state())
            .finish()
    }
}
