//! The receive loop: sole reader of one native instance.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tdhead_native::NativeClient;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::auth::AuthorizationState;
use crate::bus::MessageBus;
use crate::handle::Routes;
use crate::registry::ClientRegistry;
use crate::request::{Command, RequestChannel};
use crate::update::{Event, IncomingMessage, MessageSender, classify};

pub(crate) struct UpdateReceiver {
    pub(crate) id:       u64,
    pub(crate) native:   Arc<dyn NativeClient>,
    pub(crate) requests: Arc<RequestChannel>,
    pub(crate) routes:   Routes,
    pub(crate) registry: ClientRegistry,
    pub(crate) stop:     CancellationToken,
    pub(crate) exited:   CancellationToken,
    pub(crate) poll:     Duration,
}

impl UpdateReceiver {
    /// Run on a dedicated thread; the native receive call blocks.
    pub(crate) fn spawn(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("tdhead-recv-{}", self.id))
            .spawn(move || self.run())
    }

    fn run(self) {
        // Runs on every exit path, panics included.
        let _teardown = Teardown {
            id:       self.id,
            requests: self.requests.clone(),
            registry: self.registry.clone(),
            bus:      self.routes.bus.clone(),
            _exited:  self.exited.clone().drop_guard(),
        };
        tracing::debug!("[tdhead] Client {} receive loop started", self.id);

        while !self.stop.is_cancelled() {
            let Some(raw) = self.native.receive(self.poll) else { continue };
            if self.dispatch(&raw).is_break() {
                break;
            }
        }
    }

    /// Route one event. Breaks once the instance reports `Closed`.
    fn dispatch(&self, raw: &str) -> ControlFlow<()> {
        let event = match classify(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("[tdhead] Client {}: skipping event: {e}", self.id);
                return ControlFlow::Continue(());
            }
        };

        match event {
            Event::Reply { extra, payload } => {
                self.requests.resolve(&extra, payload);
            }
            Event::Authorization(update) => {
                let closed = update.state == AuthorizationState::Closed;
                if let Some(auth) = &self.routes.auth {
                    if auth.send(update).is_err() {
                        tracing::debug!("[tdhead] Client {}: authorization update unobserved", self.id);
                    }
                }
                if closed {
                    return ControlFlow::Break(());
                }
            }
            Event::NewMessage(msg) => {
                self.look_up_names(&msg);
                if let Some(bus) = &self.routes.bus {
                    bus.publish(msg);
                }
            }
            Event::User(user) => {
                if let Some(names) = &self.routes.names {
                    names.learn_user(&user);
                }
            }
            Event::Chat { id, title } => {
                if let Some(names) = &self.routes.names {
                    names.learn_chat(id, &title);
                }
            }
            Event::Other(ty) => {
                tracing::trace!("[tdhead] Client {}: ignoring {ty}", self.id);
            }
        }
        ControlFlow::Continue(())
    }

    /// Ask for names the directory lacks. The answers come back as bare
    /// `user`/`chat` events and are learned when they arrive.
    fn look_up_names(&self, msg: &IncomingMessage) {
        let Some(names) = &self.routes.names else { return };
        let mut lookups = Vec::with_capacity(2);
        match msg.sender {
            MessageSender::User { user_id } if names.claim_user_lookup(user_id) => {
                lookups.push(Command::new("getUser").param("user_id", user_id));
            }
            MessageSender::Chat { chat_id } if names.claim_chat_lookup(chat_id) => {
                lookups.push(Command::new("getChat").param("chat_id", chat_id));
            }
            _ => {}
        }
        if names.claim_chat_lookup(msg.chat_id) {
            lookups.push(Command::new("getChat").param("chat_id", msg.chat_id));
        }
        for command in lookups {
            if let Err(e) = self.requests.send(&command) {
                tracing::debug!("[tdhead] Client {}: {} not sent: {e}", self.id, command.method());
            }
        }
    }
}

/// Closes the channel, unregisters the handle and closes the bus when the
/// loop ends. `exited` is cancelled last, after the rest is torn down.
struct Teardown {
    id:       u64,
    requests: Arc<RequestChannel>,
    registry: ClientRegistry,
    bus:      Option<MessageBus>,
    _exited:  DropGuard,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let failed = self.requests.close();
        self.registry.remove(self.id);
        if let Some(bus) = &self.bus {
            bus.close();
        }
        if std::thread::panicking() {
            tracing::error!("[tdhead] Client {} receive loop panicked ({failed} pending request(s) failed)", self.id);
        } else {
            tracing::info!("[tdhead] Client {} receive loop stopped ({failed} pending request(s) failed)", self.id);
        }
    }
}
