//! The login handshake.
//!
//! [`AuthStateMachine`] consumes authorization-state updates from the receive
//! loop, issues the parameters request itself, and asks an [`InputProvider`]
//! for the phone number, code and password when the library wants them.
//!
//! Prompting runs in a spawned task so a provider that takes minutes never
//! stalls the receive loop. Each transition aborts the prompt of the state
//! being left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::request::{Command, RequestChannel};

// ─── AuthorizationState ───────────────────────────────────────────────────────

/// One step of the login handshake, as reported by the native library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationState {
    WaitTdlibParameters,
    WaitPhoneNumber,
    WaitCode,
    /// The phone number has no account yet; a name is needed.
    WaitRegistration,
    /// Two-step verification is enabled.
    WaitPassword,
    Ready,
    LoggingOut,
    /// Terminal. The native instance is gone.
    Closed,
}

impl AuthorizationState {
    /// Map a native `authorizationState*` type name.
    pub fn from_tdlib(name: &str) -> Option<Self> {
        Some(match name {
            "authorizationStateWaitTdlibParameters" => Self::WaitTdlibParameters,
            "authorizationStateWaitPhoneNumber"     => Self::WaitPhoneNumber,
            "authorizationStateWaitCode"            => Self::WaitCode,
            "authorizationStateWaitRegistration"    => Self::WaitRegistration,
            "authorizationStateWaitPassword"        => Self::WaitPassword,
            "authorizationStateReady"               => Self::Ready,
            "authorizationStateLoggingOut"          => Self::LoggingOut,
            "authorizationStateClosing"             => Self::LoggingOut,
            "authorizationStateClosed"              => Self::Closed,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool { self == Self::Closed }

    /// Whether moving from `from` (`None` before the first update) to `to`
    /// follows the handshake order.
    pub fn admits(from: Option<Self>, to: Self) -> bool {
        use crate::auth::AuthorizationState::*;
        match (from, to) {
            (Some(Closed), _)                         => false,
            (_, Closed)                               => true,
            (Some(LoggingOut), _)                     => false,
            (Some(_), LoggingOut)                     => true,
            (None, WaitTdlibParameters)               => true,
            (Some(WaitTdlibParameters), WaitPhoneNumber | Ready) => true,
            (Some(WaitPhoneNumber), WaitCode)         => true,
            (Some(WaitCode), WaitPassword | WaitRegistration | Ready) => true,
            (Some(WaitRegistration), WaitPassword | Ready) => true,
            (Some(WaitPassword), Ready)               => true,
            _                                         => false,
        }
    }
}

impl std::fmt::Display for AuthorizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WaitTdlibParameters => "wait_tdlib_parameters",
            Self::WaitPhoneNumber     => "wait_phone_number",
            Self::WaitCode            => "wait_code",
            Self::WaitRegistration    => "wait_registration",
            Self::WaitPassword        => "wait_password",
            Self::Ready               => "ready",
            Self::LoggingOut          => "logging_out",
            Self::Closed              => "closed",
        };
        f.write_str(name)
    }
}

/// A decoded `updateAuthorizationState`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUpdate {
    pub state:         AuthorizationState,
    /// Only set with [`AuthorizationState::WaitPassword`].
    pub password_hint: Option<String>,
}

impl AuthUpdate {
    /// Decode an `authorization_state` object. `None` for unsupported states.
    pub fn from_json(state: &Value) -> Option<Self> {
        let name = state.get("@type")?.as_str()?;
        let state_kind = AuthorizationState::from_tdlib(name);
        if state_kind.is_none() {
            tracing::debug!("[tdhead] Unsupported authorization state {name}");
        }
        let password_hint = state.get("password_hint")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        Some(Self { state: state_kind?, password_hint })
    }
}

impl From<AuthorizationState> for AuthUpdate {
    fn from(state: AuthorizationState) -> Self {
        Self { state, password_hint: None }
    }
}

// ─── Input provider ───────────────────────────────────────────────────────────

/// What the handshake needs from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    PhoneNumber,
    Code,
    Password,
    FirstName,
    LastName,
}

impl std::fmt::Display for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PhoneNumber => "phone number",
            Self::Code        => "code",
            Self::Password    => "password",
            Self::FirstName   => "first name",
            Self::LastName    => "last name",
        })
    }
}

/// One request for input.
#[derive(Clone, Debug, PartialEq)]
pub struct InputRequest {
    pub kind:  InputKind,
    /// Why the previous value for this kind was rejected.
    pub error: Option<Error>,
    /// Password hint, for [`InputKind::Password`].
    pub hint:  Option<String>,
}

impl InputRequest {
    pub fn new(kind: InputKind) -> Self {
        Self { kind, error: None, hint: None }
    }
}

/// Source of login input: a terminal, a web form, a test script.
///
/// `request` may take arbitrarily long. Returning `None` means no more input
/// will come, and prompting for the current state stops.
#[async_trait]
pub trait InputProvider: Send + Sync + 'static {
    async fn request(&self, request: InputRequest) -> Option<String>;
}

// ─── AuthStatus ───────────────────────────────────────────────────────────────

/// Read side of the machine's published state.
#[derive(Clone, Debug)]
pub struct AuthStatus {
    rx:            watch::Receiver<Option<AuthorizationState>>,
    authenticated: Arc<AtomicBool>,
}

impl AuthStatus {
    /// The last accepted state; `None` before the first update.
    pub fn current(&self) -> Option<AuthorizationState> {
        *self.rx.borrow()
    }

    /// `true` once `Ready` has been reached, even if logged out since.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Resolve once `Ready` is reached, or fail with [`Error::Closed`] if the
    /// handshake ends first.
    pub async fn wait_authenticated(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        // A dropped sender means the machine is gone; the flag decides either way.
        let _ = rx.wait_for(|s| matches!(
            s,
            Some(AuthorizationState::Ready | AuthorizationState::LoggingOut | AuthorizationState::Closed)
        )).await;
        if self.is_authenticated() { Ok(()) } else { Err(Error::Closed) }
    }

    /// A watch receiver over every accepted state.
    pub fn subscribe(&self) -> watch::Receiver<Option<AuthorizationState>> {
        self.rx.clone()
    }
}

// ─── AuthStateMachine ─────────────────────────────────────────────────────────

/// How [`AuthStateMachine::on_state`] treated an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// A new state was entered.
    Entered,
    /// Same as the current state; ignored.
    Repeated,
    /// Out of order; ignored.
    Rejected,
}

/// Drives the login handshake for one client.
pub struct AuthStateMachine {
    requests:      Arc<RequestChannel>,
    provider:      Arc<dyn InputProvider>,
    parameters:    Command,
    /// Used for the first phone-number attempt only.
    phone:         Option<String>,
    state:         Option<AuthorizationState>,
    status:        watch::Sender<Option<AuthorizationState>>,
    authenticated: Arc<AtomicBool>,
    prompt:        Option<JoinHandle<()>>,
}

impl AuthStateMachine {
    pub fn new(
        requests: Arc<RequestChannel>,
        provider: Arc<dyn InputProvider>,
        config:   &Config,
    ) -> (Self, AuthStatus) {
        let (status, rx) = watch::channel(None);
        let authenticated = Arc::new(AtomicBool::new(false));
        let machine = Self {
            requests,
            provider,
            parameters: config.parameters_command(),
            phone: config.phone.clone().filter(|p| !p.trim().is_empty()),
            state: None,
            status,
            authenticated: authenticated.clone(),
            prompt: None,
        };
        (machine, AuthStatus { rx, authenticated })
    }

    pub fn state(&self) -> Option<AuthorizationState> { self.state }

    /// Apply one authorization update.
    ///
    /// Must be called from within a tokio runtime: entering a state that needs
    /// input spawns its prompt task.
    pub fn on_state(&mut self, update: AuthUpdate) -> Transition {
        let next = update.state;
        if self.state == Some(next) {
            tracing::debug!("[tdhead] Authorization state {next} repeated");
            return Transition::Repeated;
        }
        if !AuthorizationState::admits(self.state, next) {
            tracing::warn!(
                "[tdhead] Ignoring authorization transition {} → {next}",
                self.state.map_or_else(|| "start".to_string(), |s| s.to_string())
            );
            return Transition::Rejected;
        }

        self.cancel_prompt();
        self.state = Some(next);
        if next == AuthorizationState::Ready {
            self.authenticated.store(true, Ordering::SeqCst);
        }
        self.status.send_replace(Some(next));
        tracing::info!("[tdhead] Authorization state: {next}");
        self.enter(next, update.password_hint);
        Transition::Entered
    }

    /// Consume updates until `Closed` or until the sender side goes away.
    pub async fn run(mut self, mut updates: mpsc::UnboundedReceiver<AuthUpdate>) {
        while let Some(update) = updates.recv().await {
            self.on_state(update);
            if self.state.is_some_and(AuthorizationState::is_terminal) {
                break;
            }
        }
        self.cancel_prompt();
        if !self.state.is_some_and(AuthorizationState::is_terminal) {
            self.state = Some(AuthorizationState::Closed);
            self.status.send_replace(self.state);
        }
        tracing::debug!("[tdhead] Authorization machine finished");
    }

    fn enter(&mut self, state: AuthorizationState, hint: Option<String>) {
        let requests = self.requests.clone();
        let provider = self.provider.clone();
        let task = match state {
            AuthorizationState::WaitTdlibParameters => {
                let parameters = self.parameters.clone();
                tokio::spawn(submit_parameters(requests, parameters))
            }
            AuthorizationState::WaitPhoneNumber => {
                let preset = self.phone.take();
                tokio::spawn(prompt_loop(requests, provider, InputKind::PhoneNumber, None, preset))
            }
            AuthorizationState::WaitCode => {
                tokio::spawn(prompt_loop(requests, provider, InputKind::Code, None, None))
            }
            AuthorizationState::WaitPassword => {
                tokio::spawn(prompt_loop(requests, provider, InputKind::Password, hint, None))
            }
            AuthorizationState::WaitRegistration => {
                tokio::spawn(register(requests, provider))
            }
            AuthorizationState::Ready
            | AuthorizationState::LoggingOut
            | AuthorizationState::Closed => return,
        };
        self.prompt = Some(task);
    }

    fn cancel_prompt(&mut self) {
        if let Some(task) = self.prompt.take() {
            task.abort();
        }
    }
}

impl Drop for AuthStateMachine {
    fn drop(&mut self) {
        self.cancel_prompt();
    }
}

async fn submit_parameters(requests: Arc<RequestChannel>, parameters: Command) {
    let timeout = requests.default_timeout();
    match requests.submit_command(parameters, timeout).await {
        Ok(_) => tracing::debug!("[tdhead] Parameters accepted"),
        Err(Error::Closed) => {}
        Err(e) => {
            tracing::error!("[tdhead] setTdlibParameters failed: {e}; closing");
            if let Err(e) = requests.send(&Command::new("close")) {
                tracing::debug!("[tdhead] close request not delivered: {e}");
            }
        }
    }
}

fn verification(kind: InputKind, value: &str) -> Command {
    match kind {
        InputKind::PhoneNumber => Command::new("setAuthenticationPhoneNumber")
            .param("phone_number", value)
            .param("settings", json!({
                "@type":                   "phoneNumberAuthenticationSettings",
                "allow_flash_call":        false,
                "allow_missed_call":       false,
                "is_current_phone_number": false,
                "allow_sms_retriever_api": false,
            })),
        InputKind::Code => Command::new("checkAuthenticationCode").param("code", value),
        InputKind::Password => Command::new("checkAuthenticationPassword").param("password", value),
        InputKind::FirstName | InputKind::LastName => {
            Command::new("registerUser").param("first_name", value)
        }
    }
}

async fn ask(
    provider: &dyn InputProvider,
    kind:     InputKind,
    error:    Option<Error>,
    hint:     Option<String>,
) -> Option<String> {
    let value = provider.request(InputRequest { kind, error, hint }).await;
    if value.is_none() {
        tracing::info!("[tdhead] No {kind} provided; prompting stopped");
    }
    value.map(|v| v.trim().to_string())
}

/// Ask for `kind` and submit it until the library accepts it.
async fn prompt_loop(
    requests:   Arc<RequestChannel>,
    provider:   Arc<dyn InputProvider>,
    kind:       InputKind,
    hint:       Option<String>,
    mut preset: Option<String>,
) {
    let mut error = None;
    loop {
        let value = match preset.take() {
            Some(value) => value,
            None => match ask(provider.as_ref(), kind, error.take(), hint.clone()).await {
                Some(value) => value,
                None        => return,
            },
        };
        let timeout = requests.default_timeout();
        match requests.submit_command(verification(kind, &value), timeout).await {
            Ok(_) => return,
            Err(Error::Closed) => return,
            Err(e) => {
                tracing::warn!("[tdhead] {kind} rejected: {e}");
                error = Some(e);
            }
        }
    }
}

/// New account: first and last name, then `registerUser`.
async fn register(requests: Arc<RequestChannel>, provider: Arc<dyn InputProvider>) {
    let mut error = None;
    loop {
        let Some(first) = ask(provider.as_ref(), InputKind::FirstName, error.take(), None).await else {
            return;
        };
        let Some(last) = ask(provider.as_ref(), InputKind::LastName, None, None).await else {
            return;
        };
        let command = verification(InputKind::FirstName, &first).param("last_name", last);
        let timeout = requests.default_timeout();
        match requests.submit_command(command, timeout).await {
            Ok(_) => return,
            Err(Error::Closed) => return,
            Err(e) => {
                tracing::warn!("[tdhead] registration rejected: {e}");
                error = Some(e);
            }
        }
    }
}

// ─── Channel provider ─────────────────────────────────────────────────────────

/// An [`InputProvider`] fed by an [`InputSender`] held elsewhere (a web
/// socket handler, a test).
pub struct ChannelInputProvider {
    values:  AsyncMutex<mpsc::UnboundedReceiver<String>>,
    pending: watch::Sender<Option<InputRequest>>,
}

/// Supplies values to a [`ChannelInputProvider`] and watches what it asks for.
#[derive(Clone, Debug)]
pub struct InputSender {
    tx:      mpsc::UnboundedSender<String>,
    pending: watch::Receiver<Option<InputRequest>>,
}

/// A connected provider/sender pair.
pub fn input_channel() -> (ChannelInputProvider, InputSender) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (pending_tx, pending_rx) = watch::channel(None);
    (
        ChannelInputProvider { values: AsyncMutex::new(rx), pending: pending_tx },
        InputSender { tx, pending: pending_rx },
    )
}

/// Clears the published prompt when the request ends, including on abort.
struct PendingGuard<'a>(&'a watch::Sender<Option<InputRequest>>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(None);
    }
}

#[async_trait]
impl InputProvider for ChannelInputProvider {
    async fn request(&self, request: InputRequest) -> Option<String> {
        let mut values = self.values.lock().await;
        self.pending.send_replace(Some(request));
        let _guard = PendingGuard(&self.pending);
        values.recv().await
    }
}

impl InputSender {
    /// Queue a value for the current or next prompt.
    pub fn supply(&self, value: impl Into<String>) -> Result<()> {
        self.tx.send(value.into()).map_err(|_| Error::Closed)
    }

    /// The prompt currently waiting for a value, if any.
    pub fn pending(&self) -> Option<InputRequest> {
        self.pending.borrow().clone()
    }

    /// Wait for the next prompt. `None` once the provider is gone.
    pub async fn next_prompt(&mut self) -> Option<InputRequest> {
        loop {
            self.pending.changed().await.ok()?;
            if let Some(request) = self.pending.borrow_and_update().clone() {
                return Some(request);
            }
        }
    }
}
