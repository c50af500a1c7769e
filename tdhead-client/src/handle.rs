//! Ownership of one native client instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tdhead_native::NativeLibrary;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthUpdate;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::names::NameDirectory;
use crate::receiver::UpdateReceiver;
use crate::registry::ClientRegistry;
use crate::request::{Command, PendingRequest, RequestChannel};

// ─── Routes ───────────────────────────────────────────────────────────────────

/// Where the receive loop forwards what is not a reply. Unset routes discard.
#[derive(Clone, Debug, Default)]
pub struct Routes {
    pub(crate) auth:  Option<mpsc::UnboundedSender<AuthUpdate>>,
    pub(crate) bus:   Option<MessageBus>,
    pub(crate) names: Option<Arc<NameDirectory>>,
}

impl Routes {
    pub fn new() -> Self { Self::default() }

    /// Authorization-state updates.
    pub fn auth(mut self, tx: mpsc::UnboundedSender<AuthUpdate>) -> Self {
        self.auth = Some(tx); self
    }

    /// New messages. The bus is closed when the loop ends.
    pub fn messages(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus); self
    }

    /// User and chat name updates.
    pub fn names(mut self, names: Arc<NameDirectory>) -> Self {
        self.names = Some(names); self
    }
}

// ─── ClientHandle ─────────────────────────────────────────────────────────────

struct HandleInner {
    id:            u64,
    requests:      Arc<RequestChannel>,
    registry:      ClientRegistry,
    /// Raised to make the receive loop exit at its next tick.
    stop:          CancellationToken,
    /// Cancelled by the receive loop as it exits.
    exited:        CancellationToken,
    destroyed:     AtomicBool,
    close_timeout: Duration,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A live native client instance. Cheap to clone; all clones share it.
///
/// The instance stays registered (and running) until [`destroy`](Self::destroy)
/// is called or the library reports the `Closed` authorization state.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    /// Create a native instance, start its receive loop and register it.
    pub fn create(
        registry: &ClientRegistry,
        library:  &dyn NativeLibrary,
        config:   &Config,
        routes:   Routes,
    ) -> Result<Self> {
        let native = library.create()?;
        if let Some(level) = config.log_verbosity {
            let command = Command::new("setLogVerbosityLevel").param("new_verbosity_level", level);
            if let Err(e) = native.execute(&command.encode(None)) {
                tracing::warn!("[tdhead] Could not set native log verbosity: {e}");
            }
        }

        let id       = registry.allocate_id();
        let requests = Arc::new(RequestChannel::new(native.clone(), config.request_timeout));
        let stop     = CancellationToken::new();
        let exited   = CancellationToken::new();
        let handle = Self {
            inner: Arc::new(HandleInner {
                id,
                requests:      requests.clone(),
                registry:      registry.clone(),
                stop:          stop.clone(),
                exited:        exited.clone(),
                destroyed:     AtomicBool::new(false),
                close_timeout: config.close_timeout,
            }),
        };
        registry.insert(handle.clone());

        let receiver = UpdateReceiver {
            id,
            native,
            requests: requests.clone(),
            routes,
            registry: registry.clone(),
            stop,
            exited,
            poll: config.poll_interval,
        };
        if let Err(e) = receiver.spawn() {
            registry.remove(id);
            requests.close();
            return Err(Error::Native(format!("could not start receive thread: {e}")));
        }

        tracing::info!("[tdhead] Client {id} created ({})", library.name());
        Ok(handle)
    }

    /// Instance id, unique within its registry.
    pub fn id(&self) -> u64 { self.inner.id }

    /// Fire-and-forget dispatch. Fails with [`Error::Closed`] after shutdown.
    pub fn send(&self, command: &Command) -> Result<()> {
        self.inner.requests.send(command)
    }

    pub fn submit(&self, method: &str, params: Value) -> PendingRequest {
        self.inner.requests.submit(method, params)
    }

    pub fn submit_with_timeout(&self, method: &str, params: Value, timeout: Duration) -> PendingRequest {
        self.inner.requests.submit_with_timeout(method, params, timeout)
    }

    /// Submit a prepared [`Command`] under the default timeout.
    pub fn submit_command(&self, command: Command) -> PendingRequest {
        let timeout = self.inner.requests.default_timeout();
        self.inner.requests.submit_command(command, timeout)
    }

    /// Run a request the library answers synchronously, without the loop.
    pub fn execute(&self, command: &Command) -> Result<Option<Value>> {
        let reply = self.inner.requests.native().execute(&command.encode(None))?;
        match reply {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None      => Ok(None),
        }
    }

    pub fn requests(&self) -> &Arc<RequestChannel> { &self.inner.requests }

    pub fn is_closed(&self) -> bool { self.inner.requests.is_closed() }

    /// `false` once the receive loop has exited.
    pub fn is_running(&self) -> bool { !self.inner.exited.is_cancelled() }

    /// Close the instance and wait for its receive loop to exit.
    ///
    /// Pending requests fail with [`Error::Closed`] immediately. The library
    /// gets `close_timeout` to report the `Closed` state; after that the loop
    /// is stopped at its next tick. Calling this again only waits.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            inner.exited.cancelled().await;
            return;
        }
        let failed = inner.requests.shutdown();
        inner.registry.remove(inner.id);
        tracing::info!("[tdhead] Destroying client {} ({failed} pending request(s) failed)", inner.id);

        if tokio::time::timeout(inner.close_timeout, inner.exited.cancelled()).await.is_err() {
            tracing::debug!("[tdhead] Client {} did not close in time, stopping loop", inner.id);
            inner.stop.cancel();
            inner.exited.cancelled().await;
        }
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
