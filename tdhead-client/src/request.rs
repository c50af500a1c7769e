//! Request/reply correlation.
//!
//! Every submitted [`Command`] is tagged with a fresh `@extra` correlation id
//! and a waiter is parked under that id. The receive loop hands replies back
//! through [`RequestChannel::resolve`]; replies nobody waits for any more
//! (duplicates, late arrivals after a timeout) are dropped quietly.
//!
//! A waiter expires at its deadline whether or not anyone polls it: an
//! expired waiter is never resolved and no longer counts as pending.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tdhead_native::NativeClient;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::{Error, RemoteError, Result};

// ─── Command ─────────────────────────────────────────────────────────────────

/// A tagged request object: `{"@type": method, ...params}`.
///
/// ```rust
/// use tdhead_client::Command;
///
/// let cmd = Command::new("getChat").param("chat_id", 777);
/// assert_eq!(cmd.method(), "getChat");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    method: String,
    params: Map<String, Value>,
}

impl Command {
    /// A command without parameters.
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Map::new() }
    }

    /// A command whose parameters are the fields of a JSON object.
    ///
    /// `null` means no parameters; any other non-object value is ignored.
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        let method = method.into();
        let params = match params {
            Value::Object(map) => map,
            Value::Null        => Map::new(),
            other => {
                tracing::warn!("[tdhead] {method}: ignoring non-object parameters {other}");
                Map::new()
            }
        };
        Self { method, params }
    }

    /// Add or replace one parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into()); self
    }

    pub fn method(&self) -> &str { &self.method }

    pub fn params(&self) -> &Map<String, Value> { &self.params }

    /// Serialize, tagging with `extra` as the correlation id when given.
    pub fn encode(&self, extra: Option<&str>) -> String {
        let mut object = self.params.clone();
        object.insert("@type".into(), Value::String(self.method.clone()));
        if let Some(extra) = extra {
            object.insert("@extra".into(), Value::String(extra.to_string()));
        }
        Value::Object(object).to_string()
    }
}

// ─── RequestChannel ──────────────────────────────────────────────────────────

struct Waiter {
    tx:       oneshot::Sender<Result<Value>>,
    deadline: Instant,
}

impl Waiter {
    fn expired(&self, now: Instant) -> bool { now >= self.deadline }
}

/// Correlates outbound requests with replies delivered by the receive loop.
pub struct RequestChannel {
    native:  Arc<dyn NativeClient>,
    waiters: Mutex<HashMap<String, Waiter>>,
    next_id: AtomicU64,
    closed:  AtomicBool,
    timeout: Duration,
}

impl RequestChannel {
    pub(crate) fn new(native: Arc<dyn NativeClient>, timeout: Duration) -> Self {
        Self {
            native,
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed:  AtomicBool::new(false),
            timeout,
        }
    }

    /// Fire-and-forget: dispatch `command` without a correlation id.
    pub fn send(&self, command: &Command) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.native.send(&command.encode(None))?;
        Ok(())
    }

    /// Submit `method` with `params` under the default timeout.
    pub fn submit(self: &Arc<Self>, method: &str, params: Value) -> PendingRequest {
        self.submit_command(Command::with_params(method, params), self.timeout)
    }

    /// Submit `method` with `params` under a custom timeout.
    pub fn submit_with_timeout(
        self:    &Arc<Self>,
        method:  &str,
        params:  Value,
        timeout: Duration,
    ) -> PendingRequest {
        self.submit_command(Command::with_params(method, params), timeout)
    }

    /// Register a waiter, tag `command` with its id and dispatch it.
    ///
    /// Returns immediately; the reply is awaited through the returned
    /// [`PendingRequest`].
    pub fn submit_command(self: &Arc<Self>, command: Command, timeout: Duration) -> PendingRequest {
        let id = format!("r{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            // Checked under the lock so `close` cannot miss this waiter.
            if self.is_closed() {
                return PendingRequest::failed(id, self.clone(), Error::Closed);
            }
            waiters.insert(id.clone(), Waiter { tx, deadline });
        }

        if let Err(e) = self.native.send(&command.encode(Some(&id))) {
            self.forget(&id);
            return PendingRequest::failed(id, self.clone(), e.into());
        }
        tracing::trace!("[tdhead] → {} ({id})", command.method());
        PendingRequest { id, rx: Some(rx), early: None, channel: self.clone(), deadline }
    }

    /// Hand `payload` to the waiter registered under `id`.
    ///
    /// Returns `false` when no waiter is live. A waiter past its deadline is
    /// removed and its reply discarded.
    pub(crate) fn resolve(&self, id: &str, payload: Value) -> bool {
        let Some(waiter) = self.waiters.lock().remove(id) else {
            tracing::debug!("[tdhead] No waiter for {id}, dropping reply");
            return false;
        };
        if waiter.expired(Instant::now()) {
            tracing::debug!("[tdhead] Reply for {id} arrived after its deadline, dropping it");
            return false;
        }
        if waiter.tx.send(reply_outcome(payload)).is_err() {
            tracing::debug!("[tdhead] Waiter for {id} went away before its reply");
        }
        true
    }

    /// Drop the waiter for `id` without resolving it.
    pub(crate) fn forget(&self, id: &str) -> bool {
        self.waiters.lock().remove(id).is_some()
    }

    /// Refuse new requests and fail every pending one with [`Error::Closed`].
    ///
    /// Returns how many waiters were failed.
    pub(crate) fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_pending()
    }

    /// Like [`close`](Self::close), but first asks the native instance to
    /// close itself (once).
    pub(crate) fn shutdown(&self) -> usize {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.native.send(&Command::new("close").encode(None)) {
                tracing::debug!("[tdhead] close request not delivered: {e}");
            }
        }
        self.fail_pending()
    }

    fn fail_pending(&self) -> usize {
        let drained: Vec<Waiter> = self.waiters.lock().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.tx.send(Err(Error::Closed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a reply. Expired waiters are
    /// pruned first.
    pub fn pending(&self) -> usize {
        let now = Instant::now();
        let mut waiters = self.waiters.lock();
        waiters.retain(|_, waiter| !waiter.expired(now));
        waiters.len()
    }

    pub fn default_timeout(&self) -> Duration { self.timeout }

    pub(crate) fn native(&self) -> &Arc<dyn NativeClient> { &self.native }
}

fn reply_outcome(payload: Value) -> Result<Value> {
    if payload.get("@type").and_then(Value::as_str) != Some("error") {
        return Ok(payload);
    }
    let code = payload.get("code").and_then(Value::as_i64).unwrap_or(0) as i32;
    let message = payload.get("message").and_then(Value::as_str).unwrap_or("").to_string();
    Err(Error::Remote(RemoteError { code, message }))
}

// ─── PendingRequest ──────────────────────────────────────────────────────────

/// The future side of a submitted request. Await it directly.
///
/// Dropping it unregisters the waiter; a reply arriving afterwards is
/// discarded.
pub struct PendingRequest {
    id:       String,
    rx:       Option<oneshot::Receiver<Result<Value>>>,
    early:    Option<Error>,
    channel:  Arc<RequestChannel>,
    deadline: Instant,
}

impl PendingRequest {
    fn failed(id: String, channel: Arc<RequestChannel>, error: Error) -> Self {
        Self { id, rx: None, early: Some(error), channel, deadline: Instant::now() }
    }

    /// The correlation id carried in `@extra`.
    pub fn id(&self) -> &str { &self.id }

    /// Wait for the reply, the timeout, or shutdown.
    ///
    /// Past the deadline this is [`Error::Timeout`], even if a reply was
    /// buffered in the meantime.
    pub async fn wait(mut self) -> Result<Value> {
        if let Some(error) = self.early.take() {
            return Err(error);
        }
        let Some(rx) = self.rx.take() else {
            return Err(Error::Closed);
        };
        let outcome = tokio::time::timeout_at(self.deadline, rx).await;
        if Instant::now() >= self.deadline {
            return Err(self.timed_out());
        }
        match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_))      => Err(Error::Closed),
            Err(_elapsed)   => Err(self.timed_out()),
        }
    }

    fn timed_out(&self) -> Error {
        self.channel.forget(&self.id);
        tracing::debug!("[tdhead] Request {} timed out", self.id);
        Error::Timeout
    }

    /// Wait for the reply and decode it into `T`.
    pub async fn decode<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.wait().await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl IntoFuture for PendingRequest {
    type Output     = Result<Value>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.channel.forget(&self.id);
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tdhead_native::{MemoryLibrary, NativeLibrary};

    fn channel(timeout: Duration) -> (MemoryLibrary, Arc<RequestChannel>) {
        let lib = MemoryLibrary::new();
        let native = lib.create().unwrap();
        (lib, Arc::new(RequestChannel::new(native, timeout)))
    }

    fn sent(lib: &MemoryLibrary) -> Vec<Value> {
        lib.last_client().unwrap().sent().iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    #[test]
    fn command_encodes_type_params_and_extra() {
        let cmd = Command::with_params("getChat", json!({"chat_id": 5})).param("x", true);
        let json: Value = serde_json::from_str(&cmd.encode(Some("r3"))).unwrap();
        assert_eq!(json, json!({"@type": "getChat", "chat_id": 5, "x": true, "@extra": "r3"}));
        let json: Value = serde_json::from_str(&cmd.encode(None)).unwrap();
        assert!(json.get("@extra").is_none());
    }

    #[test]
    fn non_object_params_are_ignored() {
        assert!(Command::with_params("getMe", json!([1, 2])).params().is_empty());
        assert!(Command::with_params("getMe", Value::Null).params().is_empty());
    }

    #[tokio::test]
    async fn ids_are_unique_and_sequential() {
        let (lib, ch) = channel(Duration::from_secs(1));
        let a = ch.submit("getMe", Value::Null);
        let b = ch.submit("getMe", Value::Null);
        assert_eq!((a.id(), b.id()), ("r1", "r2"));
        assert_eq!(ch.pending(), 2);
        let extras: Vec<_> = sent(&lib).iter().map(|v| v["@extra"].clone()).collect();
        assert_eq!(extras, vec![json!("r1"), json!("r2")]);
    }

    #[tokio::test]
    async fn resolve_fulfils_and_error_tag_fails() {
        let (_lib, ch) = channel(Duration::from_secs(1));
        let ok = ch.submit("getMe", Value::Null);
        let bad = ch.submit("getChat", json!({"chat_id": 1}));
        assert!(ch.resolve("r2", json!({"@type": "error", "code": 400, "message": "CHAT_NOT_FOUND"})));
        assert!(ch.resolve("r1", json!({"@type": "user", "id": 42})));

        assert_eq!(ok.await.unwrap()["id"], 42);
        let err = bad.await.unwrap_err();
        assert_eq!(err, Error::Remote(RemoteError { code: 400, message: "CHAT_NOT_FOUND".into() }));
    }

    #[tokio::test]
    async fn unknown_and_duplicate_replies_are_noops() {
        let (_lib, ch) = channel(Duration::from_secs(1));
        assert!(!ch.resolve("r99", json!({"@type": "ok"})));
        let req = ch.submit("getMe", Value::Null);
        assert!(ch.resolve("r1", json!({"@type": "ok"})));
        assert!(!ch.resolve("r1", json!({"@type": "ok"})));
        assert!(req.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_waiter_and_late_reply_is_discarded() {
        let (_lib, ch) = channel(Duration::from_millis(50));
        let req = ch.submit("getMe", Value::Null);
        assert_eq!(req.await.unwrap_err(), Error::Timeout);
        assert_eq!(ch.pending(), 0);
        assert!(!ch.resolve("r1", json!({"@type": "ok"})));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_waiter_is_dropped_without_being_polled() {
        let (_lib, ch) = channel(Duration::from_millis(50));
        let req = ch.submit("getMe", Value::Null);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(ch.pending(), 0);
        assert!(!ch.resolve("r1", json!({"@type": "user", "id": 42})));
        assert_eq!(req.await.unwrap_err(), Error::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_buffered_past_the_deadline_is_a_timeout() {
        let (_lib, ch) = channel(Duration::from_millis(50));
        let req = ch.submit("getMe", Value::Null);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ch.resolve("r1", json!({"@type": "user", "id": 42})));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(req.await.unwrap_err(), Error::Timeout);
    }

    #[tokio::test]
    async fn dropping_pending_request_forgets_waiter() {
        let (_lib, ch) = channel(Duration::from_secs(1));
        drop(ch.submit("getMe", Value::Null));
        assert_eq!(ch.pending(), 0);
    }

    #[tokio::test]
    async fn close_fails_pending_and_refuses_new() {
        let (_lib, ch) = channel(Duration::from_secs(10));
        let a = ch.submit("getMe", Value::Null);
        let b = ch.submit("getMe", Value::Null);
        assert_eq!(ch.close(), 2);
        assert_eq!(a.await.unwrap_err(), Error::Closed);
        assert_eq!(b.await.unwrap_err(), Error::Closed);
        assert_eq!(ch.submit("getMe", Value::Null).await.unwrap_err(), Error::Closed);
        assert_eq!(ch.send(&Command::new("getMe")).unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn shutdown_sends_close_once() {
        let (lib, ch) = channel(Duration::from_secs(1));
        ch.shutdown();
        ch.shutdown();
        let closes = sent(&lib).iter().filter(|v| v["@type"] == "close").count();
        assert_eq!(closes, 1);
    }
}
