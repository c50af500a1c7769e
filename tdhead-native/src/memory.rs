//! In-memory stand-in for `libtdjson`.
//!
//! Every request sent to a [`MemoryClient`] is recorded. An optional
//! responder turns each request into zero or more events, which land in the
//! client's inbox in order; tests can also [`push`](MemoryClient::push)
//! events directly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{NativeClient, NativeError, NativeLibrary};

/// Produces the events a request should trigger.
pub type Responder = dyn Fn(&str) -> Vec<String> + Send + Sync;

// ─── MemoryLibrary ────────────────────────────────────────────────────────────

/// Factory for [`MemoryClient`]s sharing one responder.
#[derive(Clone, Default)]
pub struct MemoryLibrary {
    responder: Option<Arc<Responder>>,
    clients:   Arc<Mutex<Vec<Arc<MemoryClient>>>>,
}

impl MemoryLibrary {
    /// A library whose clients only record requests.
    pub fn new() -> Self { Self::default() }

    /// A library whose clients answer each request through `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        Self { responder: Some(Arc::new(responder)), clients: Arc::default() }
    }

    /// Every client created so far, oldest first.
    pub fn clients(&self) -> Vec<Arc<MemoryClient>> {
        self.clients.lock().clone()
    }

    /// The most recently created client.
    pub fn last_client(&self) -> Option<Arc<MemoryClient>> {
        self.clients.lock().last().cloned()
    }
}

impl NativeLibrary for MemoryLibrary {
    fn create(&self) -> Result<Arc<dyn NativeClient>, NativeError> {
        let client = Arc::new(MemoryClient::new(self.responder.clone()));
        self.clients.lock().push(client.clone());
        Ok(client)
    }

    fn name(&self) -> &str { "memory" }
}

// ─── MemoryClient ─────────────────────────────────────────────────────────────

/// One in-memory instance.
pub struct MemoryClient {
    responder:      Option<Arc<Responder>>,
    inbox:          Mutex<VecDeque<String>>,
    ready:          Condvar,
    sent:           Mutex<Vec<String>>,
    executed:       Mutex<Vec<String>>,
    closed:         AtomicBool,
    active_readers: AtomicUsize,
    max_readers:    AtomicUsize,
}

impl MemoryClient {
    fn new(responder: Option<Arc<Responder>>) -> Self {
        Self {
            responder,
            inbox:          Mutex::new(VecDeque::new()),
            ready:          Condvar::new(),
            sent:           Mutex::new(Vec::new()),
            executed:       Mutex::new(Vec::new()),
            closed:         AtomicBool::new(false),
            active_readers: AtomicUsize::new(0),
            max_readers:    AtomicUsize::new(0),
        }
    }

    /// Queue a raw event for the next `receive`.
    pub fn push(&self, event: impl Into<String>) {
        self.inbox.lock().push_back(event.into());
        self.ready.notify_all();
    }

    /// Requests sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Requests run through `execute` so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Highest number of threads ever inside `receive` at once.
    pub fn max_concurrent_readers(&self) -> usize {
        self.max_readers.load(Ordering::SeqCst)
    }

    /// Stop accepting requests. Buffered and pushed events are still
    /// delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }

    /// `true` once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl NativeClient for MemoryClient {
    fn send(&self, request: &str) -> Result<(), NativeError> {
        if self.is_closed() {
            return Err(NativeError::Closed);
        }
        if request.contains('\0') {
            return Err(NativeError::InvalidString);
        }
        self.sent.lock().push(request.to_string());
        if let Some(responder) = &self.responder {
            let events = responder(request);
            if !events.is_empty() {
                self.inbox.lock().extend(events);
                self.ready.notify_all();
            }
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Option<String> {
        let now = self.active_readers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_readers.fetch_max(now, Ordering::SeqCst);

        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock();
        let event = loop {
            if let Some(event) = inbox.pop_front() {
                break Some(event);
            }
            if self.ready.wait_until(&mut inbox, deadline).timed_out() {
                break inbox.pop_front();
            }
        };
        drop(inbox);

        self.active_readers.fetch_sub(1, Ordering::SeqCst);
        event
    }

    fn execute(&self, request: &str) -> Result<Option<String>, NativeError> {
        if request.contains('\0') {
            return Err(NativeError::InvalidString);
        }
        self.executed.lock().push(request.to_string());
        Ok(Some(r#"{"@type":"ok"}"#.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_events_arrive_in_order() {
        let lib = MemoryLibrary::with_responder(|req| vec![format!("a:{req}"), format!("b:{req}")]);
        let client = lib.create().unwrap();
        client.send("x").unwrap();
        assert_eq!(client.receive(Duration::from_millis(10)).as_deref(), Some("a:x"));
        assert_eq!(client.receive(Duration::from_millis(10)).as_deref(), Some("b:x"));
        assert_eq!(client.receive(Duration::from_millis(10)), None);
        assert_eq!(lib.last_client().unwrap().sent(), vec!["x".to_string()]);
    }

    #[test]
    fn receive_times_out_empty() {
        let lib = MemoryLibrary::new();
        let client = lib.create().unwrap();
        let start = Instant::now();
        assert_eq!(client.receive(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn closed_client_rejects_send() {
        let lib = MemoryLibrary::new();
        let _ = lib.create().unwrap();
        let mem = lib.last_client().unwrap();
        mem.close();
        assert!(matches!(mem.send("x"), Err(NativeError::Closed)));
        mem.push("late");
        assert_eq!(mem.receive(Duration::from_millis(10)).as_deref(), Some("late"));
    }

    #[test]
    fn push_wakes_a_waiting_reader() {
        let lib = MemoryLibrary::new();
        let _ = lib.create().unwrap();
        let mem = lib.last_client().unwrap();
        let reader = {
            let mem = mem.clone();
            std::thread::spawn(move || mem.receive(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        mem.push("event");
        assert_eq!(reader.join().unwrap().as_deref(), Some("event"));
        assert_eq!(mem.max_concurrent_readers(), 1);
    }
}
