use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tdhead_client::{
    ClientHandle, ClientRegistry, Command, Config, Error, IncomingMessage, MessageBus,
    OverflowPolicy, Routes, SessionStore,
};
use tdhead_native::{MemoryLibrary, NativeClient, NativeError, NativeLibrary};

fn config() -> Config {
    Config {
        session:         SessionStore::new(std::env::temp_dir().join("tdhead-handle-tests")),
        poll_interval:   Duration::from_millis(10),
        close_timeout:   Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Replies to `getMe` like libtdjson does, echoing `@extra`.
fn get_me_stub() -> MemoryLibrary {
    MemoryLibrary::with_responder(|raw| {
        let request: Value = serde_json::from_str(raw).unwrap();
        match request["@type"].as_str() {
            Some("getMe") => {
                let mut user = json!({"@type": "user", "id": 42, "first_name": "Me"});
                if let Some(extra) = request.get("@extra") {
                    user["@extra"] = extra.clone();
                }
                vec![user.to_string()]
            }
            _ => Vec::new(),
        }
    })
}

fn closed_update() -> String {
    json!({
        "@type": "updateAuthorizationState",
        "authorization_state": {"@type": "authorizationStateClosed"},
    }).to_string()
}

#[tokio::test]
async fn get_me_reply_is_matched_by_extra() {
    let registry = ClientRegistry::new();
    let lib = get_me_stub();
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();

    let request = handle.submit("getMe", Value::Null);
    assert_eq!(request.id(), "r1");
    let me = request.await.unwrap();
    assert_eq!(me["id"], 42);
    assert!(me.get("@extra").is_none());

    let mem = lib.last_client().unwrap();
    assert!(mem.executed()[0].contains("setLogVerbosityLevel"));
    assert!(mem.sent()[0].contains(r#""@extra":"r1""#));
    handle.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_each_get_their_own_reply() {
    const N: i64 = 32;
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();

    let tasks: Vec<_> = (0..N)
        .map(|n| {
            let handle = handle.clone();
            tokio::spawn(async move { (n, handle.submit("echo", json!({ "n": n })).await) })
        })
        .collect();

    let mem = lib.last_client().unwrap();
    while mem.sent().len() < N as usize {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Answer in reverse submission order.
    for raw in mem.sent().iter().rev() {
        let request: Value = serde_json::from_str(raw).unwrap();
        mem.push(json!({"@type": "echo", "n": request["n"], "@extra": request["@extra"]}).to_string());
    }

    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply.unwrap()["n"], n);
    }
    assert_eq!(handle.requests().pending(), 0);
    assert_eq!(mem.max_concurrent_readers(), 1);
    handle.destroy().await;
}

#[tokio::test]
async fn destroy_fails_every_pending_request() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();
    assert_eq!(registry.ids(), vec![handle.id()]);

    let waiting: Vec<_> = (0..5)
        .map(|_| tokio::spawn(handle.submit("getMe", Value::Null).into_future()))
        .collect();
    assert_eq!(handle.requests().pending(), 5);

    handle.destroy().await;
    for task in waiting {
        let outcome = tokio::time::timeout(Duration::from_millis(10), task).await.unwrap().unwrap();
        assert_eq!(outcome, Err(Error::Closed));
    }

    assert!(registry.is_empty());
    assert!(!handle.is_running());
    assert_eq!(handle.send(&Command::new("getMe")), Err(Error::Closed));
    assert_eq!(handle.submit("getMe", Value::Null).await, Err(Error::Closed));

    let closes = lib.last_client().unwrap().sent().iter().filter(|s| s.contains(r#""close""#)).count();
    assert_eq!(closes, 1);
    handle.destroy().await;
}

#[tokio::test]
async fn malformed_events_do_not_stop_the_loop() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();
    let mem = lib.last_client().unwrap();

    let request = handle.submit("getMe", Value::Null);
    mem.push("definitely not json");
    mem.push(r#"{"@type":"updateNewMessage","message":{"id":1}}"#);
    mem.push(r#"{"no_type":true}"#);
    mem.push(r#"{"@type":"ok","@extra":"r999"}"#);
    mem.push(r#"{"@type":"user","id":42,"@extra":"r1"}"#);

    assert_eq!(request.await.unwrap()["id"], 42);
    assert!(handle.is_running());
    handle.destroy().await;
}

#[tokio::test]
async fn closed_state_ends_the_loop() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let bus = MessageBus::new(4, OverflowPolicy::DropOldest, 0);
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new().messages(bus.clone())).unwrap();
    let mut sub = bus.subscribe();

    let request = handle.submit("getMe", Value::Null);
    lib.last_client().unwrap().push(closed_update());

    assert_eq!(request.await, Err(Error::Closed));
    while handle.is_running() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(registry.get(handle.id()).is_none());
    assert!(bus.is_closed());
    assert_eq!(sub.recv().await, None::<IncomingMessage>);
}

#[tokio::test]
async fn destroy_returns_early_when_library_reports_closed() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::with_responder(|raw| {
        if raw.contains(r#""@type":"close""#) { vec![closed_update()] } else { Vec::new() }
    });
    let mut config = config();
    config.close_timeout = Duration::from_secs(30);
    let handle = ClientHandle::create(&registry, &lib, &config, Routes::new()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.destroy()).await.unwrap();
    assert!(!handle.is_running());
}

#[tokio::test]
async fn registry_tracks_several_clients() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let a = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();
    let b = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get(b.id()).unwrap().id(), b.id());

    registry.shutdown_all().await;
    assert!(registry.is_empty());
    assert!(a.is_closed() && b.is_closed());
    for mem in lib.clients() {
        assert_eq!(mem.max_concurrent_readers(), 1);
    }
}

#[tokio::test]
async fn execute_runs_synchronously() {
    let registry = ClientRegistry::new();
    let lib = MemoryLibrary::new();
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new()).unwrap();
    let reply = handle.execute(&Command::new("getOption").param("name", "version")).unwrap();
    assert_eq!(reply, Some(json!({"@type": "ok"})));
    handle.destroy().await;
}

/// Wraps [`MemoryLibrary`]; receiving the event `"boom"` panics the reader.
struct FaultyLibrary(MemoryLibrary);

struct FaultyClient(Arc<dyn NativeClient>);

impl NativeLibrary for FaultyLibrary {
    fn create(&self) -> Result<Arc<dyn NativeClient>, NativeError> {
        Ok(Arc::new(FaultyClient(self.0.create()?)))
    }

    fn name(&self) -> &str { "faulty" }
}

impl NativeClient for FaultyClient {
    fn send(&self, request: &str) -> Result<(), NativeError> { self.0.send(request) }

    fn receive(&self, timeout: Duration) -> Option<String> {
        let event = self.0.receive(timeout);
        if event.as_deref() == Some("boom") {
            panic!("native receive failed");
        }
        event
    }

    fn execute(&self, request: &str) -> Result<Option<String>, NativeError> { self.0.execute(request) }
}

#[tokio::test]
async fn panicking_loop_still_fails_requests_and_closes_the_bus() {
    let registry = ClientRegistry::new();
    let lib = FaultyLibrary(MemoryLibrary::new());
    let bus = MessageBus::new(4, OverflowPolicy::DropOldest, 0);
    let handle = ClientHandle::create(&registry, &lib, &config(), Routes::new().messages(bus.clone())).unwrap();
    let mut sub = bus.subscribe();

    let request = handle.submit("getMe", Value::Null);
    lib.0.last_client().unwrap().push("boom");

    let outcome = tokio::time::timeout(Duration::from_secs(1), request.into_future()).await.unwrap();
    assert_eq!(outcome, Err(Error::Closed));
    tokio::time::timeout(Duration::from_secs(1), async {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await.unwrap();

    assert!(registry.is_empty());
    assert!(bus.is_closed());
    assert_eq!(handle.send(&Command::new("getMe")), Err(Error::Closed));
    assert_eq!(sub.recv().await, None);
}
