//! End-to-end scenarios over a real Unix domain socket: one `ServerLoop` on
//! a background thread, plain `Client::connect` calls from the test thread.
//! Mirrors the teacher's `flux-network` integration tests (spawn one side on
//! a thread, drive the other from the test body) but synchronous rather than
//! poll-loop-driven, since `Client::call` already blocks internally.

use std::{
    path::Path,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use flux_ippc::{
    client::Client,
    error::{ClientError, CriticalError, HandlerError},
    server::ServerLoop,
    service,
};
use serde_json::{Map, Value, json};

struct Root;

#[service]
impl Root {
    #[public]
    fn echo(&self, x: Value) -> Value {
        x
    }

    #[public]
    fn greet(&self, name: String, greeting: Option<String>) -> String {
        format!("{}, {name}", greeting.unwrap_or_else(|| "hi".to_string()))
    }

    #[public]
    fn boom(&self) -> Result<Value, HandlerError> {
        Err(HandlerError::ordinary_with_kind("ValueError", "x"))
    }

    #[public]
    fn die(&self) -> Result<Value, HandlerError> {
        Err(CriticalError::new("stop").into())
    }
}

struct Math;

#[service]
impl Math {
    #[public]
    fn add(&self, a: i64, b: i64) -> i64 {
        a + b
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawns a server on a background thread; returns a receiver that yields
/// once `ServerLoop::run` returns (i.e. the loop has stopped).
fn spawn_server(path: &Path) -> mpsc::Receiver<()> {
    init_tracing();
    let path = path.to_path_buf();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let root: Arc<dyn flux_ippc::dispatch::Service> = Arc::new(Root);
        let math: Arc<dyn flux_ippc::dispatch::Service> = Arc::new(Math);
        let server = ServerLoop::new(&path, Some(root), vec![("math", math)]);
        let _ = server.run();
        let _ = tx.send(());
    });
    rx
}

/// Connects once the server's socket file exists, retrying briefly -- the
/// listener is bound inside the spawned thread's `starting()`, which races
/// the test thread's first connect attempt.
fn connect_with_retry(path: &Path) -> Client {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match Client::connect(path) {
            Ok(client) => return client,
            Err(e) if std::time::Instant::now() < deadline => {
                let _ = e;
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("could not connect to {}: {e}", path.display()),
        }
    }
}

#[test]
fn echo_returns_the_argument() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);
    let client = connect_with_retry(&path);

    let result = client.call("echo", vec![json!("hello")], Map::new()).unwrap();
    assert_eq!(result, json!("hello"));
}

#[test]
fn nested_name_dispatches_to_prefixed_service() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);
    let client = connect_with_retry(&path);

    let result = client.call("math.add", vec![json!(2), json!(3)], Map::new()).unwrap();
    assert_eq!(result, json!(5));
}

#[test]
fn kwargs_override_the_default() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);
    let client = connect_with_retry(&path);

    let mut kwargs = Map::new();
    kwargs.insert("greeting".to_string(), json!("hey"));
    let result = client.call("greet", vec![json!("a")], kwargs).unwrap();
    assert_eq!(result, json!("hey, a"));

    // Omitted kwarg falls back to the parameter's own default.
    let result = client.call("greet", vec![json!("a")], Map::new()).unwrap();
    assert_eq!(result, json!("hi, a"));
}

#[test]
fn missing_method_is_reported_as_remote_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);
    let client = connect_with_retry(&path);

    let err = client.call("nope", vec![], Map::new()).unwrap_err();
    match err {
        ClientError::Remote(e) => {
            assert_eq!(e.kind, "AttributeError");
            assert!(e.message.contains("no method 'nope'"), "got: {}", e.message);
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    // The connection and server both survive an ordinary dispatch miss.
    let result = client.call("echo", vec![json!(1)], Map::new()).unwrap();
    assert_eq!(result, json!(1));
}

#[test]
fn handler_exception_is_reported_without_tearing_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);
    let client = connect_with_retry(&path);

    let err = client.call("boom", vec![], Map::new()).unwrap_err();
    match err {
        ClientError::Remote(e) => {
            assert_eq!(e.kind, "ValueError");
            assert_eq!(e.message, "x");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }

    // Server and connection remain up after an ordinary handler failure.
    let result = client.call("echo", vec![json!("still alive")], Map::new()).unwrap();
    assert_eq!(result, json!("still alive"));
}

#[test]
fn critical_error_tears_down_the_server_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let done = spawn_server(&path);
    let client = connect_with_retry(&path);

    // No response is ever written back for a critical failure -- the
    // connection is closed instead, so the caller sees a request error
    // rather than a remote value.
    let err = client.call("die", vec![], Map::new()).unwrap_err();
    assert!(matches!(err, ClientError::Request(_)), "expected a request error, got {err:?}");

    done.recv_timeout(Duration::from_secs(5))
        .expect("server loop should stop after a critical error");
}

#[test]
fn peer_close_does_not_affect_other_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    let _done = spawn_server(&path);

    // Connect and immediately drop while idle: the server's Peer should
    // observe PeerClosed and quietly remove itself.
    {
        let _idle_client = connect_with_retry(&path);
    }

    // A fresh connection still gets served.
    let client = connect_with_retry(&path);
    let result = client.call("echo", vec![json!(42)], Map::new()).unwrap();
    assert_eq!(result, json!(42));
}
