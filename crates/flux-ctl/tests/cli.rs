//! Drives the compiled `flux-ctl` binary against a real `flux-ippc` server,
//! the way a human operator would from a shell.

use std::{
    path::Path,
    process::Command,
    sync::Arc,
    thread,
    time::Duration,
};

use flux_ippc::{dispatch::Service, server::ServerLoop, service};
use serde_json::{Value, json};

struct Math;

#[service]
impl Math {
    #[public]
    fn add(&self, a: i64, b: i64) -> i64 {
        a + b
    }
}

fn spawn_server(path: &Path) {
    let path = path.to_path_buf();
    thread::spawn(move || {
        let math: Arc<dyn Service> = Arc::new(Math);
        let server = ServerLoop::new(&path, None, vec![("math", math)]);
        let _ = server.run();
    });
}

fn wait_for_socket(path: &Path) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(std::time::Instant::now() < deadline, "server never bound {}", path.display());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn call_prints_the_json_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    spawn_server(&path);
    wait_for_socket(&path);

    let output = Command::new(env!("CARGO_BIN_EXE_flux-ctl"))
        .args(["--socket", path.to_str().unwrap(), "math.add", "--arg", "2", "--arg", "3"])
        .output()
        .expect("failed to run flux-ctl");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let printed: Value = serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(printed, json!(5));
}

#[test]
fn call_to_unknown_method_fails_with_nonzero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ippc.sock");
    spawn_server(&path);
    wait_for_socket(&path);

    let output = Command::new(env!("CARGO_BIN_EXE_flux-ctl"))
        .args(["--socket", path.to_str().unwrap(), "math.subtract", "--arg", "2", "--arg", "3"])
        .output()
        .expect("failed to run flux-ctl");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no method"));
}
