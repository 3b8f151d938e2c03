#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use scopewire::transport::Endpoint;
use scopewire::rpc::RpcClient;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/swcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn wait_for_daemon(dir: &Path, timeout: Duration) {
    let rpc = Endpoint::ipc(dir.join("rpc.sock"));
    let start = Instant::now();
    loop {
        if RpcClient::connect(&rpc, None).is_ok() {
            return;
        }
        if start.elapsed() >= timeout {
            panic!("daemon did not come up");
        }
        thread::sleep(Duration::from_millis(25));
    }
}

struct DaemonProcess {
    child: Child,
    dir: PathBuf,
}

impl DaemonProcess {
    fn start(tag: &str) -> Self {
        let dir = unique_temp_dir(tag);
        let child = Command::new(env!("CARGO_BIN_EXE_scoped"))
            .args(["--log-level", "error", "serve", "--demo", "--socket-dir"])
            .arg(&dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve should start");
        wait_for_daemon(&dir, Duration::from_secs(5));
        Self { child, dir }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_scoped"))
            .args(["--log-level", "error", "--format", "json"])
            .args(args)
            .arg("--socket-dir")
            .arg(&self.dir)
            .output()
            .expect("client command should run")
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn call_and_describe_against_demo_daemon() {
    let daemon = DaemonProcess::start("call");

    let output = daemon.run(&["call", "_ping"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "\"pong\"");

    let output = daemon.run(&["describe", "--prefix", "camera"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("camera.acquire_image"));
    assert!(!stdout.contains("_ping"));

    let output = daemon.run(&[
        "call",
        "camera.acquire_image",
        "--kwargs",
        "{\"width\": 32, \"height\": 16}",
        "--fetch",
    ]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"shape\":[16,32]"), "{stdout}");
    assert!(stdout.contains("\"dtype\":\"uint16\""), "{stdout}");
}

#[test]
fn unknown_command_exits_with_failure() {
    let daemon = DaemonProcess::start("missing");
    let output = daemon.run(&["call", "stage.move", "--kwargs", "{\"x\": 10}"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("stage.move"));
}

#[test]
fn interrupt_reaches_running_daemon() {
    let daemon = DaemonProcess::start("interrupt");
    let output = daemon.run(&["interrupt"]);
    assert!(output.status.success());
}

#[test]
fn no_daemon_is_a_transport_error() {
    let dir = unique_temp_dir("absent");
    let output = Command::new(env!("CARGO_BIN_EXE_scoped"))
        .args(["--log-level", "error", "call", "_ping", "--socket-dir"])
        .arg(&dir)
        .output()
        .expect("call should run");
    assert_eq!(output.status.code(), Some(3));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn malformed_kwargs_are_rejected_before_connecting() {
    let output = Command::new(env!("CARGO_BIN_EXE_scoped"))
        .args(["call", "_ping", "--kwargs", "[1]", "--socket-dir", "/nonexistent"])
        .output()
        .expect("call should run");
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn version_prints_name() {
    let output = Command::new(env!("CARGO_BIN_EXE_scoped"))
        .arg("version")
        .output()
        .expect("version should run");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("scoped "));
}
