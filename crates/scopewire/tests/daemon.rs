//! A full daemon started in-process, exercised through real client sockets.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use scopewire::buffer::{select_fetcher, DataFetcher, Dtype, LocalBufferFetcher, RemoteBytesFetcher};
use scopewire::property::PropertySubscriber;
use scopewire::rpc::{ErrorKind, Proxy, RpcClient, RpcError};
use scopewire::{Daemon, DaemonOptions, ScopeConfig};
use serde_json::{json, Map};

const WAIT: Duration = Duration::from_secs(5);

fn socket_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos();
    std::env::temp_dir().join(format!("sw-{tag}-{}-{nanos}", std::process::id()))
}

fn demo_daemon(tag: &str) -> Daemon {
    let config = ScopeConfig {
        socket_dir: Some(socket_dir(tag)),
        heartbeat_interval_ms: 100,
        ..ScopeConfig::default()
    };
    Daemon::start(
        &config,
        DaemonOptions {
            demo: true,
            echo_delay: Some(Duration::from_millis(20)),
        },
    )
    .unwrap()
}

fn client(daemon: &Daemon) -> RpcClient {
    let endpoints = daemon.endpoints();
    RpcClient::connect(&endpoints.rpc, Some(&endpoints.interrupt)).unwrap()
}

fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn builtins_and_proxy_tree() {
    let daemon = demo_daemon("proxy");
    let mut client = client(&daemon);
    assert_eq!(client.call_value("_ping", vec![], Map::new()).unwrap(), json!("pong"));

    let mut proxy = Proxy::new(client).unwrap();
    let camera = proxy.namespace("camera");
    assert!(camera.properties().iter().any(|p| p.name == "exposure" && p.writable));
    assert!(proxy.stub("_transfer.release_pending").is_some());
    assert!(proxy.stub("echo.set_async").is_some());

    proxy.set_property("camera.exposure", json!(1.0)).unwrap();
    assert_eq!(proxy.get_property("camera.exposure").unwrap(), json!(1.0));
    assert_eq!(daemon.properties().get("camera.exposure"), Some(json!(1.0)));

    let err = proxy.call("camera.acquire_image", vec![json!(1), json!(2), json!(3)], Map::new());
    assert!(matches!(err, Err(RpcError::Arguments { .. })));
}

#[test]
fn unknown_path_is_not_found() {
    let daemon = demo_daemon("missing");
    let mut client = client(&daemon);
    let err = client.call_value("stage.move", vec![], Map::new()).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}

#[test]
fn local_image_arrives_through_shared_memory() {
    let daemon = demo_daemon("local");
    let mut client = client(&daemon);
    assert!(client.server().local);

    let fetcher = select_fetcher(&client, false);
    assert_eq!(fetcher.name(), LocalBufferFetcher.name());
    let mut kwargs = Map::new();
    kwargs.insert("width".into(), json!(32));
    kwargs.insert("height".into(), json!(16));
    let image = fetcher
        .fetch(&mut client, "camera.acquire_image", vec![], kwargs)
        .unwrap();
    assert!(image.is_mapped());
    assert_eq!(image.meta().shape, vec![16, 32]);
    assert_eq!(image.meta().dtype, Dtype::U16);
    assert_eq!(image.bytes().len(), 32 * 16 * 2);

    // The daemon dropped its own hold and the client confirmed; only the
    // mapping remains, and the name is already unlinked.
    eventually(|| daemon.registry().is_empty());
    drop(image);
}

#[test]
fn forced_remote_fetch_packs_bytes() {
    let daemon = demo_daemon("remote");
    let mut client = client(&daemon);
    let fetcher = select_fetcher(&client, true);
    assert_eq!(fetcher.name(), RemoteBytesFetcher::default().name());
    let image = fetcher
        .fetch(&mut client, "camera.acquire_image", vec![json!(8), json!(4)], Map::new())
        .unwrap();
    assert!(!image.is_mapped());
    assert_eq!(image.meta().shape, vec![4, 8]);
    assert_eq!(image.into_vec().len(), 64);
    eventually(|| daemon.registry().is_empty());
}

#[test]
fn echo_device_modes_are_published() {
    let daemon = demo_daemon("echo");
    let subscriber =
        PropertySubscriber::connect_filtered(&daemon.endpoints().property, &["echo"]).unwrap();
    eventually(|| daemon.properties().subscription_count() >= 1);

    let mut client = client(&daemon);
    assert_eq!(
        client.call_value("echo.send", vec![json!("hi")], Map::new()).unwrap(),
        json!("hi")
    );

    client.call_value("echo.set_async", vec![json!(true)], Map::new()).unwrap();
    assert_eq!(subscriber.wait_for("echo.async", WAIT), Some(json!(true)));

    for i in 0..5 {
        let reply = client
            .call_value("echo.send", vec![json!(format!("line {i}"))], Map::new())
            .unwrap();
        assert_eq!(reply, json!(null));
    }
    client.call_value("echo.wait", vec![], Map::new()).unwrap();
    assert_eq!(
        client.call_value("echo.has_pending", vec![], Map::new()).unwrap(),
        json!(false)
    );
}

#[test]
fn interrupt_aborts_a_sleeping_call() {
    let daemon = demo_daemon("interrupt");
    let mut client = client(&daemon);
    let handle = client.interrupt_handle().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let finished = Arc::clone(&done);
    // Repeated until the call ends; interrupts addressed to a finished
    // call are ignored by the daemon.
    let interrupter = thread::spawn(move || {
        while !finished.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            let _ = handle.interrupt();
        }
    });

    let started = Instant::now();
    let err = client
        .call_value("_sleep", vec![json!(30)], Map::new())
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(10));
    done.store(true, Ordering::SeqCst);
    interrupter.join().unwrap();

    assert_eq!(client.call_value("_ping", vec![], Map::new()).unwrap(), json!("pong"));
}

#[test]
fn tcp_daemon_on_free_ports() {
    let config = ScopeConfig {
        rpc_port: 0,
        interrupt_port: 0,
        property_port: 0,
        heartbeat_port: 0,
        ..ScopeConfig::default()
    };
    let daemon = Daemon::start(&config, DaemonOptions::default()).unwrap();
    let endpoints = daemon.endpoints().clone();
    assert!(endpoints.rpc.to_string().starts_with("tcp://127.0.0.1:"));
    let mut client = RpcClient::connect(&endpoints.rpc, None).unwrap();
    assert_eq!(client.call_value("_ping", vec![], Map::new()).unwrap(), json!("pong"));
    let err = client
        .call_value("camera.acquire_image", vec![], Map::new())
        .unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
}
