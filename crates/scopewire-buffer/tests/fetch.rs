//! Local and remote retrieval of buffer results through a running dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use scopewire_buffer::{
    select_fetcher, BufferMeta, BufferRegistry, Compressor, DataFetcher, Dtype, HeapBuffer,
    LocalBufferFetcher, PackOptions, RegistryConfig, RemoteBytesFetcher, ShmRegion, TransferOps,
    TRANSFER_PREFIX,
};
use scopewire_rpc::{Command, Dispatcher, Namespace, Output, Reply, RpcClient, Signature};
use scopewire_socket::{PeerInfo, ReplySocket};
use scopewire_transport::Endpoint;
use serde_json::{json, Map};

fn image(width: usize, height: usize) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| ((i % 4096) as u16).to_le_bytes())
        .collect()
}

fn namespace(registry: &BufferRegistry) -> Namespace {
    let mut builder = Namespace::builder();
    let producer = registry.clone();
    builder
        .add(
            Command::new("camera.acquire_image", move |call, _| {
                let width: usize = call.arg("width")?;
                let height: usize = call.arg("height")?;
                let meta = BufferMeta::new(vec![height, width], Dtype::U16);
                let heap = HeapBuffer::new(&producer, meta, image(width, height))?;
                Ok(Output::Transfer(Box::new(heap)))
            })
            .signature(Signature::new().optional("width", 64).optional("height", 48)),
        )
        .mount(TRANSFER_PREFIX, TransferOps::new(registry.clone()));
    builder.build().unwrap()
}

struct Server {
    endpoint: Endpoint,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    fn start(registry: &BufferRegistry, endpoint: Endpoint) -> Self {
        let socket = ReplySocket::bind(&endpoint).unwrap();
        let endpoint = socket.endpoint().clone();
        let dispatcher = Dispatcher::new(namespace(registry));
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::spawn(move || dispatcher.serve(&socket, &flag).unwrap());
        Self {
            endpoint,
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn registry(tag: &str) -> BufferRegistry {
    BufferRegistry::new(RegistryConfig {
        prefix: format!("sw-fetch-{tag}-{}", std::process::id()),
        ..RegistryConfig::default()
    })
}

fn ipc_endpoint(tag: &str) -> Endpoint {
    let dir = std::env::temp_dir().join(format!("sw-fetch-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    Endpoint::ipc(dir.join("rpc.sock"))
}

fn kwargs(value: serde_json::Value) -> Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[test]
fn local_client_maps_and_buffer_is_torn_down_after_release() {
    let registry = registry("local");
    let server = Server::start(&registry, ipc_endpoint("local"));
    let mut client = RpcClient::connect(&server.endpoint, None).unwrap();
    assert!(client.server().local);

    let fetcher = select_fetcher(&client, false);
    assert_eq!(fetcher.name(), "local");
    let data = fetcher
        .fetch(&mut client, "camera.acquire_image", vec![], kwargs(json!({"width": 32, "height": 8})))
        .unwrap();
    assert!(data.is_mapped());
    assert_eq!(data.meta().shape, vec![8, 32]);
    assert_eq!(data.bytes(), image(32, 8).as_slice());

    // Producer released and the handoff was confirmed.
    let name = data.buffer_name().unwrap().to_string();
    assert!(!registry.contains(&name));
    assert!(!ShmRegion::exists(&name));
    assert_eq!(registry.torn_down(), 1);
    // The client's own mapping stays readable until dropped.
    assert_eq!(&data.bytes()[..4], &[0, 0, 1, 0]);
}

#[test]
fn remote_fetcher_asks_server_to_pack_named_buffers() {
    let registry = registry("pack");
    let server = Server::start(&registry, ipc_endpoint("pack"));
    let mut client = RpcClient::connect(&server.endpoint, None).unwrap();

    let fetcher = RemoteBytesFetcher {
        options: PackOptions {
            compressor: Compressor::Zlib,
            downsample: 2,
            ..PackOptions::default()
        },
    };
    let data = fetcher
        .fetch(&mut client, "camera.acquire_image", vec![json!(4), json!(4)], Map::new())
        .unwrap();
    assert!(!data.is_mapped());
    assert_eq!(data.meta().shape, vec![2, 2]);
    assert_eq!(data.into_vec(), vec![0, 0, 2, 0, 8, 0, 10, 0]);
    assert!(registry.is_empty());
}

#[test]
fn dropped_client_handoff_is_reclaimed() {
    let registry = registry("drop");
    let server = Server::start(&registry, Endpoint::tcp("127.0.0.1", 0));
    let mut client = RpcClient::connect(&server.endpoint, None).unwrap();
    let reply = client
        .call("camera.acquire_image", vec![], Map::new())
        .unwrap();
    let Reply::Value(name) = reply else {
        panic!("loopback client should receive a buffer name");
    };
    let name = name.as_str().unwrap().to_string();
    assert_eq!(registry.counts(&name).unwrap().pending, 1);
    drop(client);

    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.contains(&name) {
        assert!(Instant::now() < deadline, "handoff never reclaimed");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!ShmRegion::exists(&name));
}

#[test]
fn remote_peers_get_identical_bytes_and_no_shared_buffer() {
    let registry = registry("remote");
    let dispatcher = Dispatcher::new(namespace(&registry));
    let remote = |id: &str| {
        Arc::new(PeerInfo {
            peer_id: id.to_string(),
            node: "analysis-box".to_string(),
            local: false,
            transport: "tcp",
        })
    };
    let body = json!({"path": "camera.acquire_image", "kwargs": {"width": 16, "height": 16}}).to_string();

    let first = dispatcher.dispatch(body.as_bytes(), &remote("peer-1"));
    let second = dispatcher.dispatch(body.as_bytes(), &remote("peer-2"));
    let (Reply::Binary(a), Reply::Binary(b)) = (first, second) else {
        panic!("remote peers should receive binary replies");
    };
    assert_eq!(a, b);
    assert!(registry.is_empty());
    assert_eq!(registry.torn_down(), 0);
}

#[test]
fn local_fetcher_accepts_binary_fallback() {
    let registry = registry("fallback");
    let server = Server::start(&registry, ipc_endpoint("fallback"));
    let mut client = RpcClient::connect(&server.endpoint, None).unwrap();
    // Ask for bytes explicitly through the transfer ops.
    let buffer = registry.create(BufferMeta::bytes(3)).unwrap();
    let fetched = LocalBufferFetcher
        .fetch(
            &mut client,
            &format!("{TRANSFER_PREFIX}.pack"),
            vec![json!(buffer.name())],
            Map::new(),
        )
        .unwrap();
    assert!(!fetched.is_mapped());
    assert_eq!(fetched.into_vec(), vec![0, 0, 0]);
}
