use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use scopewire_buffer::{BufferRegistry, RegistryConfig, Sweeper, TransferOps, TRANSFER_PREFIX};
use scopewire_property::{HeartbeatPublisher, PropertyError, PropertyPublisher, PublisherConfig};
use scopewire_rpc::{Dispatcher, Interrupter, Namespace, NamespaceBuilder, RpcError};
use scopewire_socket::{PullSocket, ReplySocket, SocketError};
use scopewire_transport::Endpoint;
use tracing::{info, warn};

use crate::builtins::Builtins;
use crate::config::{ScopeConfig, Service};
use crate::demo::{Camera, EchoBench};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("property feed error: {0}")]
    Property(#[from] PropertyError),

    #[error("namespace error: {0}")]
    Rpc(#[from] RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    /// Mount the simulated camera and echo device.
    pub demo: bool,
    /// Longest simulated echo reply delay.
    pub echo_delay: Option<Duration>,
}

/// Bound endpoints of a running daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub rpc: Endpoint,
    pub interrupt: Endpoint,
    pub property: Endpoint,
    pub heartbeat: Endpoint,
}

/// Every daemon service, started and wired together.
///
/// The RPC dispatcher runs on its own thread; the interrupt channel,
/// property feed, heartbeat and buffer sweeper each have theirs.
pub struct Daemon {
    endpoints: Endpoints,
    registry: BufferRegistry,
    properties: Arc<PropertyPublisher>,
    heartbeat: HeartbeatPublisher,
    sweeper: Sweeper,
    echo: Option<EchoBench>,
    stop: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(config: &ScopeConfig, options: DaemonOptions) -> Result<Self, DaemonError> {
        if let Some(dir) = &config.socket_dir {
            std::fs::create_dir_all(dir)?;
        }

        let registry = BufferRegistry::new(RegistryConfig {
            handoff_ttl: config.handoff_ttl(),
            ..RegistryConfig::default()
        });
        let sweeper = registry.spawn_sweeper(config.sweep_interval())?;

        let properties = Arc::new(PropertyPublisher::bind_with_config(
            &config.endpoint(Service::Property),
            PublisherConfig {
                late_join: config.late_join,
                ..PublisherConfig::default()
            },
        )?);
        let heartbeat = HeartbeatPublisher::spawn(
            &config.endpoint(Service::Heartbeat),
            config.heartbeat_interval(),
        )?;

        let mut builder = Namespace::builder();
        builder
            .mount("", Builtins::new(Some(Arc::clone(&properties))))
            .mount(TRANSFER_PREFIX, TransferOps::new(registry.clone()));

        let echo = if options.demo {
            Some(mount_demo(&mut builder, config, &options, &registry, &properties)?)
        } else {
            None
        };
        let namespace = builder.build()?;

        // Interrupts must be deliverable by the time clients can call.
        let pull = PullSocket::bind(&config.endpoint(Service::Interrupt))?;
        let reply = ReplySocket::bind(&config.endpoint(Service::Rpc))?;
        let endpoints = Endpoints {
            rpc: reply.endpoint().clone(),
            interrupt: pull.endpoint().clone(),
            property: properties.endpoint().clone(),
            heartbeat: heartbeat.endpoint().clone(),
        };
        let dispatcher = Dispatcher::new(namespace).with_interrupter(Interrupter::spawn(pull)?);

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("sw-dispatcher".to_string())
            .spawn(move || {
                if let Err(err) = dispatcher.serve(&reply, &flag) {
                    warn!(error = %err, "dispatcher stopped with error");
                }
            })?;

        info!(
            rpc = %endpoints.rpc,
            interrupt = %endpoints.interrupt,
            property = %endpoints.property,
            heartbeat = %endpoints.heartbeat,
            demo = options.demo,
            "daemon ready"
        );
        Ok(Self {
            endpoints,
            registry,
            properties,
            heartbeat,
            sweeper,
            echo,
            stop,
            dispatcher: Some(thread),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn properties(&self) -> &Arc<PropertyPublisher> {
        &self.properties
    }

    /// Block until `running` is cleared, then shut down.
    pub fn run_until(mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.dispatcher.take() {
            let _ = thread.join();
        }
        if let Some(echo) = self.echo.take() {
            echo.manager.stop();
        }
        self.heartbeat.stop();
        self.sweeper.stop();
        let unlinked = self.registry.clear();
        if unlinked > 0 {
            info!(unlinked, "buffers released at shutdown");
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn mount_demo(
    builder: &mut NamespaceBuilder,
    config: &ScopeConfig,
    options: &DaemonOptions,
    registry: &BufferRegistry,
    properties: &PropertyPublisher,
) -> Result<EchoBench, DaemonError> {
    let echo = EchoBench::start(
        config.device_timeout(),
        options.echo_delay.unwrap_or(Duration::from_millis(50)),
        Some(properties),
    )?;
    builder
        .mount("camera", Camera::new(registry.clone(), Some(properties)))
        .mount("echo", Arc::clone(&echo.device));
    Ok(echo)
}
