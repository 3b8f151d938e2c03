use std::path::{Path, PathBuf};
use std::time::Duration;

use scopewire_property::LateJoin;
use scopewire_transport::Endpoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One of the daemon's sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Rpc,
    Interrupt,
    Property,
    Heartbeat,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Interrupt => "interrupt",
            Self::Property => "property",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Daemon settings, read from a JSON file. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    pub host: String,
    pub rpc_port: u16,
    pub interrupt_port: u16,
    pub property_port: u16,
    pub heartbeat_port: u16,
    /// Serve on Unix sockets in this directory instead of TCP.
    pub socket_dir: Option<PathBuf>,
    pub handoff_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub late_join: LateJoin,
    pub heartbeat_interval_ms: u64,
    pub device_timeout_ms: u64,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rpc_port: 6000,
            interrupt_port: 6001,
            property_port: 6002,
            heartbeat_port: 6004,
            socket_dir: None,
            handoff_ttl_secs: 60,
            sweep_interval_secs: 5,
            late_join: LateJoin::Deltas,
            heartbeat_interval_ms: 1000,
            device_timeout_ms: 2000,
        }
    }
}

impl ScopeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `load(path)` when given a path, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn endpoint(&self, service: Service) -> Endpoint {
        if let Some(dir) = &self.socket_dir {
            return Endpoint::ipc(dir.join(format!("{}.sock", service.name())));
        }
        let port = match service {
            Service::Rpc => self.rpc_port,
            Service::Interrupt => self.interrupt_port,
            Service::Property => self.property_port,
            Service::Heartbeat => self.heartbeat_port,
        };
        Endpoint::tcp(self.host.clone(), port)
    }

    pub fn handoff_ttl(&self) -> Duration {
        Duration::from_secs(self.handoff_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(10))
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}
