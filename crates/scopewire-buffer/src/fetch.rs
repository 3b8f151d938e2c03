//! Client-side retrieval of buffer-valued results.
//!
//! A command that returns a buffer answers local clients with a shared
//! memory name and remote clients with packed bytes. [`select_fetcher`]
//! picks the matching strategy once per connection so callers only ever
//! see [`ArrayData`].

use scopewire_rpc::{Reply, RpcClient, RpcError};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{BufferError, Result};
use crate::meta::BufferMeta;
use crate::pack::{unpack, Compressor, PackOptions};
use crate::region::MappedBuffer;
use crate::transfer::TRANSFER_PREFIX;

enum Storage {
    Mapped(MappedBuffer),
    Heap(Vec<u8>),
}

/// A fetched array, either mapped from shared memory or copied.
pub struct ArrayData {
    meta: BufferMeta,
    storage: Storage,
}

impl ArrayData {
    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Mapped(mapping) => mapping.data(),
            Storage::Heap(data) => data,
        }
    }

    /// Zero-copy view of shared memory.
    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped(_))
    }

    /// Shared memory name, when mapped.
    pub fn buffer_name(&self) -> Option<&str> {
        match &self.storage {
            Storage::Mapped(mapping) => Some(mapping.name()),
            Storage::Heap(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self.storage {
            Storage::Mapped(mapping) => mapping.data().to_vec(),
            Storage::Heap(data) => data,
        }
    }

    fn heap((meta, data): (BufferMeta, Vec<u8>)) -> Self {
        Self {
            meta,
            storage: Storage::Heap(data),
        }
    }
}

impl std::fmt::Debug for ArrayData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayData")
            .field("meta", &self.meta)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// How a client turns a buffer-valued reply into data.
pub trait DataFetcher: Send {
    fn name(&self) -> &'static str;

    /// Call `path` and return its array result.
    fn fetch(
        &self,
        client: &mut RpcClient,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<ArrayData>;
}

fn call(client: &mut RpcClient, path: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Reply> {
    match client.call(path, args, kwargs)? {
        Reply::Error(fault) => Err(RpcError::Remote(fault).into()),
        reply => Ok(reply),
    }
}

fn buffer_name(value: Value) -> Result<String> {
    match value {
        Value::String(name) => Ok(name),
        other => Err(BufferError::InvalidHeader(format!(
            "expected a buffer name, got {other}"
        ))),
    }
}

/// Maps the named region and confirms the handoff.
#[derive(Debug, Default)]
pub struct LocalBufferFetcher;

impl DataFetcher for LocalBufferFetcher {
    fn name(&self) -> &'static str {
        "local"
    }

    fn fetch(
        &self,
        client: &mut RpcClient,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<ArrayData> {
        match call(client, path, args, kwargs)? {
            Reply::Value(value) => {
                let name = buffer_name(value)?;
                let opened = MappedBuffer::open(&name);
                // Confirm even if mapping failed so the server can reclaim.
                let confirmed = client.call_value(
                    &format!("{TRANSFER_PREFIX}.release_pending"),
                    vec![json!(name)],
                    Map::new(),
                );
                let mapping = opened?;
                confirmed?;
                debug!(%name, bytes = mapping.data().len(), "buffer mapped");
                Ok(ArrayData {
                    meta: mapping.meta().clone(),
                    storage: Storage::Mapped(mapping),
                })
            }
            Reply::Binary(bytes) => Ok(ArrayData::heap(unpack(&bytes)?)),
            Reply::Error(fault) => Err(RpcError::Remote(fault).into()),
        }
    }
}

/// Receives packed bytes; asks the server to pack when handed a name.
#[derive(Debug, Default)]
pub struct RemoteBytesFetcher {
    pub options: PackOptions,
}

impl DataFetcher for RemoteBytesFetcher {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn fetch(
        &self,
        client: &mut RpcClient,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<ArrayData> {
        match call(client, path, args, kwargs)? {
            Reply::Binary(bytes) => Ok(ArrayData::heap(unpack(&bytes)?)),
            Reply::Value(value) => {
                let name = buffer_name(value)?;
                let compressor = match self.options.compressor {
                    Compressor::None => "none",
                    Compressor::Zlib => "zlib",
                };
                let mut pack_kwargs = Map::new();
                pack_kwargs.insert("compressor".to_string(), json!(compressor));
                pack_kwargs.insert("level".to_string(), json!(self.options.level));
                pack_kwargs.insert("downsample".to_string(), json!(self.options.downsample));
                let packed = client.call_bytes(
                    &format!("{TRANSFER_PREFIX}.pack"),
                    vec![json!(name)],
                    pack_kwargs,
                )?;
                Ok(ArrayData::heap(unpack(&packed)?))
            }
            Reply::Error(fault) => Err(RpcError::Remote(fault).into()),
        }
    }
}

/// Pick a fetcher for `client`'s connection.
///
/// Shared memory is used only when the handshake found both ends on one
/// host and `force_remote` is not set.
pub fn select_fetcher(client: &RpcClient, force_remote: bool) -> Box<dyn DataFetcher> {
    if client.server().local && !force_remote {
        Box::new(LocalBufferFetcher)
    } else {
        Box::new(RemoteBytesFetcher::default())
    }
}
