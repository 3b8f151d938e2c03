//! Shared-memory buffers for large command results.
//!
//! Producers allocate a [`SharedBuffer`] from the [`BufferRegistry`]. When a
//! command returns one to a client on the same host, the registry records a
//! pending handoff, the client maps the region by name and confirms with
//! `_transfer.release_pending`. The region is unlinked once no handle and
//! no unconfirmed handoff remains. Clients on other hosts get packed bytes
//! instead; see [`pack`].

pub mod error;
pub mod fetch;
pub mod handle;
pub mod meta;
pub mod pack;
pub mod region;
pub mod registry;
pub mod transfer;

pub use error::{BufferError, Result};
pub use fetch::{select_fetcher, ArrayData, DataFetcher, LocalBufferFetcher, RemoteBytesFetcher};
pub use handle::{HeapBuffer, SharedBuffer, SharedTransfer};
pub use meta::{BufferMeta, Dtype, Order};
pub use pack::{downsample, pack, unpack, Compressor, PackOptions};
pub use region::{MappedBuffer, ShmRegion};
pub use registry::{BufferCounts, BufferRegistry, RegistryConfig, Sweeper};
pub use transfer::{TransferOps, TRANSFER_PREFIX};
