use bytes::Bytes;
use scopewire_rpc::{Fault, Transferable};
use scopewire_socket::PeerInfo;
use tracing::warn;

use crate::error::{BufferError, Result};
use crate::meta::BufferMeta;
use crate::pack::{pack, PackOptions};
use crate::region::MappedBuffer;
use crate::registry::{BufferCounts, BufferRegistry};

/// Producer handle to a registered buffer, holding one reference.
///
/// Call [`release`](Self::release) when done; dropping the handle releases
/// too but cannot report errors.
pub struct SharedBuffer {
    registry: BufferRegistry,
    mapping: MappedBuffer,
    released: bool,
}

impl SharedBuffer {
    pub(crate) fn new(registry: BufferRegistry, mapping: MappedBuffer) -> Self {
        Self {
            registry,
            mapping,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        self.mapping.name()
    }

    pub fn meta(&self) -> &BufferMeta {
        self.mapping.meta()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mapping.data()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mapping.data_mut()
    }

    /// Copy `data` into the buffer at byte `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let target = self.mapping.data_mut();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= target.len())
            .ok_or(BufferError::Size {
                expected: target.len(),
                actual: offset.saturating_add(data.len()),
            })?;
        target[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Another handle to the same buffer, holding its own reference.
    pub fn share(&self) -> Result<SharedBuffer> {
        let mapping = MappedBuffer::open(self.name())?;
        self.registry.retain(self.name())?;
        Ok(Self::new(self.registry.clone(), mapping))
    }

    /// Wrap a new reference for returning from a command.
    pub fn transferable(&self) -> Result<SharedTransfer> {
        Ok(SharedTransfer {
            buffer: self.share()?,
        })
    }

    /// Drop this handle's reference, tearing the buffer down if it was the last.
    pub fn release(mut self) -> Result<BufferCounts> {
        self.released = true;
        self.registry.release(self.name())
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.registry.release(self.name()) {
                warn!(name = self.name(), error = %err, "release on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("name", &self.name())
            .field("meta", self.meta())
            .finish()
    }
}

/// An already-shared buffer travelling out through a reply.
///
/// Local peers get a pending handoff registered before this reference is
/// released, so the buffer never sees both counters at zero in between.
pub struct SharedTransfer {
    buffer: SharedBuffer,
}

impl Transferable for SharedTransfer {
    fn hand_off(self: Box<Self>, peer: &PeerInfo) -> std::result::Result<String, Fault> {
        Ok(hand_over(self.buffer, &peer.peer_id)?)
    }

    fn pack(self: Box<Self>) -> std::result::Result<Bytes, Fault> {
        let packed = pack(self.buffer.meta(), self.buffer.as_slice(), &PackOptions::default())?;
        self.buffer.release()?;
        Ok(packed)
    }
}

/// Register a handoff to `owner`, then drop the producer's reference.
///
/// If the release fails the handoff is withdrawn again, so nothing waits on
/// the TTL sweep for a name the client never received.
fn hand_over(buffer: SharedBuffer, owner: &str) -> Result<String> {
    let name = buffer.name().to_string();
    let registry = buffer.registry.clone();
    registry.register_for_transfer(&name, owner)?;
    if let Err(err) = buffer.release() {
        if let Err(rollback) = registry.release_pending(&name, owner) {
            warn!(%name, owner, error = %rollback, "handoff rollback failed");
        }
        return Err(err);
    }
    Ok(name)
}

/// Data in ordinary memory that moves to shared memory only when a local
/// client asks for it.
pub struct HeapBuffer {
    registry: BufferRegistry,
    meta: BufferMeta,
    data: Vec<u8>,
}

impl HeapBuffer {
    pub fn new(registry: &BufferRegistry, meta: BufferMeta, data: Vec<u8>) -> Result<Self> {
        let expected = meta.data_len()?;
        if data.len() != expected {
            return Err(BufferError::Size {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            registry: registry.clone(),
            meta,
            data,
        })
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Transferable for HeapBuffer {
    fn hand_off(self: Box<Self>, peer: &PeerInfo) -> std::result::Result<String, Fault> {
        let mut buffer = self.registry.create(self.meta.clone())?;
        buffer.write_at(0, &self.data)?;
        Ok(hand_over(buffer, &peer.peer_id)?)
    }

    fn pack(self: Box<Self>) -> std::result::Result<Bytes, Fault> {
        Ok(pack(&self.meta, &self.data, &PackOptions::default())?)
    }
}
