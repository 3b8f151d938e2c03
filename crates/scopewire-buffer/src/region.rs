//! POSIX shared-memory regions with a self-describing header.
//!
//! Layout: `[magic 8][meta_len u32 LE][data_offset u32 LE][meta JSON][pad][data]`.
//! The data starts on a 64-byte boundary.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use crate::error::{BufferError, Result};
use crate::meta::BufferMeta;

const MAGIC: &[u8; 8] = b"SWBUF\x00\x00\x01";
const FIXED_HEADER: usize = 16;
const DATA_ALIGN: usize = 64;

/// One mapping of a named shared-memory object.
///
/// Dropping unmaps; it never unlinks. Removing the name is the registry's job.
pub struct ShmRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: String,
}

// The mapping is plain memory; synchronization is up to the owner.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new object of `len` bytes. Fails if `name` exists.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(BufferError::Unsupported("zero-length region".to_string()));
        }
        let cname = shm_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = os_error("ftruncate", name);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }
        match map(fd, len, name) {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                name: name.to_string(),
            }),
            Err(err) => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(err)
            }
        }
    }

    /// Map an existing object at its full size.
    pub fn open(name: &str) -> Result<Self> {
        let cname = shm_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(os_error("shm_open", name));
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = os_error("fstat", name);
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let len = stat.st_size as usize;
        if len < FIXED_HEADER {
            unsafe { libc::close(fd) };
            return Err(BufferError::InvalidHeader(format!("'{name}' is only {len} bytes")));
        }
        let ptr = map(fd, len, name)?;
        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
        })
    }

    /// Remove `name` from the system. Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = shm_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            return Err(os_error("shm_unlink", name));
        }
        Ok(())
    }

    /// Whether an object called `name` currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(cname) = shm_name(name) else {
            return false;
        };
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return false;
        }
        unsafe { libc::close(fd) };
        true
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

fn map(fd: libc::c_int, len: usize, name: &str) -> Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // The mapping holds its own reference to the object.
    let err = (ptr == libc::MAP_FAILED).then(|| os_error("mmap", name));
    unsafe { libc::close(fd) };
    if let Some(err) = err {
        return Err(err);
    }
    NonNull::new(ptr.cast()).ok_or_else(|| BufferError::Os {
        op: "mmap",
        name: name.to_string(),
        source: io::Error::other("null mapping"),
    })
}

fn shm_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 255 {
        return Err(BufferError::InvalidHeader(format!(
            "'{name}' is not a valid shared memory name"
        )));
    }
    CString::new(name).map_err(|_| BufferError::InvalidHeader(format!("'{name}' contains NUL")))
}

fn os_error(op: &'static str, name: &str) -> BufferError {
    BufferError::Os {
        op,
        name: name.to_string(),
        source: io::Error::last_os_error(),
    }
}

/// A region whose header has been written or validated.
pub struct MappedBuffer {
    region: ShmRegion,
    meta: BufferMeta,
    data_offset: usize,
    data_len: usize,
}

impl MappedBuffer {
    /// Create `name` sized for `meta` and write the header. Data is zeroed.
    pub fn create(name: &str, meta: BufferMeta) -> Result<Self> {
        let meta_json = serde_json::to_vec(&meta)?;
        let data_len = meta.data_len()?;
        let data_offset = (FIXED_HEADER + meta_json.len()).div_ceil(DATA_ALIGN) * DATA_ALIGN;
        let total = data_offset
            .checked_add(data_len.max(1))
            .ok_or_else(|| BufferError::InvalidHeader(format!("{data_len}-byte buffer too large")))?;

        let mut region = ShmRegion::create(name, total)?;
        let bytes = region.as_mut_slice();
        bytes[..8].copy_from_slice(MAGIC);
        bytes[8..12].copy_from_slice(&(meta_json.len() as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&(data_offset as u32).to_le_bytes());
        bytes[FIXED_HEADER..FIXED_HEADER + meta_json.len()].copy_from_slice(&meta_json);
        Ok(Self {
            region,
            meta,
            data_offset,
            data_len,
        })
    }

    /// Map `name` and read its header.
    pub fn open(name: &str) -> Result<Self> {
        let region = ShmRegion::open(name)?;
        let bytes = region.as_slice();
        if &bytes[..8] != MAGIC {
            return Err(BufferError::InvalidHeader(format!("'{name}' has no buffer magic")));
        }
        let meta_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let data_offset = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
        let meta_end = FIXED_HEADER
            .checked_add(meta_len)
            .filter(|end| *end <= data_offset && data_offset <= bytes.len())
            .ok_or_else(|| {
                BufferError::InvalidHeader(format!("'{name}' header lengths out of range"))
            })?;
        let meta: BufferMeta = serde_json::from_slice(&bytes[FIXED_HEADER..meta_end])?;
        let data_len = meta.data_len()?;
        let data_end = data_offset.checked_add(data_len).ok_or_else(|| {
            BufferError::InvalidHeader(format!("'{name}' data extends past the address space"))
        })?;
        if data_end > bytes.len() {
            return Err(BufferError::Size {
                expected: data_end,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            region,
            meta,
            data_offset,
            data_len,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    /// The data section.
    pub fn data(&self) -> &[u8] {
        &self.region.as_slice()[self.data_offset..self.data_offset + self.data_len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.region.as_mut_slice()[self.data_offset..self.data_offset + self.data_len]
    }
}

impl std::fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("name", &self.name())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Dtype;

    fn unique(tag: &str) -> String {
        format!("/sw-region-{tag}-{}", std::process::id())
    }

    #[test]
    fn header_roundtrips_through_a_second_mapping() {
        let name = unique("header");
        let meta = BufferMeta::new(vec![2, 3], Dtype::U16);
        let mut producer = MappedBuffer::create(&name, meta.clone()).unwrap();
        producer.data_mut().copy_from_slice(&[1u8; 12]);

        let consumer = MappedBuffer::open(&name).unwrap();
        assert_eq!(consumer.meta(), &meta);
        assert_eq!(consumer.data(), &[1u8; 12]);
        ShmRegion::unlink(&name).unwrap();
        assert!(!ShmRegion::exists(&name));
        // Existing mappings survive the unlink.
        assert_eq!(consumer.data()[0], 1);
    }

    #[test]
    fn create_refuses_existing_name() {
        let name = unique("excl");
        let _first = ShmRegion::create(&name, 64).unwrap();
        assert!(matches!(
            ShmRegion::create(&name, 64),
            Err(BufferError::Os { op: "shm_open", .. })
        ));
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn rejects_bad_names() {
        assert!(ShmRegion::open("no-slash").is_err());
        assert!(ShmRegion::open("/a/b").is_err());
    }

    #[test]
    fn open_rejects_foreign_objects() {
        let name = unique("foreign");
        let _raw = ShmRegion::create(&name, 64).unwrap();
        assert!(matches!(
            MappedBuffer::open(&name),
            Err(BufferError::InvalidHeader(_))
        ));
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn open_rejects_overflowing_meta() {
        let name = unique("overflow");
        let meta_json = br#"{"shape":[18446744073709551615,3],"dtype":"uint16"}"#;
        let mut raw = ShmRegion::create(&name, 3 * DATA_ALIGN).unwrap();
        let bytes = raw.as_mut_slice();
        bytes[..8].copy_from_slice(MAGIC);
        bytes[8..12].copy_from_slice(&(meta_json.len() as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&(2 * DATA_ALIGN as u32).to_le_bytes());
        bytes[FIXED_HEADER..FIXED_HEADER + meta_json.len()].copy_from_slice(meta_json);

        assert!(matches!(
            MappedBuffer::open(&name),
            Err(BufferError::InvalidHeader(_))
        ));
        ShmRegion::unlink(&name).unwrap();
    }
}
