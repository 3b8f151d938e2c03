//! Byte packing for buffers sent in `binary` replies.
//!
//! Format: `[header_len u16 LE][JSON header][payload]`, where the header is
//! `{dtype, shape, order, compressor}` and the payload is the raw data,
//! optionally zlib-compressed.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};
use crate::meta::{BufferMeta, Dtype, Order};

/// Payload compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    #[default]
    None,
    Zlib,
}

impl std::str::FromStr for Compressor {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            other => Err(BufferError::Unsupported(format!("compressor '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackOptions {
    pub compressor: Compressor,
    /// zlib level, 0-9.
    pub level: u32,
    /// Keep every n-th element along both axes of a 2-D buffer; 1 keeps all.
    pub downsample: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            compressor: Compressor::None,
            level: 6,
            downsample: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PackHeader {
    dtype: Dtype,
    shape: Vec<usize>,
    order: Order,
    compressor: Compressor,
}

pub fn pack(meta: &BufferMeta, data: &[u8], options: &PackOptions) -> Result<Bytes> {
    let expected = meta.data_len()?;
    if data.len() != expected {
        return Err(BufferError::Size {
            expected,
            actual: data.len(),
        });
    }
    let (meta, data) = if options.downsample > 1 {
        let (meta, data) = downsample(meta, data, options.downsample)?;
        (meta, std::borrow::Cow::Owned(data))
    } else {
        (meta.clone(), std::borrow::Cow::Borrowed(data))
    };

    let header = serde_json::to_vec(&PackHeader {
        dtype: meta.dtype,
        shape: meta.shape.clone(),
        order: meta.order,
        compressor: options.compressor,
    })?;
    let header_len = u16::try_from(header.len())
        .map_err(|_| BufferError::Unsupported(format!("{}-byte pack header", header.len())))?;

    let mut out = BytesMut::with_capacity(2 + header.len() + data.len());
    out.put_u16_le(header_len);
    out.put_slice(&header);
    match options.compressor {
        Compressor::None => out.put_slice(&data),
        Compressor::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(options.level.min(9)));
            encoder.write_all(&data)?;
            out.put_slice(&encoder.finish()?);
        }
    }
    Ok(out.freeze())
}

pub fn unpack(packed: &[u8]) -> Result<(BufferMeta, Vec<u8>)> {
    if packed.len() < 2 {
        return Err(BufferError::InvalidHeader("packed data shorter than its length prefix".into()));
    }
    let header_len = u16::from_le_bytes([packed[0], packed[1]]) as usize;
    let body_start = 2 + header_len;
    if packed.len() < body_start {
        return Err(BufferError::InvalidHeader(format!(
            "header of {header_len} bytes truncated"
        )));
    }
    let header: PackHeader = serde_json::from_slice(&packed[2..body_start])?;
    let meta = BufferMeta {
        shape: header.shape,
        dtype: header.dtype,
        order: header.order,
    };
    let expected = meta.data_len()?;
    let body = &packed[body_start..];
    let data = match header.compressor {
        Compressor::None => body.to_vec(),
        Compressor::Zlib => {
            // One byte past the claimed size is enough to detect a mismatch.
            let limit = u64::try_from(expected).unwrap_or(u64::MAX).saturating_add(1);
            let mut data = Vec::new();
            ZlibDecoder::new(body).take(limit).read_to_end(&mut data)?;
            data
        }
    };
    if data.len() != expected {
        return Err(BufferError::Size {
            expected,
            actual: data.len(),
        });
    }
    Ok((meta, data))
}

/// Keep every `step`-th element along both axes of a 2-D buffer.
pub fn downsample(meta: &BufferMeta, data: &[u8], step: usize) -> Result<(BufferMeta, Vec<u8>)> {
    if step <= 1 {
        return Ok((meta.clone(), data.to_vec()));
    }
    let [rows, cols] = meta.shape[..] else {
        return Err(BufferError::Unsupported(format!(
            "downsampling a {}-D buffer",
            meta.shape.len()
        )));
    };
    let expected = meta.data_len()?;
    if data.len() != expected {
        return Err(BufferError::Size {
            expected,
            actual: data.len(),
        });
    }
    let item = meta.dtype.item_size();
    let out_rows = rows.div_ceil(step);
    let out_cols = cols.div_ceil(step);
    let offset = |r: usize, c: usize, rows: usize, cols: usize| match meta.order {
        Order::C => (r * cols + c) * item,
        Order::F => (c * rows + r) * item,
    };

    let mut out = vec![0u8; out_rows * out_cols * item];
    for r in 0..out_rows {
        for c in 0..out_cols {
            let src = offset(r * step, c * step, rows, cols);
            let dst = offset(r, c, out_rows, out_cols);
            out[dst..dst + item].copy_from_slice(&data[src..src + item]);
        }
    }
    let meta = BufferMeta {
        shape: vec![out_rows, out_cols],
        dtype: meta.dtype,
        order: meta.order,
    };
    Ok((meta, out))
}
