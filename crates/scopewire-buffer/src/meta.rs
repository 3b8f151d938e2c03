use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl Dtype {
    pub fn item_size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// Memory layout of a multi-dimensional buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    /// Row-major.
    #[default]
    C,
    /// Column-major.
    F,
}

/// Shape and type of the data in a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMeta {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    #[serde(default)]
    pub order: Order,
}

impl BufferMeta {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: Dtype) -> Self {
        Self {
            shape: shape.into(),
            dtype,
            order: Order::C,
        }
    }

    /// Flat byte array of `len` bytes.
    pub fn bytes(len: usize) -> Self {
        Self::new(vec![len], Dtype::U8)
    }

    /// `None` when the shape overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
    }

    /// Size of the data in bytes, or `None` when it does not fit in `usize`.
    ///
    /// Shapes arrive from packed headers and from other processes' shared
    /// memory, so nothing here may overflow.
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.element_count()?.checked_mul(self.dtype.item_size())
    }

    pub(crate) fn data_len(&self) -> Result<usize> {
        self.checked_byte_len().ok_or_else(|| {
            BufferError::InvalidHeader(format!(
                "shape {:?} of {:?} overflows the address space",
                self.shape, self.dtype
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_accounts_for_item_size() {
        let meta = BufferMeta::new(vec![480, 640], Dtype::U16);
        assert_eq!(meta.element_count(), Some(307_200));
        assert_eq!(meta.checked_byte_len(), Some(614_400));
    }

    #[test]
    fn oversized_shapes_do_not_overflow() {
        let meta = BufferMeta::new(vec![usize::MAX, 3], Dtype::U16);
        assert_eq!(meta.element_count(), None);
        assert!(matches!(meta.data_len(), Err(BufferError::InvalidHeader(_))));

        let meta = BufferMeta::new(vec![usize::MAX / 2 + 1], Dtype::U16);
        assert!(meta.element_count().is_some());
        assert_eq!(meta.checked_byte_len(), None);
    }

    #[test]
    fn serializes_numpy_style_names() {
        let json = serde_json::to_string(&BufferMeta::new(vec![2, 3], Dtype::F32)).unwrap();
        assert_eq!(json, r#"{"shape":[2,3],"dtype":"float32","order":"C"}"#);
        let meta: BufferMeta = serde_json::from_str(r#"{"shape":[4],"dtype":"uint8"}"#).unwrap();
        assert_eq!(meta.order, Order::C);
    }
}
