//! In-memory message instances.
//!
//! A [`Message`] is a constructed instance of a [`MessageSpec`]: concrete
//! block rows holding concrete field values, addressed by block and field
//! name. It carries its spec (and therefore its name) for dispatch.
//!
//! Field values are tagged variants rather than trait objects; the spec is
//! the authority on which variant a field may hold.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    errors::MessageError,
    template::{FieldKind, MessageSpec, Quota},
};

/// Maximum rows a `Variable` block can encode (1-byte count).
pub const MAX_VARIABLE_ROWS: usize = 255;

/// A concrete field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 8-bit integer.
    S8(i8),
    /// Signed 16-bit integer.
    S16(i16),
    /// Signed 32-bit integer.
    S32(i32),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Three-component float vector.
    Vector3([f32; 3]),
    /// Four-component float vector.
    Vector4([f32; 4]),
    /// Rotation as four floats.
    Quaternion([f32; 4]),
    /// 128-bit identifier.
    Uuid(Uuid),
    /// Raw bytes for `Variable` and `Fixed` fields.
    Bytes(Bytes),
}

impl FieldValue {
    /// The zero value for a field kind.
    #[must_use]
    pub fn default_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::U8 => Self::U8(0),
            FieldKind::U16 => Self::U16(0),
            FieldKind::U32 => Self::U32(0),
            FieldKind::U64 => Self::U64(0),
            FieldKind::S8 => Self::S8(0),
            FieldKind::S16 => Self::S16(0),
            FieldKind::S32 => Self::S32(0),
            FieldKind::F32 => Self::F32(0.0),
            FieldKind::F64 => Self::F64(0.0),
            FieldKind::Vector3 => Self::Vector3([0.0; 3]),
            FieldKind::Vector4 => Self::Vector4([0.0; 4]),
            FieldKind::Quaternion => Self::Quaternion([0.0; 4]),
            FieldKind::Uuid => Self::Uuid(Uuid::nil()),
            FieldKind::Variable1 | FieldKind::Variable2 => Self::Bytes(Bytes::new()),
            FieldKind::Fixed(n) => Self::Bytes(Bytes::from(vec![0u8; n])),
        }
    }

    /// Convert this value into the representation `kind` stores, if the
    /// variants are compatible. `Vector4` and `Quaternion` interconvert;
    /// `Bytes` satisfies every byte-string kind.
    fn coerced_to(self, kind: FieldKind, field: &str) -> Result<Self, MessageError> {
        let ok = match (&self, kind) {
            (Self::U8(_), FieldKind::U8)
            | (Self::U16(_), FieldKind::U16)
            | (Self::U32(_), FieldKind::U32)
            | (Self::U64(_), FieldKind::U64)
            | (Self::S8(_), FieldKind::S8)
            | (Self::S16(_), FieldKind::S16)
            | (Self::S32(_), FieldKind::S32)
            | (Self::F32(_), FieldKind::F32)
            | (Self::F64(_), FieldKind::F64)
            | (Self::Vector3(_), FieldKind::Vector3)
            | (Self::Uuid(_), FieldKind::Uuid)
            | (Self::Bytes(_), FieldKind::Variable1 | FieldKind::Variable2 | FieldKind::Fixed(_)) => {
                true
            }
            (Self::Vector4(v) | Self::Quaternion(v), FieldKind::Vector4) => {
                return Ok(Self::Vector4(*v));
            }
            (Self::Vector4(v) | Self::Quaternion(v), FieldKind::Quaternion) => {
                return Ok(Self::Quaternion(*v));
            }
            _ => false,
        };
        if ok {
            Ok(self)
        } else {
            Err(MessageError::TypeMismatch { field: field.to_owned(), expected: kind.name() })
        }
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        Self::U8(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        Self::U16(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<i8> for FieldValue {
    fn from(v: i8) -> Self {
        Self::S8(v)
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        Self::S16(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::S32(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<[f32; 3]> for FieldValue {
    fn from(v: [f32; 3]) -> Self {
        Self::Vector3(v)
    }
}

impl From<[f32; 4]> for FieldValue {
    fn from(v: [f32; 4]) -> Self {
        Self::Vector4(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Bytes> for FieldValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

/// A constructed message: spec plus concrete block rows.
///
/// # Invariants
///
/// - Row counts respect the spec: `Single` blocks hold exactly one row,
///   `Multiple(n)` exactly `n`, `Variable` between 0 and 255.
/// - Every row holds exactly one value per field, in spec order, of the
///   variant the spec declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    spec: Arc<MessageSpec>,
    /// Outer index parallel to `spec.blocks`; middle index is the row.
    blocks: Vec<Vec<Vec<FieldValue>>>,
}

impl Message {
    /// Instantiate an empty message: `Single` and `Multiple` blocks get
    /// their full row quota of zero values, `Variable` blocks start empty.
    #[must_use]
    pub fn new(spec: Arc<MessageSpec>) -> Self {
        let blocks = spec
            .blocks
            .iter()
            .map(|block| {
                let rows = match block.quota {
                    Quota::Single => 1,
                    Quota::Multiple(n) => n as usize,
                    Quota::Variable => 0,
                };
                (0..rows).map(|_| Self::blank_row(block)).collect()
            })
            .collect();
        Self { spec, blocks }
    }

    fn blank_row(block: &crate::template::BlockSpec) -> Vec<FieldValue> {
        block.fields.iter().map(|f| FieldValue::default_for(f.kind)).collect()
    }

    /// Message name, used for dispatch.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The spec this message was built from.
    #[must_use]
    pub fn spec(&self) -> &Arc<MessageSpec> {
        &self.spec
    }

    /// Number of rows currently present in `block`.
    pub fn rows(&self, block: &str) -> Result<usize, MessageError> {
        let idx = self.block_index(block)?;
        Ok(self.blocks[idx].len())
    }

    /// Append a row to a `Variable` block and return its index.
    pub fn push_row(&mut self, block: &str) -> Result<usize, MessageError> {
        let idx = self.block_index(block)?;
        let spec = &self.spec.blocks[idx];
        if spec.quota != Quota::Variable || self.blocks[idx].len() >= MAX_VARIABLE_ROWS {
            return Err(MessageError::BlockFull(block.to_owned()));
        }
        let row = Self::blank_row(spec);
        self.blocks[idx].push(row);
        Ok(self.blocks[idx].len() - 1)
    }

    /// Set a field on row 0 of `block`.
    pub fn set(
        &mut self,
        block: &str,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), MessageError> {
        self.set_at(block, 0, field, value)
    }

    /// Set a field on a specific row of `block`.
    pub fn set_at(
        &mut self,
        block: &str,
        row: usize,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> Result<(), MessageError> {
        let (block_idx, field_idx) = self.field_index(block, field)?;
        let rows = self.blocks[block_idx].len();
        if row >= rows {
            return Err(MessageError::RowOutOfRange { block: block.to_owned(), row, rows });
        }
        let kind = self.spec.blocks[block_idx].fields[field_idx].kind;
        self.blocks[block_idx][row][field_idx] = value.into().coerced_to(kind, field)?;
        Ok(())
    }

    /// Read a field from row 0 of `block`.
    pub fn get(&self, block: &str, field: &str) -> Result<&FieldValue, MessageError> {
        self.get_at(block, 0, field)
    }

    /// Read a field from a specific row of `block`.
    pub fn get_at(&self, block: &str, row: usize, field: &str) -> Result<&FieldValue, MessageError> {
        let (block_idx, field_idx) = self.field_index(block, field)?;
        let rows = self.blocks[block_idx].len();
        if row >= rows {
            return Err(MessageError::RowOutOfRange { block: block.to_owned(), row, rows });
        }
        Ok(&self.blocks[block_idx][row][field_idx])
    }

    /// Read a `U8` field from row 0.
    pub fn get_u8(&self, block: &str, field: &str) -> Result<u8, MessageError> {
        match self.get(block, field)? {
            FieldValue::U8(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "U8" }),
        }
    }

    /// Read a `U16` field from row 0.
    pub fn get_u16(&self, block: &str, field: &str) -> Result<u16, MessageError> {
        match self.get(block, field)? {
            FieldValue::U16(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "U16" }),
        }
    }

    /// Read a `U32` field from row 0.
    pub fn get_u32(&self, block: &str, field: &str) -> Result<u32, MessageError> {
        match self.get(block, field)? {
            FieldValue::U32(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "U32" }),
        }
    }

    /// Read a `U32` field from a specific row.
    pub fn get_u32_at(&self, block: &str, row: usize, field: &str) -> Result<u32, MessageError> {
        match self.get_at(block, row, field)? {
            FieldValue::U32(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "U32" }),
        }
    }

    /// Read a `U64` field from row 0.
    pub fn get_u64(&self, block: &str, field: &str) -> Result<u64, MessageError> {
        match self.get(block, field)? {
            FieldValue::U64(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "U64" }),
        }
    }

    /// Read an `LLUUID` field from row 0.
    pub fn get_uuid(&self, block: &str, field: &str) -> Result<Uuid, MessageError> {
        match self.get(block, field)? {
            FieldValue::Uuid(v) => Ok(*v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "LLUUID" }),
        }
    }

    /// Read a byte-string field from row 0.
    pub fn get_bytes(&self, block: &str, field: &str) -> Result<&Bytes, MessageError> {
        match self.get(block, field)? {
            FieldValue::Bytes(v) => Ok(v),
            _ => Err(MessageError::TypeMismatch { field: field.to_owned(), expected: "Variable" }),
        }
    }

    /// Read a byte-string field from row 0 as text, trimming the protocol's
    /// trailing NULs.
    pub fn get_text(&self, block: &str, field: &str) -> Result<String, MessageError> {
        let bytes = self.get_bytes(block, field)?;
        let mut trimmed: &[u8] = bytes;
        while let Some(rest) = trimmed.strip_suffix(&[0u8][..]) {
            trimmed = rest;
        }
        Ok(String::from_utf8_lossy(trimmed).into_owned())
    }

    /// Set a text field on row 0, appending the protocol's trailing NUL.
    pub fn set_text(&mut self, block: &str, field: &str, text: &str) -> Result<(), MessageError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        self.set(block, field, bytes)
    }

    /// Iterate the rows of a block by index. Used by the codec.
    pub(crate) fn block_rows(&self, block_idx: usize) -> &[Vec<FieldValue>] {
        &self.blocks[block_idx]
    }

    /// Push a pre-built row during decode. Bypasses quota checks; the
    /// codec enforces those against the wire data.
    pub(crate) fn push_raw_row(&mut self, block_idx: usize, row: Vec<FieldValue>) {
        self.blocks[block_idx].push(row);
    }

    /// Replace a row during decode.
    pub(crate) fn set_raw_row(&mut self, block_idx: usize, row_idx: usize, row: Vec<FieldValue>) {
        self.blocks[block_idx][row_idx] = row;
    }

    fn block_index(&self, block: &str) -> Result<usize, MessageError> {
        self.spec.block_index(block).ok_or_else(|| MessageError::UnknownBlock(block.to_owned()))
    }

    fn field_index(&self, block: &str, field: &str) -> Result<(usize, usize), MessageError> {
        let block_idx = self.block_index(block)?;
        let field_idx = self.spec.blocks[block_idx]
            .fields
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| MessageError::UnknownField(field.to_owned()))?;
        Ok((block_idx, field_idx))
    }
}
