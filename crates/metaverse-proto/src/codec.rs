//! Template-driven encode/decode of message bodies.
//!
//! The body is the opcode followed by the block/field layout the spec
//! declares. All multi-byte integers and floats are little-endian; only the
//! opcode itself uses network byte order. Packet-level concerns (flags,
//! sequence numbers, zerocoding, appended acks) live in [`crate::packet`].

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{
    errors::{CodecError, Result},
    message::{FieldValue, Message, MAX_VARIABLE_ROWS},
    template::{FieldKind, Frequency, MessageTemplate, Quota},
};

/// Body budget per datagram. The transport MTU for this protocol is 1200
/// bytes; the packet header and appended acks ride on top of the body, so
/// encoders reject anything beyond this.
pub const MTU: usize = 1200;

impl Message {
    /// Encode this message to its wire body (opcode + blocks).
    ///
    /// # Errors
    ///
    /// - [`CodecError::BlockOverflow`] if a `Variable` block exceeds 255
    ///   rows (unreachable through the typed API, enforced regardless)
    /// - [`CodecError::VariableOverflow`] if a byte string exceeds its
    ///   length prefix capacity
    /// - [`CodecError::FixedLengthMismatch`] if a `Fixed(n)` field holds
    ///   the wrong byte count
    /// - [`CodecError::Oversize`] if the body exceeds [`MTU`]
    pub fn encode(&self) -> Result<Bytes> {
        let spec = self.spec();
        let mut buf = BytesMut::with_capacity(64);

        match spec.frequency {
            Frequency::High => buf.put_u8(spec.id as u8),
            Frequency::Medium => {
                buf.put_u8(0xFF);
                buf.put_u8(spec.id as u8);
            }
            Frequency::Low => {
                buf.put_u8(0xFF);
                buf.put_u8(0xFF);
                buf.put_u16(spec.id as u16);
            }
            Frequency::Fixed => buf.put_u32(spec.id),
        }

        for (block_idx, block) in spec.blocks.iter().enumerate() {
            let rows = self.block_rows(block_idx);
            if block.quota == Quota::Variable {
                if rows.len() > MAX_VARIABLE_ROWS {
                    return Err(CodecError::BlockOverflow {
                        block: block.name.clone(),
                        count: rows.len(),
                        max: MAX_VARIABLE_ROWS,
                    });
                }
                buf.put_u8(rows.len() as u8);
            }
            for row in rows {
                for (field, value) in block.fields.iter().zip(row) {
                    encode_field(&mut buf, &field.name, field.kind, value)?;
                }
            }
        }

        if buf.len() > MTU {
            return Err(CodecError::Oversize { size: buf.len(), max: MTU });
        }
        Ok(buf.freeze())
    }

    /// Decode a wire body against the template.
    ///
    /// Trailing bytes after the spec is satisfied are ignored.
    ///
    /// # Errors
    ///
    /// - [`CodecError::UnknownOpcode`] if the opcode matches no message
    /// - [`CodecError::Truncated`] if the body ends mid-spec
    pub fn decode(template: &MessageTemplate, body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { buf: body, pos: 0 };

        let (frequency, id) = decode_opcode(&mut cursor)?;
        let spec = template
            .spec_by_id(frequency, id)
            .ok_or(CodecError::UnknownOpcode { frequency: frequency.keyword(), id })?;

        let mut message = Message::new(spec.clone());
        for (block_idx, block) in spec.blocks.iter().enumerate() {
            let rows = match block.quota {
                Quota::Single => 1,
                Quota::Multiple(n) => n as usize,
                Quota::Variable => cursor.take_u8()? as usize,
            };
            for row_idx in 0..rows {
                let mut row = Vec::with_capacity(block.fields.len());
                for field in &block.fields {
                    row.push(decode_field(&mut cursor, field.kind)?);
                }
                if block.quota == Quota::Variable {
                    message.push_raw_row(block_idx, row);
                } else {
                    message.set_raw_row(block_idx, row_idx, row);
                }
            }
        }
        Ok(message)
    }
}

fn encode_field(
    buf: &mut BytesMut,
    name: &str,
    kind: FieldKind,
    value: &FieldValue,
) -> Result<()> {
    match (kind, value) {
        (FieldKind::U8, FieldValue::U8(v)) => buf.put_u8(*v),
        (FieldKind::U16, FieldValue::U16(v)) => buf.put_u16_le(*v),
        (FieldKind::U32, FieldValue::U32(v)) => buf.put_u32_le(*v),
        (FieldKind::U64, FieldValue::U64(v)) => buf.put_u64_le(*v),
        (FieldKind::S8, FieldValue::S8(v)) => buf.put_i8(*v),
        (FieldKind::S16, FieldValue::S16(v)) => buf.put_i16_le(*v),
        (FieldKind::S32, FieldValue::S32(v)) => buf.put_i32_le(*v),
        (FieldKind::F32, FieldValue::F32(v)) => buf.put_f32_le(*v),
        (FieldKind::F64, FieldValue::F64(v)) => buf.put_f64_le(*v),
        (FieldKind::Vector3, FieldValue::Vector3(v)) => {
            for component in v {
                buf.put_f32_le(*component);
            }
        }
        (FieldKind::Vector4, FieldValue::Vector4(v))
        | (FieldKind::Quaternion, FieldValue::Quaternion(v)) => {
            for component in v {
                buf.put_f32_le(*component);
            }
        }
        (FieldKind::Uuid, FieldValue::Uuid(v)) => buf.put_slice(v.as_bytes()),
        (FieldKind::Variable1, FieldValue::Bytes(bytes)) => {
            if bytes.len() > u8::MAX as usize {
                return Err(CodecError::VariableOverflow {
                    field: name.to_owned(),
                    len: bytes.len(),
                    max: u8::MAX as usize,
                });
            }
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
        (FieldKind::Variable2, FieldValue::Bytes(bytes)) => {
            if bytes.len() > u16::MAX as usize {
                return Err(CodecError::VariableOverflow {
                    field: name.to_owned(),
                    len: bytes.len(),
                    max: u16::MAX as usize,
                });
            }
            buf.put_u16_le(bytes.len() as u16);
            buf.put_slice(bytes);
        }
        (FieldKind::Fixed(n), FieldValue::Bytes(bytes)) => {
            if bytes.len() != n {
                return Err(CodecError::FixedLengthMismatch {
                    field: name.to_owned(),
                    expected: n,
                    actual: bytes.len(),
                });
            }
            buf.put_slice(bytes);
        }
        // Message construction keeps values aligned with the spec; a
        // mismatch here means the invariant was bypassed.
        (kind, _) => {
            return Err(CodecError::Message(crate::errors::MessageError::TypeMismatch {
                field: name.to_owned(),
                expected: kind.name(),
            }));
        }
    }
    Ok(())
}

fn decode_field(cursor: &mut Cursor<'_>, kind: FieldKind) -> Result<FieldValue> {
    Ok(match kind {
        FieldKind::U8 => FieldValue::U8(cursor.take_u8()?),
        FieldKind::U16 => FieldValue::U16(u16::from_le_bytes(cursor.take_array()?)),
        FieldKind::U32 => FieldValue::U32(u32::from_le_bytes(cursor.take_array()?)),
        FieldKind::U64 => FieldValue::U64(u64::from_le_bytes(cursor.take_array()?)),
        FieldKind::S8 => FieldValue::S8(cursor.take_u8()? as i8),
        FieldKind::S16 => FieldValue::S16(i16::from_le_bytes(cursor.take_array()?)),
        FieldKind::S32 => FieldValue::S32(i32::from_le_bytes(cursor.take_array()?)),
        FieldKind::F32 => FieldValue::F32(f32::from_le_bytes(cursor.take_array()?)),
        FieldKind::F64 => FieldValue::F64(f64::from_le_bytes(cursor.take_array()?)),
        FieldKind::Vector3 => FieldValue::Vector3(cursor.take_f32s()?),
        FieldKind::Vector4 => FieldValue::Vector4(cursor.take_f32s()?),
        FieldKind::Quaternion => FieldValue::Quaternion(cursor.take_f32s()?),
        FieldKind::Uuid => FieldValue::Uuid(Uuid::from_bytes(cursor.take_array()?)),
        FieldKind::Variable1 => {
            let len = cursor.take_u8()? as usize;
            FieldValue::Bytes(Bytes::copy_from_slice(cursor.take(len)?))
        }
        FieldKind::Variable2 => {
            let len = u16::from_le_bytes(cursor.take_array()?) as usize;
            FieldValue::Bytes(Bytes::copy_from_slice(cursor.take(len)?))
        }
        FieldKind::Fixed(n) => FieldValue::Bytes(Bytes::copy_from_slice(cursor.take(n)?)),
    })
}

fn decode_opcode(cursor: &mut Cursor<'_>) -> Result<(Frequency, u32)> {
    let b0 = cursor.take_u8()?;
    if b0 != 0xFF {
        return Ok((Frequency::High, u32::from(b0)));
    }
    let b1 = cursor.take_u8()?;
    if b1 != 0xFF {
        return Ok((Frequency::Medium, u32::from(b1)));
    }
    let b2 = cursor.take_u8()?;
    let b3 = cursor.take_u8()?;
    if b2 != 0xFF {
        return Ok((Frequency::Low, u32::from(u16::from_be_bytes([b2, b3]))));
    }
    Ok((Frequency::Fixed, u32::from_be_bytes([0xFF, 0xFF, b2, b3])))
}

/// Bounds-checked reader over the body slice.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated { needed: len })?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| CodecError::Truncated { needed: end - self.buf.len() })?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn take_f32s<const N: usize>(&mut self) -> Result<[f32; N]> {
        let mut out = [0f32; N];
        for slot in &mut out {
            *slot = f32::from_le_bytes(self.take_array()?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::MessageTemplate;

    #[test]
    fn low_opcode_is_four_bytes_big_endian() {
        let msg = MessageTemplate::shared().message("CompleteAgentMovement").unwrap();
        let body = msg.encode().unwrap();
        assert_eq!(&body[..4], &[0xFF, 0xFF, 0x00, 249]);
    }

    #[test]
    fn fixed_opcode_is_full_id() {
        let msg = MessageTemplate::shared().message("PacketAck").unwrap();
        let body = msg.encode().unwrap();
        assert_eq!(&body[..4], &[0xFF, 0xFF, 0xFF, 0xFB]);
        // Empty Variable block still writes its row count.
        assert_eq!(body[4], 0);
    }

    #[test]
    fn high_opcode_is_one_byte() {
        let msg = MessageTemplate::shared().message("StartPingCheck").unwrap();
        let body = msg.encode().unwrap();
        assert_eq!(body[0], 1);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let template = MessageTemplate::shared();
        let err = Message::decode(template, &[0xFF, 0xFF, 0x7F, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::UnknownOpcode { frequency: "Low", .. }));
    }

    #[test]
    fn truncated_body_rejected() {
        let template = MessageTemplate::shared();
        let msg = template.message("UseCircuitCode").unwrap();
        let body = msg.encode().unwrap();
        let err = Message::decode(template, &body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn variable_length_overrun_rejected() {
        let template = MessageTemplate::shared();
        // RegionHandshakeReply is AgentData + RegionInfo{Flags}; craft a
        // LogoutReply whose InventoryData count claims more rows than the
        // bytes provide.
        let mut msg = template.message("LogoutReply").unwrap();
        let row = msg.push_row("InventoryData").unwrap();
        msg.set_at("InventoryData", row, "ItemID", uuid::Uuid::nil()).unwrap();
        let body = msg.encode().unwrap();
        let mut bad = body.to_vec();
        // Inflate the row count byte past the data present.
        let count_pos = 4 + 32; // opcode + AgentData (two UUIDs)
        bad[count_pos] = 9;
        let err = Message::decode(template, &bad).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn oversize_body_rejected() {
        let template = MessageTemplate::shared();
        let mut msg = template.message("KickUser").unwrap();
        msg.set("UserInfo", "Reason", vec![0x55u8; MTU]).unwrap();
        assert!(matches!(msg.encode(), Err(CodecError::Oversize { .. })));
    }
}
