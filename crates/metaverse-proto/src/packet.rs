//! Datagram framing: flags, sequence numbers, zerocoding, appended acks.
//!
//! Every UDP datagram is `Flags(1) | Sequence(4, BE) | ExtraLen(1) |
//! Extra | Body`, optionally followed by `acks... ackCount(1)` when the
//! ACK_APPENDED flag is set. The body is the (optionally zerocoded)
//! opcode + block encoding from [`crate::codec`].

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{CodecError, Result};

/// Outbound sequence numbers wrap at 24 bits.
pub const SEQUENCE_MASK: u32 = 0x00FF_FFFF;

/// Maximum acks a single datagram can append (1-byte count).
pub const MAX_APPENDED_ACKS: usize = 255;

/// Packet flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags {
    bits: u8,
}

impl PacketFlags {
    /// Body is run-length coded.
    pub const ZEROCODED: u8 = 0x80;
    /// Sender expects an acknowledgement.
    pub const RELIABLE: u8 = 0x40;
    /// This is a retransmission.
    pub const RESENT: u8 = 0x20;
    /// Ack sequences are appended after the body.
    pub const ACK_APPENDED: u8 = 0x10;

    /// Wrap a raw flags byte.
    #[must_use]
    pub fn from_byte(bits: u8) -> Self {
        Self { bits }
    }

    /// The raw flags byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.bits
    }

    /// Test a flag bit.
    #[must_use]
    pub fn contains(self, flag: u8) -> bool {
        self.bits & flag != 0
    }

    /// Set a flag bit.
    #[must_use]
    pub fn with(self, flag: u8) -> Self {
        Self { bits: self.bits | flag }
    }

    /// Clear a flag bit.
    #[must_use]
    pub fn without(self, flag: u8) -> Self {
        Self { bits: self.bits & !flag }
    }
}

/// Fixed 6-byte datagram header.
///
/// Stored as raw bytes to avoid alignment issues; the sequence is network
/// byte order on the wire and exposed as `u32` through the accessor.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    flags: u8,
    sequence: [u8; 4],
    extra_len: u8,
}

impl PacketHeader {
    /// Serialized header size.
    pub const SIZE: usize = 6;

    /// Build a header. The sequence is masked to 24 bits.
    #[must_use]
    pub fn new(flags: PacketFlags, sequence: u32, extra_len: u8) -> Self {
        Self { flags: flags.to_byte(), sequence: (sequence & SEQUENCE_MASK).to_be_bytes(), extra_len }
    }

    /// Parse the fixed prefix of a datagram.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(bytes)
            .map(|(header, _)| header)
            .map_err(|_| CodecError::Truncated { needed: Self::SIZE.saturating_sub(bytes.len()) })
    }

    /// Flag bits.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_byte(self.flags)
    }

    /// Sequence number.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        u32::from_be_bytes(self.sequence)
    }

    /// Length of the extra-header bytes that follow.
    #[must_use]
    pub fn extra_len(&self) -> usize {
        self.extra_len as usize
    }
}

impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("sequence", &self.sequence())
            .field("extra_len", &self.extra_len)
            .finish()
    }
}

/// A parsed (or to-be-sent) datagram.
///
/// After [`Packet::decode`], `body` is the plain (zero-expanded) bytes and
/// `acks` holds any stripped appended acks; the flags byte is preserved as
/// received so callers can test RELIABLE/RESENT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Flag bits as sent on the wire.
    pub flags: PacketFlags,
    /// 24-bit sequence number.
    pub sequence: u32,
    /// Extra-header bytes. Unused by this protocol revision but carried
    /// through for wire fidelity.
    pub extra: Bytes,
    /// Message body (opcode + blocks), never zerocoded in memory.
    pub body: Bytes,
    /// Acknowledged sequences appended to the datagram, oldest first.
    pub acks: Vec<u32>,
}

impl Packet {
    /// Build an outbound packet with no extra header and no acks.
    #[must_use]
    pub fn new(flags: PacketFlags, sequence: u32, body: Bytes) -> Self {
        Self { flags, sequence: sequence & SEQUENCE_MASK, extra: Bytes::new(), body, acks: Vec::new() }
    }

    /// Serialize to datagram bytes.
    ///
    /// Zerocoding is applied iff the ZEROCODED flag is set, and the flag is
    /// dropped when compression does not pay: callers request it, the
    /// encoder decides. ACK_APPENDED is derived from `acks` being
    /// non-empty.
    ///
    /// # Errors
    ///
    /// [`CodecError::BlockOverflow`] if more than 255 acks are attached.
    pub fn encode(&self) -> Result<Bytes> {
        if self.acks.len() > MAX_APPENDED_ACKS {
            return Err(CodecError::BlockOverflow {
                block: "acks".to_owned(),
                count: self.acks.len(),
                max: MAX_APPENDED_ACKS,
            });
        }

        let mut flags = self.flags;
        let mut body: &[u8] = &self.body;
        let compressed;
        if flags.contains(PacketFlags::ZEROCODED) {
            compressed = zero_encode(&self.body);
            if compressed.len() < self.body.len() {
                body = &compressed;
            } else {
                flags = flags.without(PacketFlags::ZEROCODED);
            }
        }

        if self.acks.is_empty() {
            flags = flags.without(PacketFlags::ACK_APPENDED);
        } else {
            flags = flags.with(PacketFlags::ACK_APPENDED);
        }

        let mut buf =
            BytesMut::with_capacity(PacketHeader::SIZE + self.extra.len() + body.len() + 1 + self.acks.len() * 4);
        let header = PacketHeader::new(flags, self.sequence, self.extra.len() as u8);
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.extra);
        buf.put_slice(body);
        if !self.acks.is_empty() {
            for ack in &self.acks {
                buf.put_u32(*ack);
            }
            buf.put_u8(self.acks.len() as u8);
        }
        Ok(buf.freeze())
    }

    /// Parse a datagram: header, appended-ack strip, zerocode expansion.
    ///
    /// Appended acks are stripped before zerocode expansion; they are never
    /// zerocoded on the wire.
    ///
    /// # Errors
    ///
    /// [`CodecError::Truncated`] if the datagram is shorter than its
    /// header, its extra bytes, or its claimed ack trailer, or if a
    /// zerocode run is cut off.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let header = PacketHeader::from_bytes(datagram)?;
        let flags = header.flags();
        let sequence = header.sequence();
        let extra_len = header.extra_len();

        let after_header = &datagram[PacketHeader::SIZE..];
        if after_header.len() < extra_len {
            return Err(CodecError::Truncated { needed: extra_len - after_header.len() });
        }
        let extra = Bytes::copy_from_slice(&after_header[..extra_len]);
        let mut rest = &after_header[extra_len..];

        let mut acks = Vec::new();
        if flags.contains(PacketFlags::ACK_APPENDED) {
            let (body_part, stripped) = strip_acks(rest)?;
            rest = body_part;
            acks = stripped;
        }

        let body = if flags.contains(PacketFlags::ZEROCODED) {
            Bytes::from(zero_expand(rest)?)
        } else {
            Bytes::copy_from_slice(rest)
        };

        Ok(Self { flags, sequence, extra, body, acks })
    }
}

/// Split `rest` into body and appended acks.
///
/// The trailer is `acks... count(1)`: the final byte is the count, and the
/// `4 * count` bytes before it are big-endian sequences in order.
fn strip_acks(rest: &[u8]) -> Result<(&[u8], Vec<u32>)> {
    let (&count, before_count) =
        rest.split_last().ok_or(CodecError::Truncated { needed: 1 })?;
    let trailer = count as usize * 4;
    if before_count.len() < trailer {
        return Err(CodecError::Truncated { needed: trailer - before_count.len() });
    }
    let (body, ack_bytes) = before_count.split_at(before_count.len() - trailer);
    let acks = ack_bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((body, acks))
}

/// Run-length encode zero bytes as `00 count`, splitting runs longer than
/// 255. Non-zero bytes pass through untouched.
#[must_use]
pub fn zero_encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte != 0 {
            out.push(byte);
            continue;
        }
        let mut run: usize = 1;
        while iter.peek() == Some(&&0) {
            iter.next();
            run += 1;
        }
        while run > 0 {
            let chunk = run.min(255);
            out.push(0);
            out.push(chunk as u8);
            run -= chunk;
        }
    }
    out
}

/// Expand `00 count` runs back into zero bytes.
pub fn zero_expand(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() * 2);
    let mut iter = body.iter();
    while let Some(&byte) = iter.next() {
        if byte != 0 {
            out.push(byte);
            continue;
        }
        let &count = iter.next().ok_or(CodecError::Truncated { needed: 1 })?;
        out.extend(std::iter::repeat_n(0u8, count as usize));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
    }

    #[test]
    fn sequence_masks_to_24_bits() {
        let packet = Packet::new(PacketFlags::default(), 0x0100_0001, Bytes::from_static(b"x"));
        assert_eq!(packet.sequence, 1);
    }

    #[test]
    fn appended_ack_trailer_layout() {
        let mut packet =
            Packet::new(PacketFlags::default(), 9, Bytes::from_static(&[0x42]));
        packet.acks = vec![7, 8];
        let wire = packet.encode().unwrap();
        assert_eq!(
            &wire[wire.len() - 9..],
            &[0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x08, 0x02]
        );
        let decoded = Packet::decode(&wire).unwrap();
        assert_eq!(decoded.acks, vec![7, 8]);
        assert_eq!(decoded.body, packet.body);
    }

    #[test]
    fn zerocoding_skipped_when_it_does_not_shrink() {
        let body = Bytes::from_static(&[1, 2, 3, 4]);
        let packet =
            Packet::new(PacketFlags::default().with(PacketFlags::ZEROCODED), 1, body.clone());
        let wire = packet.encode().unwrap();
        let decoded = Packet::decode(&wire).unwrap();
        assert!(!decoded.flags.contains(PacketFlags::ZEROCODED));
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn zerocoding_applied_when_it_shrinks() {
        let body = Bytes::from(vec![0u8; 64]);
        let packet =
            Packet::new(PacketFlags::default().with(PacketFlags::ZEROCODED), 1, body.clone());
        let wire = packet.encode().unwrap();
        assert!(wire.len() < PacketHeader::SIZE + 64);
        let decoded = Packet::decode(&wire).unwrap();
        assert!(decoded.flags.contains(PacketFlags::ZEROCODED));
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn long_zero_runs_split_at_255() {
        let body = vec![0u8; 600];
        let encoded = zero_encode(&body);
        assert_eq!(encoded, vec![0, 255, 0, 255, 0, 90]);
        assert_eq!(zero_expand(&encoded).unwrap(), body);
    }

    #[test]
    fn zero_expand_rejects_cut_run() {
        assert!(matches!(zero_expand(&[5, 0]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn decode_rejects_short_ack_trailer() {
        let packet = Packet::new(
            PacketFlags::default().with(PacketFlags::ACK_APPENDED),
            1,
            Bytes::new(),
        );
        // Hand-build a datagram whose count byte claims more acks than fit.
        let mut wire = PacketHeader::new(packet.flags, 1, 0).as_bytes().to_vec();
        wire.extend_from_slice(&[0x00, 0x00, 0x07]);
        wire.push(2);
        assert!(matches!(Packet::decode(&wire), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn reliable_and_resent_flags_survive() {
        let flags = PacketFlags::default().with(PacketFlags::RELIABLE).with(PacketFlags::RESENT);
        let packet = Packet::new(flags, 77, Bytes::from_static(&[9]));
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert!(decoded.flags.contains(PacketFlags::RELIABLE));
        assert!(decoded.flags.contains(PacketFlags::RESENT));
        assert_eq!(decoded.sequence, 77);
    }
}
