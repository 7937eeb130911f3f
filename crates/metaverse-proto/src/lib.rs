//! Wire protocol for the viewer UDP transport.
//!
//! This crate is the pure codec layer: no sockets, no clocks. It covers
//! the three wire concerns every circuit shares:
//!
//! - [`template`]: the message schema, parsed once from the viewer
//!   template format and frozen.
//! - [`message`] + [`codec`]: constructing message instances and
//!   encoding/decoding their bodies (frequency-class opcodes,
//!   little-endian fields, block quotas).
//! - [`packet`]: datagram framing around a body - flags, 24-bit
//!   sequences, zerocoding, appended acks.
//!
//! The transport (reliable delivery, retransmission, duplicate
//! suppression) lives in the client crate and drives these types.

pub mod codec;
pub mod errors;
pub mod message;
pub mod packet;
pub mod template;

pub use codec::MTU;
pub use errors::{CodecError, MessageError, TemplateError};
pub use message::{FieldValue, Message};
pub use packet::{Packet, PacketFlags, PacketHeader, SEQUENCE_MASK};
pub use template::{
    BlockSpec, Encoding, FieldKind, FieldSpec, Frequency, MessageSpec, MessageTemplate, Quota,
    Trust,
};
