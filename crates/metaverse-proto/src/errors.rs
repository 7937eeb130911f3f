//! Error types for the wire codec.
//!
//! Strongly-typed errors for each stage: template parsing (load time),
//! message construction (caller bugs), and encode/decode (wire data).
//! We avoid `std::io::Error` here - the codec never touches a socket.

use thiserror::Error;

/// Convenience alias for codec results.
pub type Result<T, E = CodecError> = std::result::Result<T, E>;

/// Errors raised while parsing the message template schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A token appeared where the grammar did not allow it.
    #[error("unexpected token {token:?} at line {line}")]
    UnexpectedToken {
        /// Line number in the schema text (1-based).
        line: usize,
        /// The offending token.
        token: String,
    },

    /// The schema text ended mid-entry.
    #[error("unexpected end of template")]
    UnexpectedEof,

    /// A numeric attribute could not be parsed.
    #[error("invalid number {value:?} at line {line}")]
    InvalidNumber {
        /// Line number in the schema text (1-based).
        line: usize,
        /// The token that failed to parse.
        value: String,
    },

    /// A message id is outside the range its frequency class allows.
    #[error("message id {id} out of range for {frequency} frequency")]
    IdOutOfRange {
        /// Frequency class name.
        frequency: &'static str,
        /// The declared id.
        id: u32,
    },

    /// An unrecognised field type keyword.
    #[error("unknown field type {0:?}")]
    UnknownFieldType(String),

    /// Two messages share a name or a (frequency, id) pair.
    #[error("duplicate message {0:?}")]
    DuplicateMessage(String),
}

/// Errors raised while building a message in memory.
///
/// These indicate caller bugs (wrong name, wrong value type), not bad
/// wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// No message with this name in the template.
    #[error("unknown message {0:?}")]
    UnknownMessage(String),

    /// No block with this name in the message spec.
    #[error("unknown block {0:?}")]
    UnknownBlock(String),

    /// No field with this name in the block spec.
    #[error("unknown field {0:?}")]
    UnknownField(String),

    /// The value's variant does not match the field's declared type.
    #[error("type mismatch for field {field:?}: expected {expected}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared field type.
        expected: &'static str,
    },

    /// A row index past the block's current row count.
    #[error("row {row} out of range for block {block:?} ({rows} rows)")]
    RowOutOfRange {
        /// Block name.
        block: String,
        /// Requested row.
        row: usize,
        /// Rows present.
        rows: usize,
    },

    /// A `Variable` block already holds the maximum 255 rows.
    #[error("block {0:?} is full")]
    BlockFull(String),
}

/// Errors raised while encoding or decoding wire bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The opcode did not match any message in the template.
    #[error("unknown opcode {id:#x} ({frequency})")]
    UnknownOpcode {
        /// Frequency class implied by the header form.
        frequency: &'static str,
        /// The decoded numeric id.
        id: u32,
    },

    /// The body ended before the spec was satisfied.
    #[error("truncated message: needed {needed} more bytes")]
    Truncated {
        /// Bytes missing at the failure point.
        needed: usize,
    },

    /// A block holds more rows than its quota or the wire format allows.
    #[error("block {block:?} row count {count} exceeds {max}")]
    BlockOverflow {
        /// Block name.
        block: String,
        /// Row count found.
        count: usize,
        /// Maximum permitted.
        max: usize,
    },

    /// A variable-length field exceeds its length prefix capacity.
    #[error("field {field:?} length {len} exceeds {max}")]
    VariableOverflow {
        /// Field name.
        field: String,
        /// Byte length found.
        len: usize,
        /// Maximum the prefix can express.
        max: usize,
    },

    /// A fixed-length field holds the wrong number of bytes.
    #[error("field {field:?} holds {actual} bytes, spec requires {expected}")]
    FixedLengthMismatch {
        /// Field name.
        field: String,
        /// Declared length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// The encoded body exceeds the transport MTU.
    #[error("encoded message is {size} bytes, limit {max}")]
    Oversize {
        /// Encoded size.
        size: usize,
        /// The MTU budget.
        max: usize,
    },

    /// A message construction error surfaced during encode.
    #[error(transparent)]
    Message(#[from] MessageError),
}
