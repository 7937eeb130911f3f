//! Error types for the session engine.
//!
//! One enum per layer: circuit (transport), capability (HTTP surface), and
//! agent (session lifecycle). Codec errors bubble up from the proto crate.
//! An inbound datagram from the wrong host is not an error at all - it is
//! silently dropped as a security gate.

use thiserror::Error;

use metaverse_proto::{CodecError, MessageError};

/// Errors from a circuit's reliable UDP transport.
#[derive(Error, Debug)]
pub enum CircuitError {
    /// Socket-level failure (bind, send, receive).
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A reliable packet exhausted its retransmission attempts.
    #[error("retransmission attempts exhausted for sequence {sequence}")]
    RetransmitExhausted {
        /// Sequence of the abandoned packet.
        sequence: u32,
    },

    /// The circuit is closed.
    #[error("circuit closed")]
    Closed,

    /// Encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Message construction failure.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Errors from the capability HTTP surface.
#[derive(Error, Debug)]
pub enum CapabilityError {
    /// The seed reply did not include a required capability, or the
    /// registry does not know it.
    #[error("capability {0:?} unavailable")]
    Unavailable(String),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an unexpected status.
    #[error("unexpected http status {0}")]
    Status(u16),

    /// The reply body was not valid LLSD.
    #[error(transparent)]
    Llsd(#[from] metaverse_llsd::LlsdError),

    /// The reply parsed but did not have the agreed shape.
    #[error("malformed capability reply: {0}")]
    Shape(&'static str),
}

/// Errors from the agent session lifecycle.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The login result carried a failure flag.
    #[error("login rejected: {reason}")]
    LoginInvalid {
        /// Server-provided failure text.
        reason: String,
    },

    /// No parent simulator to carry control traffic.
    #[error("no parent simulator")]
    NoParent,

    /// Transport failure on an owned circuit.
    #[error(transparent)]
    Circuit(#[from] CircuitError),

    /// Message construction failure.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// HTTP client construction failure.
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}
