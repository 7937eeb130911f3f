//! Typed events delivered to agent subscribers.

use std::sync::Arc;

use metaverse_llsd::Value;
use metaverse_proto::Message;

use crate::{capability::QueueEvent, simulator::Simulator};

/// Events the agent surfaces to its subscribers.
///
/// A compile-time-known set rather than name-keyed listener lists; name
/// dispatch, when a caller wants it, is a `match` on
/// [`Message::name`](metaverse_proto::Message::name).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A UDP message arrived on a simulator's circuit (after system
    /// handling).
    Message {
        /// The simulator the message arrived on.
        simulator: Arc<Simulator>,
        /// The decoded message.
        message: Message,
    },
    /// An event-queue notification arrived.
    QueueEvent {
        /// The simulator whose queue delivered it.
        simulator: Arc<Simulator>,
        /// Event name.
        name: String,
        /// Structured body.
        body: Value,
    },
    /// The session ended (logout reply, kick, or teardown).
    Logout,
    /// The server kicked this agent; followed by [`AgentEvent::Logout`].
    Kicked,
}

/// Internal signals from simulator pumps to the agent's dispatch task.
pub(crate) enum AgentSignal {
    /// A UDP message cleared simulator system handling.
    Udp {
        simulator: Arc<Simulator>,
        message: Message,
    },
    /// An event-queue event arrived.
    Queue {
        simulator: Arc<Simulator>,
        event: QueueEvent,
    },
    /// The simulator's circuit died (failure or close).
    CircuitClosed { simulator: Arc<Simulator> },
}
