//! Viewer session engine.
//!
//! Four layers compose one logged-in session:
//!
//! - [`circuit`]: reliable delivery over one UDP socket per region -
//!   sequencing, retransmission, ack piggybacking, duplicate suppression,
//!   and the host security gate.
//! - [`capability`]: the HTTP side - a registry of named capability
//!   clients granted through a region's seed URL.
//! - the event-queue loop (internal): `EventQueueGet` long-polling,
//!   feeding out-of-band notifications into the simulator.
//! - [`simulator`] and [`agent`]: one region's state and the session
//!   that owns all of them, driving login, neighbor activation, teleport,
//!   region crossing, kick, and logout.
//!
//! ```no_run
//! use metaverse_client::{Agent, AgentConfig, AgentEvent, LoginResult};
//!
//! # async fn example(login: LoginResult) -> Result<(), metaverse_client::AgentError> {
//! let agent = Agent::login(login, AgentConfig::default()).await?;
//! let mut events = agent.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let AgentEvent::Message { message, .. } = event {
//!             tracing::info!(name = message.name(), "message");
//!         }
//!     }
//! });
//! agent.run().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod capability;
pub mod circuit;
pub mod error;
pub mod event;
mod event_queue;
pub mod login;
pub mod simulator;

pub use agent::{Agent, AgentConfig};
pub use capability::{
    Capability, CapabilityRegistry, ChatSessionRequest, EventQueueGet, QueueEvent, QueuePoll,
    SeedCapability,
};
pub use circuit::{Circuit, CircuitConfig};
pub use error::{AgentError, CapabilityError, CircuitError};
pub use event::AgentEvent;
pub use login::{Identity, LoginResult};
pub use simulator::{RegionInfo, Simulator};
