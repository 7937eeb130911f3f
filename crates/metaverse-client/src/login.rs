//! Login result record.
//!
//! The login HTTP handshake is external to this crate; whatever performs
//! it produces a [`LoginResult`], which is all the agent needs to bring up
//! its first circuit and capability set.

use std::net::Ipv4Addr;

use uuid::Uuid;

/// The outcome of the external login handshake.
#[derive(Debug, Clone)]
pub struct LoginResult {
    /// Whether the grid accepted the login.
    pub success: bool,
    /// Server-provided status text (failure reason when `success` is
    /// false).
    pub message: String,
    /// The agent's identity.
    pub agent_id: Uuid,
    /// Session identifier presented on the circuit.
    pub session_id: Uuid,
    /// Secondary session secret, used by some capability calls.
    pub secure_session_id: Uuid,
    /// Circuit code identifying this session on UDP.
    pub circuit_code: u32,
    /// Address of the first region's simulator.
    pub sim_ip: Ipv4Addr,
    /// UDP port of the first region's simulator.
    pub sim_port: u16,
    /// Bootstrap URL for the capability set.
    pub seed_capability: String,
    /// Region grid coordinate.
    pub region_x: u32,
    /// Region grid coordinate.
    pub region_y: u32,
    /// Account first name.
    pub first_name: String,
    /// Account last name.
    pub last_name: String,
}

/// Session identity captured from a successful login. Immutable for the
/// life of the agent.
#[derive(Debug, Clone)]
pub struct Identity {
    /// The agent's UUID.
    pub agent_id: Uuid,
    /// Session identifier presented on every circuit.
    pub session_id: Uuid,
    /// Secondary session secret.
    pub secure_session_id: Uuid,
    /// Circuit code presented in `UseCircuitCode`.
    pub circuit_code: u32,
    /// Account name as `(first, last)`.
    pub username: (String, String),
}

impl From<&LoginResult> for Identity {
    fn from(login: &LoginResult) -> Self {
        Self {
            agent_id: login.agent_id,
            session_id: login.session_id,
            secure_session_id: login.secure_session_id,
            circuit_code: login.circuit_code,
            username: (login.first_name.clone(), login.last_name.clone()),
        }
    }
}
