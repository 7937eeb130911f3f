//! The logged-in session.
//!
//! The agent owns the simulator set - exactly one parent carrying control
//! traffic plus zero or more neighbors - and reacts to the lifecycle
//! triggers from both channels: queue events (`EnableSimulator`,
//! `EstablishAgentCommunication`, `TeleportFinish`, `CrossedRegion`) and
//! UDP messages (`DisableSimulator`, `LogoutReply`, `KickUser`).
//!
//! A dispatch task serializes every signal from the simulator pumps, so
//! membership mutations never race; subscribers receive typed
//! [`AgentEvent`]s over a broadcast channel.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use metaverse_llsd::Value;
use metaverse_proto::{Message, MessageTemplate};
use tokio::{
    sync::{broadcast, mpsc},
    task::AbortHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capability::{CapabilityRegistry, QueueEvent},
    circuit::CircuitConfig,
    error::AgentError,
    event::{AgentEvent, AgentSignal},
    login::{Identity, LoginResult},
    simulator::{Simulator, SimulatorContext},
};

/// How often the run loop sweeps the simulator set.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Liveness probe timeout used by the sweep.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How long logout waits for `LogoutReply` before closing anyway.
pub const DEFAULT_LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request HTTP timeout (the event-queue poll overrides it).
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Run-loop sweep period.
    pub sweep_interval: Duration,
    /// Sweep liveness probe timeout.
    pub ping_timeout: Duration,
    /// Bounded wait for `LogoutReply`.
    pub logout_timeout: Duration,
    /// HTTP client timeout for capability calls.
    pub http_timeout: Duration,
    /// Circuit tunables applied to every simulator.
    pub circuit: CircuitConfig,
    /// Capability table; extend before login to register new
    /// capabilities.
    pub registry: Arc<CapabilityRegistry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            logout_timeout: DEFAULT_LOGOUT_TIMEOUT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            circuit: CircuitConfig::default(),
            registry: Arc::new(CapabilityRegistry::standard()),
        }
    }
}

/// The logged-in user's client-side session.
pub struct Agent {
    shared: Arc<AgentShared>,
    dispatch: AbortHandle,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

impl Agent {
    /// Consume a successful login result: capture identity, connect the
    /// parent simulator, bootstrap its capabilities, and complete agent
    /// movement.
    pub async fn login(login: LoginResult, config: AgentConfig) -> Result<Self, AgentError> {
        if !login.success {
            return Err(AgentError::LoginInvalid { reason: login.message });
        }
        let identity = Arc::new(Identity::from(&login));
        info!(
            agent = %identity.agent_id,
            "logged in as {} {}",
            identity.username.0,
            identity.username.1
        );

        let http = reqwest::Client::builder().timeout(config.http_timeout).build()?;
        let (signal_tx, signal_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);

        let shared = Arc::new(AgentShared {
            identity,
            config,
            template: MessageTemplate::shared(),
            http,
            signal_tx,
            simulators: Mutex::new(Vec::new()),
            parent: Mutex::new(None),
            events,
        });

        let dispatch =
            tokio::spawn(AgentShared::dispatch(Arc::clone(&shared), signal_rx)).abort_handle();

        let address = SocketAddr::from((login.sim_ip, login.sim_port));
        let parent = shared.add_simulator(address, Some(&login.seed_capability), true).await?;
        shared.complete_agent_movement(&parent).await?;

        Ok(Self { shared, dispatch, shutdown: CancellationToken::new() })
    }

    /// Session identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.shared.events.subscribe()
    }

    /// The current parent simulator, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Simulator>> {
        self.shared.parent()
    }

    /// Snapshot of the simulator set.
    #[must_use]
    pub fn simulators(&self) -> Vec<Arc<Simulator>> {
        self.shared.snapshot()
    }

    /// Token that cancels [`Agent::run`] with a graceful logout.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Send a message via the parent simulator.
    pub async fn send(&self, message: &Message, reliable: bool) -> Result<(), AgentError> {
        let parent = self.shared.parent().ok_or(AgentError::NoParent)?;
        Ok(parent.send(message, reliable).await?)
    }

    /// Run the session: periodically probe every simulator and remove
    /// the dead. Returns when the parent is gone; cancellation through
    /// [`Agent::shutdown_token`] attempts a graceful logout first.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!("run cancelled; attempting graceful logout");
                    if let Err(err) = self.logout().await {
                        warn!(%err, "logout failed during shutdown");
                        self.shared.close_all();
                    }
                    return;
                }
                () = tokio::time::sleep(self.shared.config.sweep_interval) => {
                    for simulator in self.shared.snapshot() {
                        if !simulator.ping(self.shared.config.ping_timeout, false).await {
                            warn!(%simulator, "ping failed, removing");
                            self.shared.remove_simulator(&simulator);
                        }
                    }
                    if self.shared.parent().is_none() {
                        debug!("parent simulator gone, run loop ending");
                        return;
                    }
                }
            }
        }
    }

    /// Graceful logout: `LogoutRequest` via the parent, bounded wait for
    /// the reply, then unconditional teardown.
    pub async fn logout(&self) -> Result<(), AgentError> {
        let Some(parent) = self.shared.parent() else {
            self.shared.close_all();
            return Ok(());
        };
        info!("logging out");

        let mut events = self.events();
        let mut request = self.shared.template.message("LogoutRequest")?;
        request.set("AgentData", "AgentID", self.shared.identity.agent_id)?;
        request.set("AgentData", "SessionID", self.shared.identity.session_id)?;
        parent.send(&request, true).await?;

        let acknowledged = tokio::time::timeout(self.shared.config.logout_timeout, async {
            loop {
                match events.recv().await {
                    Ok(AgentEvent::Logout) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        })
        .await;
        if acknowledged.is_err() {
            warn!("no LogoutReply within timeout, closing anyway");
        }

        self.shared.close_all();
        Ok(())
    }

    /// Tear down every simulator without the logout handshake.
    pub fn close(&self) {
        self.shared.close_all();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shared.close_all();
        self.dispatch.abort();
    }
}

/// State shared between the agent handle and its dispatch task.
struct AgentShared {
    identity: Arc<Identity>,
    config: AgentConfig,
    template: &'static MessageTemplate,
    http: reqwest::Client,
    signal_tx: mpsc::Sender<AgentSignal>,
    simulators: Mutex<Vec<Arc<Simulator>>>,
    parent: Mutex<Option<Arc<Simulator>>>,
    events: broadcast::Sender<AgentEvent>,
}

impl AgentShared {
    fn context(&self) -> SimulatorContext {
        SimulatorContext {
            identity: Arc::clone(&self.identity),
            template: self.template,
            http: self.http.clone(),
            registry: Arc::clone(&self.config.registry),
            circuit_config: self.config.circuit.clone(),
            signal_tx: self.signal_tx.clone(),
        }
    }

    fn parent(&self) -> Option<Arc<Simulator>> {
        lock(&self.parent).clone()
    }

    fn snapshot(&self) -> Vec<Arc<Simulator>> {
        lock(&self.simulators).clone()
    }

    fn find_simulator(&self, address: SocketAddr) -> Option<Arc<Simulator>> {
        lock(&self.simulators).iter().find(|sim| sim.address() == address).cloned()
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    /// Connect a simulator, adopt it into the set, optionally bootstrap
    /// its capabilities and promote it to parent.
    ///
    /// A failed capability bootstrap disables the dependent features but
    /// keeps the simulator.
    async fn add_simulator(
        &self,
        address: SocketAddr,
        seed: Option<&str>,
        parent: bool,
    ) -> Result<Arc<Simulator>, AgentError> {
        let simulator = Simulator::connect(self.context(), address).await?;
        lock(&self.simulators).push(Arc::clone(&simulator));
        if parent {
            debug!(%simulator, "parent simulator set");
            *lock(&self.parent) = Some(Arc::clone(&simulator));
        }
        if let Some(seed) = seed {
            if let Err(err) = simulator.fetch_capabilities(seed).await {
                warn!(%simulator, %err, "capability bootstrap failed");
            }
        }
        Ok(simulator)
    }

    fn remove_simulator(&self, simulator: &Arc<Simulator>) {
        debug!(%simulator, "removing simulator");
        {
            let mut parent = lock(&self.parent);
            if parent.as_ref().is_some_and(|p| Arc::ptr_eq(p, simulator)) {
                debug!(%simulator, "parent simulator removed");
                *parent = None;
            }
        }
        lock(&self.simulators).retain(|other| !Arc::ptr_eq(other, simulator));
        simulator.close();
    }

    fn close_all(&self) {
        *lock(&self.parent) = None;
        for simulator in lock(&self.simulators).drain(..) {
            simulator.close();
        }
    }

    async fn complete_agent_movement(&self, simulator: &Arc<Simulator>) -> Result<(), AgentError> {
        let mut message = self.template.message("CompleteAgentMovement")?;
        message.set("AgentData", "AgentID", self.identity.agent_id)?;
        message.set("AgentData", "SessionID", self.identity.session_id)?;
        message.set("AgentData", "CircuitCode", self.identity.circuit_code)?;
        Ok(simulator.send(&message, true).await?)
    }

    /// Serialize all simulator signals through one task.
    async fn dispatch(shared: Arc<Self>, mut signals: mpsc::Receiver<AgentSignal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                AgentSignal::Udp { simulator, message } => {
                    shared.handle_message(simulator, message);
                }
                AgentSignal::Queue { simulator, event } => {
                    shared.handle_queue_event(simulator, event).await;
                }
                AgentSignal::CircuitClosed { simulator } => {
                    debug!(%simulator, "circuit closed");
                    shared.remove_simulator(&simulator);
                }
            }
        }
    }

    fn handle_message(&self, simulator: Arc<Simulator>, message: Message) {
        match message.name() {
            "DisableSimulator" => {
                debug!(%simulator, "disabling simulator");
                self.remove_simulator(&simulator);
            }
            "LogoutReply" => {
                debug!(%simulator, "logout reply");
                self.remove_simulator(&simulator);
                self.emit(AgentEvent::Logout);
            }
            "KickUser" => {
                let reason = message.get_text("UserInfo", "Reason").unwrap_or_default();
                warn!(%simulator, reason, "kicked");
                self.remove_simulator(&simulator);
                self.emit(AgentEvent::Kicked);
                self.emit(AgentEvent::Logout);
            }
            _ => {}
        }
        self.emit(AgentEvent::Message { simulator, message });
    }

    async fn handle_queue_event(&self, simulator: Arc<Simulator>, event: QueueEvent) {
        debug!(%simulator, name = event.name, "queue event");
        match event.name.as_str() {
            "EnableSimulator" => self.on_enable_simulator(&event.body).await,
            "TeleportFinish" => self.on_teleport_finish(&event.body).await,
            "CrossedRegion" => self.on_crossed_region(&event.body).await,
            "EstablishAgentCommunication" => {
                self.on_establish_agent_communication(&event.body).await;
            }
            _ => {}
        }
        self.emit(AgentEvent::QueueEvent { simulator, name: event.name, body: event.body });
    }

    /// Neighbor announcement: connect with the session circuit code, no
    /// seed yet, never parent.
    async fn on_enable_simulator(&self, body: &Value) {
        let Some(rows) = body.get("SimulatorInfo").and_then(Value::as_array) else {
            warn!("EnableSimulator without SimulatorInfo");
            return;
        };
        for row in rows {
            let Some(address) = queue_address(row.get("IP"), row.get("Port")) else {
                warn!("EnableSimulator with unparseable address");
                continue;
            };
            if self.find_simulator(address).is_some() {
                debug!(%address, "neighbor already connected");
                continue;
            }
            if let Err(err) = self.add_simulator(address, None, false).await {
                warn!(%address, %err, "neighbor connect failed");
            }
        }
    }

    async fn on_teleport_finish(&self, body: &Value) {
        let Some(info) = body.get("Info").and_then(Value::as_array).and_then(<[Value]>::first)
        else {
            warn!("TeleportFinish without Info");
            return;
        };
        self.arrive(info).await;
    }

    async fn on_crossed_region(&self, body: &Value) {
        let Some(region_data) = body
            .get("CrossedRegion")
            .and_then(Value::as_array)
            .and_then(<[Value]>::first)
            .and_then(|row| row.get("RegionData"))
            .and_then(Value::as_array)
            .and_then(<[Value]>::first)
        else {
            warn!("CrossedRegion without RegionData");
            return;
        };
        self.arrive(region_data).await;
    }

    /// Shared tail of teleport and region crossing: connect at the
    /// announced address with its seed, promote to parent, and complete
    /// agent movement. The prior parent stays in the set as a neighbor.
    async fn arrive(&self, info: &Value) {
        let Some(address) = queue_address(info.get("SimIP"), info.get("SimPort")) else {
            warn!("region arrival with unparseable address");
            return;
        };
        let seed = info.get("SeedCapability").and_then(Value::as_str);
        match self.add_simulator(address, seed, true).await {
            Ok(simulator) => {
                if let Err(err) = self.complete_agent_movement(&simulator).await {
                    warn!(%simulator, %err, "complete agent movement failed");
                }
            }
            Err(err) => warn!(%address, %err, "arrival connect failed"),
        }
    }

    async fn on_establish_agent_communication(&self, body: &Value) {
        let Some(address) =
            body.get("sim-ip-and-port").and_then(Value::as_str).and_then(|s| s.parse().ok())
        else {
            warn!("EstablishAgentCommunication without address");
            return;
        };
        let Some(seed) = body.get("seed-capability").and_then(Value::as_str) else {
            warn!("EstablishAgentCommunication without seed");
            return;
        };
        match self.find_simulator(address) {
            Some(simulator) => {
                if let Err(err) = simulator.fetch_capabilities(seed).await {
                    warn!(%simulator, %err, "capability bootstrap failed");
                }
            }
            None => warn!(%address, "EstablishAgentCommunication for unknown host"),
        }
    }
}

/// Decode the `(IP, Port)` pair the queue events carry: a 4-byte binary
/// address (network order) or a dotted string, plus an integer port.
fn queue_address(ip: Option<&Value>, port: Option<&Value>) -> Option<SocketAddr> {
    let port = u16::try_from(port?.as_integer()?).ok()?;
    let ip = match ip? {
        Value::Binary(bytes) => {
            let octets: [u8; 4] = bytes.as_slice().try_into().ok()?;
            std::net::Ipv4Addr::from(octets)
        }
        Value::String(text) => text.parse().ok()?,
        _ => return None,
    };
    Some(SocketAddr::from((ip, port)))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
