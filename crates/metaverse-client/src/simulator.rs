//! Client-side representation of one region.
//!
//! A simulator composes a [`Circuit`] with a capability set and an event
//! queue. Its pump task interprets system messages (acks, pings, the
//! region handshake, disable) before anything is forwarded to the agent,
//! and carries both UDP messages and queue events upward over the agent's
//! signal channel.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use metaverse_proto::{Message, MessageTemplate};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{
    capability::{Capability, CapabilityRegistry, QueueEvent, SeedCapability},
    circuit::{Circuit, CircuitConfig},
    error::{CapabilityError, CircuitError},
    event::AgentSignal,
    event_queue::EventQueue,
    login::Identity,
};

/// Display name before the region handshake arrives.
const UNKNOWN_REGION: &str = "Unknown Region";

/// Region facts captured from `RegionHandshake`.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    /// Region display name.
    pub name: String,
    /// Region owner.
    pub owner: Uuid,
    /// Region identifier.
    pub region_id: Uuid,
}

impl Default for RegionInfo {
    fn default() -> Self {
        Self { name: UNKNOWN_REGION.to_owned(), owner: Uuid::nil(), region_id: Uuid::nil() }
    }
}

/// Session-wide pieces the agent hands to every simulator it creates.
#[derive(Clone)]
pub(crate) struct SimulatorContext {
    pub identity: Arc<Identity>,
    pub template: &'static MessageTemplate,
    pub http: reqwest::Client,
    pub registry: Arc<CapabilityRegistry>,
    pub circuit_config: CircuitConfig,
    pub signal_tx: mpsc::Sender<AgentSignal>,
}

/// One region the agent is connected to.
pub struct Simulator {
    address: SocketAddr,
    identity: Arc<Identity>,
    template: &'static MessageTemplate,
    http: reqwest::Client,
    registry: Arc<CapabilityRegistry>,
    circuit: Circuit,
    info: Mutex<RegionInfo>,
    capabilities: Mutex<HashMap<String, Capability>>,
    event_queue: EventQueue,
    queue_tx: mpsc::Sender<QueueEvent>,
    ping_sequence: AtomicU8,
    pending_pings: Mutex<HashMap<u8, oneshot::Sender<bool>>>,
    last_message: Mutex<Instant>,
    closed: AtomicBool,
}

impl Simulator {
    /// Open the circuit, present `UseCircuitCode`, and start the pump.
    pub(crate) async fn connect(
        ctx: SimulatorContext,
        address: SocketAddr,
    ) -> Result<Arc<Self>, CircuitError> {
        debug!(%address, circuit = ctx.identity.circuit_code, "connecting simulator");
        let (circuit, messages) =
            Circuit::connect(address, ctx.template, ctx.circuit_config).await?;
        let (queue_tx, queue_rx) = mpsc::channel(64);

        let simulator = Arc::new(Self {
            address,
            identity: Arc::clone(&ctx.identity),
            template: ctx.template,
            http: ctx.http,
            registry: ctx.registry,
            circuit,
            info: Mutex::new(RegionInfo::default()),
            capabilities: Mutex::new(HashMap::new()),
            event_queue: EventQueue::new(),
            queue_tx,
            ping_sequence: AtomicU8::new(0),
            pending_pings: Mutex::new(HashMap::new()),
            last_message: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });

        let mut hello = simulator.template.message("UseCircuitCode")?;
        hello.set("CircuitCode", "Code", ctx.identity.circuit_code)?;
        hello.set("CircuitCode", "SessionID", ctx.identity.session_id)?;
        hello.set("CircuitCode", "ID", ctx.identity.agent_id)?;
        simulator.send(&hello, true).await?;

        tokio::spawn(pump(Arc::clone(&simulator), messages, queue_rx, ctx.signal_tx));
        Ok(simulator)
    }

    /// The remote address, the simulator's identity key.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Region facts as of the last handshake.
    #[must_use]
    pub fn region_info(&self) -> RegionInfo {
        lock(&self.info).clone()
    }

    /// Region display name.
    #[must_use]
    pub fn name(&self) -> String {
        lock(&self.info).name.clone()
    }

    /// A granted capability client by name.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<Capability> {
        lock(&self.capabilities).get(name).cloned()
    }

    /// Encode and send a message on this simulator's circuit.
    pub async fn send(&self, message: &Message, reliable: bool) -> Result<(), CircuitError> {
        self.circuit.send(message, reliable).await
    }

    /// Fetch the capability set from a seed URL and start the event
    /// queue.
    pub async fn fetch_capabilities(&self, seed_url: &str) -> Result<(), CapabilityError> {
        let seed = SeedCapability::new(seed_url, self.http.clone());
        let granted = seed.fetch(&self.registry).await?;
        debug!(simulator = %self, count = granted.len(), "capabilities installed");

        let event_queue = granted.get("EventQueueGet").and_then(Capability::as_event_queue).cloned();
        *lock(&self.capabilities) = granted;

        match event_queue {
            Some(capability) => {
                self.event_queue.start(capability, self.queue_tx.clone());
                Ok(())
            }
            None => Err(CapabilityError::Unavailable("EventQueueGet".to_owned())),
        }
    }

    /// Liveness probe.
    ///
    /// Traffic within `timeout` counts as alive unless `force` demands an
    /// active check. Otherwise sends `StartPingCheck` with the next 8-bit
    /// ping id and waits for the matching `CompletePingCheck`. A stale
    /// waiter displaced from the id slot is resolved as failed.
    pub async fn ping(&self, timeout: Duration, force: bool) -> bool {
        if !force && lock(&self.last_message).elapsed() < timeout {
            return true;
        }
        if self.is_closed() {
            return false;
        }
        let ping_id = self.ping_sequence.fetch_add(1, Ordering::Relaxed);
        trace!(simulator = %self, ping_id, "ping check");

        let (waiter_tx, waiter_rx) = oneshot::channel();
        if let Some(stale) = lock(&self.pending_pings).insert(ping_id, waiter_tx) {
            let _ = stale.send(false);
        }

        let sent = self.send_ping(ping_id).await;
        if let Err(err) = sent {
            debug!(simulator = %self, %err, "ping send failed");
            lock(&self.pending_pings).remove(&ping_id);
            return false;
        }

        match tokio::time::timeout(timeout, waiter_rx).await {
            Ok(Ok(alive)) => alive,
            _ => {
                lock(&self.pending_pings).remove(&ping_id);
                false
            }
        }
    }

    async fn send_ping(&self, ping_id: u8) -> Result<(), CircuitError> {
        let mut message = self.template.message("StartPingCheck")?;
        message.set("PingID", "PingID", ping_id)?;
        message.set("PingID", "OldestUnacked", self.circuit.oldest_unacked())?;
        self.send(&message, false).await
    }

    /// System-message handling, applied before the agent or subscribers
    /// see anything.
    pub(crate) async fn handle_system_message(&self, message: &Message) {
        match message.name() {
            "PacketAck" => {
                let rows = message.rows("Packets").unwrap_or(0);
                let mut acks = Vec::with_capacity(rows);
                for row in 0..rows {
                    if let Ok(id) = message.get_u32_at("Packets", row, "ID") {
                        acks.push(id);
                    }
                }
                self.circuit.acknowledge(&acks);
            }
            "StartPingCheck" => {
                let Ok(ping_id) = message.get_u8("PingID", "PingID") else { return };
                if let Err(err) = self.reply_ping(ping_id).await {
                    debug!(simulator = %self, %err, "ping reply failed");
                }
            }
            "CompletePingCheck" => {
                let Ok(ping_id) = message.get_u8("PingID", "PingID") else { return };
                if let Some(waiter) = lock(&self.pending_pings).remove(&ping_id) {
                    let _ = waiter.send(true);
                }
            }
            "RegionHandshake" => {
                if let Err(err) = self.handle_region_handshake(message).await {
                    warn!(simulator = %self, %err, "handshake reply failed");
                }
            }
            "DisableSimulator" => {
                debug!(simulator = %self, "disabled by server");
                self.close();
            }
            _ => {}
        }
    }

    async fn reply_ping(&self, ping_id: u8) -> Result<(), CircuitError> {
        let mut reply = self.template.message("CompletePingCheck")?;
        reply.set("PingID", "PingID", ping_id)?;
        self.send(&reply, false).await
    }

    async fn handle_region_handshake(&self, message: &Message) -> Result<(), CircuitError> {
        {
            let mut info = lock(&self.info);
            if let Ok(name) = message.get_text("RegionInfo", "SimName") {
                info.name = name;
            }
            if let Ok(owner) = message.get_uuid("RegionInfo", "SimOwner") {
                info.owner = owner;
            }
            if let Ok(region_id) = message.get_uuid("RegionInfo2", "RegionID") {
                info.region_id = region_id;
            }
        }
        debug!(simulator = %self, "handshake received");

        let mut reply = self.template.message("RegionHandshakeReply")?;
        reply.set("AgentData", "AgentID", self.identity.agent_id)?;
        reply.set("AgentData", "SessionID", self.identity.session_id)?;
        reply.set("RegionInfo", "Flags", 1u32)?;
        self.send(&reply, true).await
    }

    /// Instant of the last inbound message.
    #[must_use]
    pub fn last_message(&self) -> Instant {
        *lock(&self.last_message)
    }

    pub(crate) fn note_message(&self) {
        *lock(&self.last_message) = Instant::now();
    }

    /// Whether this simulator has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the event queue, close the circuit, and fail any pending
    /// pings. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(simulator = %self, "closing");
        self.event_queue.close();
        self.circuit.close();
        for (_, waiter) in lock(&self.pending_pings).drain() {
            let _ = waiter.send(false);
        }
    }
}

impl fmt::Display for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({})", lock(&self.info).name, self.address)
    }
}

impl fmt::Debug for Simulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulator")
            .field("address", &self.address)
            .field("name", &lock(&self.info).name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pump: serialize this simulator's inbound traffic into the agent's
/// signal channel, one message at a time.
async fn pump(
    simulator: Arc<Simulator>,
    mut messages: mpsc::Receiver<Message>,
    mut queue: mpsc::Receiver<QueueEvent>,
    signals: mpsc::Sender<AgentSignal>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Some(message) => {
                    simulator.note_message();
                    simulator.handle_system_message(&message).await;
                    let signal =
                        AgentSignal::Udp { simulator: Arc::clone(&simulator), message };
                    if signals.send(signal).await.is_err() {
                        break;
                    }
                }
                None => {
                    let signal = AgentSignal::CircuitClosed { simulator: Arc::clone(&simulator) };
                    let _ = signals.send(signal).await;
                    break;
                }
            },
            Some(event) = queue.recv() => {
                let signal = AgentSignal::Queue { simulator: Arc::clone(&simulator), event };
                if signals.send(signal).await.is_err() {
                    break;
                }
            }
        }
    }
}
