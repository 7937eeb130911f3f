//! Reliable UDP circuit.
//!
//! A circuit is the client end of one region's UDP channel: sequence
//! numbering, reliable delivery with retransmission, ack piggybacking,
//! duplicate suppression, and the host security gate.
//!
//! The reliability rules live in [`ReliableState`], a pure state machine
//! that takes time as a parameter and never touches a socket. [`Circuit`]
//! is the driver around it: one task multiplexes the socket receive path
//! with a retransmission/ack-flush tick, and hands decoded messages to the
//! owning simulator over a channel. The channel closing is the circuit
//! death signal.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use metaverse_proto::{Encoding, Message, MessageTemplate, Packet, PacketFlags, SEQUENCE_MASK};
use tokio::{net::UdpSocket, sync::mpsc, task::AbortHandle, time::MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::error::CircuitError;

/// Initial retransmission threshold.
pub const DEFAULT_RETRANSMIT_INITIAL: Duration = Duration::from_secs(1);

/// Retransmission threshold cap for the exponential backoff.
pub const DEFAULT_RETRANSMIT_CAP: Duration = Duration::from_secs(8);

/// Total transmission attempts (initial send included) before the circuit
/// declares failure.
pub const DEFAULT_MAX_ATTEMPTS: u8 = 5;

/// How often the driver inspects the unacked table and flushes acks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Acks piggybacked onto one outbound datagram.
pub const DEFAULT_ACK_PIGGYBACK_LIMIT: usize = 250;

/// Inbound sequences remembered for duplicate suppression.
pub const DEFAULT_SEEN_WINDOW: usize = 1024;

/// Tunables for one circuit.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Threshold before the first retransmission.
    pub retransmit_initial: Duration,
    /// Backoff cap; thresholds double per attempt up to this.
    pub retransmit_cap: Duration,
    /// Transmission attempts before [`CircuitError::RetransmitExhausted`].
    pub max_attempts: u8,
    /// Driver tick period.
    pub tick_interval: Duration,
    /// Maximum acks appended to a normal outbound datagram.
    pub ack_piggyback_limit: usize,
    /// Duplicate-suppression window size.
    pub seen_window: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            retransmit_initial: DEFAULT_RETRANSMIT_INITIAL,
            retransmit_cap: DEFAULT_RETRANSMIT_CAP,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            ack_piggyback_limit: DEFAULT_ACK_PIGGYBACK_LIMIT,
            seen_window: DEFAULT_SEEN_WINDOW,
        }
    }
}

/// A reliable outbound datagram awaiting acknowledgement.
#[derive(Debug, Clone)]
struct UnackedPacket {
    datagram: Bytes,
    last_send: Instant,
    /// Transmissions so far, the initial send included.
    attempts: u8,
}

/// Disposition of an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// First sighting; dispatch it.
    Fresh,
    /// Replayed sequence; drop it.
    Duplicate,
}

/// Pure reliability state machine.
///
/// Time is passed into every method that needs it; no I/O, no clock reads.
/// One lock owner at a time, never held across an await.
pub(crate) struct ReliableState {
    config: CircuitConfig,
    sequence: u32,
    unacked: BTreeMap<u32, UnackedPacket>,
    pending_acks: VecDeque<u32>,
    seen: HashSet<u32>,
    seen_order: VecDeque<u32>,
    last_receive: Instant,
}

impl ReliableState {
    pub(crate) fn new(config: CircuitConfig, now: Instant) -> Self {
        Self {
            config,
            sequence: 0,
            unacked: BTreeMap::new(),
            pending_acks: VecDeque::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            last_receive: now,
        }
    }

    /// Allocate the next outbound sequence. Strictly increasing modulo
    /// 2^24, starting at 1.
    pub(crate) fn next_sequence(&mut self) -> u32 {
        self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
        self.sequence
    }

    /// Pop up to the configured limit of pending inbound acks for
    /// piggybacking, oldest first.
    pub(crate) fn take_piggyback_acks(&mut self) -> Vec<u32> {
        let take = self.pending_acks.len().min(self.config.ack_piggyback_limit);
        self.pending_acks.drain(..take).collect()
    }

    /// Drain every pending inbound ack for an explicit `PacketAck` flush.
    pub(crate) fn drain_pending_acks(&mut self) -> Vec<u32> {
        self.pending_acks.drain(..).collect()
    }

    /// Retain a reliable datagram until its sequence is acknowledged.
    pub(crate) fn register_reliable(&mut self, sequence: u32, datagram: Bytes, now: Instant) {
        self.unacked
            .insert(sequence, UnackedPacket { datagram, last_send: now, attempts: 1 });
    }

    /// Remove acknowledged sequences from the unacked table.
    pub(crate) fn acknowledge(&mut self, acks: &[u32]) {
        for ack in acks {
            if self.unacked.remove(ack).is_some() {
                trace!(sequence = ack, "acknowledged");
            }
        }
    }

    /// Process an inbound packet's transport effects: appended acks,
    /// freshness, duplicate suppression, and ack scheduling.
    ///
    /// Reliable packets are scheduled for acknowledgement even when they
    /// are duplicates - the peer resent because our ack was lost.
    pub(crate) fn accept(&mut self, packet: &Packet, now: Instant) -> Inbound {
        if !packet.acks.is_empty() {
            self.acknowledge(&packet.acks);
        }
        self.last_receive = now;

        if packet.flags.contains(PacketFlags::RELIABLE) {
            self.pending_acks.push_back(packet.sequence);
        }

        if !self.seen.insert(packet.sequence) {
            return Inbound::Duplicate;
        }
        self.seen_order.push_back(packet.sequence);
        while self.seen_order.len() > self.config.seen_window {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        Inbound::Fresh
    }

    /// Datagrams due for retransmission at `now`, with the RESENT flag
    /// set and attempt counters advanced.
    ///
    /// # Errors
    ///
    /// [`CircuitError::RetransmitExhausted`] once any entry has used all
    /// its attempts and is due again.
    pub(crate) fn due_retransmits(&mut self, now: Instant) -> Result<Vec<Bytes>, CircuitError> {
        let mut due = Vec::new();
        for (&sequence, entry) in &mut self.unacked {
            let threshold = retransmit_threshold(&self.config, entry.attempts);
            if now.duration_since(entry.last_send) < threshold {
                continue;
            }
            if entry.attempts >= self.config.max_attempts {
                return Err(CircuitError::RetransmitExhausted { sequence });
            }
            entry.attempts += 1;
            entry.last_send = now;
            let mut wire = entry.datagram.to_vec();
            wire[0] |= PacketFlags::RESENT;
            due.push(Bytes::from(wire));
        }
        Ok(due)
    }

    /// Oldest unacknowledged sequence, or 0 when the table is empty.
    /// Reported in `StartPingCheck`.
    pub(crate) fn oldest_unacked(&self) -> u32 {
        self.unacked.keys().next().copied().unwrap_or(0)
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    #[allow(dead_code, reason = "only exercised by in-module tests")]
    pub(crate) fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    pub(crate) fn last_receive(&self) -> Instant {
        self.last_receive
    }
}

/// Backoff schedule: `initial * 2^(attempts-1)`, capped.
fn retransmit_threshold(config: &CircuitConfig, attempts: u8) -> Duration {
    let shift = u32::from(attempts.saturating_sub(1)).min(6);
    config.retransmit_initial.saturating_mul(1 << shift).min(config.retransmit_cap)
}

fn lock(state: &Mutex<ReliableState>) -> MutexGuard<'_, ReliableState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The client end of one region's UDP channel.
///
/// Decoded, deduplicated inbound messages arrive on the receiver returned
/// by [`Circuit::connect`]; the channel closing means the circuit died
/// (failure or [`Circuit::close`]).
pub struct Circuit {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    template: &'static MessageTemplate,
    state: Arc<Mutex<ReliableState>>,
    driver: AbortHandle,
    closed: Arc<AtomicBool>,
}

impl Circuit {
    /// Bind an ephemeral local socket and start the driver task.
    pub async fn connect(
        remote: SocketAddr,
        template: &'static MessageTemplate,
        config: CircuitConfig,
    ) -> Result<(Self, mpsc::Receiver<Message>), CircuitError> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let state = Arc::new(Mutex::new(ReliableState::new(config.clone(), Instant::now())));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(128);

        let driver = tokio::spawn(drive(
            Arc::clone(&socket),
            remote,
            Arc::clone(&state),
            template,
            config,
            tx,
            Arc::clone(&closed),
        ));

        debug!(%remote, "circuit open");
        Ok((
            Self { remote, socket, template, state, driver: driver.abort_handle(), closed },
            rx,
        ))
    }

    /// The bound remote address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// The local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr, CircuitError> {
        Ok(self.socket.local_addr()?)
    }

    /// Encode and transmit a message.
    ///
    /// Assigns the next sequence, piggybacks pending acks, zerocodes when
    /// the spec permits and compression pays, and retains the datagram for
    /// retransmission when `reliable`.
    pub async fn send(&self, message: &Message, reliable: bool) -> Result<(), CircuitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CircuitError::Closed);
        }
        transmit(&self.socket, self.remote, &self.state, message, reliable).await
    }

    /// Remove explicitly acknowledged sequences (a `PacketAck` body) from
    /// the unacked table.
    pub fn acknowledge(&self, acks: &[u32]) {
        lock(&self.state).acknowledge(acks);
    }

    /// Reliable datagrams still awaiting acknowledgement.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        lock(&self.state).unacked_count()
    }

    /// Oldest unacknowledged outbound sequence, or 0.
    #[must_use]
    pub fn oldest_unacked(&self) -> u32 {
        lock(&self.state).oldest_unacked()
    }

    /// Instant of the last accepted inbound datagram.
    #[must_use]
    pub fn last_receive(&self) -> Instant {
        lock(&self.state).last_receive()
    }

    /// Whether the circuit has been closed or has failed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the driver and drop the reliability tables. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.driver.abort();
            debug!(remote = %self.remote, "circuit closed");
        }
    }

    /// The template this circuit encodes against.
    #[must_use]
    pub fn template(&self) -> &'static MessageTemplate {
        self.template
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared send path for callers and the driver's ack flush.
async fn transmit(
    socket: &UdpSocket,
    remote: SocketAddr,
    state: &Mutex<ReliableState>,
    message: &Message,
    reliable: bool,
) -> Result<(), CircuitError> {
    let body = message.encode()?;
    let zerocoded = message.spec().encoding == Encoding::Zerocoded;

    let wire = {
        let mut state = lock(state);
        let sequence = state.next_sequence();

        let mut flags = PacketFlags::default();
        if reliable {
            flags = flags.with(PacketFlags::RELIABLE);
        }
        if zerocoded {
            flags = flags.with(PacketFlags::ZEROCODED);
        }

        let mut packet = Packet::new(flags, sequence, body);
        packet.acks = state.take_piggyback_acks();
        let wire = packet.encode()?;
        if reliable {
            state.register_reliable(sequence, wire.clone(), Instant::now());
        }
        wire
    };

    socket.send_to(&wire, remote).await?;
    trace!(name = message.name(), reliable, "sent");
    Ok(())
}

/// Driver task: multiplex socket receive with the retransmit/ack tick.
///
/// Ends on consumer drop, socket error, or retransmission exhaustion;
/// dropping `tx` is the death signal the simulator observes.
async fn drive(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    state: Arc<Mutex<ReliableState>>,
    template: &'static MessageTemplate,
    config: CircuitConfig,
    tx: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 0x1_0000];
    let mut tick = tokio::time::interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, source) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%remote, %err, "socket receive failed");
                        break;
                    }
                };
                // Host gate: only the bound remote may speak on this circuit.
                if source != remote {
                    trace!(%source, "dropping datagram from unknown host");
                    continue;
                }
                let packet = match Packet::decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        debug!(%err, "dropping malformed datagram");
                        continue;
                    }
                };
                if lock(&state).accept(&packet, Instant::now()) == Inbound::Duplicate {
                    trace!(sequence = packet.sequence, "dropping duplicate");
                    continue;
                }
                let message = match Message::decode(template, &packet.body) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!(%err, "dropping undecodable message");
                        continue;
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            _ = tick.tick() => {
                if !tick_once(&socket, remote, &state, template).await {
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

/// One maintenance tick: retransmit due packets, flush pending acks as an
/// explicit `PacketAck`. Returns false when the circuit has failed.
async fn tick_once(
    socket: &UdpSocket,
    remote: SocketAddr,
    state: &Mutex<ReliableState>,
    template: &'static MessageTemplate,
) -> bool {
    let (resends, acks) = {
        let mut state = lock(state);
        match state.due_retransmits(Instant::now()) {
            Ok(resends) => (resends, state.drain_pending_acks()),
            Err(err) => {
                error!(%remote, %err, "circuit failed");
                return false;
            }
        }
    };

    for wire in resends {
        trace!(%remote, "retransmitting");
        if let Err(err) = socket.send_to(&wire, remote).await {
            warn!(%remote, %err, "retransmit send failed");
            return false;
        }
    }

    for chunk in acks.chunks(metaverse_proto::packet::MAX_APPENDED_ACKS) {
        match build_packet_ack(template, chunk) {
            Ok(message) => {
                if let Err(err) = transmit(socket, remote, state, &message, false).await {
                    warn!(%remote, %err, "ack flush failed");
                    return false;
                }
            }
            Err(err) => error!(%err, "could not build PacketAck"),
        }
    }
    true
}

fn build_packet_ack(
    template: &MessageTemplate,
    acks: &[u32],
) -> Result<Message, metaverse_proto::MessageError> {
    let mut message = template.message("PacketAck")?;
    for &ack in acks {
        let row = message.push_row("Packets")?;
        message.set_at("Packets", row, "ID", ack)?;
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(config: CircuitConfig) -> ReliableState {
        ReliableState::new(config, Instant::now())
    }

    fn packet(sequence: u32, reliable: bool) -> Packet {
        let flags = if reliable {
            PacketFlags::default().with(PacketFlags::RELIABLE)
        } else {
            PacketFlags::default()
        };
        Packet::new(flags, sequence, Bytes::from_static(&[1]))
    }

    #[test]
    fn sequences_increase_and_wrap() {
        let mut state = state_with(CircuitConfig::default());
        assert_eq!(state.next_sequence(), 1);
        assert_eq!(state.next_sequence(), 2);

        state.sequence = SEQUENCE_MASK - 1;
        assert_eq!(state.next_sequence(), SEQUENCE_MASK);
        assert_eq!(state.next_sequence(), 0);
        assert_eq!(state.next_sequence(), 1);
    }

    #[test]
    fn reliable_payload_retained_until_acked() {
        let mut state = state_with(CircuitConfig::default());
        let now = Instant::now();
        state.register_reliable(5, Bytes::from_static(b"abc"), now);
        assert_eq!(state.unacked_count(), 1);

        state.acknowledge(&[4]);
        assert_eq!(state.unacked_count(), 1);

        state.acknowledge(&[5]);
        assert_eq!(state.unacked_count(), 0);
    }

    #[test]
    fn duplicates_are_suppressed_but_still_acked() {
        let mut state = state_with(CircuitConfig::default());
        let now = Instant::now();
        assert_eq!(state.accept(&packet(7, true), now), Inbound::Fresh);
        assert_eq!(state.accept(&packet(7, true), now), Inbound::Duplicate);
        // Both sightings scheduled an ack; the peer resent because our
        // ack was lost.
        assert_eq!(state.pending_ack_count(), 2);
    }

    #[test]
    fn seen_window_evicts_oldest() {
        let config = CircuitConfig { seen_window: 4, ..CircuitConfig::default() };
        let mut state = state_with(config);
        let now = Instant::now();
        for sequence in 1..=5 {
            assert_eq!(state.accept(&packet(sequence, false), now), Inbound::Fresh);
        }
        // Sequence 1 fell out of the window and is treated as fresh again.
        assert_eq!(state.accept(&packet(1, false), now), Inbound::Fresh);
        // Sequence 5 is still within the window.
        assert_eq!(state.accept(&packet(5, false), now), Inbound::Duplicate);
    }

    #[test]
    fn appended_acks_clear_unacked_table() {
        let mut state = state_with(CircuitConfig::default());
        let now = Instant::now();
        state.register_reliable(3, Bytes::from_static(b"x"), now);

        let mut inbound = packet(9, false);
        inbound.acks = vec![3];
        state.accept(&inbound, now);
        assert_eq!(state.unacked_count(), 0);
    }

    #[test]
    fn piggyback_respects_limit_and_order() {
        let config = CircuitConfig { ack_piggyback_limit: 2, ..CircuitConfig::default() };
        let mut state = state_with(config);
        let now = Instant::now();
        for sequence in [7, 8, 9] {
            state.accept(&packet(sequence, true), now);
        }
        assert_eq!(state.take_piggyback_acks(), vec![7, 8]);
        assert_eq!(state.take_piggyback_acks(), vec![9]);
        assert!(state.take_piggyback_acks().is_empty());
    }

    #[test]
    fn retransmit_backoff_doubles_to_cap() {
        let config = CircuitConfig {
            retransmit_initial: Duration::from_secs(1),
            retransmit_cap: Duration::from_secs(8),
            ..CircuitConfig::default()
        };
        assert_eq!(retransmit_threshold(&config, 1), Duration::from_secs(1));
        assert_eq!(retransmit_threshold(&config, 2), Duration::from_secs(2));
        assert_eq!(retransmit_threshold(&config, 4), Duration::from_secs(8));
        assert_eq!(retransmit_threshold(&config, 7), Duration::from_secs(8));
    }

    #[test]
    fn due_retransmits_set_resent_and_fail_after_attempts() {
        let config = CircuitConfig {
            retransmit_initial: Duration::from_millis(10),
            retransmit_cap: Duration::from_millis(10),
            max_attempts: 2,
            ..CircuitConfig::default()
        };
        let mut state = ReliableState::new(config, Instant::now());
        let start = Instant::now();
        let datagram = Packet::new(
            PacketFlags::default().with(PacketFlags::RELIABLE),
            1,
            Bytes::from_static(&[0x42]),
        )
        .encode()
        .unwrap();
        state.register_reliable(1, datagram, start);

        let later = start + Duration::from_millis(20);
        let due = state.due_retransmits(later).unwrap();
        assert_eq!(due.len(), 1);
        assert!(PacketFlags::from_byte(due[0][0]).contains(PacketFlags::RESENT));

        let exhausted = start + Duration::from_millis(40);
        assert!(matches!(
            state.due_retransmits(exhausted),
            Err(CircuitError::RetransmitExhausted { sequence: 1 })
        ));
    }

    #[test]
    fn oldest_unacked_reports_lowest_sequence() {
        let mut state = state_with(CircuitConfig::default());
        let now = Instant::now();
        assert_eq!(state.oldest_unacked(), 0);
        state.register_reliable(9, Bytes::from_static(b"a"), now);
        state.register_reliable(4, Bytes::from_static(b"b"), now);
        assert_eq!(state.oldest_unacked(), 4);
    }
}
