//! Scripted fake simulator for exercising the session engine over real
//! loopback sockets.

// Shared across test targets; not every target uses every helper.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use metaverse_proto::{Message, MessageTemplate, Packet, PacketFlags};
use tokio::net::UdpSocket;

/// How long a scripted peer waits for the client before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A fake region endpoint: one UDP socket plus the shared template.
pub struct FakeSim {
    socket: UdpSocket,
    sequence: AtomicU32,
    template: &'static MessageTemplate,
}

/// One datagram received from the client under test.
pub struct Received {
    pub source: SocketAddr,
    pub packet: Packet,
    pub message: Message,
}

impl FakeSim {
    pub async fn bind() -> Self {
        init_tracing();
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake simulator");
        Self { socket, sequence: AtomicU32::new(0), template: MessageTemplate::shared() }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("local addr")
    }

    pub fn template(&self) -> &'static MessageTemplate {
        self.template
    }

    /// Receive and decode the next datagram.
    pub async fn recv(&self) -> Received {
        let mut buf = vec![0u8; 0x1_0000];
        let (len, source) = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for client datagram")
            .expect("recv");
        let packet = Packet::decode(&buf[..len]).expect("packet decodes");
        let message = Message::decode(self.template, &packet.body).expect("message decodes");
        Received { source, packet, message }
    }

    /// Receive until a message with `name` arrives, skipping transport
    /// chatter (acks, retransmissions of already-seen names).
    pub async fn recv_named(&self, name: &str) -> Received {
        for _ in 0..32 {
            let received = self.recv().await;
            if received.message.name() == name {
                return received;
            }
        }
        panic!("never received {name}");
    }

    /// Receive with a short deadline; `None` when the client stays
    /// silent.
    pub async fn try_recv(&self, deadline: Duration) -> Option<Received> {
        let mut buf = vec![0u8; 0x1_0000];
        let received = tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await;
        let (len, source) = received.ok()?.expect("recv");
        let packet = Packet::decode(&buf[..len]).expect("packet decodes");
        let message = Message::decode(self.template, &packet.body).expect("message decodes");
        Some(Received { source, packet, message })
    }

    /// Send `message` to the client at `to`, with our own sequence
    /// numbering.
    pub async fn send(&self, to: SocketAddr, message: &Message, reliable: bool) -> u32 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.send_with_sequence(to, message, reliable, sequence).await;
        sequence
    }

    /// Send with an explicit sequence (for duplicate/ack scripting).
    pub async fn send_with_sequence(
        &self,
        to: SocketAddr,
        message: &Message,
        reliable: bool,
        sequence: u32,
    ) {
        let mut flags = PacketFlags::default();
        if reliable {
            flags = flags.with(PacketFlags::RELIABLE);
        }
        let packet = Packet::new(flags, sequence, message.encode().expect("encode"));
        self.send_packet(to, &packet).await;
    }

    /// Send a pre-built packet (appended acks and all).
    pub async fn send_packet(&self, to: SocketAddr, packet: &Packet) {
        let wire = packet.encode().expect("encode packet");
        self.socket.send_to(&wire, to).await.expect("send");
    }
}

/// A minimal message for payload-free traffic.
pub fn probe_message() -> Message {
    MessageTemplate::shared().message("CloseCircuit").expect("known message")
}

/// Route library logs through `RUST_LOG` during tests.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
