//! UDP transport to a local voice bridge
//!
//! The bridge process owns the chat platform's voice connection; this side
//! frames control messages and PCM into datagrams and paces PCM at real-time
//! rate.
//!
//! Datagram layout:
//!
//! ```text
//! ┌──────┬──────┬──────────────┬─────────────┐
//! │ "VR" │ kind │ sequence u32 │ payload     │
//! │ 2B   │ 1B   │ big endian   │ ≤ 1280B     │
//! └──────┴──────┴──────────────┴─────────────┘
//! ```

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::connection::VoiceChannel;
use crate::constants::{BYTES_PER_SECOND, MAX_PACKET_SIZE, MAX_PCM_PAYLOAD};
use crate::error::TransportError;
use crate::transport::{PcmSink, VoiceGateway, VoiceTransport};

const MAGIC: [u8; 2] = *b"VR";
const HEADER_SIZE: usize = 7;
const SEND_BUFFER_SIZE: usize = 256 * 1024;

/// How far the sink may fall behind real time before the pacing clock resets
const MAX_PACING_LAG: Duration = Duration::from_millis(200);

/// Datagram kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Join = 1,
    Leave = 2,
    Speaking = 3,
    Pcm = 4,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Join),
            2 => Some(Self::Leave),
            3 => Some(Self::Speaking),
            4 => Some(Self::Pcm),
            _ => None,
        }
    }
}

/// Build one datagram
pub fn encode_packet(kind: PacketKind, sequence: u32, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    packet.put_slice(&MAGIC);
    packet.put_u8(kind as u8);
    packet.put_u32(sequence);
    packet.put_slice(payload);
    packet.freeze()
}

/// Split a datagram into kind, sequence and payload
pub fn parse_packet(packet: &[u8]) -> Option<(PacketKind, u32, &[u8])> {
    if packet.len() < HEADER_SIZE || packet[..2] != MAGIC {
        return None;
    }
    let kind = PacketKind::from_u8(packet[2])?;
    let sequence = u32::from_be_bytes([packet[3], packet[4], packet[5], packet[6]]);
    Some((kind, sequence, &packet[HEADER_SIZE..]))
}

fn create_socket(bridge: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(bridge), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;

    let bind: SocketAddr = if bridge.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

/// Connects to channels through the voice bridge
pub struct UdpGateway {
    bridge: SocketAddr,
}

impl UdpGateway {
    pub fn new(bridge: SocketAddr) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl VoiceGateway for UdpGateway {
    async fn connect(&self, channel: &VoiceChannel) -> Result<Arc<dyn VoiceTransport>, TransportError> {
        let socket = create_socket(self.bridge)
            .and_then(UdpSocket::from_std)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        socket
            .connect(self.bridge)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let transport = UdpTransport {
            socket: Arc::new(socket),
            sequence: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        transport
            .send(PacketKind::Join, &channel.id.to_be_bytes())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tracing::info!(channel = %channel.name, bridge = %self.bridge, "voice bridge joined");
        Ok(Arc::new(transport))
    }
}

/// A joined voice channel on the bridge
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    sequence: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

impl UdpTransport {
    async fn send(&self, kind: PacketKind, payload: &[u8]) -> Result<(), TransportError> {
        send_packet(&self.socket, &self.sequence, &self.closed, kind, payload).await
    }
}

async fn send_packet(
    socket: &UdpSocket,
    sequence: &AtomicU32,
    closed: &AtomicBool,
    kind: PacketKind,
    payload: &[u8],
) -> Result<(), TransportError> {
    if closed.load(Ordering::SeqCst) {
        return Err(TransportError::Closed);
    }
    let seq = sequence.fetch_add(1, Ordering::Relaxed);
    let packet = encode_packet(kind, seq, payload);
    debug_assert!(packet.len() <= MAX_PACKET_SIZE);
    socket
        .send(&packet)
        .await
        .map(|_| ())
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[async_trait]
impl VoiceTransport for UdpTransport {
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
        self.send(PacketKind::Speaking, &[speaking as u8]).await
    }

    async fn open_pcm_stream(&self) -> Result<Box<dyn PcmSink>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(UdpSink {
            socket: self.socket.clone(),
            sequence: self.sequence.clone(),
            closed: self.closed.clone(),
            pending: BytesMut::with_capacity(MAX_PCM_PAYLOAD * 4),
            pacer: Pacer::default(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.send(PacketKind::Leave, &[]).await;
        self.closed.store(true, Ordering::SeqCst);
        result
    }
}

/// Real-time pacing for outgoing PCM
#[derive(Default)]
struct Pacer {
    started: Option<Instant>,
    sent_bytes: u64,
}

impl Pacer {
    /// Wait until `len` more bytes may be sent
    async fn wait(&mut self, len: usize) {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        let due = started + Duration::from_secs_f64(self.sent_bytes as f64 / BYTES_PER_SECOND as f64);

        if now > due + MAX_PACING_LAG {
            // fell behind (e.g. silence from the capture device), restart the clock
            self.started = Some(now);
            self.sent_bytes = 0;
        } else if due > now {
            tokio::time::sleep_until(due).await;
        }
        self.sent_bytes += len as u64;
    }
}

/// PCM sink splitting audio into paced datagrams
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    sequence: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    pending: BytesMut,
    pacer: Pacer,
}

impl UdpSink {
    async fn send_pcm(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.pacer.wait(payload.len()).await;
        send_packet(&self.socket, &self.sequence, &self.closed, PacketKind::Pcm, payload).await
    }
}

#[async_trait]
impl PcmSink for UdpSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), TransportError> {
        self.pending.extend_from_slice(pcm);
        while self.pending.len() >= MAX_PCM_PAYLOAD {
            let payload = self.pending.split_to(MAX_PCM_PAYLOAD);
            self.send_pcm(&payload).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let payload = self.pending.split();
        self.send_pcm(&payload)
            .await
            .map_err(|e| TransportError::FlushFailed(e.to_string()))
    }
}
