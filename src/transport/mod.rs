//! Outbound voice transport
//!
//! The chat platform's voice stack sits behind these traits. A gateway
//! establishes a connection to a channel and hands back a transport; the
//! transport toggles speaking state and opens PCM sinks.

pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::VoiceChannel;
use crate::error::TransportError;

pub use udp::{UdpGateway, UdpTransport};

/// Sink accepting s16le stereo 48kHz PCM
#[async_trait]
pub trait PcmSink: Send {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), TransportError>;

    /// Push out any partially buffered frame
    async fn flush(&mut self) -> Result<(), TransportError>;
}

/// A live voice connection
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError>;

    async fn open_pcm_stream(&self) -> Result<Box<dyn PcmSink>, TransportError>;

    /// Leave the channel and release the connection
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Establishes voice connections
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn connect(&self, channel: &VoiceChannel) -> Result<Arc<dyn VoiceTransport>, TransportError>;
}
