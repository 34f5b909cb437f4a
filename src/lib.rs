//! # Voice Relay
//!
//! Relays audio into a chat voice channel, either from a file decoded by an
//! external process or from a live system loopback capture, and keeps a
//! "now playing" message in sync with a media player's window title.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  CommandRouter (commands)                            │
//! │   join / disconnect / stream / play / stop / now-playing / devices   │
//! └───────┬─────────────────────────────────────────────┬────────────────┘
//!         │                                             │
//!         ▼                                             ▼
//! ┌───────────────────────────────┐         ┌───────────────────────────┐
//! │ ConnectionManager (connection)│         │ TrackPresence (presence)  │
//! │  Disconnected → Connecting    │         │  poll window title (5s)   │
//! │    → Connected → Disconnected │         │  edit message on change   │
//! │  single-flight StreamSession  │         └─────────────┬─────────────┘
//! └───────┬───────────────────────┘                       │
//!         │ start                                         ▼
//!         ▼                                       ┌───────────────┐
//! ┌───────────────────────────────────────────┐   │ WindowSource  │
//! │          StreamSession (session)          │   └───────────────┘
//! │                                           │
//! │  ┌─────────────┐  chunk   ┌────────────┐  │
//! │  │ AudioSource │ ───────▶ │  PcmSink   │  │
//! │  │ ffmpeg pipe │          │ (transport)│  │
//! │  │ or loopback │          └─────┬──────┘  │
//! │  └─────────────┘                │         │
//! └─────────────────────────────────┼─────────┘
//!                                   ▼
//!                      ┌───────────────────────┐
//!                      │ Voice bridge (UDP)    │
//!                      └───────────────────────┘
//! ```

pub mod audio;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Output sample rate expected by the voice transport
    pub const SAMPLE_RATE: u32 = 48000;

    /// Output channel count (stereo)
    pub const CHANNELS: u16 = 2;

    /// Bytes per interleaved stereo s16le frame
    pub const BYTES_PER_FRAME: usize = 4;

    /// Real-time PCM byte rate
    pub const BYTES_PER_SECOND: usize = SAMPLE_RATE as usize * BYTES_PER_FRAME;

    /// Default read size for the decoder pipe (20ms of audio)
    pub const DEFAULT_CHUNK_BYTES: usize = 3840;

    /// Interval between transport readiness checks
    pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Upper bound on waiting for the transport to come up
    pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Interval at which capture state is supervised
    pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Interval between window title polls
    pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Largest PCM payload carried by one datagram (whole frames only)
    pub const MAX_PCM_PAYLOAD: usize = 1280;
}
