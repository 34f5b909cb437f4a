//! Application configuration
//!
//! Loaded from a TOML file. Every field has a default, so a missing file or
//! a partial file both produce a usable configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CHUNK_BYTES, PRESENCE_POLL_INTERVAL, READY_POLL_INTERVAL, READY_TIMEOUT,
};
use crate::connection::VoiceChannel;
use crate::error::Error;
use crate::presence::{Truncation, WindowDescriptor};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub decoder: DecoderConfig,
    pub voice: VoiceConfig,
    pub presence: PresenceConfig,
}

/// Capture and chunking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Index into the device list printed by `relay devices`
    pub device_index: usize,
    /// Bytes read from the decoder pipe per chunk
    pub chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

/// External decoder process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub program: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

/// Voice connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Address of the voice bridge receiving PCM datagrams
    pub bridge_addr: SocketAddr,
    pub ready_timeout_secs: u64,
    pub ready_poll_ms: u64,
    /// Channel joined when the requester has no voice location of its own
    pub channel: Option<ChannelConfig>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            bridge_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            ready_timeout_secs: READY_TIMEOUT.as_secs(),
            ready_poll_ms: READY_POLL_INTERVAL.as_millis() as u64,
            channel: None,
        }
    }
}

impl VoiceConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }
}

/// A configured voice channel target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u64,
    pub name: String,
}

impl From<ChannelConfig> for VoiceChannel {
    fn from(config: ChannelConfig) -> Self {
        VoiceChannel::new(config.id, config.name)
    }
}

/// "Now playing" window settings
///
/// Common player setups:
/// - `"foobar2000"`, `end`, 12 (20 for the portable build)
/// - `"Google Chrome"`, `end`, 16
/// - `"Mozilla Firefox"`, `end`, 18
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub partial_title: String,
    pub truncation: Truncation,
    pub truncate_count: usize,
    pub poll_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            partial_title: "foobar2000".to_string(),
            truncation: Truncation::End,
            truncate_count: 12,
            poll_interval_secs: PRESENCE_POLL_INTERVAL.as_secs(),
        }
    }
}

impl PresenceConfig {
    pub fn window(&self) -> WindowDescriptor {
        WindowDescriptor::new(
            self.partial_title.clone(),
            self.truncation,
            self.truncate_count,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl AppConfig {
    /// Default config file location, e.g. `~/.config/voice-relay/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "voice-relay").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file at an explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let config = Self::from_toml(&contents)?;
                tracing::info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.audio.chunk_bytes == 0 {
            return Err(Error::Config("audio.chunk_bytes must be positive".into()));
        }
        if self.decoder.program.trim().is_empty() {
            return Err(Error::Config("decoder.program must not be empty".into()));
        }
        if self.voice.ready_poll_ms == 0 {
            return Err(Error::Config("voice.ready_poll_ms must be positive".into()));
        }
        if self.presence.poll_interval_secs == 0 {
            return Err(Error::Config("presence.poll_interval_secs must be positive".into()));
        }
        Ok(())
    }
}
