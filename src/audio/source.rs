//! Pull-style PCM producers
//!
//! Both the decoder pipe and the loopback capture are exposed to the stream
//! session as an [`AudioSource`]: a sequence of s16le stereo 48kHz chunks
//! that ends with `Ok(None)`.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::audio::decoder::FileSource;
use crate::audio::loopback::LoopbackSource;
use crate::config::AppConfig;
use crate::error::AudioError;

/// A producer of raw PCM bytes
#[async_trait]
pub trait AudioSource: Send {
    /// Next chunk of PCM, or `None` at end of data.
    ///
    /// Must be cancel-safe: the session may drop the future when it is
    /// cancelled while waiting for data.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, AudioError>;

    /// Release the underlying process or device. Called on every exit path.
    async fn close(&mut self);

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Which source a stream session should open once it is admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Decode a file through the external decoder
    File(PathBuf),
    /// Capture the device at this enumeration index
    Loopback(usize),
}

impl SourceSpec {
    /// Open the process or device this describes
    pub async fn open(self, config: &AppConfig) -> Result<Box<dyn AudioSource>, AudioError> {
        match self {
            SourceSpec::File(path) => {
                let source = FileSource::spawn(&config.decoder.program, &path, config.audio.chunk_bytes)?;
                Ok(Box::new(source))
            }
            SourceSpec::Loopback(index) => {
                let source = tokio::task::spawn_blocking(move || LoopbackSource::open(index))
                    .await
                    .map_err(|e| AudioError::StreamError(e.to_string()))??;
                Ok(Box::new(source))
            }
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::File(path) => write!(f, "file {}", path.display()),
            SourceSpec::Loopback(index) => write!(f, "loopback device {}", index),
        }
    }
}

/// Opens sources for stream sessions
///
/// The connection manager goes through this seam so sessions can be driven
/// by in-memory sources in tests.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self, spec: SourceSpec) -> Result<Box<dyn AudioSource>, AudioError>;
}

/// Opens real decoder processes and capture devices
pub struct SystemSources {
    config: AppConfig,
}

impl SystemSources {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceFactory for SystemSources {
    async fn open(&self, spec: SourceSpec) -> Result<Box<dyn AudioSource>, AudioError> {
        spec.open(&self.config).await
    }
}
