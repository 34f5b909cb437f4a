//! Error types for the voice relay

use std::time::Duration;

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Responder error: {0}")]
    Responder(#[from] ResponderError),

    #[error("Stream failed: {0}")]
    Stream(#[from] StreamFailure),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection and session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoiceError {
    #[error("User must be in a voice channel, or a voice channel must be passed as an argument")]
    NoVoiceTarget,

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Not connected to a voice channel")]
    NotConnected,

    #[error("Failed to connect to the voice channel: {0}")]
    ConnectFailed(String),

    #[error("Timed out after {0:?} waiting for the voice transport")]
    Timeout(Duration),

    #[error("Previous stream is still running")]
    SessionBusy,

    #[error("Stream was not running")]
    NotActive,
}

/// Audio source errors (decoder process and capture device)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture stopped: {0}")]
    CaptureStopped(String),

    #[error("Failed to spawn decoder: {0}")]
    DecoderSpawn(String),

    #[error("Decoder exited with {0}")]
    DecoderExited(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Enumeration failed: {0}")]
    Enumeration(String),
}

/// Outbound voice transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),

    #[error("Transport closed")]
    Closed,
}

/// Errors reported by the command responder
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponderError {
    /// The original message can no longer be edited
    #[error("Responder context expired")]
    Expired,

    #[error("Failed to respond: {0}")]
    Failed(String),
}

/// Reason a stream session ended in failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamFailure {
    #[error("source failure: {0}")]
    Source(#[from] AudioError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("session task aborted")]
    Aborted,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
