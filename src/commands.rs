//! Command dispatch
//!
//! Maps inbound commands onto the connection manager and the presence
//! poller, and reports every outcome through the requester's [`Responder`].
//! Failures never propagate past this layer; they become messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::audio::device::{enumerate_devices, DeviceDescriptor};
use crate::config::AppConfig;
use crate::connection::{ConnectionManager, Requester, VoiceChannel};
use crate::error::VoiceError;
use crate::presence::{Responder, TrackPresence};
use crate::session::SessionId;

/// A parsed inbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Join the given channel, or the requester's own
    Join(Option<VoiceChannel>),
    Disconnect,
    /// Stream loopback capture of the configured device
    Stream,
    Stop,
    NowPlaying,
    /// Stream a file through the decoder
    Play(PathBuf),
    Devices,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown command {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl Command {
    /// Parse a command line such as `play ~/music/song.flac` or `join 42 Music`
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (name, args) = match line.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (line, ""),
        };

        match name {
            "join" if args.is_empty() => Ok(Command::Join(None)),
            "join" => {
                let (id, channel) = args
                    .split_once(char::is_whitespace)
                    .ok_or(ParseError::Usage("join [<channel id> <channel name>]"))?;
                let id = id
                    .parse()
                    .map_err(|_| ParseError::Usage("join [<channel id> <channel name>]"))?;
                Ok(Command::Join(Some(VoiceChannel::new(id, channel.trim()))))
            }
            "disconnect" => Ok(Command::Disconnect),
            "stream" => Ok(Command::Stream),
            "stop" => Ok(Command::Stop),
            "now-playing" => Ok(Command::NowPlaying),
            "play" if args.is_empty() => Err(ParseError::Usage("play <path>")),
            "play" => Ok(Command::Play(PathBuf::from(args))),
            "devices" => Ok(Command::Devices),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

/// One line per device: `"<index>: <flow> | <friendly> | <endpoint> | <state>"`
pub fn device_listing(devices: &[DeviceDescriptor]) -> String {
    devices
        .iter()
        .map(|device| format!("{}: {}", device.index, device))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Routes commands to the voice core
pub struct CommandRouter {
    connections: Arc<ConnectionManager>,
    presence: Arc<TrackPresence>,
    config: AppConfig,
    /// Start waiting for the voice transport
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl CommandRouter {
    pub fn new(connections: Arc<ConnectionManager>, presence: Arc<TrackPresence>, config: AppConfig) -> Self {
        Self {
            connections,
            presence,
            config,
            pending: Mutex::new(None),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn presence(&self) -> &Arc<TrackPresence> {
        &self.presence
    }

    /// Parse `line` and handle it, answering unknown commands with a warning
    pub async fn dispatch(&self, line: &str, requester: &Requester, responder: Arc<dyn Responder>) {
        match Command::parse(line) {
            Ok(command) => self.handle(command, requester, responder).await,
            Err(e) => {
                tracing::warn!(requester = %requester.name, "{}", e);
                reply(responder.as_ref(), &e.to_string(), true).await;
            }
        }
    }

    pub async fn handle(&self, command: Command, requester: &Requester, responder: Arc<dyn Responder>) {
        tracing::debug!(requester = %requester.name, ?command, "handling command");
        match command {
            Command::Join(target) => self.join(requester, target, responder.as_ref()).await,
            Command::Disconnect => {
                self.shutdown().await;
                reply(responder.as_ref(), "Disconnected", false).await;
            }
            Command::Stream => {
                let index = self.config.audio.device_index;
                self.start_when_ready(responder, "Starting stream".to_string(), move |c| {
                    c.start_stream(index)
                })
                .await
            }
            Command::Play(path) => {
                let message = format!("Playing {}", path.display());
                self.start_when_ready(responder, message, move |c| c.start_file(path))
                    .await
            }
            Command::Stop => {
                let cancelled = self.cancel_pending();
                let stopped = self.connections.stop() || cancelled;
                self.presence.stop().await;
                if stopped {
                    reply(responder.as_ref(), "Stopping stream", false).await;
                } else {
                    let message = format!("Failed to stop stream: {}", VoiceError::NotActive);
                    reply(responder.as_ref(), &message, true).await;
                }
            }
            Command::NowPlaying => match self.presence.start(responder.clone()).await {
                Ok(true) => {}
                Ok(false) => reply(responder.as_ref(), "Nothing is playing", true).await,
                Err(e) => tracing::warn!("Failed to announce now playing: {}", e),
            },
            Command::Devices => match enumerate_devices().await {
                Ok(devices) if devices.is_empty() => {
                    reply(responder.as_ref(), "No audio devices found", true).await
                }
                Ok(devices) => reply(responder.as_ref(), &device_listing(&devices), true).await,
                Err(e) => {
                    tracing::error!("Failed to enumerate devices: {}", e);
                    let message = format!("Failed to list devices: {}", e);
                    reply(responder.as_ref(), &message, true).await;
                }
            },
        }
    }

    /// Stop streaming and presence, then leave the voice channel
    pub async fn shutdown(&self) {
        self.cancel_pending();
        self.connections.stop();
        self.presence.stop().await;
        self.connections.disconnect().await;
    }

    async fn join(&self, requester: &Requester, target: Option<VoiceChannel>, responder: &dyn Responder) {
        match self.connections.join(requester, target) {
            Ok(channel) => reply(responder, &format!("Joined {}", channel.name), false).await,
            Err(e) => reply(responder, &e.to_string(), true).await,
        }
    }

    /// Wait for the voice transport on a background task, then start.
    ///
    /// Only one start may be waiting at a time; `stop` and `disconnect`
    /// abort a waiting start.
    async fn start_when_ready<F>(&self, responder: Arc<dyn Responder>, started: String, start: F)
    where
        F: FnOnce(&ConnectionManager) -> Result<SessionId, VoiceError> + Send + 'static,
    {
        let admitted = {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|task| !task.is_finished()) {
                false
            } else {
                *pending = Some(tokio::spawn(start_when_ready(
                    self.connections.clone(),
                    self.config.voice.ready_timeout(),
                    responder.clone(),
                    started,
                    start,
                )));
                true
            }
        };

        if !admitted {
            tracing::warn!("a start is already waiting for the voice connection");
            let message = format!("Failed to start stream: {}", VoiceError::SessionBusy);
            reply(responder.as_ref(), &message, true).await;
        }
    }

    /// Abort a start still waiting for the transport. Returns true if one was.
    fn cancel_pending(&self) -> bool {
        match self.pending.lock().take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                tracing::info!("pending start cancelled");
                true
            }
            _ => false,
        }
    }

    /// Wait for a pending start to reply
    #[cfg(test)]
    async fn settle(&self) {
        let task = self.pending.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn start_when_ready<F>(
    connections: Arc<ConnectionManager>,
    timeout: Duration,
    responder: Arc<dyn Responder>,
    started: String,
    start: F,
) where
    F: FnOnce(&ConnectionManager) -> Result<SessionId, VoiceError>,
{
    if let Err(e) = connections.ensure_ready(timeout).await {
        let message = match e {
            VoiceError::Timeout(_) => "Voice connection is not ready yet".to_string(),
            other => format!("Failed to start stream: {}", other),
        };
        reply(responder.as_ref(), &message, true).await;
        return;
    }

    match start(connections.as_ref()) {
        Ok(_) => reply(responder.as_ref(), &started, false).await,
        Err(e) => {
            let message = format!("Failed to start stream: {}", e);
            reply(responder.as_ref(), &message, true).await
        }
    }
}

async fn reply(responder: &dyn Responder, text: &str, ephemeral: bool) {
    if let Err(e) = responder.respond(text, ephemeral).await {
        tracing::warn!("Failed to respond: {}", e);
    }
}
