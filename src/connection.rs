//! Voice connection lifecycle
//!
//! The [`ConnectionManager`] owns the single voice [`Connection`] of the
//! process and the stream session running on it.
//!
//! ```text
//!   join ──▶ Connecting ──(gateway ready)──▶ Connected
//!     ▲          │                              │
//!     │    (connect failed)                 disconnect
//!     │          ▼                              ▼
//!     └──── Disconnected ◀──────────────────────┘
//! ```
//!
//! Joining returns as soon as the target channel is resolved; the gateway
//! connection is established on a background task whose handle is kept so
//! a disconnect can abort it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::source::{SourceFactory, SourceSpec};
use crate::constants::READY_POLL_INTERVAL;
use crate::error::VoiceError;
use crate::session::{SessionCompletion, SessionId, SessionState, StreamSession};
use crate::transport::{VoiceGateway, VoiceTransport};

/// A voice-capable channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChannel {
    pub id: u64,
    pub name: String,
}

impl VoiceChannel {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for VoiceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// The user issuing a command and the voice channel they are sitting in
#[derive(Debug, Clone, Default)]
pub struct Requester {
    pub name: String,
    pub voice_channel: Option<VoiceChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The live voice connection
struct Connection {
    channel: VoiceChannel,
    state: ConnectionState,
    transport: Option<Arc<dyn VoiceTransport>>,
    connect_task: Option<JoinHandle<()>>,
    /// Distinguishes this connection from earlier ones still finishing up
    generation: u64,
}

/// Owns the voice connection and enforces one stream session at a time
pub struct ConnectionManager {
    gateway: Arc<dyn VoiceGateway>,
    sources: Arc<dyn SourceFactory>,
    connection: Arc<Mutex<Option<Connection>>>,
    /// Why the most recent join failed to connect
    connect_failure: Arc<Mutex<Option<String>>>,
    session: Mutex<Option<StreamSession>>,
    generation: AtomicU64,
    poll_interval: Duration,
}

impl ConnectionManager {
    pub fn new(gateway: Arc<dyn VoiceGateway>, sources: Arc<dyn SourceFactory>) -> Self {
        Self {
            gateway,
            sources,
            connection: Arc::new(Mutex::new(None)),
            connect_failure: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            poll_interval: READY_POLL_INTERVAL,
        }
    }

    /// Interval between readiness checks in [`ensure_ready`](Self::ensure_ready)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Resolve the target channel and start connecting to it.
    ///
    /// `target` wins over the requester's own voice channel. Returns the
    /// resolved channel without waiting for the connection. Joining while a
    /// connection exists is rejected; disconnect first.
    pub fn join(
        &self,
        requester: &Requester,
        target: Option<VoiceChannel>,
    ) -> Result<VoiceChannel, VoiceError> {
        let channel = target
            .or_else(|| requester.voice_channel.clone())
            .ok_or_else(|| {
                tracing::info!(requester = %requester.name, "{}", VoiceError::NoVoiceTarget);
                VoiceError::NoVoiceTarget
            })?;

        let mut guard = self.connection.lock();
        if let Some(existing) = guard.as_ref() {
            tracing::warn!(
                current = %existing.channel,
                requested = %channel,
                "join rejected, already connected"
            );
            return Err(VoiceError::AlreadyConnected(existing.channel.name.clone()));
        }

        self.connect_failure.lock().take();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let connect_task = tokio::spawn(connect(
            self.gateway.clone(),
            self.connection.clone(),
            self.connect_failure.clone(),
            channel.clone(),
            generation,
        ));

        *guard = Some(Connection {
            channel: channel.clone(),
            state: ConnectionState::Connecting,
            transport: None,
            connect_task: Some(connect_task),
            generation,
        });

        tracing::info!(channel = %channel, "joining voice channel");
        Ok(channel)
    }

    /// Wait until the transport is available, polling every poll interval.
    ///
    /// Fails fast with `NotConnected` when no connection exists, with
    /// `ConnectFailed` when the last join could not connect, and with
    /// `Timeout` once `timeout` has elapsed.
    pub async fn ensure_ready(&self, timeout: Duration) -> Result<Arc<dyn VoiceTransport>, VoiceError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.transport_or_state() {
                Ok(transport) => {
                    tracing::info!("voice transport is alive");
                    return Ok(transport);
                }
                Err(ConnectionState::Disconnected) => {
                    return Err(self
                        .connect_failure
                        .lock()
                        .clone()
                        .map_or(VoiceError::NotConnected, VoiceError::ConnectFailed));
                }
                Err(_) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!("timed out after {:?} waiting for voice transport", timeout);
                return Err(VoiceError::Timeout(timeout));
            }

            tracing::debug!("voice transport not ready yet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Start a session streaming `spec`, unless one is still running
    pub fn start(&self, spec: SourceSpec) -> Result<SessionId, VoiceError> {
        let transport = self.transport().ok_or(VoiceError::NotConnected)?;

        let mut session = self.session.lock();
        if let Some(active) = session.as_ref() {
            if !active.is_finished() {
                tracing::warn!(
                    session = %active.id(),
                    rejected = %spec,
                    "previous stream was incomplete"
                );
                return Err(VoiceError::SessionBusy);
            }
        }

        let started = StreamSession::start(spec, self.sources.clone(), transport);
        let id = started.id();
        *session = Some(started);
        Ok(id)
    }

    /// Stream a file through the decoder
    pub fn start_file(&self, path: impl Into<PathBuf>) -> Result<SessionId, VoiceError> {
        self.start(SourceSpec::File(path.into()))
    }

    /// Stream loopback capture of the device at `device_index`
    pub fn start_stream(&self, device_index: usize) -> Result<SessionId, VoiceError> {
        self.start(SourceSpec::Loopback(device_index))
    }

    /// Cancel the running session. Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let session = self.session.lock();
        match session.as_ref() {
            Some(active) if active.stop() => {
                tracing::info!(session = %active.id(), "stopping stream");
                true
            }
            _ => {
                tracing::info!("{}", VoiceError::NotActive);
                false
            }
        }
    }

    /// Stop any session, then release the transport and forget the connection.
    ///
    /// Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.connect_failure.lock().take();
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.stop();
            let id = session.id();
            let state = session.join().await;
            tracing::debug!(session = %id, ?state, "session joined on disconnect");
        }

        let connection = self.connection.lock().take();
        let Some(mut connection) = connection else {
            return;
        };

        if let Some(task) = connection.connect_task.take() {
            task.abort();
        }
        if let Some(transport) = connection.transport.take() {
            if let Err(e) = transport.disconnect().await {
                tracing::warn!(channel = %connection.channel, "transport disconnect failed: {}", e);
            }
        }
        tracing::info!(channel = %connection.channel, "disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state)
    }

    pub fn channel(&self) -> Option<VoiceChannel> {
        self.connection.lock().as_ref().map(|c| c.channel.clone())
    }

    pub fn transport(&self) -> Option<Arc<dyn VoiceTransport>> {
        self.transport_or_state().ok()
    }

    fn transport_or_state(&self) -> Result<Arc<dyn VoiceTransport>, ConnectionState> {
        match self.connection.lock().as_ref() {
            Some(c) => c.transport.clone().ok_or(c.state),
            None => Err(ConnectionState::Disconnected),
        }
    }

    /// True while a session's pipeline task is running
    pub fn is_streaming(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }

    /// State of the current (or last) session
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.lock().as_ref().map(StreamSession::state)
    }

    /// Completion handle for the current (or last) session
    pub fn session_completion(&self) -> Option<SessionCompletion> {
        self.session.lock().as_ref().map(StreamSession::completion)
    }
}

/// Background connect for one join request
async fn connect(
    gateway: Arc<dyn VoiceGateway>,
    connection: Arc<Mutex<Option<Connection>>>,
    connect_failure: Arc<Mutex<Option<String>>>,
    channel: VoiceChannel,
    generation: u64,
) {
    match gateway.connect(&channel).await {
        Ok(transport) => {
            let mut transport = Some(transport);
            {
                let mut guard = connection.lock();
                if let Some(current) = guard.as_mut().filter(|c| c.generation == generation) {
                    current.transport = transport.take();
                    current.state = ConnectionState::Connected;
                    current.connect_task = None;
                    tracing::info!(channel = %channel, "voice connection ready");
                }
            }
            // The join was abandoned while connecting
            if let Some(stale) = transport {
                let _ = stale.disconnect().await;
            }
        }
        Err(e) => {
            tracing::error!(channel = %channel, "failed to connect: {}", e);
            let mut guard = connection.lock();
            if guard.as_ref().is_some_and(|c| c.generation == generation) {
                *guard = None;
                *connect_failure.lock() = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::testing::{Ending, FakeGateway, FakeSources, FakeTransport, TransportEvent};
    use bytes::Bytes;

    fn requester_in(channel: Option<VoiceChannel>) -> Requester {
        Requester {
            name: "tester".into(),
            voice_channel: channel,
        }
    }

    fn music() -> VoiceChannel {
        VoiceChannel::new(1, "Music")
    }

    fn manager(gateway: Arc<FakeGateway>, sources: Arc<FakeSources>) -> ConnectionManager {
        ConnectionManager::new(gateway, sources)
    }

    async fn connected(ending: Ending) -> (ConnectionManager, Arc<FakeTransport>, Arc<FakeSources>) {
        let gateway = FakeGateway::new(Duration::ZERO);
        let sources = FakeSources::new(vec![Bytes::from_static(b"pcm!")], ending);
        let manager = manager(gateway.clone(), sources.clone());
        manager.join(&requester_in(Some(music())), None).unwrap();
        manager.ensure_ready(Duration::from_secs(10)).await.unwrap();
        (manager, gateway.transport(), sources)
    }

    #[tokio::test]
    async fn test_join_without_target_fails() {
        let gateway = FakeGateway::new(Duration::ZERO);
        let manager = manager(gateway.clone(), FakeSources::new(vec![], Ending::Eof));

        let result = manager.join(&requester_in(None), None);
        assert_eq!(result, Err(VoiceError::NoVoiceTarget));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(gateway.connects().is_empty());
    }

    #[tokio::test]
    async fn test_join_prefers_explicit_target() {
        let gateway = FakeGateway::new(Duration::ZERO);
        let manager = manager(gateway.clone(), FakeSources::new(vec![], Ending::Eof));

        let lobby = VoiceChannel::new(2, "Lobby");
        let joined = manager.join(&requester_in(Some(music())), Some(lobby.clone())).unwrap();
        assert_eq!(joined, lobby);

        manager.ensure_ready(Duration::from_secs(10)).await.unwrap();
        assert_eq!(gateway.connects(), vec![lobby]);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_returns_before_connection() {
        let gateway = FakeGateway::new(Duration::from_secs(3));
        let manager = manager(gateway, FakeSources::new(vec![], Ending::Eof));

        let channel = manager.join(&requester_in(Some(music())), None).unwrap();
        assert_eq!(channel.name, "Music");
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(manager.transport().is_none());
    }

    #[tokio::test]
    async fn test_rejoin_is_rejected() {
        let (manager, _, _) = connected(Ending::Eof).await;
        let result = manager.join(&requester_in(Some(VoiceChannel::new(2, "Lobby"))), None);
        assert_eq!(result, Err(VoiceError::AlreadyConnected("Music".into())));
        assert_eq!(manager.channel(), Some(music()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_ready_after_three_seconds() {
        let gateway = FakeGateway::new(Duration::from_secs(3));
        let manager = manager(gateway, FakeSources::new(vec![], Ending::Eof));
        manager.join(&requester_in(Some(music())), None).unwrap();

        let start = Instant::now();
        manager.ensure_ready(Duration::from_secs(10)).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_ready_times_out() {
        let gateway = FakeGateway::new(Duration::from_secs(3600));
        let manager = manager(gateway, FakeSources::new(vec![], Ending::Eof));
        manager.join(&requester_in(Some(music())), None).unwrap();

        let start = Instant::now();
        let result = manager.ensure_ready(Duration::from_secs(10)).await;
        let elapsed = start.elapsed();
        assert_eq!(result.err(), Some(VoiceError::Timeout(Duration::from_secs(10))));
        assert!(elapsed >= Duration::from_secs(9), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(11), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_ensure_ready_without_connection() {
        let manager = manager(FakeGateway::new(Duration::ZERO), FakeSources::new(vec![], Ending::Eof));
        let result = manager.ensure_ready(Duration::from_secs(10)).await;
        assert_eq!(result.err(), Some(VoiceError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_returns_to_disconnected() {
        let gateway = FakeGateway::failing(TransportError::ConnectionFailed("refused".into()));
        let manager = manager(gateway, FakeSources::new(vec![], Ending::Eof));
        manager.join(&requester_in(Some(music())), None).unwrap();

        let result = manager.ensure_ready(Duration::from_secs(10)).await;
        assert_eq!(
            result.err(),
            Some(VoiceError::ConnectFailed("Connection failed: refused".into()))
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // a fresh join is allowed afterwards and clears the failure
        assert!(manager.join(&requester_in(Some(music())), None).is_ok());
        manager.disconnect().await;
        let result = manager.ensure_ready(Duration::from_secs(10)).await;
        assert_eq!(result.err(), Some(VoiceError::NotConnected));
    }

    #[tokio::test]
    async fn test_start_requires_connection() {
        let manager = manager(FakeGateway::new(Duration::ZERO), FakeSources::new(vec![], Ending::Eof));
        assert_eq!(manager.start_stream(0), Err(VoiceError::NotConnected));
    }

    #[tokio::test]
    async fn test_only_first_start_is_admitted() {
        let (manager, transport, sources) = connected(Ending::Hang).await;

        let first = manager.start_stream(3).unwrap();
        for _ in 0..5 {
            assert_eq!(manager.start_stream(3), Err(VoiceError::SessionBusy));
            assert_eq!(manager.start_file("song.mp3"), Err(VoiceError::SessionBusy));
        }

        transport.wait_for_writes(1).await;
        assert!(manager.is_streaming());
        assert_eq!(manager.session_state(), Some(SessionState::Streaming));
        assert_eq!(sources.probe().opened_specs(), vec![SourceSpec::Loopback(3)]);

        // the original session is untouched and still the one that stops
        assert!(manager.stop());
        let completion = manager.session_completion().unwrap();
        assert_eq!(completion.wait().await, SessionState::Cancelled);
        assert_ne!(first, manager.start_stream(3).unwrap());
    }

    #[tokio::test]
    async fn test_start_after_completion() {
        let (manager, _, sources) = connected(Ending::Eof).await;

        manager.start_file("a.mp3").unwrap();
        manager.session_completion().unwrap().wait().await;
        manager.start_file("b.mp3").unwrap();
        manager.session_completion().unwrap().wait().await;

        assert_eq!(
            sources.probe().opened_specs(),
            vec![SourceSpec::File("a.mp3".into()), SourceSpec::File("b.mp3".into())]
        );
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let (manager, transport, _) = connected(Ending::Eof).await;
        assert!(!manager.stop());
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_stops_session_and_releases_transport() {
        let (manager, transport, sources) = connected(Ending::Endless).await;
        manager.start_stream(0).unwrap();
        transport.wait_for_writes(2).await;

        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.transport().is_none());
        assert!(!manager.is_streaming());
        assert!(sources.probe().is_closed());

        let events = transport.events();
        let n = events.len();
        assert_eq!(events[n - 2], TransportEvent::Speaking(false));
        assert_eq!(events[n - 1], TransportEvent::Disconnect);

        // idempotent
        manager.disconnect().await;
        assert_eq!(transport.events().len(), n);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting() {
        let gateway = FakeGateway::new(Duration::from_secs(5));
        let manager = manager(gateway.clone(), FakeSources::new(vec![], Ending::Eof));
        manager.join(&requester_in(Some(music())), None).unwrap();

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(gateway.transport().events().is_empty());
    }
}
