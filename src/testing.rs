//! In-memory collaborators for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::audio::source::{AudioSource, SourceFactory, SourceSpec};
use crate::connection::VoiceChannel;
use crate::error::{AudioError, ResponderError, TransportError};
use crate::presence::{Responder, WindowHandle, WindowSource};
use crate::transport::{PcmSink, VoiceGateway, VoiceTransport};

/// What a fake source does after its scripted chunks
#[derive(Debug, Clone)]
pub(crate) enum Ending {
    Eof,
    Fail(AudioError),
    /// Never produces another chunk
    Hang,
    /// Produces a chunk every few milliseconds forever
    Endless,
}

#[derive(Default)]
pub(crate) struct SourceProbe {
    closed: AtomicUsize,
    opened: Mutex<Vec<SourceSpec>>,
}

impl SourceProbe {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) > 0
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn opened_specs(&self) -> Vec<SourceSpec> {
        self.opened.lock().clone()
    }
}

pub(crate) struct FakeSource {
    chunks: VecDeque<Bytes>,
    ending: Ending,
    probe: Arc<SourceProbe>,
}

#[async_trait]
impl AudioSource for FakeSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, AudioError> {
        if let Some(chunk) = self.chunks.pop_front() {
            tokio::task::yield_now().await;
            return Ok(Some(chunk));
        }
        match &self.ending {
            Ending::Eof => Ok(None),
            Ending::Fail(e) => Err(e.clone()),
            Ending::Hang => std::future::pending().await,
            Ending::Endless => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Some(Bytes::from_static(&[0; 4])))
            }
        }
    }

    async fn close(&mut self) {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// Hands out scripted sources, sharing one probe
pub(crate) struct FakeSources {
    chunks: Vec<Bytes>,
    ending: Ending,
    fail_open: Option<AudioError>,
    probe: Arc<SourceProbe>,
}

impl FakeSources {
    pub fn new(chunks: Vec<Bytes>, ending: Ending) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            ending,
            fail_open: None,
            probe: Arc::default(),
        })
    }

    pub fn failing_open(error: AudioError) -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            ending: Ending::Eof,
            fail_open: Some(error),
            probe: Arc::default(),
        })
    }

    pub fn probe(&self) -> Arc<SourceProbe> {
        self.probe.clone()
    }
}

#[async_trait]
impl SourceFactory for FakeSources {
    async fn open(&self, spec: SourceSpec) -> Result<Box<dyn AudioSource>, AudioError> {
        self.probe.opened.lock().push(spec);
        if let Some(e) = &self.fail_open {
            return Err(e.clone());
        }
        Ok(Box::new(FakeSource {
            chunks: self.chunks.iter().cloned().collect(),
            ending: self.ending.clone(),
            probe: self.probe.clone(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportEvent {
    Speaking(bool),
    Write(Vec<u8>),
    Flush,
    Disconnect,
}

/// Records everything sent to it
#[derive(Default)]
pub(crate) struct FakeTransport {
    events: Arc<Mutex<Vec<TransportEvent>>>,
    fail_writes: Option<TransportError>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_writes(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            events: Arc::default(),
            fail_writes: Some(error),
        })
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransportEvent::Write(_)))
            .count()
    }

    pub async fn wait_for_writes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.write_count() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("writes did not arrive");
    }
}

struct FakeSink {
    events: Arc<Mutex<Vec<TransportEvent>>>,
    fail_writes: Option<TransportError>,
}

#[async_trait]
impl PcmSink for FakeSink {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), TransportError> {
        if let Some(e) = &self.fail_writes {
            return Err(e.clone());
        }
        self.events.lock().push(TransportEvent::Write(pcm.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.events.lock().push(TransportEvent::Flush);
        Ok(())
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
        self.events.lock().push(TransportEvent::Speaking(speaking));
        Ok(())
    }

    async fn open_pcm_stream(&self) -> Result<Box<dyn PcmSink>, TransportError> {
        Ok(Box::new(FakeSink {
            events: self.events.clone(),
            fail_writes: self.fail_writes.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.events.lock().push(TransportEvent::Disconnect);
        Ok(())
    }
}

/// Connects after a delay, handing out one shared transport
pub(crate) struct FakeGateway {
    delay: Duration,
    fail: Option<TransportError>,
    transport: Arc<FakeTransport>,
    connects: Mutex<Vec<VoiceChannel>>,
}

impl FakeGateway {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: None,
            transport: FakeTransport::new(),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: TransportError) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail: Some(error),
            transport: FakeTransport::new(),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        self.transport.clone()
    }

    pub fn connects(&self) -> Vec<VoiceChannel> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn connect(&self, channel: &VoiceChannel) -> Result<Arc<dyn VoiceTransport>, TransportError> {
        self.connects.lock().push(channel.clone());
        tokio::time::sleep(self.delay).await;
        if let Some(e) = &self.fail {
            return Err(e.clone());
        }
        Ok(self.transport.clone())
    }
}

/// Records responses and edits
#[derive(Default)]
pub(crate) struct FakeResponder {
    responses: Mutex<Vec<(String, bool)>>,
    edits: Mutex<Vec<String>>,
    expired: AtomicBool,
}

impl FakeResponder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responses(&self) -> Vec<(String, bool)> {
        self.responses.lock().clone()
    }

    pub fn last_response(&self) -> Option<String> {
        self.responses.lock().last().map(|(text, _)| text.clone())
    }

    pub fn edits(&self) -> Vec<String> {
        self.edits.lock().clone()
    }

    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn respond(&self, text: &str, ephemeral: bool) -> Result<(), ResponderError> {
        self.responses.lock().push((text.to_string(), ephemeral));
        Ok(())
    }

    async fn edit_original(&self, text: &str) -> Result<(), ResponderError> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(ResponderError::Expired);
        }
        self.edits.lock().push(text.to_string());
        Ok(())
    }
}

/// Window list that tests can rewrite
#[derive(Default)]
pub(crate) struct FakeWindows {
    windows: Mutex<HashMap<WindowHandle, String>>,
}

impl FakeWindows {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, handle: isize, title: &str) {
        self.windows.lock().insert(WindowHandle(handle), title.to_string());
    }

    pub fn close(&self, handle: isize) {
        self.windows.lock().remove(&WindowHandle(handle));
    }
}

impl WindowSource for FakeWindows {
    fn list(&self) -> Vec<(WindowHandle, String)> {
        let mut windows: Vec<_> = self
            .windows
            .lock()
            .iter()
            .map(|(handle, title)| (*handle, title.clone()))
            .collect();
        windows.sort_by_key(|(handle, _)| handle.0);
        windows
    }

    fn title_of(&self, handle: WindowHandle) -> Option<String> {
        self.windows.lock().get(&handle).cloned()
    }
}
