//! Stream sessions
//!
//! A session opens its source, marks the transport as speaking and copies
//! chunks into a PCM sink until the source ends, fails, or the session is
//! cancelled. Cancellation is only observed while waiting for the next
//! chunk, so a write that has started always completes.
//!
//! Every exit path flushes the sink, clears the speaking flag and closes the
//! source (killing the decoder or stopping the capture thread).

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::source::{AudioSource, SourceFactory, SourceSpec};
use crate::error::StreamFailure;
use crate::transport::{PcmSink, VoiceTransport};

pub type SessionId = Uuid;

/// Lifecycle of a stream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed(StreamFailure),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed(_)
        )
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

/// One running source → transport pipeline
pub struct StreamSession {
    id: SessionId,
    spec: SourceSpec,
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionState>,
}

impl StreamSession {
    /// Spawn the pipeline for `spec` on the runtime
    pub fn start(
        spec: SourceSpec,
        sources: Arc<dyn SourceFactory>,
        transport: Arc<dyn VoiceTransport>,
    ) -> Self {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let task = tokio::spawn(run(
            id,
            spec.clone(),
            sources,
            transport,
            cancel.clone(),
            state_tx,
        ));

        Self {
            id,
            spec,
            cancel,
            state: state_rx,
            task,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// True once the pipeline task has returned
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request cancellation. Returns false if the session already finished.
    pub fn stop(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// A handle that resolves when the session reaches a terminal state
    pub fn completion(&self) -> SessionCompletion {
        SessionCompletion {
            state: self.state.clone(),
        }
    }

    /// Wait for the pipeline task and return its final state
    pub async fn join(self) -> SessionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(session = %self.id, "session task failed: {}", e);
                SessionState::Failed(StreamFailure::Aborted)
            }
        }
    }
}

/// Resolves to the terminal state of a session
#[derive(Clone)]
pub struct SessionCompletion {
    state: watch::Receiver<SessionState>,
}

impl SessionCompletion {
    pub async fn wait(mut self) -> SessionState {
        let waited = self
            .state
            .wait_for(SessionState::is_terminal)
            .await
            .map(|state| state.clone());
        match waited {
            Ok(state) => state,
            Err(_) => {
                let state = self.state.borrow().clone();
                if state.is_terminal() {
                    state
                } else {
                    SessionState::Failed(StreamFailure::Aborted)
                }
            }
        }
    }
}

async fn run(
    id: SessionId,
    spec: SourceSpec,
    sources: Arc<dyn SourceFactory>,
    transport: Arc<dyn VoiceTransport>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
) -> SessionState {
    state.send_replace(SessionState::Streaming);
    tracing::info!(session = %id, source = %spec, "stream starting");

    let result = stream(id, spec, sources.as_ref(), transport.as_ref(), &cancel).await;

    let final_state = match result {
        Ok(Outcome::Completed) => {
            tracing::info!(session = %id, "stream completed");
            SessionState::Completed
        }
        Ok(Outcome::Cancelled) => {
            tracing::info!(session = %id, "stream cancelled");
            SessionState::Cancelled
        }
        Err(failure) => {
            tracing::error!(session = %id, "stream failed: {}", failure);
            SessionState::Failed(failure)
        }
    };

    state.send_replace(final_state.clone());
    final_state
}

async fn stream(
    id: SessionId,
    spec: SourceSpec,
    sources: &dyn SourceFactory,
    transport: &dyn VoiceTransport,
    cancel: &CancellationToken,
) -> Result<Outcome, StreamFailure> {
    let mut source = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
        source = sources.open(spec) => source?,
    };
    tracing::info!(session = %id, source = %source.describe(), "source opened");

    let result = if cancel.is_cancelled() {
        Ok(Outcome::Cancelled)
    } else {
        speak(source.as_mut(), transport, cancel).await
    };
    source.close().await;
    result
}

/// Speaking is set before copying and cleared afterwards, whatever happened
async fn speak(
    source: &mut dyn AudioSource,
    transport: &dyn VoiceTransport,
    cancel: &CancellationToken,
) -> Result<Outcome, StreamFailure> {
    let result = async {
        transport.set_speaking(true).await?;
        copy(source, transport, cancel).await
    }
    .await;

    if let Err(e) = transport.set_speaking(false).await {
        tracing::warn!("Failed to clear speaking state: {}", e);
    }
    result
}

async fn copy(
    source: &mut dyn AudioSource,
    transport: &dyn VoiceTransport,
    cancel: &CancellationToken,
) -> Result<Outcome, StreamFailure> {
    let mut sink = transport.open_pcm_stream().await?;
    let result = copy_loop(source, sink.as_mut(), cancel).await;
    let flushed = sink.flush().await;

    match (result, flushed) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e.into()),
        (Ok(outcome), Ok(())) => Ok(outcome),
    }
}

async fn copy_loop(
    source: &mut dyn AudioSource,
    sink: &mut dyn PcmSink,
    cancel: &CancellationToken,
) -> Result<Outcome, StreamFailure> {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            chunk = source.next_chunk() => chunk?,
        };

        match chunk {
            Some(pcm) => sink.write(&pcm).await?,
            None => return Ok(Outcome::Completed),
        }
    }
}
