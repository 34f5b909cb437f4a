//! "Now playing" presence
//!
//! [`TrackPresence`] follows a player window and keeps a chat message in
//! sync with its title. The first title is sent as a new message; later
//! changes edit that message in place until the presence is stopped or the
//! responder can no longer edit.

pub mod title;
pub mod window;

pub use title::{Truncation, WindowDescriptor};
pub use window::{SystemWindows, TrackedWindow, WindowHandle, WindowSource};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ResponderError;

/// Reply channel of the command that triggered an action
#[async_trait]
pub trait Responder: Send + Sync {
    /// Send a new message; ephemeral messages are only shown to the requester
    async fn respond(&self, text: &str, ephemeral: bool) -> Result<(), ResponderError>;

    /// Replace the text of the message sent by [`respond`](Self::respond)
    async fn edit_original(&self, text: &str) -> Result<(), ResponderError>;
}

fn announcement(track: &str) -> String {
    format!("Now playing:\n{}", track)
}

struct PresenceLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls the player window and republishes its title
pub struct TrackPresence {
    windows: Arc<dyn WindowSource>,
    descriptor: WindowDescriptor,
    interval: Duration,
    active: Mutex<Option<PresenceLoop>>,
}

impl TrackPresence {
    pub fn new(windows: Arc<dyn WindowSource>, descriptor: WindowDescriptor, interval: Duration) -> Self {
        Self {
            windows,
            descriptor,
            interval,
            active: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &WindowDescriptor {
        &self.descriptor
    }

    /// Announce the current title and start following it.
    ///
    /// Returns `Ok(false)` without sending anything, and leaves a running
    /// loop alone, when no matching window has a title. Otherwise a loop
    /// that is already running is replaced.
    pub async fn start(&self, responder: Arc<dyn Responder>) -> Result<bool, ResponderError> {
        let mut tracked = TrackedWindow::new(self.descriptor.clone());
        tracked.update(self.windows.as_ref());
        let Some(track) = tracked.track() else {
            tracing::info!(window = %self.descriptor.partial_title(), "no matching window");
            return Ok(false);
        };

        self.stop().await;

        responder.respond(&announcement(&track), false).await?;
        tracing::info!(track = %track, "now playing");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll(
            self.windows.clone(),
            tracked,
            responder,
            self.interval,
            cancel.clone(),
        ));

        let previous = self.active.lock().replace(PresenceLoop { cancel, task });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(true)
    }

    /// Cancel the poll loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                tracing::warn!("presence task failed: {}", e);
            }
            tracing::info!("presence stopped");
        }
    }

    /// True while a poll loop is running
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }
}

async fn poll(
    windows: Arc<dyn WindowSource>,
    mut tracked: TrackedWindow,
    responder: Arc<dyn Responder>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if !tracked.update(windows.as_ref()) {
            tracing::debug!(title = ?tracked.title(), "title unchanged");
            continue;
        }
        let Some(track) = tracked.track() else {
            continue;
        };

        match responder.edit_original(&announcement(&track)).await {
            Ok(()) => tracing::info!(track = %track, "now playing"),
            Err(ResponderError::Expired) => {
                tracing::info!("responder expired, presence stopping");
                break;
            }
            Err(e) => tracing::warn!("Failed to update now playing: {}", e),
        }
    }
}
