//! File playback through an external decoder process
//!
//! The decoder (ffmpeg by default) writes raw s16le stereo 48kHz PCM to its
//! standard output, which is read chunk by chunk. The process is killed when
//! the source is closed or dropped.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

use crate::audio::source::AudioSource;
use crate::constants::{CHANNELS, SAMPLE_RATE};
use crate::error::AudioError;

/// Program and arguments used to start the decoder
#[derive(Debug, Clone)]
pub struct DecoderCommand {
    program: String,
    args: Vec<String>,
}

impl DecoderCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// ffmpeg-compatible invocation emitting raw PCM on stdout, banner and logs suppressed
    pub fn ffmpeg(program: impl Into<String>, path: &Path) -> Self {
        Self::new(program)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("panic")
            .arg("-i")
            .arg(path.to_string_lossy())
            .arg("-ac")
            .arg(CHANNELS.to_string())
            .arg("-f")
            .arg("s16le")
            .arg("-ar")
            .arg(SAMPLE_RATE.to_string())
            .arg("pipe:1")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// PCM read from a running decoder process
pub struct FileSource {
    label: String,
    child: Child,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
}

impl FileSource {
    /// Start decoding `path` with `program`
    pub fn spawn(program: &str, path: &Path, chunk_bytes: usize) -> Result<Self, AudioError> {
        Self::from_command(DecoderCommand::ffmpeg(program, path), chunk_bytes)
    }

    pub fn from_command(command: DecoderCommand, chunk_bytes: usize) -> Result<Self, AudioError> {
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AudioError::DecoderSpawn(format!("{}: {}", command.program(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AudioError::DecoderSpawn("decoder stdout was not captured".into()))?;

        let label = format!("{} {}", command.program(), command.args().join(" "));
        tracing::debug!(decoder = %label, pid = ?child.id(), "decoder started");

        Ok(Self {
            label,
            child,
            stdout: Some(stdout),
            buffer: vec![0u8; chunk_bytes.max(1)],
        })
    }
}

#[async_trait]
impl AudioSource for FileSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, AudioError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let n = stdout
            .read(&mut self.buffer)
            .await
            .map_err(|e| AudioError::ReadFailed(e.to_string()))?;

        if n == 0 {
            self.stdout = None;
            let status = self
                .child
                .wait()
                .await
                .map_err(|e| AudioError::ReadFailed(e.to_string()))?;
            if !status.success() {
                return Err(AudioError::DecoderExited(status.to_string()));
            }
            return Ok(None);
        }

        Ok(Some(Bytes::copy_from_slice(&self.buffer[..n])))
    }

    async fn close(&mut self) {
        self.stdout = None;
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!("Failed to terminate decoder: {}", e);
            }
        }
        match self.child.wait().await {
            Ok(status) => tracing::debug!(%status, "decoder exited"),
            Err(e) => tracing::warn!("Failed to reap decoder: {}", e),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
