//! System audio loopback capture
//!
//! Render endpoints are opened as loopback inputs (WASAPI supports building
//! an input stream on an output device); capture endpoints are recorded
//! directly. The cpal stream lives on a dedicated thread because it is not
//! `Send`.
//!
//! The device callback pushes each converted buffer into a single-slot
//! channel with `blocking_send`, so the callback does not return until the
//! previous buffer has been taken by the stream session. Nothing is dropped
//! under overload; the device thread waits instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use tokio::sync::mpsc;

use crate::audio::device::get_device_by_index;
use crate::audio::pcm::PcmConverter;
use crate::audio::source::AudioSource;
use crate::constants::CAPTURE_POLL_INTERVAL;
use crate::error::AudioError;

/// Loopback capture of one enumerated device
pub struct LoopbackSource {
    device_name: String,

    /// Converted PCM from the device callback, capacity one
    chunks: mpsc::Receiver<Bytes>,

    /// Channel for stream errors
    error_rx: Receiver<AudioError>,

    /// Dropping this stops the capture thread
    stop_tx: Option<Sender<()>>,

    /// Whether the stream is playing
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,
}

impl LoopbackSource {
    /// Open and start capturing the device at `index`.
    ///
    /// Blocks until the stream is playing or has failed to start.
    pub fn open(index: usize) -> Result<Self, AudioError> {
        let device = get_device_by_index(index)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_output_config()
            .or_else(|_| device.default_input_config())
            .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", device_name, e)))?;

        tracing::info!(
            device = %device_name,
            sample_rate = supported.sample_rate().0,
            channels = supported.channels(),
            format = ?supported.sample_format(),
            "opening loopback capture"
        );

        let (chunk_tx, chunk_rx) = mpsc::channel::<Bytes>(1);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(false));
        let running_for_thread = running.clone();

        let handle = thread::Builder::new()
            .name(format!("loopback-capture-{}", index))
            .spawn(move || {
                let stream = build_stream(
                    &device,
                    supported.sample_format(),
                    &supported.config(),
                    chunk_tx,
                    error_tx,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }

                running_for_thread.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                // Returns once the source sends stop or drops the sender
                let _ = stop_rx.recv();
                running_for_thread.store(false, Ordering::SeqCst);

                // Stream is dropped here, stopping capture
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        let started = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("capture thread exited during startup".into()))
            .and_then(|ready| ready);

        if let Err(e) = started {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            device_name,
            chunks: chunk_rx,
            error_rx,
            stop_tx: Some(stop_tx),
            running,
            thread_handle: Some(handle),
        })
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Check for errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }

    /// Unblock the device callback and signal the capture thread to stop
    fn signal_stop(&mut self) {
        self.chunks.close();
        self.stop_tx.take();
    }
}

#[async_trait]
impl AudioSource for LoopbackSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, AudioError> {
        loop {
            if let Some(e) = self.check_errors() {
                return Err(e);
            }
            if !self.is_running() {
                return Err(AudioError::CaptureStopped(self.device_name.clone()));
            }

            tokio::select! {
                chunk = self.chunks.recv() => {
                    return chunk
                        .map(Some)
                        .ok_or_else(|| AudioError::CaptureStopped(self.device_name.clone()));
                }
                _ = tokio::time::sleep(CAPTURE_POLL_INTERVAL) => {
                    tracing::trace!(device = %self.device_name, "capture state poll");
                }
            }
        }
    }

    async fn close(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.thread_handle.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => tracing::debug!(device = %self.device_name, "loopback capture stopped"),
                Ok(Err(_)) => tracing::error!(device = %self.device_name, "capture thread panicked"),
                Err(e) => tracing::error!("Failed to join capture thread: {}", e),
            }
        }
    }

    fn describe(&self) -> String {
        format!("loopback {}", self.device_name)
    }
}

impl Drop for LoopbackSource {
    fn drop(&mut self) {
        // the thread exits on its own once signalled
        self.signal_stop();
    }
}

fn build_stream(
    device: &cpal::Device,
    format: SampleFormat,
    config: &StreamConfig,
    chunks: mpsc::Sender<Bytes>,
    errors: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError> {
    match format {
        SampleFormat::F32 => build_typed_stream::<f32>(device, config, chunks, errors),
        SampleFormat::I16 => build_typed_stream::<i16>(device, config, chunks, errors),
        SampleFormat::U16 => build_typed_stream::<u16>(device, config, chunks, errors),
        SampleFormat::I32 => build_typed_stream::<i32>(device, config, chunks, errors),
        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
    }
}

fn build_typed_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: mpsc::Sender<Bytes>,
    errors: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut converter = PcmConverter::new(config.sample_rate.0, config.channels);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));

                let pcm = converter.convert(&scratch);
                if pcm.is_empty() {
                    return;
                }

                // Fails only once the session has closed the channel
                let _ = chunks.blocking_send(pcm);
            },
            move |err| {
                let _ = errors.try_send(AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}
