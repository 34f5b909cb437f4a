//! PCM reformatting for captured audio
//!
//! Capture devices deliver samples in their own mix format. The voice
//! transport only accepts interleaved 16-bit little-endian stereo at 48kHz,
//! so every captured buffer goes through a [`PcmConverter`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{BYTES_PER_FRAME, SAMPLE_RATE};

/// Stateful converter from device frames to 48kHz stereo s16le
///
/// Keeps the last frame of each buffer so linear interpolation stays
/// continuous across callback boundaries.
pub struct PcmConverter {
    in_channels: usize,
    /// Input frames advanced per output frame
    step: f64,
    /// Read position, relative to `prev` when it is set
    position: f64,
    prev: Option<[f32; 2]>,
    scratch: Vec<[f32; 2]>,
}

impl PcmConverter {
    pub fn new(in_rate: u32, in_channels: u16) -> Self {
        Self {
            in_channels: in_channels.max(1) as usize,
            step: in_rate as f64 / SAMPLE_RATE as f64,
            position: 0.0,
            prev: None,
            scratch: Vec::new(),
        }
    }

    /// True when no resampling is needed
    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Convert one buffer of interleaved samples
    pub fn convert(&mut self, samples: &[f32]) -> Bytes {
        self.scratch.clear();
        if let Some(prev) = self.prev {
            if !self.is_passthrough() {
                self.scratch.push(prev);
            }
        }
        let channels = self.in_channels;
        self.scratch.extend(samples.chunks_exact(channels).map(|frame| match channels {
            1 => [frame[0], frame[0]],
            _ => [frame[0], frame[1]],
        }));

        if self.is_passthrough() {
            let mut out = BytesMut::with_capacity(self.scratch.len() * BYTES_PER_FRAME);
            for frame in &self.scratch {
                put_frame(&mut out, *frame);
            }
            return out.freeze();
        }

        let frames = &self.scratch;
        if frames.len() < 2 {
            if let Some(last) = frames.last() {
                self.prev = Some(*last);
            }
            return Bytes::new();
        }

        let estimate = (frames.len() as f64 / self.step) as usize + 1;
        let mut out = BytesMut::with_capacity(estimate * BYTES_PER_FRAME);
        let mut t = self.position;
        while (t.floor() as usize) + 1 < frames.len() {
            let i = t.floor() as usize;
            let frac = (t - i as f64) as f32;
            let a = frames[i];
            let b = frames[i + 1];
            put_frame(
                &mut out,
                [a[0] + (b[0] - a[0]) * frac, a[1] + (b[1] - a[1]) * frac],
            );
            t += self.step;
        }

        self.position = t - (frames.len() - 1) as f64;
        self.prev = frames.last().copied();
        out.freeze()
    }
}

fn put_frame(out: &mut BytesMut, frame: [f32; 2]) {
    out.put_i16_le(to_i16(frame[0]));
    out.put_i16_le(to_i16(frame[1]));
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
pub fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}
