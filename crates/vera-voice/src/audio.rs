//! Audio frames and the collaborator seams: microphone source, recorder, playback sink.
//!
//! The engine never talks to a device directly. Hosts plug in implementations of
//! [`AudioSource`], [`Recorder`] and [`PlaybackSink`]; the `device` feature ships
//! cpal/rodio ones.

use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One analysis window of mono PCM (f32, normalized to -1.0 to 1.0)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Monotonic capture time
    pub timestamp: Instant,
    /// Trailing samples not seen in any earlier frame. Windows overlap, recordings must not.
    pub fresh: usize,
}

impl AudioFrame {
    /// Non-overlapping frame: every sample is new
    pub fn new(samples: Vec<f32>, sample_rate: u32, timestamp: Instant) -> Self {
        let fresh = samples.len();
        Self::sliding(samples, fresh, sample_rate, timestamp)
    }

    /// Window whose last `fresh` samples arrived since the previous frame
    pub fn sliding(samples: Vec<f32>, fresh: usize, sample_rate: u32, timestamp: Instant) -> Self {
        let fresh = fresh.min(samples.len());
        Self {
            samples,
            sample_rate,
            timestamp,
            fresh,
        }
    }

    pub fn fresh_samples(&self) -> &[f32] {
        &self.samples[self.samples.len() - self.fresh..]
    }

    /// Wall duration covered by the samples
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Turns an arbitrary device callback cadence into overlapping analysis windows:
/// `size` samples long, one every `hop` new samples.
#[derive(Debug)]
pub struct SlidingWindow {
    size: usize,
    hop: usize,
    buffer: VecDeque<f32>,
    pending: usize,
}

impl SlidingWindow {
    pub fn new(size: usize, hop: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            hop: hop.clamp(1, size),
            buffer: VecDeque::with_capacity(size),
            pending: 0,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.frame_size, config.hop_size)
    }

    /// Feed device samples; `emit(window, fresh)` runs for every completed hop.
    /// Nothing is emitted until the first full window.
    pub fn push<F>(&mut self, data: &[f32], mut emit: F)
    where
        F: FnMut(Vec<f32>, usize),
    {
        for &sample in data {
            if self.buffer.len() == self.size {
                self.buffer.pop_front();
            }
            self.buffer.push_back(sample);
            self.pending += 1;
            if self.buffer.len() == self.size && self.pending >= self.hop {
                let fresh = self.pending.min(self.size);
                self.pending = 0;
                emit(self.buffer.iter().copied().collect(), fresh);
            }
        }
    }
}

pub type FrameReceiver = mpsc::UnboundedReceiver<AudioFrame>;
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;

/// Long-lived microphone tap, opened once per session.
pub trait AudioSource {
    /// Open the device. Returns the frame stream on the first successful call and
    /// `None` when already open. Fails with `DeviceUnavailable`.
    fn open(&mut self, constraints: &AudioConfig) -> VoiceResult<Option<FrameReceiver>>;

    fn is_open(&self) -> bool;
}

/// Source fed by the host (its own capture thread, a file, a test).
pub struct ChannelAudioSource {
    rx: Option<FrameReceiver>,
    open: bool,
}

impl ChannelAudioSource {
    pub fn new() -> (Self, FrameSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx: Some(rx),
                open: false,
            },
            tx,
        )
    }
}

impl AudioSource for ChannelAudioSource {
    fn open(&mut self, _constraints: &AudioConfig) -> VoiceResult<Option<FrameReceiver>> {
        if self.open {
            return Ok(None);
        }
        let rx = self
            .rx
            .take()
            .ok_or_else(|| VoiceError::DeviceUnavailable("frame channel already taken".into()))?;
        self.open = true;
        Ok(Some(rx))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Turns the live stream into an encoded blob between `start` and `stop`.
pub trait Recorder: Send {
    /// Begin a new segment. Fails with `DeviceUnavailable` when the device can't record.
    fn start(&mut self) -> VoiceResult<()>;

    /// Feed one frame; ignored while inactive.
    fn push_frame(&mut self, frame: &AudioFrame);

    /// End the segment and return its encoded bytes (empty when nothing was recorded).
    fn stop(&mut self) -> VoiceResult<Vec<u8>>;

    /// Stop without producing anything (hard flush).
    fn discard(&mut self);

    fn is_recording(&self) -> bool;
}

/// In-memory recorder producing 16-bit mono WAV.
pub struct WavRecorder {
    sample_rate: u32,
    samples: Vec<f32>,
    recording: bool,
}

impl WavRecorder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
            recording: false,
        }
    }
}

impl Recorder for WavRecorder {
    fn start(&mut self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::DeviceUnavailable(
                "recorder has no sample rate".to_string(),
            ));
        }
        self.samples.clear();
        self.recording = true;
        Ok(())
    }

    fn push_frame(&mut self, frame: &AudioFrame) {
        if self.recording {
            self.samples.extend_from_slice(frame.fresh_samples());
        }
    }

    fn stop(&mut self) -> VoiceResult<Vec<u8>> {
        if !self.recording {
            return Err(VoiceError::Recorder("stop while inactive".to_string()));
        }
        self.recording = false;
        let samples = std::mem::take(&mut self.samples);
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let bytes = encode_wav(&samples, self.sample_rate)?;
        debug!("Recorder: {} samples -> {} bytes", samples.len(), bytes.len());
        Ok(bytes)
    }

    fn discard(&mut self) {
        if self.recording {
            info!("Recorder: hard flush of active segment ({} samples)", self.samples.len());
        }
        self.recording = false;
        self.samples.clear();
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

/// Encode f32 PCM (mono) as 16-bit WAV bytes for upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer.write_sample((clamped * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Identifies one `play` call so completions from superseded clips can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClipId(pub u64);

/// Notifications coming back from the playback sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { clip: ClipId, at: Instant },
    Ended { clip: ClipId, at: Instant },
}

/// Assistant audio output. `play` is non-blocking; start/end arrive as [`PlaybackEvent`]s.
pub trait PlaybackSink: Send {
    fn play(&mut self, clip: ClipId, url: &str) -> VoiceResult<()>;

    /// Stop immediately and drop anything queued. No `Ended` event is owed for the stopped clip.
    fn stop(&mut self);

    /// Position within the current clip, if one is playing
    fn position(&self) -> Option<Duration>;

    fn is_playing(&self) -> bool;
}
