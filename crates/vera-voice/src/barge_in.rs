//! Barge-in detection while the assistant is speaking.
//!
//! A band-pass gate on RMS and ZCR, stricter than speech-start detection so that
//! loudspeaker bleed (clicks, pops, the playback's own onset) doesn't count as the
//! user talking. A qualifying run must both reach a frame count and last long enough.

use crate::config::BargeInConfig;
use crate::signal::FeatureSample;
use std::time::Instant;
use tracing::{debug, info};

/// Per-reply interruption detector
pub struct BargeInDetector {
    config: BargeInConfig,
    /// Set while an interruptible reply is playing
    playback_started_at: Option<Instant>,
    run_frames: u32,
    run_started_at: Option<Instant>,
    fired: bool,
}

impl BargeInDetector {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            playback_started_at: None,
            run_frames: 0,
            run_started_at: None,
            fired: false,
        }
    }

    /// Start watching a reply whose playback began at `started_at`.
    pub fn arm(&mut self, started_at: Instant) {
        debug!("Barge-in armed ({}ms grace)", self.config.grace_ms);
        self.playback_started_at = Some(started_at);
        self.fired = false;
        self.reset_run();
    }

    /// Stop watching (playback ended, filler playing, mode switched).
    pub fn disarm(&mut self) {
        self.playback_started_at = None;
        self.reset_run();
    }

    pub fn is_armed(&self) -> bool {
        self.playback_started_at.is_some()
    }

    /// Whether the detector already fired for the current reply
    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Speech-like frame according to the interruption gate
    pub fn qualifies(&self, sample: &FeatureSample) -> bool {
        let c = &self.config;
        sample.rms > c.interrupt_rms
            && sample.rms < c.max_speech_rms
            && sample.zcr > c.interrupt_zcr_min
            && sample.zcr < c.interrupt_zcr_max
    }

    /// Classify one frame. Returns true exactly once per armed reply, when the user
    /// has been talking over the playback long enough.
    pub fn observe(&mut self, sample: &FeatureSample) -> bool {
        let Some(started_at) = self.playback_started_at else {
            self.reset_run();
            return false;
        };
        let now = sample.timestamp;

        if now.saturating_duration_since(started_at) <= self.config.grace() {
            return false;
        }

        if self.qualifies(sample) {
            if self.run_frames == 0 {
                self.run_started_at = Some(now);
            }
            self.run_frames += 1;
        } else {
            self.reset_run();
            return false;
        }

        let run = self
            .run_started_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();

        if self.run_frames >= self.config.interrupt_min_frames && run > self.config.min_run() {
            info!(
                "⚡ Barge-in: {} frames over {:?} (rms {:.4}, zcr {:.3})",
                self.run_frames, run, sample.rms, sample.zcr
            );
            self.fired = true;
            self.disarm();
            return true;
        }

        false
    }

    fn reset_run(&mut self) {
        self.run_frames = 0;
        self.run_started_at = None;
    }
}
