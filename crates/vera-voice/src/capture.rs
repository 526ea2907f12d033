//! Utterance capture: from silence-start to silence-end.
//!
//! Implements the "Gap Logic" for one recording segment: wait for the first voiced
//! frame, keep recording while the user talks, and stop once the configured silence
//! (plus a guaranteed tail) has passed.

use crate::audio::Recorder;
use crate::config::CaptureConfig;
use crate::error::{EmptyReason, VoiceError, VoiceResult};
use crate::signal::FeatureSample;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How the utterance was captured; sent along with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceMode {
    /// Hands-free capture ended by silence
    Normal,
    /// User pressed to start and pressed again to send
    PushToTalk,
    /// User talked over the assistant
    Interrupt,
}

/// A finished recording, consumed once by the remote call
#[derive(Debug, Clone)]
pub struct Utterance {
    pub audio_blob: Vec<u8>,
    pub size_bytes: usize,
    pub mode: UtteranceMode,
}

/// Segment lifecycle: Armed → AwaitingSpeech → Recording → Finalizing → Done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Armed,
    AwaitingSpeech,
    Recording,
    Finalizing,
    Done,
}

/// One capture segment at a time, driven by feature samples and timer polls
pub struct UtteranceCapture {
    config: CaptureConfig,
    phase: CapturePhase,
    mode: UtteranceMode,
    segment: u64,
    armed_at: Option<Instant>,
    last_voice: Option<Instant>,
    has_spoken: bool,
}

impl UtteranceCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            phase: CapturePhase::Done,
            mode: UtteranceMode::Normal,
            segment: 0,
            armed_at: None,
            last_voice: None,
            has_spoken: false,
        }
    }

    /// Start a fresh segment, hard-flushing whatever the recorder still holds.
    ///
    /// Returns the new segment generation. On recorder failure the capture is left
    /// `Done` and the `DeviceUnavailable` error is returned.
    pub fn begin(
        &mut self,
        recorder: &mut dyn Recorder,
        mode: UtteranceMode,
        now: Instant,
    ) -> VoiceResult<u64> {
        if recorder.is_recording() {
            recorder.discard();
        }

        self.segment += 1;
        self.phase = CapturePhase::Armed;
        self.mode = mode;
        self.armed_at = Some(now);
        self.last_voice = None;
        self.has_spoken = false;

        if let Err(e) = recorder.start() {
            self.phase = CapturePhase::Done;
            return Err(match e {
                VoiceError::DeviceUnavailable(_) => e,
                other => VoiceError::DeviceUnavailable(other.to_string()),
            });
        }

        match mode {
            // The barge-in already proved the user is talking.
            UtteranceMode::Interrupt => {
                self.phase = CapturePhase::Recording;
                self.last_voice = Some(now);
                self.has_spoken = true;
            }
            UtteranceMode::Normal | UtteranceMode::PushToTalk => {
                self.phase = CapturePhase::AwaitingSpeech;
            }
        }

        debug!("Capture: segment {} armed ({:?})", self.segment, mode);
        Ok(self.segment)
    }

    /// Feed one feature sample. Returns true when the segment should be finalized.
    pub fn observe(&mut self, sample: &FeatureSample, playback_active: bool) -> bool {
        let voiced = sample.rms > self.config.volume_threshold;
        let now = sample.timestamp;

        match (self.phase, voiced) {
            (CapturePhase::AwaitingSpeech, true) => {
                info!("🎤 Speech started (rms {:.4})", sample.rms);
                self.phase = CapturePhase::Recording;
                self.has_spoken = true;
                self.last_voice = Some(now);
            }
            (CapturePhase::Recording, true) => {
                self.has_spoken = true;
                self.last_voice = Some(now);
            }
            _ => {}
        }

        self.poll(now, playback_active)
    }

    /// Check the time-based end conditions without a new frame.
    pub fn poll(&mut self, now: Instant, playback_active: bool) -> bool {
        if !self.is_active() {
            return self.phase == CapturePhase::Finalizing;
        }

        let done = match self.mode {
            UtteranceMode::PushToTalk => false,
            UtteranceMode::Interrupt => self
                .silence_since_voice(now)
                .is_some_and(|s| s > self.config.silence()),
            UtteranceMode::Normal => {
                if self.has_spoken {
                    !playback_active
                        && self
                            .silence_since_voice(now)
                            .is_some_and(|s| s > self.config.end_of_speech())
                } else {
                    self.armed_at
                        .is_some_and(|t| now.saturating_duration_since(t) >= self.config.max_wait_for_speech())
                }
            }
        };

        if done {
            if self.has_spoken {
                info!("🤫 End of speech detected (segment {})", self.segment);
            } else {
                debug!("⏱️ No speech within {:?}", self.config.max_wait_for_speech());
            }
            self.phase = CapturePhase::Finalizing;
        }
        done
    }

    /// Stop the recorder and produce the utterance.
    ///
    /// Push-to-talk segments may be finished from any active phase. Fails with
    /// `EmptyUtterance` when nobody spoke (normal mode) or the blob is too small.
    pub fn finish(&mut self, recorder: &mut dyn Recorder) -> VoiceResult<Utterance> {
        if self.phase == CapturePhase::Done {
            return Err(VoiceError::Recorder("no capture segment to finish".to_string()));
        }
        self.phase = CapturePhase::Finalizing;

        let stopped = recorder.stop();
        self.phase = CapturePhase::Done;
        let audio_blob = stopped?;

        if self.mode == UtteranceMode::Normal && !self.has_spoken {
            return Err(VoiceError::EmptyUtterance(EmptyReason::NoSpeech));
        }

        let size_bytes = audio_blob.len();
        if size_bytes < self.config.min_audio_bytes {
            debug!("⏭️ Utterance too small ({} bytes), ignoring", size_bytes);
            return Err(VoiceError::EmptyUtterance(EmptyReason::TooSmall { size_bytes }));
        }

        info!("🎯 Utterance captured: {} bytes ({:?})", size_bytes, self.mode);
        Ok(Utterance {
            audio_blob,
            size_bytes,
            mode: self.mode,
        })
    }

    /// Abandon the current segment without producing anything.
    pub fn cancel(&mut self, recorder: &mut dyn Recorder) {
        if self.phase != CapturePhase::Done {
            debug!("Capture: segment {} cancelled", self.segment);
        }
        recorder.discard();
        self.phase = CapturePhase::Done;
    }

    fn silence_since_voice(&self, now: Instant) -> Option<Duration> {
        self.last_voice.map(|t| now.saturating_duration_since(t))
    }

    /// Listening for or recording speech
    pub fn is_active(&self) -> bool {
        matches!(
            self.phase,
            CapturePhase::Armed | CapturePhase::AwaitingSpeech | CapturePhase::Recording
        )
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn mode(&self) -> UtteranceMode {
        self.mode
    }

    /// Generation of the most recent segment
    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn has_spoken(&self) -> bool {
        self.has_spoken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRecorder;

    const FRAME: Duration = Duration::from_millis(10);

    fn sample(at: Instant, rms: f32) -> FeatureSample {
        FeatureSample {
            rms,
            zcr: 0.1,
            timestamp: at,
        }
    }

    #[test]
    fn silent_window_ends_empty_at_ceiling() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::default();
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::Normal, t0).unwrap();

        let mut stopped_at = None;
        for i in 1..=250u32 {
            let at = t0 + FRAME * i;
            if cap.observe(&sample(at, 0.002), false) {
                stopped_at = Some(at - t0);
                break;
            }
        }
        assert_eq!(stopped_at, Some(Duration::from_millis(2000)));

        let result = cap.finish(&mut rec);
        assert!(matches!(
            result,
            Err(VoiceError::EmptyUtterance(EmptyReason::NoSpeech))
        ));
        assert_eq!(rec.last_blob_len, Some(0));
        assert_eq!(cap.phase(), CapturePhase::Done);
    }

    #[test]
    fn trailing_silence_ends_after_1250ms() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::with_bytes_per_frame(100);
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::Normal, t0).unwrap();

        // 400ms of speech
        let mut at = t0;
        for _ in 0..40 {
            at += FRAME;
            rec.frames += 1;
            assert!(!cap.observe(&sample(at, 0.05), false));
        }
        let last_voice = at;
        assert_eq!(cap.phase(), CapturePhase::Recording);

        let mut stopped_after = None;
        for _ in 0..200 {
            at += FRAME;
            rec.frames += 1;
            if cap.observe(&sample(at, 0.001), false) {
                stopped_after = Some(at - last_voice);
                break;
            }
        }
        let silence = stopped_after.expect("capture should end");
        assert!(silence > Duration::from_millis(1250));
        assert!(silence <= Duration::from_millis(1250) + FRAME);

        let utt = cap.finish(&mut rec).unwrap();
        assert_eq!(utt.mode, UtteranceMode::Normal);
        assert_eq!(utt.size_bytes, utt.audio_blob.len());
        assert!(utt.size_bytes >= 1500);
    }

    #[test]
    fn playback_holds_the_segment_open() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::default();
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::Normal, t0).unwrap();
        cap.observe(&sample(t0, 0.05), false);

        let late = t0 + Duration::from_millis(3000);
        assert!(!cap.poll(late, true));
        assert!(cap.poll(late, false));
    }

    #[test]
    fn small_blob_is_empty() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::with_bytes_per_frame(10);
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::Normal, t0).unwrap();
        cap.observe(&sample(t0, 0.05), false);
        rec.frames = 5;
        assert!(cap.poll(t0 + Duration::from_millis(1300), false));
        assert!(matches!(
            cap.finish(&mut rec),
            Err(VoiceError::EmptyUtterance(EmptyReason::TooSmall { size_bytes: 50 }))
        ));
    }

    #[test]
    fn interrupt_segment_uses_plain_silence_rule() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::with_bytes_per_frame(1000);
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::Interrupt, t0).unwrap();
        assert_eq!(cap.phase(), CapturePhase::Recording);
        rec.frames = 10;

        assert!(!cap.poll(t0 + Duration::from_millis(950), false));
        // playback state does not matter for interrupt segments
        assert!(cap.poll(t0 + Duration::from_millis(960), true));
        let utt = cap.finish(&mut rec).unwrap();
        assert_eq!(utt.mode, UtteranceMode::Interrupt);
    }

    #[test]
    fn push_to_talk_never_ends_by_itself() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::with_bytes_per_frame(1000);
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        cap.begin(&mut rec, UtteranceMode::PushToTalk, t0).unwrap();
        rec.frames = 3;

        assert!(!cap.poll(t0 + Duration::from_secs(30), false));
        let utt = cap.finish(&mut rec).unwrap();
        assert_eq!(utt.mode, UtteranceMode::PushToTalk);
        assert_eq!(utt.size_bytes, 3000);
    }

    #[test]
    fn begin_hard_flushes_active_recorder() {
        let t0 = Instant::now();
        let mut rec = FakeRecorder::default();
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        let first = cap.begin(&mut rec, UtteranceMode::Normal, t0).unwrap();
        let second = cap.begin(&mut rec, UtteranceMode::Interrupt, t0).unwrap();
        assert!(second > first);
        assert_eq!(rec.discards, 1);
        assert_eq!(rec.starts, 2);
    }

    #[test]
    fn recorder_failure_is_device_unavailable() {
        let mut rec = FakeRecorder {
            fail_start: true,
            ..Default::default()
        };
        let mut cap = UtteranceCapture::new(CaptureConfig::default());
        let err = cap.begin(&mut rec, UtteranceMode::Normal, Instant::now());
        assert!(matches!(err, Err(VoiceError::DeviceUnavailable(_))));
        assert!(!cap.is_active());
    }
}
