//! Tunable thresholds and timings.
//!
//! Every value here was tuned empirically against one microphone/room, so none of
//! them are hard constants: defaults live in the `Default` impls and can be
//! overridden from a TOML file and from `VERA__*` environment variables.
//!
//! | Env | Field |
//! |-----|-------|
//! | VERA_CONFIG | path of the TOML file (default `config/voice.toml`) |
//! | VERA__CAPTURE__VOLUME_THRESHOLD | `capture.volume_threshold` |
//! | VERA__CAPTURE__SILENCE_MS | `capture.silence_ms` |
//! | VERA__BARGE_IN__GRACE_MS | `barge_in.grace_ms` |
//! | VERA__FILLER__DELAY_MS | `filler.delay_ms` |
//! | VERA__INFERENCE__BASE_URL | `inference.base_url` |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the turn-taking engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub audio: AudioConfig,
    pub capture: CaptureConfig,
    pub barge_in: BargeInConfig,
    pub filler: FillerConfig,
    pub inference: InferenceConfig,
}

/// Microphone constraints and analysis cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate requested from the source (default: 16000 Hz)
    pub sample_rate: u32,
    /// Samples per analysis window (default: 2048)
    pub frame_size: usize,
    /// New samples between consecutive windows (default: 256, 16ms at 16 kHz, about 60 Hz)
    pub hop_size: usize,
    /// Browser-style processing toggles; all off so the gates see the raw signal
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Scheduler tick for timers when no frame arrives (default: 16ms ≈ 60 Hz)
    pub tick_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 2048,
            hop_size: 256,
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            tick_ms: 16,
        }
    }
}

impl AudioConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

/// End-of-utterance detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// RMS above this counts as voice (default: 0.009)
    pub volume_threshold: f32,
    /// Silence after the last voiced frame before speech is considered over (default: 950ms)
    pub silence_ms: u64,
    /// Guaranteed tail recorded after `silence_ms` (default: 300ms)
    pub trailing_ms: u64,
    /// Ceiling when nobody speaks at all (default: 2000ms)
    pub max_wait_for_speech_ms: u64,
    /// Encoded blobs smaller than this are noise (default: 1500 bytes)
    pub min_audio_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 0.009,
            silence_ms: 950,
            trailing_ms: 300,
            max_wait_for_speech_ms: 2000,
            min_audio_bytes: 1500,
        }
    }
}

impl CaptureConfig {
    /// Silence required to end a normal utterance (`silence_ms + trailing_ms`)
    pub fn end_of_speech(&self) -> Duration {
        Duration::from_millis(self.silence_ms + self.trailing_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn max_wait_for_speech(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_speech_ms)
    }
}

/// Gate used while the assistant is speaking.
///
/// Tuned above the speech-start threshold so loudspeaker clicks and pops don't
/// count as the user talking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BargeInConfig {
    /// Lower RMS bound, exclusive (default: 0.010)
    pub interrupt_rms: f32,
    /// Upper RMS bound, exclusive (default: 0.080)
    pub max_speech_rms: f32,
    /// ZCR band, both exclusive (default: 0.015 .. 0.25)
    pub interrupt_zcr_min: f32,
    pub interrupt_zcr_max: f32,
    /// Consecutive qualifying frames required (default: 1)
    pub interrupt_min_frames: u32,
    /// Qualifying run must last longer than this (default: 120ms)
    pub min_run_ms: u64,
    /// Detection is suppressed this long after playback starts (default: 200ms)
    pub grace_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            interrupt_rms: 0.010,
            max_speech_rms: 0.080,
            interrupt_zcr_min: 0.015,
            interrupt_zcr_max: 0.25,
            interrupt_min_frames: 1,
            min_run_ms: 120,
            grace_ms: 200,
        }
    }
}

impl BargeInConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn min_run(&self) -> Duration {
        Duration::from_millis(self.min_run_ms)
    }
}

/// Stalling cue played while a slow answer is computed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    /// Delay after the call starts before a filler plays (default: 5300ms)
    pub delay_ms: u64,
    /// Pause between the filler ending and the held answer (default: 1000ms)
    pub grace_ms: u64,
    /// Clip paths, resolved against the inference base URL. One is picked uniformly.
    pub clips: Vec<String>,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            delay_ms: 5300,
            grace_ms: 1000,
            clips: vec![
                "/static/fillers/moment.wav".to_string(),
                "/static/fillers/one_second.wav".to_string(),
                "/static/fillers/give_me_a_second.wav".to_string(),
                "/static/fillers/one_moment.wav".to_string(),
            ],
        }
    }
}

impl FillerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Remote inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL without trailing slash
    pub base_url: String,
    /// Per-request timeout (default: 60s)
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            timeout_secs: 60,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: `VERA__*` env > `VERA_CONFIG` file
    /// (default `config/voice.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("VERA_CONFIG").unwrap_or_else(|_| "config/voice.toml".to_string());
        Self::load_from_path(Path::new(&config_path))
    }

    /// Same as [`VoiceConfig::load`] with an explicit file path. A missing file is not an error.
    pub fn load_from_path(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("VERA")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: VoiceConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document directly (tests, embedded defaults).
    pub fn from_toml_str(s: &str) -> VoiceResult<Self> {
        let config: VoiceConfig =
            toml::from_str(s).map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gates cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        let b = &self.barge_in;
        if b.interrupt_rms >= b.max_speech_rms {
            return Err(VoiceError::Config(format!(
                "barge_in.interrupt_rms ({}) must be below max_speech_rms ({})",
                b.interrupt_rms, b.max_speech_rms
            )));
        }
        if b.interrupt_zcr_min >= b.interrupt_zcr_max {
            return Err(VoiceError::Config(format!(
                "barge_in.interrupt_zcr_min ({}) must be below interrupt_zcr_max ({})",
                b.interrupt_zcr_min, b.interrupt_zcr_max
            )));
        }
        if self.audio.frame_size == 0 {
            return Err(VoiceError::Config("audio.frame_size must be > 0".to_string()));
        }
        if self.audio.hop_size == 0 || self.audio.hop_size > self.audio.frame_size {
            return Err(VoiceError::Config(format!(
                "audio.hop_size ({}) must be between 1 and frame_size ({})",
                self.audio.hop_size, self.audio.frame_size
            )));
        }
        if self.filler.clips.iter().any(|c| c.trim().is_empty()) {
            return Err(VoiceError::Config("filler.clips contains an empty path".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_values() {
        let c = VoiceConfig::default();
        assert!((c.capture.volume_threshold - 0.009).abs() < 1e-6);
        assert_eq!(c.capture.end_of_speech(), Duration::from_millis(1250));
        assert_eq!(c.capture.max_wait_for_speech(), Duration::from_millis(2000));
        assert_eq!(c.capture.min_audio_bytes, 1500);
        assert_eq!(c.barge_in.grace(), Duration::from_millis(200));
        assert_eq!(c.barge_in.interrupt_min_frames, 1);
        assert_eq!(c.filler.delay(), Duration::from_millis(5300));
        assert_eq!(c.filler.clips.len(), 4);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let c = VoiceConfig::from_toml_str(
            r#"
            [capture]
            silence_ms = 700

            [filler]
            clips = ["/static/fillers/hmm.wav"]
            "#,
        )
        .unwrap();
        assert_eq!(c.capture.silence_ms, 700);
        assert_eq!(c.capture.trailing_ms, 300);
        assert_eq!(c.filler.clips, vec!["/static/fillers/hmm.wav".to_string()]);
        assert_eq!(c.barge_in.grace_ms, 200);
    }

    #[test]
    fn inverted_band_is_rejected() {
        let err = VoiceConfig::from_toml_str(
            r#"
            [barge_in]
            interrupt_rms = 0.2
            "#,
        );
        assert!(matches!(err, Err(VoiceError::Config(_))));
    }

    #[test]
    fn hop_longer_than_window_is_rejected() {
        let err = VoiceConfig::from_toml_str(
            r#"
            [audio]
            frame_size = 512
            hop_size = 1024
            "#,
        );
        assert!(matches!(err, Err(VoiceError::Config(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let c = VoiceConfig::load_from_path(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(c.audio.sample_rate, 16000);
    }

    #[test]
    fn shipped_sample_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/voice.toml");
        let c = VoiceConfig::load_from_path(&path).unwrap();
        assert_eq!(c.filler.clips.len(), 4);
        assert_eq!(c.inference.base_url, "http://127.0.0.1:8787");
        assert_eq!(c.audio.tick(), Duration::from_millis(16));
    }
}
