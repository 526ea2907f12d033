//! Per-frame signal features: RMS energy and zero-crossing rate.

use crate::audio::AudioFrame;
use std::time::Instant;

/// Scalar features of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSample {
    /// Root-mean-square energy, >= 0
    pub rms: f32,
    /// Fraction of consecutive sample pairs that change sign, in [0, 1]
    pub zcr: f32,
    pub timestamp: Instant,
}

/// Stateless frame analyzer. Cheap enough for every tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalAnalyzer;

impl SignalAnalyzer {
    pub fn analyze(&self, frame: &AudioFrame) -> FeatureSample {
        FeatureSample {
            rms: rms(&frame.samples),
            zcr: zcr(&frame.samples),
            timestamp: frame.timestamp,
        }
    }
}

/// sqrt(mean(sample²)); 0 for an empty slice
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_of_squares: f64 = samples.iter().map(|&s| s as f64 * s as f64).sum();
    (sum_of_squares / samples.len() as f64).sqrt() as f32
}

/// Sign changes between neighbours divided by the frame length.
///
/// Zero counts as positive, so only moves across the `>= 0` / `< 0` boundary count.
pub fn zcr(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / samples.len() as f32
}
