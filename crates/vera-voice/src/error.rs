//! Error types for the Vera turn-taking engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Why a capture produced nothing worth sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// No frame crossed the volume threshold before the ceiling elapsed
    NoSpeech,
    /// The encoded blob was below the minimum size
    TooSmall { size_bytes: usize },
}

/// Errors that can occur in the turn-taking engine
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access denied or no input device. Fatal to voice mode only.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capture ended without usable speech. Recovered locally, never surfaced.
    #[error("Empty utterance: {0:?}")]
    EmptyUtterance(EmptyReason),

    /// Network or decode failure talking to the inference service.
    #[error("Remote call failed: {0}")]
    RemoteCallFailed(String),

    /// A completion arrived for a superseded recorder, clip or request.
    #[error("Stale {kind} event ignored (got {got}, current {current:?})")]
    StaleEventIgnored {
        kind: &'static str,
        got: u64,
        current: Option<u64>,
    },

    /// A voice or text submission arrived while a remote call was outstanding.
    #[error("A remote call is already in flight")]
    RequestInFlight,

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error should reach the user (status line / error event).
    ///
    /// Capture-level and detector-level conditions are recovered locally.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            VoiceError::DeviceUnavailable(_) | VoiceError::RemoteCallFailed(_)
        )
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::RemoteCallFailed(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Recorder(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_and_remote_errors_are_visible() {
        assert!(VoiceError::DeviceUnavailable("denied".into()).is_user_visible());
        assert!(VoiceError::RemoteCallFailed("timeout".into()).is_user_visible());
        assert!(!VoiceError::EmptyUtterance(EmptyReason::NoSpeech).is_user_visible());
        assert!(!VoiceError::StaleEventIgnored {
            kind: "clip",
            got: 1,
            current: Some(2)
        }
        .is_user_visible());
    }
}
