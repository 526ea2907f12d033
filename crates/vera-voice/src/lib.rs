//! # Vera Voice - Client-side Turn Taking
//!
//! This crate decides when the user has finished speaking, when they are talking
//! over the assistant, and how to mask slow answers with a short filler clip.
//! Speech recognition and synthesis live on the remote service; this side only
//! looks at frame energy and zero-crossing rate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Voice Loop (tokio)                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ AudioSource  │→ │SignalAnalyzer│→ │   UtteranceCapture    │  │
//! │  │  (frames)    │  │  (rms, zcr)  │  │ (silence + tail gap)  │  │
//! │  └──────────────┘  └──────┬───────┘  └───────────┬───────────┘  │
//! │                           ↓                      ↓              │
//! │                  ┌─────────────────┐   ┌───────────────────┐    │
//! │                  │ BargeInDetector │ → │  TurnController   │ ──→ InferenceClient
//! │                  │ (band-pass gate)│   │  (state machine)  │ ←── reply (epoch)
//! │                  └─────────────────┘   └─────────┬─────────┘    │
//! │                                                  ↓              │
//! │                  ┌─────────────────┐   ┌───────────────────┐    │
//! │                  │ FillerScheduler │ → │   PlaybackSink    │    │
//! │                  │ (5.3s one-shot) │   │ (rodio / host)    │    │
//! │                  └─────────────────┘   └───────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod barge_in;
pub mod capture;
pub mod config;
pub mod controller;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod filler;
pub mod inference;
pub mod signal;
pub mod voice_loop;

pub use audio::{
    encode_wav, AudioFrame, AudioSource, ChannelAudioSource, ClipId, FrameReceiver, FrameSender,
    PlaybackEvent, PlaybackSink, Recorder, SlidingWindow, WavRecorder,
};
pub use barge_in::BargeInDetector;
pub use capture::{CapturePhase, Utterance, UtteranceCapture, UtteranceMode};
pub use config::{
    AudioConfig, BargeInConfig, CaptureConfig, FillerConfig, InferenceConfig, VoiceConfig,
};
pub use controller::{
    ConversationMode, Outbound, StatusClass, StatusLine, TurnController, TurnEvent, TurnState,
};
#[cfg(feature = "device")]
pub use device::{CpalAudioSource, RodioPlayback};
pub use error::{EmptyReason, VoiceError, VoiceResult};
pub use filler::{FillerCue, FillerScheduler, FillerWindow, PendingAnswer};
pub use inference::{
    ControlAction, HttpInferenceClient, InferenceClient, InferenceReply, InferenceRequest,
    Payload, ReplyCommand, RequestOrigin, Session,
};
pub use signal::{FeatureSample, SignalAnalyzer};
pub use voice_loop::{run_voice_loop, UserAction, VoiceLoopHandle};
