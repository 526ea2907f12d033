//! Turn Controller - the conversation state machine
//!
//! Owns the capture, barge-in and filler components and sequences one turn at a time:
//! `Idle → Listening → Processing → Speaking → Listening`, with `Paused` as
//! listening-with-a-flag. The controller does no I/O of its own. It is driven by
//! [`TurnController::on_frame`], [`TurnController::tick`] and the completion methods,
//! queues remote work in an outbox, and reports what happened as [`TurnEvent`]s.
//!
//! Every remote call carries an epoch and every played clip a [`ClipId`], so a
//! completion that belongs to a superseded call or clip is rejected with
//! `StaleEventIgnored` instead of mutating state.

use crate::audio::{AudioFrame, ClipId, PlaybackEvent, PlaybackSink, Recorder};
use crate::barge_in::BargeInDetector;
use crate::capture::{UtteranceCapture, UtteranceMode};
use crate::config::VoiceConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::filler::{FillerCue, FillerScheduler, PendingAnswer};
use crate::inference::{
    resolve_url, ControlAction, InferenceReply, InferenceRequest, ReplyCommand, RequestOrigin,
    Session,
};
use crate::signal::SignalAnalyzer;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Where the conversation is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Processing,
    Speaking,
    /// Listening, but the service was told to hold off until "unpause"
    Paused,
}

/// How the user talks to the assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationMode {
    /// Hands-free: capture re-arms after every turn, barge-in enabled
    Continuous,
    /// One press starts a capture, the next press sends it
    PushToTalk,
}

/// Visual class of the status line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Idle,
    Recording,
    Thinking,
    Speaking,
    Paused,
    Offline,
}

/// User-facing status text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub text: &'static str,
    pub class: StatusClass,
}

impl StatusLine {
    pub const READY: StatusLine = StatusLine::new("Ready", StatusClass::Idle);
    pub const LISTENING: StatusLine = StatusLine::new("Listening…", StatusClass::Recording);
    pub const LISTENING_PTT: StatusLine =
        StatusLine::new("Listening (PTT)… tap again to send", StatusClass::Recording);
    pub const INTERRUPTED: StatusLine =
        StatusLine::new("Listening… (interrupted)", StatusClass::Recording);
    pub const PAUSED: StatusLine =
        StatusLine::new("Paused — say “unpause” or press mic", StatusClass::Paused);
    pub const PROCESSING: StatusLine = StatusLine::new("Processing…", StatusClass::Thinking);
    pub const THINKING: StatusLine = StatusLine::new("Thinking…", StatusClass::Thinking);
    pub const SPEAKING: StatusLine = StatusLine::new("Speaking…", StatusClass::Speaking);
    pub const SPEAKING_INTERRUPTIBLE: StatusLine =
        StatusLine::new("Speaking… (Interruptible)", StatusClass::Speaking);
    pub const SPEAKING_AFTER_INTERRUPT: StatusLine = StatusLine::new(
        "Speaking… (can only be interrupted once)",
        StatusClass::Speaking,
    );
    pub const SERVER_ERROR: StatusLine = StatusLine::new("Server error", StatusClass::Offline);
    pub const CANT_PAUSE: StatusLine =
        StatusLine::new("Can’t pause — microphone isn’t active", StatusClass::Idle);
    pub const MIC_UNAVAILABLE: StatusLine =
        StatusLine::new("Microphone unavailable", StatusClass::Offline);

    pub const fn new(text: &'static str, class: StatusClass) -> Self {
        Self { text, class }
    }
}

/// Observable output of the controller
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
        timestamp: DateTime<Utc>,
    },

    Status(StatusLine),

    /// What the user said (or typed)
    Transcript { text: String },

    /// What the assistant answered
    Reply { text: String },

    FillerStarted { cue: u64, clip: String },

    /// User talked over the assistant; playback was cut
    Interrupted { timestamp: DateTime<Utc> },

    /// User-visible failure (network, microphone)
    Error { message: String },
}

/// Remote work queued for the driver
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Run the call and hand the result back to [`TurnController::on_reply`] with `epoch`.
    Infer { epoch: u64, request: InferenceRequest },
    /// Fire-and-forget pause toggle
    Command { action: ControlAction },
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    epoch: u64,
    origin: RequestOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClipKind {
    Filler { cue: u64 },
    Answer { origin: RequestOrigin, interruptible: bool },
}

#[derive(Debug, Clone, Copy)]
struct ActiveClip {
    id: ClipId,
    kind: ClipKind,
}

/// Single-owner turn-taking state machine
pub struct TurnController<R: Recorder, P: PlaybackSink> {
    config: VoiceConfig,
    session: Session,
    recorder: R,
    playback: P,

    analyzer: SignalAnalyzer,
    capture: UtteranceCapture,
    barge_in: BargeInDetector,
    filler: FillerScheduler,

    state: TurnState,
    mode: ConversationMode,
    status: StatusLine,
    paused: bool,
    mic_ready: bool,
    /// Hands-free listening switched on by the mic button; suspended by errors
    auto_listen: bool,

    request_epoch: u64,
    in_flight: Option<InFlight>,

    clip_seq: u64,
    clip: Option<ActiveClip>,

    outbox: VecDeque<Outbound>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl<R: Recorder, P: PlaybackSink> TurnController<R, P> {
    /// Create a controller and the receiving end of its event stream
    pub fn new(
        config: VoiceConfig,
        session: Session,
        recorder: R,
        playback: P,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let controller = Self {
            analyzer: SignalAnalyzer,
            capture: UtteranceCapture::new(config.capture.clone()),
            barge_in: BargeInDetector::new(config.barge_in.clone()),
            filler: FillerScheduler::new(config.filler.clone()),
            config,
            session,
            recorder,
            playback,
            state: TurnState::Idle,
            mode: ConversationMode::Continuous,
            status: StatusLine::READY,
            paused: false,
            mic_ready: false,
            auto_listen: false,
            request_epoch: 0,
            in_flight: None,
            clip_seq: 0,
            clip: None,
            outbox: VecDeque::new(),
            event_tx,
        };

        (controller, event_rx)
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// The audio source opened successfully.
    pub fn on_mic_ready(&mut self) {
        if !self.mic_ready {
            info!("🎙️ Microphone ready");
        }
        self.mic_ready = true;
    }

    /// The audio source could not be opened or the recorder refused to start.
    /// Voice mode shuts down; text keeps working.
    pub fn on_device_unavailable(&mut self, err: VoiceError) {
        error!("Microphone unavailable: {}", err);
        self.mic_ready = false;
        self.auto_listen = false;
        self.capture.cancel(&mut self.recorder);
        self.barge_in.disarm();
        if self.in_flight.is_none() && self.clip.is_none() {
            self.set_state(TurnState::Idle);
        }
        self.set_status(StatusLine::MIC_UNAVAILABLE);
        self.emit(TurnEvent::Error {
            message: err.to_string(),
        });
    }

    /// Mic button. First press starts hands-free listening; later presses toggle pause
    /// and tell the service.
    pub fn press_mic(&mut self, now: Instant) -> VoiceResult<()> {
        self.mode = ConversationMode::Continuous;

        if !self.auto_listen {
            if !self.mic_ready {
                return Err(VoiceError::DeviceUnavailable(
                    "microphone is not open".to_string(),
                ));
            }
            self.auto_listen = true;
            self.paused = false;
            info!("🎧 Hands-free listening on");
            if self.is_busy() {
                // capture re-arms once the current turn completes
                return Ok(());
            }
            return self.arm_listening(now);
        }

        self.paused = !self.paused;
        let action = if self.paused {
            ControlAction::Pause
        } else {
            ControlAction::Unpause
        };
        info!("⏯️ Mic toggle: {}", action.as_str());
        self.outbox.push_back(Outbound::Command { action });

        if self.is_busy() {
            return Ok(());
        }
        self.arm_listening(now)
    }

    /// Push-to-talk button. Press #1 starts a manual capture, press #2 sends it.
    pub fn press_push_to_talk(&mut self, now: Instant) -> VoiceResult<()> {
        if self.in_flight.is_some() {
            return Err(VoiceError::RequestInFlight);
        }

        let recording_ptt =
            self.capture.is_active() && self.capture.mode() == UtteranceMode::PushToTalk;

        if !recording_ptt {
            if !self.mic_ready {
                return Err(VoiceError::DeviceUnavailable(
                    "microphone is not open".to_string(),
                ));
            }
            self.mode = ConversationMode::PushToTalk;
            self.auto_listen = false;
            self.filler.discard();
            self.stop_clip();
            if let Err(e) = self
                .capture
                .begin(&mut self.recorder, UtteranceMode::PushToTalk, now)
            {
                self.on_device_unavailable(e);
                return Ok(());
            }
            self.set_state(TurnState::Listening);
            self.set_status(StatusLine::LISTENING_PTT);
            return Ok(());
        }

        self.set_status(StatusLine::PROCESSING);
        self.finalize_capture(now)
    }

    /// Typed message. No capture, no filler, no barge-in for its reply.
    pub fn submit_text(&mut self, text: &str) -> VoiceResult<()> {
        let text = text.trim();

        if text.to_lowercase().contains("pause") && !self.mic_ready {
            self.emit(TurnEvent::Transcript {
                text: text.to_string(),
            });
            self.hard_reset(StatusLine::CANT_PAUSE);
            return Ok(());
        }

        if self.status.class == StatusClass::Offline {
            self.hard_reset(StatusLine::READY);
        }

        if text.is_empty() {
            return Ok(());
        }
        if self.in_flight.is_some() {
            return Err(VoiceError::RequestInFlight);
        }

        self.capture.cancel(&mut self.recorder);
        self.filler.discard();
        self.stop_clip();

        self.emit(TurnEvent::Transcript {
            text: text.to_string(),
        });
        let request = InferenceRequest::text(&self.session, text);
        self.issue(request);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// One analysis frame from the microphone
    pub fn on_frame(&mut self, frame: &AudioFrame) -> VoiceResult<()> {
        if self.recorder.is_recording() {
            self.recorder.push_frame(frame);
        }
        let sample = self.analyzer.analyze(frame);
        let now = sample.timestamp;

        if self.barge_in_enabled() && self.barge_in.observe(&sample) {
            self.interrupt(now);
        }

        if self.capture.is_active() && self.capture.observe(&sample, self.clip.is_some()) {
            self.finalize_capture(now)?;
        }

        self.tick(now)
    }

    /// Timers: capture ceilings, the filler delay and the filler grace release.
    pub fn tick(&mut self, now: Instant) -> VoiceResult<()> {
        if self.capture.is_active() && self.capture.poll(now, self.clip.is_some()) {
            self.finalize_capture(now)?;
        }

        if let Some(cue) = self
            .filler
            .poll(now, self.in_flight.is_some(), self.paused)
        {
            self.play_filler(cue, now);
        }

        if let Some(answer) = self.filler.take_due(now) {
            self.play_answer(answer, now);
        }

        Ok(())
    }

    /// Result of the call issued with `epoch`.
    pub fn on_reply(
        &mut self,
        epoch: u64,
        result: VoiceResult<InferenceReply>,
        now: Instant,
    ) -> VoiceResult<()> {
        let flight = match self.in_flight {
            Some(f) if f.epoch == epoch => f,
            other => {
                return Err(VoiceError::StaleEventIgnored {
                    kind: "request",
                    got: epoch,
                    current: other.map(|f| f.epoch),
                })
            }
        };
        self.in_flight = None;
        let filler_playing = self.filler.disarm();

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.on_remote_failure(e);
                return Ok(());
            }
        };

        let continuous = self.mode == ConversationMode::Continuous;
        let text_turn = flight.origin == RequestOrigin::Text;

        if reply.skip {
            debug!("⏭️ Reply {} skipped", epoch);
            self.drop_filler();
            return self.resume(now);
        }

        match reply.command {
            Some(ReplyCommand::Pause) if continuous || text_turn => {
                self.drop_filler();
                if !self.mic_ready {
                    self.hard_reset(StatusLine::CANT_PAUSE);
                    return Ok(());
                }
                info!("⏸️ Paused by reply {}", epoch);
                self.paused = true;
                return self.arm_listening(now);
            }
            Some(ReplyCommand::Unpause) if continuous => {
                self.drop_filler();
                info!("▶️ Unpaused by reply {}", epoch);
                self.paused = false;
                return self.arm_listening(now);
            }
            _ => {}
        }

        if reply.paused && (continuous || text_turn) {
            self.drop_filler();
            self.paused = true;
            return self.arm_listening(now);
        }

        self.paused = false;
        if !text_turn {
            self.emit(TurnEvent::Transcript {
                text: reply.transcript.clone(),
            });
        }

        let answer = PendingAnswer {
            turn: epoch,
            origin: flight.origin,
            reply,
        };
        if filler_playing {
            debug!("Reply {} waits for the filler", epoch);
        }
        if let Some(answer) = self.filler.hold(answer) {
            self.play_answer(answer, now);
        }
        Ok(())
    }

    /// Playback started or ended.
    pub fn on_playback_event(&mut self, event: PlaybackEvent) -> VoiceResult<()> {
        let (clip_id, at, started) = match event {
            PlaybackEvent::Started { clip, at } => (clip, at, true),
            PlaybackEvent::Ended { clip, at } => (clip, at, false),
        };

        let active = match self.clip {
            Some(active) if active.id == clip_id => active,
            other => {
                return Err(VoiceError::StaleEventIgnored {
                    kind: "clip",
                    got: clip_id.0,
                    current: other.map(|c| c.id.0),
                })
            }
        };

        match (active.kind, started) {
            (ClipKind::Filler { cue }, true) => {
                debug!("Filler {} started", cue);
            }
            (ClipKind::Filler { cue }, false) => {
                self.clip = None;
                self.filler.on_filler_ended(cue, at)?;
            }
            (ClipKind::Answer { origin, interruptible }, true) => {
                self.set_state(TurnState::Speaking);
                let status = match origin {
                    _ if interruptible => StatusLine::SPEAKING_INTERRUPTIBLE,
                    RequestOrigin::Voice(UtteranceMode::Interrupt) => {
                        StatusLine::SPEAKING_AFTER_INTERRUPT
                    }
                    _ => StatusLine::SPEAKING,
                };
                self.set_status(status);
                if interruptible {
                    self.barge_in.arm(at);
                }
            }
            (ClipKind::Answer { .. }, false) => {
                info!("🔈 Reply playback finished");
                self.clip = None;
                self.barge_in.disarm();
                self.resume(at)?;
            }
        }
        Ok(())
    }

    /// Drain the queued remote work.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn barge_in_enabled(&self) -> bool {
        self.mode == ConversationMode::Continuous
            && self.barge_in.is_armed()
            && !self.filler.is_active()
    }

    fn interrupt(&mut self, now: Instant) {
        info!("⚡ User interrupted the reply");
        self.emit(TurnEvent::Interrupted {
            timestamp: Utc::now(),
        });
        self.playback.stop();
        self.clip = None;
        self.filler.discard();

        self.set_state(TurnState::Listening);
        self.set_status(StatusLine::INTERRUPTED);
        if let Err(e) = self
            .capture
            .begin(&mut self.recorder, UtteranceMode::Interrupt, now)
        {
            self.on_device_unavailable(e);
        }
    }

    fn finalize_capture(&mut self, now: Instant) -> VoiceResult<()> {
        let mode = self.capture.mode();
        let utterance = match self.capture.finish(&mut self.recorder) {
            Ok(u) => u,
            Err(VoiceError::EmptyUtterance(reason)) => {
                debug!("Empty {:?} utterance ({:?}), not sending", mode, reason);
                return self.resume(now);
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                return self.resume(now);
            }
        };

        if self.in_flight.is_some() {
            warn!("Dropping utterance: a call is already in flight");
            return Err(VoiceError::RequestInFlight);
        }

        let request = InferenceRequest::audio(&self.session, utterance.audio_blob, utterance.mode);
        self.filler.arm(now);
        self.issue(request);
        Ok(())
    }

    fn issue(&mut self, request: InferenceRequest) {
        self.request_epoch += 1;
        let epoch = self.request_epoch;
        self.in_flight = Some(InFlight {
            epoch,
            origin: request.origin(),
        });
        self.set_state(TurnState::Processing);
        self.set_status(StatusLine::THINKING);
        debug!("Request {} queued ({:?})", epoch, request.origin());
        self.outbox.push_back(Outbound::Infer { epoch, request });
    }

    fn play_filler(&mut self, cue: FillerCue, now: Instant) {
        let id = self.next_clip();
        let url = resolve_url(&self.config.inference.base_url, &cue.clip);
        match self.playback.play(id, &url) {
            Ok(()) => {
                self.clip = Some(ActiveClip {
                    id,
                    kind: ClipKind::Filler { cue: cue.id },
                });
                self.emit(TurnEvent::FillerStarted {
                    cue: cue.id,
                    clip: cue.clip,
                });
            }
            Err(e) => {
                warn!("Filler playback failed: {}", e);
                if let Err(e) = self.filler.on_filler_ended(cue.id, now) {
                    debug!("{}", e);
                }
            }
        }
    }

    fn play_answer(&mut self, answer: PendingAnswer, now: Instant) {
        let PendingAnswer {
            turn,
            origin,
            reply,
        } = answer;
        self.emit(TurnEvent::Reply {
            text: reply.reply.clone(),
        });

        let Some(path) = reply.playable_audio() else {
            debug!("Reply {} has no audio", turn);
            if let Err(e) = self.resume(now) {
                warn!("Resume after silent reply failed: {}", e);
            }
            return;
        };

        let id = self.next_clip();
        let url = resolve_url(&self.config.inference.base_url, path);
        // The reply to an interruption can't itself be interrupted.
        let interruptible = self.mode == ConversationMode::Continuous
            && origin == RequestOrigin::Voice(UtteranceMode::Normal);

        if self.clip.is_some() {
            self.playback.stop();
        }
        match self.playback.play(id, &url) {
            Ok(()) => {
                info!("🔊 Playing reply {} ({})", turn, url);
                self.clip = Some(ActiveClip {
                    id,
                    kind: ClipKind::Answer {
                        origin,
                        interruptible,
                    },
                });
            }
            Err(e) => {
                warn!("Reply playback failed: {}", e);
                self.clip = None;
                if let Err(e) = self.resume(now) {
                    warn!("Resume after playback failure failed: {}", e);
                }
            }
        }
    }

    fn on_remote_failure(&mut self, err: VoiceError) {
        error!("Remote call failed: {}", err);
        self.drop_filler();
        self.capture.cancel(&mut self.recorder);
        self.auto_listen = false;
        self.set_state(TurnState::Idle);
        self.set_status(StatusLine::SERVER_ERROR);
        self.emit(TurnEvent::Error {
            message: err.to_string(),
        });
    }

    /// Turn finished (or produced nothing): go back to whatever listening the mode implies.
    fn resume(&mut self, now: Instant) -> VoiceResult<()> {
        if let Some(f) = self.in_flight {
            debug!("Resume deferred: request {} still in flight", f.epoch);
            return Ok(());
        }
        if self.capture.is_active() && self.capture.mode() == UtteranceMode::PushToTalk {
            // the manual recording owns state and status until the second press
            return Ok(());
        }
        if self.auto_listen && self.mic_ready && self.mode == ConversationMode::Continuous {
            return self.arm_listening(now);
        }
        let state = if self.mic_ready {
            TurnState::Listening
        } else {
            TurnState::Idle
        };
        self.set_state(state);
        self.set_status(StatusLine::READY);
        Ok(())
    }

    /// Fresh hands-free segment; state and status follow the pause flag.
    fn arm_listening(&mut self, now: Instant) -> VoiceResult<()> {
        if let Err(e) = self
            .capture
            .begin(&mut self.recorder, UtteranceMode::Normal, now)
        {
            self.on_device_unavailable(e);
            return Ok(());
        }
        if self.paused {
            self.set_state(TurnState::Paused);
            self.set_status(StatusLine::PAUSED);
        } else {
            self.set_state(TurnState::Listening);
            self.set_status(StatusLine::LISTENING);
        }
        Ok(())
    }

    /// Cut the clip that is playing. Its start/end events become stale.
    fn stop_clip(&mut self) {
        if let Some(clip) = self.clip.take() {
            debug!("Stopping clip {}", clip.id.0);
            self.playback.stop();
        }
        self.barge_in.disarm();
    }

    /// Forget the filler for this turn, silencing its clip if one is playing.
    fn drop_filler(&mut self) {
        self.filler.discard();
        if matches!(
            self.clip,
            Some(ActiveClip {
                kind: ClipKind::Filler { .. },
                ..
            })
        ) {
            self.stop_clip();
        }
    }

    /// Drop the outstanding call and all listening.
    fn hard_reset(&mut self, status: StatusLine) {
        if let Some(f) = self.in_flight.take() {
            debug!("Hard reset drops request {}", f.epoch);
        }
        self.paused = false;
        self.auto_listen = false;
        self.filler.discard();
        self.stop_clip();
        self.capture.cancel(&mut self.recorder);
        self.set_state(TurnState::Idle);
        self.set_status(status);
    }

    fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.clip.is_some() || self.filler.has_pending()
    }

    fn next_clip(&mut self) -> ClipId {
        self.clip_seq += 1;
        ClipId(self.clip_seq)
    }

    fn set_state(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("🔄 {:?} → {:?}", from, to);
        self.state = to;
        self.emit(TurnEvent::StateChanged {
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    fn set_status(&mut self, status: StatusLine) {
        if self.status == status {
            return;
        }
        self.status = status.clone();
        self.emit(TurnEvent::Status(status));
    }

    fn emit(&self, event: TurnEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Turn event dropped: no subscriber");
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    pub fn mode(&self) -> ConversationMode {
        self.mode
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_mic_ready(&self) -> bool {
        self.mic_ready
    }

    /// Epoch of the outstanding call, if any
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight.map(|f| f.epoch)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn capture(&self) -> &UtteranceCapture {
        &self.capture
    }

    pub fn barge_in(&self) -> &BargeInDetector {
        &self.barge_in
    }

    pub fn filler(&self) -> &FillerScheduler {
        &self.filler
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    pub fn playback(&self) -> &P {
        &self.playback
    }
}
