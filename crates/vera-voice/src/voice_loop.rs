//! **Voice loop** — the async driver around [`TurnController`].
//!
//! One task owns the controller and serializes everything into it with `tokio::select!`:
//! microphone frames, a periodic tick (~60 Hz), playback notifications, finished
//! remote calls and user actions. Remote calls run as their own tasks and come back
//! tagged with the epoch they were issued under, so nothing here ever blocks on I/O.

use crate::audio::{AudioFrame, AudioSource, FrameReceiver, PlaybackEvent, PlaybackSink, Recorder};
use crate::controller::{Outbound, TurnController};
use crate::error::{VoiceError, VoiceResult};
use crate::inference::{InferenceClient, InferenceReply};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Button presses and typed input from the host UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    PressMic,
    PressPushToTalk,
    SubmitText(String),
    Shutdown,
}

/// Sender side for [`UserAction`]s
#[derive(Debug, Clone)]
pub struct VoiceLoopHandle {
    tx: mpsc::UnboundedSender<UserAction>,
}

impl VoiceLoopHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UserAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, action: UserAction) -> VoiceResult<()> {
        self.tx
            .send(action)
            .map_err(|e| VoiceError::ChannelSend(format!("voice loop stopped: {:?}", e.0)))
    }

    pub fn press_mic(&self) -> VoiceResult<()> {
        self.send(UserAction::PressMic)
    }

    pub fn press_push_to_talk(&self) -> VoiceResult<()> {
        self.send(UserAction::PressPushToTalk)
    }

    pub fn submit_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(UserAction::SubmitText(text.into()))
    }

    pub fn shutdown(&self) -> VoiceResult<()> {
        self.send(UserAction::Shutdown)
    }
}

type ReplyResult = (u64, VoiceResult<InferenceReply>);

/// Runs the loop until `Shutdown` or until every action sender is dropped, then hands
/// the controller back.
///
/// The audio source is opened lazily on the first mic or push-to-talk press.
pub async fn run_voice_loop<R, P, S, C>(
    mut controller: TurnController<R, P>,
    mut source: S,
    client: Arc<C>,
    mut playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    mut actions: mpsc::UnboundedReceiver<UserAction>,
) -> VoiceResult<TurnController<R, P>>
where
    R: Recorder,
    P: PlaybackSink,
    S: AudioSource,
    C: InferenceClient + ?Sized + 'static,
{
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ReplyResult>();
    let mut frames: Option<FrameReceiver> = None;

    let mut ticker = tokio::time::interval(controller.config().audio.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("🚀 Voice loop started (session {})", controller.session().session_id);

    loop {
        let outcome = tokio::select! {
            frame = next_frame(&mut frames) => match frame {
                Some(frame) => controller.on_frame(&frame),
                None => {
                    frames = None;
                    controller.on_device_unavailable(VoiceError::DeviceUnavailable(
                        "audio stream closed".to_string(),
                    ));
                    Ok(())
                }
            },
            _ = ticker.tick() => controller.tick(now()),
            Some(event) = playback_events.recv() => controller.on_playback_event(event),
            Some((epoch, result)) = reply_rx.recv() => controller.on_reply(epoch, result, now()),
            action = actions.recv() => match action {
                None | Some(UserAction::Shutdown) => break,
                Some(UserAction::PressMic) => {
                    if open_source(&mut source, &mut frames, &mut controller) {
                        controller.press_mic(now())
                    } else {
                        Ok(())
                    }
                }
                Some(UserAction::PressPushToTalk) => {
                    if open_source(&mut source, &mut frames, &mut controller) {
                        controller.press_push_to_talk(now())
                    } else {
                        Ok(())
                    }
                }
                Some(UserAction::SubmitText(text)) => controller.submit_text(&text),
            },
        };

        if let Err(e) = outcome {
            match e {
                VoiceError::StaleEventIgnored { .. } => debug!("{}", e),
                other => warn!("Voice loop: {}", other),
            }
        }

        dispatch(&mut controller, &client, &reply_tx);
    }

    info!("🛑 Voice loop stopped");
    Ok(controller)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn next_frame(frames: &mut Option<FrameReceiver>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Open the microphone once. Returns whether voice input is usable.
fn open_source<R, P, S>(
    source: &mut S,
    frames: &mut Option<FrameReceiver>,
    controller: &mut TurnController<R, P>,
) -> bool
where
    R: Recorder,
    P: PlaybackSink,
    S: AudioSource,
{
    let constraints = controller.config().audio.clone();
    match source.open(&constraints) {
        Ok(Some(rx)) => {
            *frames = Some(rx);
            controller.on_mic_ready();
            true
        }
        Ok(None) => {
            if frames.is_none() {
                controller.on_device_unavailable(VoiceError::DeviceUnavailable(
                    "audio stream closed".to_string(),
                ));
                return false;
            }
            controller.on_mic_ready();
            true
        }
        Err(e) => {
            controller.on_device_unavailable(e);
            false
        }
    }
}

/// Spawn whatever remote work the controller queued.
fn dispatch<R, P, C>(
    controller: &mut TurnController<R, P>,
    client: &Arc<C>,
    reply_tx: &mpsc::UnboundedSender<ReplyResult>,
) where
    R: Recorder,
    P: PlaybackSink,
    C: InferenceClient + ?Sized + 'static,
{
    for outbound in controller.take_outbound() {
        match outbound {
            Outbound::Infer { epoch, request } => {
                let client = Arc::clone(client);
                let tx = reply_tx.clone();
                tokio::spawn(async move {
                    let result = client.infer(request).await;
                    if tx.send((epoch, result)).is_err() {
                        debug!("Reply {} dropped: loop stopped", epoch);
                    }
                });
            }
            Outbound::Command { action } => {
                let client = Arc::clone(client);
                let session_id = controller.session().session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.send_command(&session_id, action).await {
                        warn!("Command {} failed: {}", action.as_str(), e);
                    }
                });
            }
        }
    }
}
