//! Bare-metal devices: cpal microphone source and rodio playback sink.
//!
//! Only built with the `device` feature.

use crate::audio::{
    AudioFrame, AudioSource, ClipId, FrameReceiver, PlaybackEvent, PlaybackSink, SlidingWindow,
};
use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use rodio::{OutputStream, Sink};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default input device via cpal. The stream lives as long as the source.
pub struct CpalAudioSource {
    stream: Option<Stream>,
}

impl CpalAudioSource {
    pub fn new() -> Self {
        Self { stream: None }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Default for CpalAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for CpalAudioSource {
    fn open(&mut self, constraints: &AudioConfig) -> VoiceResult<Option<FrameReceiver>> {
        if self.stream.is_some() {
            return Ok(None);
        }

        info!("🎤 Opening microphone ({}Hz mono)", constraints.sample_rate);
        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            warn!("cpal has no input processing; echo/noise/gain flags are ignored");
        }

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(constraints.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let sample_rate = constraints.sample_rate;
        let mut window = SlidingWindow::from_config(constraints);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                window.push(data, |samples, fresh| {
                    // receiver gone means the loop stopped; frames are dropped
                    let _ = tx.send(AudioFrame::sliding(
                        samples,
                        fresh,
                        sample_rate,
                        Instant::now(),
                    ));
                });
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        info!(
            "✅ Microphone open ({}-sample window every {} samples)",
            constraints.frame_size, constraints.hop_size
        );

        self.stream = Some(stream);
        Ok(Some(rx))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

enum SinkCommand {
    Play { clip: ClipId, url: String },
    Stop,
}

/// Clip currently owned by the worker and when it started
type NowPlaying = Arc<Mutex<Option<(ClipId, Instant)>>>;

/// rodio output on a dedicated thread.
///
/// `OutputStream` is not `Send`, so a worker owns it together with the sink. `play`
/// fetches the clip over HTTP, decodes it and reports start/end on the event channel.
pub struct RodioPlayback {
    commands: std_mpsc::Sender<SinkCommand>,
    now_playing: NowPlaying,
}

impl RodioPlayback {
    pub fn new(fetch_timeout: Duration) -> VoiceResult<(Self, mpsc::UnboundedReceiver<PlaybackEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let now_playing: NowPlaying = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&now_playing);

        let client = reqwest::blocking::Client::builder()
            .timeout(fetch_timeout)
            .build()?;

        thread::Builder::new()
            .name("vera-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                info!("🔊 Playback sink ready");
                run_sink(handle, client, cmd_rx, event_tx, shared);
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited".to_string()))??;

        Ok((
            Self {
                commands: cmd_tx,
                now_playing,
            },
            event_rx,
        ))
    }

    fn current(&self) -> Option<(ClipId, Instant)> {
        self.now_playing.lock().ok().and_then(|g| *g)
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&mut self, clip: ClipId, url: &str) -> VoiceResult<()> {
        self.commands
            .send(SinkCommand::Play {
                clip,
                url: url.to_string(),
            })
            .map_err(|_| VoiceError::Playback("playback thread exited".to_string()))
    }

    fn stop(&mut self) {
        if let Ok(mut g) = self.now_playing.lock() {
            *g = None;
        }
        if self.commands.send(SinkCommand::Stop).is_err() {
            warn!("Playback: stop after the worker exited");
        }
    }

    fn position(&self) -> Option<Duration> {
        self.current().map(|(_, started)| started.elapsed())
    }

    fn is_playing(&self) -> bool {
        self.current().is_some()
    }
}

const POLL: Duration = Duration::from_millis(20);

fn run_sink(
    handle: rodio::OutputStreamHandle,
    client: reqwest::blocking::Client,
    commands: std_mpsc::Receiver<SinkCommand>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    now_playing: NowPlaying,
) {
    let mut sink: Option<(ClipId, Sink)> = None;

    loop {
        match commands.recv_timeout(POLL) {
            Ok(SinkCommand::Play { clip, url }) => {
                if let Some((_, old)) = sink.take() {
                    old.stop();
                }
                match start_clip(&handle, &client, &url) {
                    Ok(new_sink) => {
                        let at = Instant::now();
                        set_playing(&now_playing, Some((clip, at)));
                        debug!("Playback: clip {} started ({})", clip.0, url);
                        let _ = events.send(PlaybackEvent::Started { clip, at });
                        sink = Some((clip, new_sink));
                    }
                    Err(e) => {
                        // no audible output; report it as a zero-length clip so the turn moves on
                        error!("Playback: clip {} failed: {}", clip.0, e);
                        let at = Instant::now();
                        let _ = events.send(PlaybackEvent::Started { clip, at });
                        let _ = events.send(PlaybackEvent::Ended { clip, at });
                    }
                }
            }
            Ok(SinkCommand::Stop) => {
                if let Some((clip, s)) = sink.take() {
                    s.stop();
                    info!("Playback: clip {} stopped", clip.0);
                }
                set_playing(&now_playing, None);
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if sink.as_ref().is_some_and(|(_, s)| s.empty()) {
            if let Some((clip, _)) = sink.take() {
                set_playing(&now_playing, None);
                debug!("Playback: clip {} ended", clip.0);
                let _ = events.send(PlaybackEvent::Ended {
                    clip,
                    at: Instant::now(),
                });
            }
        }
    }

    debug!("Playback worker exiting");
}

fn start_clip(
    handle: &rodio::OutputStreamHandle,
    client: &reqwest::blocking::Client,
    url: &str,
) -> VoiceResult<Sink> {
    let res = client.get(url).send()?;
    if !res.status().is_success() {
        return Err(VoiceError::Playback(format!("GET {} returned {}", url, res.status())));
    }
    let bytes = res.bytes()?.to_vec();
    let source = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
    let sink = Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
    sink.append(source);
    Ok(sink)
}

fn set_playing(now_playing: &NowPlaying, value: Option<(ClipId, Instant)>) {
    if let Ok(mut g) = now_playing.lock() {
        *g = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_devices_does_not_panic() {
        // may be empty on CI
        let _ = CpalAudioSource::list_input_devices();
    }

    #[test]
    fn fresh_source_is_closed() {
        assert!(!CpalAudioSource::new().is_open());
    }
}
