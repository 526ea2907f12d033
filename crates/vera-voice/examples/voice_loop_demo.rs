//! Vera voice loop demo — microphone, remote assistant and speakers.
//!
//! Needs the `device` feature and a running assistant service (`VERA__INFERENCE__BASE_URL`,
//! default http://127.0.0.1:8787). Type on stdin:
//! - `mic` toggles continuous listening (first press opens the microphone)
//! - `ptt` starts / sends a push-to-talk recording
//! - `quit` stops
//! - anything else is sent as a text message
//!
//! Run: `cargo run -p vera-voice --example voice_loop_demo --features device`

use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vera_voice::{
    run_voice_loop, CpalAudioSource, HttpInferenceClient, RodioPlayback, Session, TurnController,
    TurnEvent, VoiceConfig, VoiceLoopHandle, WavRecorder,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = VoiceConfig::load().context("loading voice config")?;
    info!("Vera voice demo — assistant at {}", config.inference.base_url);

    let client = Arc::new(HttpInferenceClient::from_config(&config.inference)?);
    let (playback, playback_events) =
        RodioPlayback::new(config.inference.timeout()).context("opening speakers")?;
    let recorder = WavRecorder::new(config.audio.sample_rate);
    let (controller, mut events) =
        TurnController::new(config, Session::generate(), recorder, playback);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::Status(status) => info!("[{:?}] {}", status.class, status.text),
                TurnEvent::Transcript { text } => info!("🧑 {}", text),
                TurnEvent::Reply { text } => info!("🤖 {}", text),
                TurnEvent::Error { message } => warn!("⚠️ {}", message),
                other => tracing::debug!("{:?}", other),
            }
        }
    });

    let (handle, actions) = VoiceLoopHandle::new();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let sent = match line.trim() {
                "mic" => handle.press_mic(),
                "ptt" => handle.press_push_to_talk(),
                "quit" => {
                    let _ = handle.shutdown();
                    break;
                }
                text => handle.submit_text(text),
            };
            if sent.is_err() {
                break;
            }
        }
    });

    run_voice_loop(
        controller,
        CpalAudioSource::new(),
        client,
        playback_events,
        actions,
    )
    .await?;
    Ok(())
}
