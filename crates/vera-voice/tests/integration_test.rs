//! Integration tests against a local mock of the assistant service
//!
//! The mock speaks the same HTTP contract as the real service (`/infer`, `/text`,
//! `/command`) so the reqwest client and the voice loop run unmodified.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use vera_voice::{
    run_voice_loop, ChannelAudioSource, ClipId, ControlAction, HttpInferenceClient,
    InferenceClient, InferenceRequest, PlaybackEvent, PlaybackSink, Session, TurnController,
    TurnEvent, TurnState, UtteranceMode, VoiceConfig, VoiceError, VoiceLoopHandle, VoiceResult,
    WavRecorder,
};

/// Everything the mock service received, as `(route, field, value)`
type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

async fn read_form(route: &str, seen: &Seen, mut multipart: Multipart) {
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let value = if name == "audio" {
            format!("{} bytes", field.bytes().await.unwrap().len())
        } else {
            field.text().await.unwrap()
        };
        seen.lock().unwrap().push((route.to_string(), name, value));
    }
}

async fn infer(State(seen): State<Seen>, multipart: Multipart) -> Json<Value> {
    read_form("infer", &seen, multipart).await;
    Json(json!({
        "transcript": "what time is it",
        "reply": "half past ten",
        "audio_url": "/audio/answer.wav",
        "command": null,
        "paused": false
    }))
}

async fn text(State(seen): State<Seen>, Json(body): Json<Value>) -> Json<Value> {
    for key in ["text", "session_id"] {
        let value = body[key].as_str().unwrap_or_default().to_string();
        seen.lock().unwrap().push(("text".into(), key.into(), value));
    }
    Json(json!({
        "transcript": body["text"],
        "reply": "typed answer",
        "audio_url": "/audio/typed.wav"
    }))
}

async fn command(State(seen): State<Seen>, multipart: Multipart) -> StatusCode {
    read_form("command", &seen, multipart).await;
    StatusCode::OK
}

async fn spawn_service() -> (String, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/infer", post(infer))
        .route("/text", post(text))
        .route("/command", post(command))
        .route("/broken/infer", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .with_state(Arc::clone(&seen));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

fn fields(seen: &Seen, route: &str) -> Vec<(String, String)> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|(r, _, _)| r == route)
        .map(|(_, k, v)| (k.clone(), v.clone()))
        .collect()
}

#[tokio::test]
async fn voice_upload_uses_multipart_contract() {
    let (base, seen) = spawn_service().await;
    let client = HttpInferenceClient::new(&base, Duration::from_secs(5)).unwrap();
    let session = Session::new("s-42");

    let reply = client
        .infer(InferenceRequest::audio(
            &session,
            vec![7u8; 2048],
            UtteranceMode::Interrupt,
        ))
        .await
        .unwrap();

    assert_eq!(reply.transcript, "what time is it");
    assert_eq!(reply.reply, "half past ten");
    assert_eq!(reply.playable_audio(), Some("/audio/answer.wav"));
    assert!(reply.command.is_none());

    let got = fields(&seen, "infer");
    assert!(got.contains(&("audio".into(), "2048 bytes".into())));
    assert!(got.contains(&("session_id".into(), "s-42".into())));
    assert!(got.contains(&("mode".into(), "interrupt".into())));
}

#[tokio::test]
async fn normal_utterance_sends_no_mode() {
    let (base, seen) = spawn_service().await;
    let client = HttpInferenceClient::new(&base, Duration::from_secs(5)).unwrap();

    client
        .infer(InferenceRequest::audio(
            &Session::new("s-1"),
            vec![1u8; 64],
            UtteranceMode::Normal,
        ))
        .await
        .unwrap();

    assert!(fields(&seen, "infer").iter().all(|(k, _)| k != "mode"));
}

#[tokio::test]
async fn text_and_command_calls() {
    let (base, seen) = spawn_service().await;
    let client = HttpInferenceClient::new(format!("{}/", base), Duration::from_secs(5)).unwrap();

    let reply = client
        .infer(InferenceRequest::text(&Session::new("s-7"), "hello there"))
        .await
        .unwrap();
    assert_eq!(reply.transcript, "hello there");
    assert_eq!(
        fields(&seen, "text"),
        vec![
            ("text".to_string(), "hello there".to_string()),
            ("session_id".to_string(), "s-7".to_string()),
        ]
    );

    client.send_command("s-7", ControlAction::Unpause).await.unwrap();
    let got = fields(&seen, "command");
    assert!(got.contains(&("action".into(), "unpause".into())));
    assert!(got.contains(&("session_id".into(), "s-7".into())));
}

#[tokio::test]
async fn service_error_is_a_remote_failure() {
    let (base, _seen) = spawn_service().await;
    let client =
        HttpInferenceClient::new(format!("{}/broken", base), Duration::from_secs(5)).unwrap();

    let err = client
        .infer(InferenceRequest::audio(
            &Session::new("s"),
            vec![0u8; 16],
            UtteranceMode::Normal,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::RemoteCallFailed(ref m) if m.contains("500")));
    assert!(err.is_user_visible());
}

#[tokio::test]
async fn unreachable_service_is_a_remote_failure() {
    // nothing listens on port 9 locally
    let client = HttpInferenceClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let err = client
        .infer(InferenceRequest::text(&Session::new("s"), "hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::RemoteCallFailed(_)));
}

/// Playback that only records what it was asked to play
#[derive(Clone, Default)]
struct RecordingPlayback {
    played: Arc<Mutex<Vec<(ClipId, String)>>>,
    playing: Arc<Mutex<Option<ClipId>>>,
}

impl PlaybackSink for RecordingPlayback {
    fn play(&mut self, clip: ClipId, url: &str) -> VoiceResult<()> {
        self.played.lock().unwrap().push((clip, url.to_string()));
        *self.playing.lock().unwrap() = Some(clip);
        Ok(())
    }

    fn stop(&mut self) {
        *self.playing.lock().unwrap() = None;
    }

    fn position(&self) -> Option<Duration> {
        self.playing.lock().unwrap().map(|_| Duration::ZERO)
    }

    fn is_playing(&self) -> bool {
        self.playing.lock().unwrap().is_some()
    }
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<TurnEvent>, mut pred: F) -> TurnEvent
where
    F: FnMut(&TurnEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn typed_message_round_trip_through_the_loop() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (base, seen) = spawn_service().await;
    let mut config = VoiceConfig::default();
    config.inference.base_url = base.clone();

    let client = Arc::new(HttpInferenceClient::from_config(&config.inference).unwrap());
    let playback = RecordingPlayback::default();
    let played = Arc::clone(&playback.played);
    let (controller, mut events) = TurnController::new(
        config,
        Session::new("typed"),
        WavRecorder::new(16000),
        playback,
    );
    let (source, _frame_tx) = ChannelAudioSource::new();
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let (handle, actions) = VoiceLoopHandle::new();

    let task = tokio::spawn(run_voice_loop(controller, source, client, playback_rx, actions));

    handle.submit_text("tell me a joke").unwrap();
    let transcript = wait_for(&mut events, |e| matches!(e, TurnEvent::Transcript { .. })).await;
    assert_eq!(
        transcript,
        TurnEvent::Transcript {
            text: "tell me a joke".into()
        }
    );
    let reply = wait_for(&mut events, |e| matches!(e, TurnEvent::Reply { .. })).await;
    assert_eq!(
        reply,
        TurnEvent::Reply {
            text: "typed answer".into()
        }
    );

    let (clip, url) = played.lock().unwrap().last().cloned().unwrap();
    assert_eq!(url, format!("{}/audio/typed.wav", base));

    playback_tx
        .send(PlaybackEvent::Started {
            clip,
            at: Instant::now(),
        })
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TurnEvent::StateChanged { to: TurnState::Speaking, .. })
    })
    .await;

    playback_tx
        .send(PlaybackEvent::Ended {
            clip,
            at: Instant::now(),
        })
        .unwrap();
    wait_for(&mut events, |e| {
        matches!(e, TurnEvent::StateChanged { to: TurnState::Idle, .. })
    })
    .await;

    handle.shutdown().unwrap();
    let controller = task.await.unwrap().unwrap();
    assert_eq!(controller.state(), TurnState::Idle);
    assert!(controller.in_flight().is_none());
    assert_eq!(fields(&seen, "text").len(), 2);
}
