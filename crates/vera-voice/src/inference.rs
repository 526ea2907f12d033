//! **Remote inference** — ship an utterance (or typed text) to the assistant service and
//! get back a structured reply.
//!
//! Implement `InferenceClient` for any transport; `HttpInferenceClient` speaks the
//! service's HTTP contract:
//!
//! | Call | Request |
//! |------|---------|
//! | voice | `POST {base}/infer` multipart: `audio`, `session_id`, `mode` (`ptt` / `interrupt`, omitted for normal) |
//! | text | `POST {base}/text` JSON `{ text, session_id }` |
//! | command | `POST {base}/command` multipart: `session_id`, `action` |

use crate::capture::UtteranceMode;
use crate::config::InferenceConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Conversation session, generated once per client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    /// Fresh random session id (uuid v4)
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// What the user sent
#[derive(Debug, Clone)]
pub enum Payload {
    /// Encoded recording
    Audio(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub session_id: String,
    pub payload: Payload,
    /// Capture mode for audio payloads; `None` for text
    pub mode: Option<UtteranceMode>,
}

impl InferenceRequest {
    pub fn audio(session: &Session, bytes: Vec<u8>, mode: UtteranceMode) -> Self {
        Self {
            session_id: session.session_id.clone(),
            payload: Payload::Audio(bytes),
            mode: Some(mode),
        }
    }

    pub fn text(session: &Session, text: impl Into<String>) -> Self {
        Self {
            session_id: session.session_id.clone(),
            payload: Payload::Text(text.into()),
            mode: None,
        }
    }

    pub fn origin(&self) -> RequestOrigin {
        match self.payload {
            Payload::Text(_) => RequestOrigin::Text,
            Payload::Audio(_) => RequestOrigin::Voice(self.mode.unwrap_or(UtteranceMode::Normal)),
        }
    }
}

/// Which input produced a request; decides how its reply is sequenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    Voice(UtteranceMode),
    Text,
}

/// Control instruction carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyCommand {
    Pause,
    Unpause,
    /// Anything this client doesn't act on
    #[serde(other)]
    Other,
}

/// Action sent to `/command` when the user toggles pause from the mic button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Unpause,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Unpause => "unpause",
        }
    }
}

/// Structured reply from the service. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceReply {
    #[serde(deserialize_with = "null_as_default")]
    pub transcript: String,
    #[serde(deserialize_with = "null_as_default")]
    pub reply: String,
    /// Usually relative to the service base URL
    pub audio_url: Option<String>,
    pub command: Option<ReplyCommand>,
    #[serde(deserialize_with = "null_as_default")]
    pub paused: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub skip: bool,
}

impl InferenceReply {
    /// Audio URL if the reply has something to play
    pub fn playable_audio(&self) -> Option<&str> {
        self.audio_url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `mode` form field for a capture mode; normal captures send none.
pub fn mode_field(mode: UtteranceMode) -> Option<&'static str> {
    match mode {
        UtteranceMode::Normal => None,
        UtteranceMode::PushToTalk => Some("ptt"),
        UtteranceMode::Interrupt => Some("interrupt"),
    }
}

/// Join a (usually relative) path to the base URL. Absolute URLs pass through.
pub fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Transport to the assistant service. Calls are independent; the caller enforces single flight.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Submit one utterance or text message.
    async fn infer(&self, request: InferenceRequest) -> VoiceResult<InferenceReply>;

    /// Tell the service the user paused or unpaused from the UI.
    async fn send_command(&self, session_id: &str, action: ControlAction) -> VoiceResult<()>;
}

#[derive(Serialize)]
struct TextBody<'a> {
    text: &'a str,
    session_id: &'a str,
}

/// reqwest client for the assistant HTTP API
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    /// Base URL without trailing slash (e.g. http://127.0.0.1:8787).
    pub base_url: String,
    client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_config(config: &InferenceConfig) -> VoiceResult<Self> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn decode(res: reqwest::Response) -> VoiceResult<InferenceReply> {
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::RemoteCallFailed(format!(
                "service error {}: {}",
                status, body
            )));
        }
        let reply: InferenceReply = res.json().await?;
        Ok(reply)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: InferenceRequest) -> VoiceResult<InferenceReply> {
        let res = match request.payload {
            Payload::Audio(bytes) => {
                let size = bytes.len();
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")?;
                let mut form = reqwest::multipart::Form::new()
                    .part("audio", part)
                    .text("session_id", request.session_id);
                if let Some(mode) = request.mode.and_then(mode_field) {
                    form = form.text("mode", mode);
                }
                info!("📡 POST /infer ({} bytes, {:?})", size, request.mode);
                self.client
                    .post(self.endpoint("infer"))
                    .multipart(form)
                    .send()
                    .await?
            }
            Payload::Text(text) => {
                info!("📡 POST /text ({} chars)", text.chars().count());
                self.client
                    .post(self.endpoint("text"))
                    .json(&TextBody {
                        text: &text,
                        session_id: &request.session_id,
                    })
                    .send()
                    .await?
            }
        };

        let reply = Self::decode(res).await?;
        debug!(
            "Reply: skip={} paused={} command={:?} audio={:?}",
            reply.skip, reply.paused, reply.command, reply.audio_url
        );
        Ok(reply)
    }

    async fn send_command(&self, session_id: &str, action: ControlAction) -> VoiceResult<()> {
        let form = reqwest::multipart::Form::new()
            .text("session_id", session_id.to_string())
            .text("action", action.as_str());
        let res = self
            .client
            .post(self.endpoint("command"))
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            warn!("/command {} returned {}", action.as_str(), res.status());
            return Err(VoiceError::RemoteCallFailed(format!(
                "command {} failed: {}",
                action.as_str(),
                res.status()
            )));
        }
        Ok(())
    }
}
