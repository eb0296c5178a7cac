//! REST client for the assistant backend.
//!
//! The backend owns document ingestion, retrieval, answer generation,
//! transcription and speech synthesis; this client only speaks the wire
//! contract and maps failures onto the client-side error taxonomy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, warn};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio_toolkit::audio::{samples_to_wav, CAPTURE_SAMPLE_RATE};
use crate::settings::AppSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    RateLimited(String),
    #[error("The request timed out; the backend may be overloaded")]
    Timeout,
    #[error("Backend error: {0}")]
    Service(String),
    #[error("Could not decode the response audio: {0}")]
    Decode(String),
    #[error("{0}")]
    InvalidRequest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("No speech was detected in the recording")]
    NoSpeechDetected,
    #[error("That language is not supported; please use English, Hindi or Marathi")]
    UnsupportedLanguage,
    #[error("{0}")]
    RateLimited(String),
    #[error("Transcription failed: {0}")]
    Service(String),
    #[error("Transcription timed out")]
    Timeout,
}

impl From<BackendError> for TranscriptionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::RateLimited(msg) => TranscriptionError::RateLimited(msg),
            BackendError::Timeout => TranscriptionError::Timeout,
            other => TranscriptionError::Service(other.to_string()),
        }
    }
}

/// One user/assistant exchange as the backend stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub user: String,
    pub assistant: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub message: String,
    pub model_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub input_text: String,
    pub model_key: String,
    pub enhanced_mode: bool,
    pub voice_lang_pref: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    reply: String,
}

#[derive(Debug, Deserialize)]
struct ChatHistoryResponse {
    #[serde(default)]
    chat_history: Vec<ChatEntry>,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    audio_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    transcription: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A document to upload, by name and content.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Service(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &AppSettings) -> Result<Self, BackendError> {
        Self::new(&settings.backend_url, settings.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The WebSocket address of the streaming transcription endpoint.
    pub fn ws_transcribe_url(&self) -> String {
        websocket_url(&self.base_url)
    }

    pub async fn health(&self) -> Result<(), BackendError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Service(format!(
                "Health check returned {}",
                response.status()
            )))
        }
    }

    /// Upload reference documents and receive the knowledge-base key that
    /// scopes every later query. At least one file is required; that is
    /// checked here so an empty upload never leaves the client.
    pub async fn upload(
        &self,
        pdf: Option<FilePayload>,
        txt: Option<FilePayload>,
    ) -> Result<UploadResponse, BackendError> {
        if pdf.is_none() && txt.is_none() {
            return Err(BackendError::InvalidRequest(
                "Please provide at least one file (PDF or TXT)".to_string(),
            ));
        }

        let mut form = Form::new();
        if let Some(pdf) = pdf {
            let part = Part::bytes(pdf.bytes)
                .file_name(pdf.file_name)
                .mime_str("application/pdf")
                .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
            form = form.part("pdf_file", part);
        }
        if let Some(txt) = txt {
            let part = Part::bytes(txt.bytes)
                .file_name(txt.file_name)
                .mime_str("text/plain")
                .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
            form = form.part("txt_file", part);
        }

        let response = self
            .http
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Service(format!("Malformed upload response: {e}")))?;
        debug!("Knowledge base ready: {}", upload.model_key);
        Ok(upload)
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<String, BackendError> {
        debug!(
            "Query ({} chars, lang={}, enhanced={})",
            request.input_text.len(),
            request.voice_lang_pref,
            request.enhanced_mode
        );

        let response = self
            .http
            .post(format!("{}/query", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let answer: QueryResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Service(format!("Malformed query response: {e}")))?;
        Ok(answer.reply)
    }

    pub async fn chat_history(&self) -> Result<Vec<ChatEntry>, BackendError> {
        let response = self
            .http
            .get(format!("{}/chat-history", self.base_url))
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let history: ChatHistoryResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Service(format!("Malformed history response: {e}")))?;
        Ok(history.chat_history)
    }

    /// Synthesize speech for `text`; returns WAV bytes.
    pub async fn synthesize(
        &self,
        text: &str,
        lang_preference: &str,
    ) -> Result<Vec<u8>, BackendError> {
        let form = Form::new()
            .text("text", text.to_string())
            .text("lang_preference", lang_preference.to_string());

        let response = self
            .http
            .post(format!("{}/tts", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response).await?;
        let tts: TtsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Service(format!("Malformed TTS response: {e}")))?;

        let encoded = tts
            .audio_base64
            .ok_or_else(|| BackendError::Service("TTS returned no audio".to_string()))?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Batch transcription: ship the whole recording as a WAV attachment.
    pub async fn transcribe(&self, samples: &[f32]) -> Result<String, TranscriptionError> {
        if samples.is_empty() {
            return Err(TranscriptionError::NoSpeechDetected);
        }

        let wav = samples_to_wav(samples, CAPTURE_SAMPLE_RATE)
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;
        debug!("Transcribing {} bytes of WAV", wav.len());

        let part = Part::bytes(wav)
            .file_name("query.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Service(e.to_string()))?;
        let form = Form::new().part("audio", part);

        let response = self
            .http
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::from(map_transport_error(e)))?;

        let response = check_status(response).await?;
        let body: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Service(format!("Malformed response: {e}")))?;

        if let Some(error) = body.error {
            return Err(classify_transcription_error(&error));
        }

        let text = body.transcription.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            warn!("Backend returned an empty transcription");
            return Err(TranscriptionError::NoSpeechDetected);
        }
        Ok(text)
    }
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Service(e.to_string())
    }
}

/// Promote a non-2xx response to a typed error, preserving the server's
/// own wording for rate limits so it can be surfaced verbatim.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BackendError::RateLimited(rate_limit_message(&body)));
    }
    Err(BackendError::Service(format!(
        "HTTP {}: {}",
        status,
        server_message(&body)
    )))
}

/// Pull a human-readable message out of an error body shaped like
/// `{"message": ...}` or `{"error": ...}`, falling back to the raw text.
fn server_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.trim().to_string())
}

fn rate_limit_message(body: &str) -> String {
    let msg = server_message(body);
    if msg.is_empty() {
        "Rate limited. Please wait a moment before asking again.".to_string()
    } else {
        msg
    }
}

fn classify_transcription_error(error: &str) -> TranscriptionError {
    let lower = error.to_lowercase();
    if lower.contains("no speech") || lower.contains("too small") || lower.contains("corrupted") {
        TranscriptionError::NoSpeechDetected
    } else if lower.contains("language") {
        TranscriptionError::UnsupportedLanguage
    } else {
        TranscriptionError::Service(error.to_string())
    }
}

fn websocket_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{ws_base}/ws/transcribe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://localhost:8000"),
            "ws://localhost:8000/ws/transcribe"
        );
        assert_eq!(
            websocket_url("https://assistant.example.org"),
            "wss://assistant.example.org/ws/transcribe"
        );
    }

    #[test]
    fn test_server_message_shapes() {
        assert_eq!(
            server_message(r#"{"message": "Rate limited. Wait 5.0 seconds."}"#),
            "Rate limited. Wait 5.0 seconds."
        );
        assert_eq!(
            server_message(r#"{"error": "Empty query input."}"#),
            "Empty query input."
        );
        assert_eq!(server_message("plain text"), "plain text");
    }

    #[test]
    fn test_transcription_error_classification() {
        assert!(matches!(
            classify_transcription_error("Audio file is too small or corrupted"),
            TranscriptionError::NoSpeechDetected
        ));
        assert!(matches!(
            classify_transcription_error("Unsupported language detected"),
            TranscriptionError::UnsupportedLanguage
        ));
        assert!(matches!(
            classify_transcription_error("whisper exploded"),
            TranscriptionError::Service(_)
        ));
    }

    #[test]
    fn test_upload_requires_a_file() {
        let client = BackendClient::new("http://localhost:8000", Duration::from_secs(1)).unwrap();
        let result = futures_util::FutureExt::now_or_never(client.upload(None, None));
        assert!(matches!(
            result,
            Some(Err(BackendError::InvalidRequest(_)))
        ));
    }
}
