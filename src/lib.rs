//! vaani - voice client engine for a multilingual document-grounded
//! assistant.
//!
//! The engine owns the four things a conversational voice front end gets
//! wrong when left to ad hoc glue: microphone capture (exclusive, always
//! released), transcription (batch or streaming), speech playback (one
//! audible clip application-wide), and the query lifecycle (newest
//! submission wins). Rendering is someone else's job; subscribe to
//! [`events::ClientEvent`] and call into the managers.

pub mod audio_toolkit;
pub mod backend;
pub mod cli;
pub mod events;
pub mod managers;
pub mod settings;

use std::sync::Arc;

use audio_toolkit::audio::{ChunkSender, MicError, CHUNK_CHANNEL_BOUND};
use backend::{
    BackendClient, BackendError, ChatEntry, FilePayload, TranscriptionError, UploadResponse,
};
use events::{ClientEvent, EventSink, LogEventSink};
use managers::playback::{AudioOutput, PlaybackManager, RodioOutput};
use managers::query::{QueryError, QueryId, QueryManager};
use managers::recording::{RecordedAudio, RecordingManager};
use settings::AppSettings;

pub use managers::playback::{ClipId, ClipState, PlaybackError};
pub use managers::query::{AnswerState, AudioState, QueryView};
pub use managers::recording::RecordingState;

/// Composition root: one backend client, one recording session slot, one
/// global speaker, one query pipeline.
pub struct VoiceClient {
    settings: AppSettings,
    backend: Arc<BackendClient>,
    recording: RecordingManager,
    playback: Arc<PlaybackManager>,
    query: Arc<QueryManager>,
    events: Arc<dyn EventSink>,
}

impl VoiceClient {
    /// Build a client that plays audio through the default output device.
    pub fn new(settings: AppSettings, events: Arc<dyn EventSink>) -> Result<Self, BackendError> {
        Self::with_output(settings, events, Box::new(RodioOutput::spawn()))
    }

    /// Build a client with a custom audio output (headless: `NullOutput`).
    pub fn with_output(
        settings: AppSettings,
        events: Arc<dyn EventSink>,
        output: Box<dyn AudioOutput>,
    ) -> Result<Self, BackendError> {
        let backend = Arc::new(BackendClient::from_settings(&settings)?);
        let playback = Arc::new(PlaybackManager::new(output, events.clone()));
        let recording = RecordingManager::new(&settings, events.clone());
        let query = Arc::new(QueryManager::new(
            &settings,
            backend.clone(),
            playback.clone(),
            events.clone(),
        ));

        Ok(Self {
            settings,
            backend,
            recording,
            playback,
            query,
            events,
        })
    }

    pub fn from_env() -> Result<Self, BackendError> {
        Self::new(AppSettings::load_or_default(), Arc::new(LogEventSink))
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<BackendClient> {
        &self.backend
    }

    pub fn playback(&self) -> &Arc<PlaybackManager> {
        &self.playback
    }

    pub fn recording(&self) -> &RecordingManager {
        &self.recording
    }

    pub fn query(&self) -> &Arc<QueryManager> {
        &self.query
    }

    pub async fn check_health(&self) -> Result<(), BackendError> {
        self.backend.health().await
    }

    /// Upload reference documents; on success the returned knowledge-base
    /// key is stored and the query pipeline unlocks.
    pub async fn upload_documents(
        &self,
        pdf: Option<FilePayload>,
        txt: Option<FilePayload>,
    ) -> Result<UploadResponse, BackendError> {
        let response = self.backend.upload(pdf, txt).await?;
        self.query.set_model_key(response.model_key.clone());
        self.events.on_event(ClientEvent::Notice {
            message: response.message.clone(),
        });
        Ok(response)
    }

    /// Submit a typed or transcribed question.
    pub fn ask(&self, text: &str) -> Result<QueryId, QueryError> {
        self.query.clone().submit(text)
    }

    pub fn start_recording(&self) -> Result<(), MicError> {
        self.recording.start()
    }

    /// Stop recording and return the capture; if the silence watchdog beat
    /// us to it, return that capture instead.
    pub fn stop_recording(&self) -> Option<RecordedAudio> {
        self.recording
            .stop()
            .or_else(|| self.recording.take_auto_capture())
    }

    /// Batch transcription of a finished capture.
    pub async fn transcribe(&self, audio: &RecordedAudio) -> Result<String, TranscriptionError> {
        let text = self.backend.transcribe(&audio.samples).await?;
        self.events.on_event(ClientEvent::TranscriptionFinal {
            text: text.clone(),
        });
        Ok(text)
    }

    /// Begin a streaming transcription session fed by the live recording.
    /// Call [`Self::finish_streaming`] (or stop the recording) to signal
    /// end-of-input; the session then resolves to its final text.
    pub async fn start_streaming_transcription(
        &self,
    ) -> Result<backend::StreamingSession, TranscriptionError> {
        let (tx, rx): (ChunkSender, _) = tokio::sync::mpsc::channel(CHUNK_CHANNEL_BOUND);
        self.recording.route_chunks(Some(tx));

        let session = backend::start_streaming(
            &self.backend.ws_transcribe_url(),
            rx,
            self.settings.streaming_ceiling(),
        )
        .await;

        match session {
            Ok(session) => Ok(session),
            Err(e) => {
                self.recording.route_chunks(None);
                Err(e)
            }
        }
    }

    /// Close the live-chunk route; the streaming session sees end-of-input.
    pub fn finish_streaming(&self) {
        self.recording.route_chunks(None);
    }

    /// Fetch the server-side conversation history.
    pub async fn chat_history(&self) -> Result<Vec<ChatEntry>, BackendError> {
        self.backend.chat_history().await
    }

    /// Play (or synthesize and play) narration for a chat-history entry.
    pub async fn speak_history_entry(
        &self,
        index: usize,
        text: &str,
    ) -> Result<(), PlaybackError> {
        let clip = ClipId::History(index);
        if self.playback.has_clip(clip) {
            self.playback.request_play(clip)
        } else {
            self.playback
                .synthesize_then_play(
                    clip,
                    text,
                    &self.settings.voice_lang_pref,
                    &self.backend,
                    true,
                )
                .await
        }
    }

    /// Leaving the conversational view: silence everything, release the
    /// microphone if it is somehow still held.
    pub fn shutdown(&self) {
        self.playback.stop_all();
        self.recording.cancel();
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
