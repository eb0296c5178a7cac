//! Query lifecycle orchestration.
//!
//! Each submission gets a monotonically increasing id and two independently
//! resolving facets: the answer text and its narration. Only the
//! highest-id query ever updates the "current answer" surface - a response
//! that arrives for an older id is recorded into history and otherwise
//! dropped (last submission wins, not last response). Answer and narration
//! failures are isolated: a silent answer is an answer, not an error.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::audio_toolkit::text::{classify_script, ScriptClass};
use crate::backend::{BackendClient, BackendError, ChatEntry, QueryRequest};
use crate::events::{ClientEvent, EventSink};
use crate::managers::playback::{ClipId, PlaybackError, PlaybackManager};
use crate::settings::AppSettings;

pub type QueryId = u64;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Only English, Hindi and Marathi input is supported")]
    UnsupportedInputScript,
    #[error("Please upload at least one document before asking questions")]
    MissingKnowledgeBase,
    #[error("Please enter a question first")]
    EmptyInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerState {
    Pending,
    Ready(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioState {
    Pending,
    Ready(ClipId),
    /// No narration for this answer (too short, or narration disabled)
    Absent,
    Failed(String),
}

/// What the UI renders as "the current exchange".
#[derive(Debug, Clone)]
pub struct QueryView {
    pub id: QueryId,
    pub text: String,
    pub answer: AnswerState,
    pub audio: AudioState,
}

struct QueryInner {
    current: Option<QueryView>,
    /// Local history cache, newest first.
    history: Vec<ChatEntry>,
}

pub struct QueryManager {
    next_id: AtomicU64,
    inner: Mutex<QueryInner>,
    model_key: Mutex<Option<String>>,
    backend: Arc<BackendClient>,
    playback: Arc<PlaybackManager>,
    events: Arc<dyn EventSink>,
    enhanced_mode: bool,
    voice_lang_pref: String,
    auto_play: bool,
}

impl QueryManager {
    pub fn new(
        settings: &AppSettings,
        backend: Arc<BackendClient>,
        playback: Arc<PlaybackManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(QueryInner {
                current: None,
                history: Vec::new(),
            }),
            model_key: Mutex::new(None),
            backend,
            playback,
            events,
            enhanced_mode: settings.enhanced_mode,
            voice_lang_pref: settings.voice_lang_pref.clone(),
            auto_play: settings.auto_play_responses,
        }
    }

    /// Record the knowledge-base key returned by a successful upload.
    pub fn set_model_key(&self, key: String) {
        info!("Knowledge base unlocked: {key}");
        *self.model_key.lock().unwrap() = Some(key);
    }

    pub fn has_model_key(&self) -> bool {
        self.model_key.lock().unwrap().is_some()
    }

    pub fn current_view(&self) -> Option<QueryView> {
        self.inner.lock().unwrap().current.clone()
    }

    /// Locally cached exchanges, newest first.
    pub fn local_history(&self) -> Vec<ChatEntry> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Validate and register a submission without touching the network.
    /// Any previously pending query is superseded from this moment on.
    pub fn submit_local(&self, text: &str) -> Result<QueryId, QueryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryError::EmptyInput);
        }
        if !self.has_model_key() {
            return Err(QueryError::MissingKnowledgeBase);
        }
        if classify_script(text) == ScriptClass::Unsupported {
            warn!("Rejecting input outside the supported scripts");
            return Err(QueryError::UnsupportedInputScript);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = &inner.current {
            if previous.answer == AnswerState::Pending {
                debug!("Query #{} superseded by #{id}", previous.id);
            }
        }
        inner.current = Some(QueryView {
            id,
            text: text.to_string(),
            answer: AnswerState::Pending,
            audio: AudioState::Pending,
        });
        Ok(id)
    }

    /// Submit a question: validates locally, then fires the answer request.
    /// Narration for the reply is requested as soon as the reply is known;
    /// the two facets resolve independently.
    pub fn submit(self: Arc<Self>, text: &str) -> Result<QueryId, QueryError> {
        let id = self.submit_local(text)?;
        let question = text.trim().to_string();

        let request = QueryRequest {
            input_text: question.clone(),
            model_key: self
                .model_key
                .lock()
                .unwrap()
                .clone()
                .expect("model key checked in submit_local"),
            enhanced_mode: self.enhanced_mode,
            voice_lang_pref: self.voice_lang_pref.clone(),
        };

        let manager = self;
        tokio::spawn(async move {
            let result = manager.backend.query(&request).await;
            let narrate = manager.apply_answer(id, &question, result);

            if let Some(reply) = narrate {
                let outcome = manager
                    .playback
                    .synthesize_then_play(
                        ClipId::Query(id),
                        &reply,
                        &manager.voice_lang_pref,
                        &manager.backend,
                        manager.auto_play,
                    )
                    .await;
                manager.apply_audio(id, outcome);
            }
        });

        Ok(id)
    }

    /// Fold an answer resolution into the state machine. Returns the reply
    /// text when this query is still current and narration should proceed.
    ///
    /// Stale resolutions (a newer query exists) are recorded into history
    /// but never promoted to the current view and never narrated.
    pub fn apply_answer(
        &self,
        id: QueryId,
        question: &str,
        result: Result<String, BackendError>,
    ) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();

        if let Ok(reply) = &result {
            inner.history.insert(
                0,
                ChatEntry {
                    user: question.to_string(),
                    assistant: reply.clone(),
                    timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
                },
            );
        }

        let is_current = inner.current.as_ref().map(|v| v.id) == Some(id);
        if !is_current {
            debug!("Dropping stale answer for query #{id}");
            return None;
        }

        let view = inner.current.as_mut().expect("current checked above");
        match result {
            Ok(reply) => {
                view.answer = AnswerState::Ready(reply.clone());
                drop(inner);
                self.events.on_event(ClientEvent::AnswerReady {
                    query_id: id,
                    reply: reply.clone(),
                });
                Some(reply)
            }
            Err(e) => {
                let message = e.to_string();
                view.answer = AnswerState::Failed(message.clone());
                // No answer means nothing to narrate either.
                view.audio = AudioState::Absent;
                drop(inner);
                self.events.on_event(ClientEvent::AnswerFailed {
                    query_id: id,
                    message,
                });
                None
            }
        }
    }

    /// Fold a narration resolution into the state machine. Narration failure
    /// never disturbs a displayed answer.
    pub fn apply_audio(&self, id: QueryId, result: Result<(), PlaybackError>) {
        let mut inner = self.inner.lock().unwrap();
        let is_current = inner.current.as_ref().map(|v| v.id) == Some(id);
        if !is_current {
            debug!("Dropping stale narration for query #{id}");
            return;
        }

        let view = inner.current.as_mut().expect("current checked above");
        let clip = ClipId::Query(id);
        match result {
            Ok(()) => {
                view.audio = AudioState::Ready(clip);
            }
            Err(PlaybackError::NothingToSpeak) => {
                view.audio = AudioState::Absent;
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Narration for query #{id} failed: {message}");
                view.audio = AudioState::Failed(message.clone());
                drop(inner);
                self.events
                    .on_event(ClientEvent::NarrationFailed { clip, message });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use crate::managers::playback::NullOutput;
    use std::time::Duration;

    fn manager() -> QueryManager {
        let settings = AppSettings::default();
        let backend =
            Arc::new(BackendClient::new("http://localhost:8000", Duration::from_secs(1)).unwrap());
        let playback = Arc::new(PlaybackManager::new(
            Box::new(NullOutput),
            Arc::new(NoopEventSink),
        ));
        let manager = QueryManager::new(&settings, backend, playback, Arc::new(NoopEventSink));
        manager.set_model_key("kb-test".to_string());
        manager
    }

    #[test]
    fn test_last_submission_wins_when_old_answer_arrives_late() {
        let manager = manager();
        let q1 = manager.submit_local("what is the health scheme?").unwrap();
        let q2 = manager.submit_local("what about housing?").unwrap();
        assert!(q2 > q1);

        // q1's answer lands after q2 was submitted: history only.
        let narrate = manager.apply_answer(q1, "what is the health scheme?", Ok("h1".into()));
        assert!(narrate.is_none());
        let view = manager.current_view().unwrap();
        assert_eq!(view.id, q2);
        assert_eq!(view.answer, AnswerState::Pending);

        let narrate = manager.apply_answer(q2, "what about housing?", Ok("h2".into()));
        assert_eq!(narrate.as_deref(), Some("h2"));
        let view = manager.current_view().unwrap();
        assert_eq!(view.answer, AnswerState::Ready("h2".into()));

        // Both replies reached history, newest first.
        let history = manager.local_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].assistant, "h2");
        assert_eq!(history[1].assistant, "h1");
    }

    #[test]
    fn test_last_submission_wins_reversed_completion_order() {
        let manager = manager();
        let q1 = manager.submit_local("q1").unwrap();
        let q2 = manager.submit_local("q2").unwrap();

        manager.apply_answer(q2, "q2", Ok("a2".into()));
        manager.apply_answer(q1, "q1", Ok("a1".into()));

        let view = manager.current_view().unwrap();
        assert_eq!(view.id, q2);
        assert_eq!(view.answer, AnswerState::Ready("a2".into()));
    }

    #[test]
    fn test_devanagari_accepted_cyrillic_rejected() {
        let manager = manager();
        assert!(manager.submit_local("मुख्यमंत्री योजना काय आहे?").is_ok());
        assert!(matches!(
            manager.submit_local("Что это?"),
            Err(QueryError::UnsupportedInputScript)
        ));
    }

    #[test]
    fn test_query_requires_model_key() {
        let settings = AppSettings::default();
        let backend =
            Arc::new(BackendClient::new("http://localhost:8000", Duration::from_secs(1)).unwrap());
        let playback = Arc::new(PlaybackManager::new(
            Box::new(NullOutput),
            Arc::new(NoopEventSink),
        ));
        let manager = QueryManager::new(&settings, backend, playback, Arc::new(NoopEventSink));

        assert!(matches!(
            manager.submit_local("hello"),
            Err(QueryError::MissingKnowledgeBase)
        ));
    }

    #[test]
    fn test_empty_input_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.submit_local("   "),
            Err(QueryError::EmptyInput)
        ));
    }

    #[test]
    fn test_narration_failure_keeps_answer() {
        let manager = manager();
        let id = manager.submit_local("मुख्यमंत्री योजना काय आहे?").unwrap();

        let narrate = manager.apply_answer(id, "मुख्यमंत्री योजना काय आहे?", Ok("उत्तर".into()));
        assert!(narrate.is_some());

        manager.apply_audio(
            id,
            Err(PlaybackError::Synthesis("tts backend unreachable".into())),
        );

        let view = manager.current_view().unwrap();
        assert_eq!(view.answer, AnswerState::Ready("उत्तर".into()));
        assert!(matches!(view.audio, AudioState::Failed(_)));
    }

    #[test]
    fn test_answer_failure_is_terminal_for_audio_too() {
        let manager = manager();
        let id = manager.submit_local("hello there").unwrap();

        manager.apply_answer(
            id,
            "hello there",
            Err(BackendError::RateLimited("Rate limited. Wait 5.0 seconds.".into())),
        );

        let view = manager.current_view().unwrap();
        assert_eq!(
            view.answer,
            AnswerState::Failed("Rate limited. Wait 5.0 seconds.".into())
        );
        assert_eq!(view.audio, AudioState::Absent);
        // A failed answer never reaches history.
        assert!(manager.local_history().is_empty());
    }

    #[test]
    fn test_stale_narration_dropped() {
        let manager = manager();
        let q1 = manager.submit_local("first").unwrap();
        manager.apply_answer(q1, "first", Ok("a1".into()));
        let q2 = manager.submit_local("second").unwrap();

        manager.apply_audio(q1, Ok(()));
        let view = manager.current_view().unwrap();
        assert_eq!(view.id, q2);
        assert_eq!(view.audio, AudioState::Pending);
    }
}
