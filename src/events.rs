//! Client events - observer seam between the engine and whatever renders it
//!
//! Consumers implement EventSink to receive state changes. The engine never
//! talks to a UI directly; every user-visible condition flows through here.

use std::sync::Arc;

use crate::managers::playback::{ClipId, ClipState};
use crate::managers::query::QueryId;

/// Events emitted by the voice client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Microphone capture started
    RecordingStarted,
    /// Microphone capture ended; duration of the captured audio
    RecordingStopped { seconds: f32, auto: bool },
    /// Live input level for visual feedback (0.0-1.0)
    InputLevel { level: f32 },
    /// Intermediate transcription result; replaces any prior partial
    TranscriptionPartial { text: String },
    /// Terminal transcription result
    TranscriptionFinal { text: String },
    /// Transcription ended without usable text
    TranscriptionFailed { message: String },
    /// Answer text resolved for a query
    AnswerReady { query_id: QueryId, reply: String },
    /// Answer request failed
    AnswerFailed { query_id: QueryId, message: String },
    /// Narration audio is decoded and attached to its clip slot
    NarrationReady { clip: ClipId },
    /// Narration failed; the answer text stands on its own
    NarrationFailed { clip: ClipId, message: String },
    /// The global speaker changed clip or state
    PlaybackChanged { clip: ClipId, state: ClipState },
    /// Platform refused to start audio; will retry on next user interaction
    PlaybackBlocked { clip: ClipId },
    /// Short user-facing notice (rate limits, upload results)
    Notice { message: String },
}

/// Trait for receiving client events
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: ClientEvent);
}

/// No-op event sink (silent operation)
pub struct NoopEventSink;
impl EventSink for NoopEventSink {
    fn on_event(&self, _event: ClientEvent) {}
}

/// Logging event sink
pub struct LogEventSink;
impl EventSink for LogEventSink {
    fn on_event(&self, event: ClientEvent) {
        match &event {
            ClientEvent::RecordingStarted => log::info!("[client] Recording started"),
            ClientEvent::RecordingStopped { seconds, auto } => {
                log::info!("[client] Recording stopped ({seconds:.1}s, auto={auto})")
            }
            ClientEvent::InputLevel { .. } => {}
            ClientEvent::TranscriptionPartial { text } => {
                log::debug!("[client] Partial: '{text}'")
            }
            ClientEvent::TranscriptionFinal { text } => log::info!("[client] Heard: '{text}'"),
            ClientEvent::TranscriptionFailed { message } => {
                log::warn!("[client] Transcription failed: {message}")
            }
            ClientEvent::AnswerReady { query_id, reply } => {
                log::info!("[client] Answer #{query_id}: {} chars", reply.len())
            }
            ClientEvent::AnswerFailed { query_id, message } => {
                log::warn!("[client] Answer #{query_id} failed: {message}")
            }
            ClientEvent::NarrationReady { clip } => {
                log::info!("[client] Narration ready for {clip:?}")
            }
            ClientEvent::NarrationFailed { clip, message } => {
                log::warn!("[client] Narration for {clip:?} failed: {message}")
            }
            ClientEvent::PlaybackChanged { clip, state } => {
                log::debug!("[client] Playback: {clip:?} -> {state:?}")
            }
            ClientEvent::PlaybackBlocked { clip } => {
                log::warn!("[client] Playback blocked for {clip:?}; waiting for interaction")
            }
            ClientEvent::Notice { message } => log::info!("[client] {message}"),
        }
    }
}

/// Fan events out to several sinks
pub struct FanoutSink(pub Vec<Arc<dyn EventSink>>);
impl EventSink for FanoutSink {
    fn on_event(&self, event: ClientEvent) {
        for sink in &self.0 {
            sink.on_event(event.clone());
        }
    }
}
