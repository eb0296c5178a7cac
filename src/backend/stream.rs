//! Streaming transcription over the backend's WebSocket endpoint.
//!
//! Chunks are forwarded as they arrive from the capture pipeline; the server
//! answers with zero or more partials and exactly one terminal final or
//! error. A partial always replaces the previously displayed text - the
//! transport may reorder, so nothing is ever appended client-side. A session
//! that produces no terminal result within the ceiling is finalized as a
//! timeout. Sessions are single-use; restart by opening a new one.

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::api::TranscriptionError;
use crate::audio_toolkit::audio::samples_to_pcm16_bytes;

/// Progress of a streaming transcription.
#[derive(Debug, Clone)]
pub enum StreamingUpdate {
    /// Interim text; replaces anything previously displayed
    Partial(String),
    /// Terminal text for the session
    Final(String),
    /// Terminal failure for the session
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    partial: Option<String>,
    #[serde(default, rename = "final")]
    final_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_server_message(text: &str) -> Option<StreamingUpdate> {
    let msg: WireMessage = serde_json::from_str(text).ok()?;
    if let Some(error) = msg.error {
        Some(StreamingUpdate::Failed(error))
    } else if let Some(final_text) = msg.final_text {
        Some(StreamingUpdate::Final(final_text))
    } else {
        msg.partial.map(StreamingUpdate::Partial)
    }
}

/// Replace-not-append display semantics for streamed text.
pub fn apply_update(display: &mut String, update: &StreamingUpdate) {
    match update {
        StreamingUpdate::Partial(text) | StreamingUpdate::Final(text) => {
            display.clear();
            display.push_str(text);
        }
        StreamingUpdate::Failed(_) => {}
    }
}

/// A live streaming transcription session.
pub struct StreamingSession {
    updates: mpsc::UnboundedReceiver<StreamingUpdate>,
}

impl StreamingSession {
    pub(crate) fn from_updates(updates: mpsc::UnboundedReceiver<StreamingUpdate>) -> Self {
        Self { updates }
    }

    /// Next update, or None once the session has delivered its terminal.
    pub async fn next_update(&mut self) -> Option<StreamingUpdate> {
        self.updates.recv().await
    }

    /// Drive the session to its terminal and return the final text.
    pub async fn final_text(mut self) -> Result<String, TranscriptionError> {
        let mut display = String::new();
        while let Some(update) = self.updates.recv().await {
            apply_update(&mut display, &update);
            match update {
                StreamingUpdate::Final(_) => return Ok(display),
                StreamingUpdate::Failed(message) => {
                    return Err(if message == "timeout" {
                        TranscriptionError::Timeout
                    } else {
                        TranscriptionError::Service(message)
                    })
                }
                StreamingUpdate::Partial(_) => {}
            }
        }
        Err(TranscriptionError::Service(
            "Streaming session ended without a result".to_string(),
        ))
    }
}

/// Open a streaming session. `chunks` carries live 16 kHz mono frames from
/// the recorder; closing it signals end-of-input to the server.
pub async fn start_streaming(
    ws_url: &str,
    chunks: mpsc::Receiver<Vec<f32>>,
    ceiling: Duration,
) -> Result<StreamingSession, TranscriptionError> {
    let (ws, _) = connect_async(ws_url)
        .await
        .map_err(|e| TranscriptionError::Service(format!("WebSocket connect failed: {e}")))?;
    debug!("Streaming transcription session open at {ws_url}");

    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_session(ws, chunks, ceiling, updates_tx));
    Ok(StreamingSession::from_updates(updates_rx))
}

async fn run_session(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut chunks: mpsc::Receiver<Vec<f32>>,
    ceiling: Duration,
    updates: mpsc::UnboundedSender<StreamingUpdate>,
) {
    let (mut to_server, mut from_server) = ws.split();
    let deadline = tokio::time::sleep(ceiling);
    tokio::pin!(deadline);
    let mut input_open = true;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("Streaming transcription hit the {}s ceiling", ceiling.as_secs());
                let _ = updates.send(StreamingUpdate::Failed("timeout".to_string()));
                let _ = to_server.send(Message::Close(None)).await;
                return;
            }

            chunk = chunks.recv(), if input_open => {
                match chunk {
                    Some(samples) => {
                        let frame = samples_to_pcm16_bytes(&samples);
                        if let Err(e) = to_server.send(Message::Binary(frame)).await {
                            let _ = updates.send(StreamingUpdate::Failed(format!(
                                "Failed to send audio: {e}"
                            )));
                            return;
                        }
                    }
                    None => {
                        input_open = false;
                        debug!("Capture finished, signalling end of stream");
                        let end = r#"{"event":"end"}"#.to_string();
                        if let Err(e) = to_server.send(Message::Text(end)).await {
                            let _ = updates.send(StreamingUpdate::Failed(format!(
                                "Failed to finish stream: {e}"
                            )));
                            return;
                        }
                    }
                }
            }

            message = from_server.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match parse_server_message(&text) {
                            Some(update @ StreamingUpdate::Partial(_)) => {
                                let _ = updates.send(update);
                            }
                            Some(update) => {
                                let _ = updates.send(update);
                                let _ = to_server.send(Message::Close(None)).await;
                                return;
                            }
                            None => debug!("Ignoring unrecognized server message: {text}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = updates.send(StreamingUpdate::Failed(
                            "Server closed the stream early".to_string(),
                        ));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = updates.send(StreamingUpdate::Failed(e.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_messages() {
        assert!(matches!(
            parse_server_message(r#"{"partial": "नम"}"#),
            Some(StreamingUpdate::Partial(t)) if t == "नम"
        ));
        assert!(matches!(
            parse_server_message(r#"{"final": "नमस्ते"}"#),
            Some(StreamingUpdate::Final(t)) if t == "नमस्ते"
        ));
        assert!(matches!(
            parse_server_message(r#"{"error": "boom"}"#),
            Some(StreamingUpdate::Failed(t)) if t == "boom"
        ));
        assert!(parse_server_message("not json").is_none());
    }

    #[test]
    fn test_partials_replace_rather_than_append() {
        let mut display = String::new();
        for update in [
            StreamingUpdate::Partial("न".to_string()),
            StreamingUpdate::Partial("नमस्".to_string()),
            StreamingUpdate::Final("नमस्ते".to_string()),
        ] {
            apply_update(&mut display, &update);
        }
        assert_eq!(display, "नमस्ते");
    }

    #[tokio::test]
    async fn test_final_text_resolves_terminal() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamingUpdate::Partial("नम".to_string())).unwrap();
        tx.send(StreamingUpdate::Final("नमस्ते".to_string())).unwrap();
        drop(tx);

        let session = StreamingSession::from_updates(rx);
        assert_eq!(session.final_text().await.unwrap(), "नमस्ते");
    }

    #[tokio::test]
    async fn test_timeout_is_terminal_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(StreamingUpdate::Partial("half a sen".to_string()))
            .unwrap();
        tx.send(StreamingUpdate::Failed("timeout".to_string()))
            .unwrap();
        drop(tx);

        let session = StreamingSession::from_updates(rx);
        assert!(matches!(
            session.final_text().await,
            Err(TranscriptionError::Timeout)
        ));
    }
}
