//! Command-line front end for the voice client engine.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{FilePayload, StreamingUpdate};
use crate::events::LogEventSink;
use crate::settings::AppSettings;
use crate::VoiceClient;

#[derive(Parser, Debug)]
#[command(name = "vaani", about = "Voice client for the scheme assistant")]
pub struct CliArgs {
    /// Backend base URL (overrides settings and VAANI_BACKEND_URL)
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check whether the backend is reachable
    Health,
    /// Upload reference documents and unlock the chat
    Upload {
        #[arg(long)]
        pdf: Option<PathBuf>,
        #[arg(long)]
        txt: Option<PathBuf>,
    },
    /// Ask a typed question
    Ask {
        question: String,
        /// Upload this document first (shortcut for upload + ask)
        #[arg(long)]
        txt: Option<PathBuf>,
        /// Reuse a knowledge-base key from an earlier upload
        #[arg(long)]
        model_key: Option<String>,
    },
    /// Record a spoken question and transcribe it
    Record {
        /// Stream audio to the transcription socket instead of batch upload
        #[arg(long)]
        streaming: bool,
    },
    /// Synthesize and play the given text
    Speak { text: String },
    /// Show the server-side conversation history
    History,
}

pub async fn run(args: CliArgs) -> Result<()> {
    let mut settings = AppSettings::load_or_default();
    if let Some(url) = args.backend_url {
        settings.backend_url = url.trim_end_matches('/').to_string();
    }
    settings.normalize();

    let client = VoiceClient::new(settings, Arc::new(LogEventSink))?;

    match args.command {
        Command::Health => {
            client.check_health().await?;
            println!("Backend reachable at {}", client.backend().base_url());
        }

        Command::Upload { pdf, txt } => {
            let response = client
                .upload_documents(read_payload(pdf)?, read_payload(txt)?)
                .await?;
            println!("{}", response.message);
            println!("model_key: {}", response.model_key);
        }

        Command::Ask {
            question,
            txt,
            model_key,
        } => {
            match (txt, model_key) {
                (Some(txt), _) => {
                    let response = client
                        .upload_documents(None, read_payload(Some(txt))?)
                        .await?;
                    println!("{}", response.message);
                }
                (None, Some(key)) => client.query().set_model_key(key),
                (None, None) => {
                    return Err(anyhow!("ask needs --txt or --model-key"));
                }
            }
            ask_and_wait(&client, &question).await?;
        }

        Command::Record { streaming } => {
            let text = if streaming {
                record_streaming(&client).await?
            } else {
                record_batch(&client).await?
            };
            println!("Heard: {text}");
        }

        Command::Speak { text } => {
            let clip = crate::ClipId::History(0);
            client
                .playback()
                .synthesize_then_play(
                    clip,
                    &text,
                    &client.settings().voice_lang_pref,
                    client.backend(),
                    true,
                )
                .await?;
            // Keep the process alive long enough to hear it.
            let seconds = client.playback().clip_duration_secs(clip).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(seconds + 0.5)).await;
        }

        Command::History => {
            let history = client.chat_history().await?;
            if history.is_empty() {
                println!("No chat history yet.");
            }
            for (i, entry) in history.iter().enumerate() {
                println!("#{} [{}]", i + 1, entry.timestamp);
                println!("  Citizen:   {}", entry.user);
                println!("  Assistant: {}", entry.assistant);
            }
        }
    }

    Ok(())
}

fn read_payload(path: Option<PathBuf>) -> Result<Option<FilePayload>> {
    match path {
        None => Ok(None),
        Some(path) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            Ok(Some(FilePayload { file_name, bytes }))
        }
    }
}

/// Submit and poll the current view until this query's facets settle.
/// Narration resolves independently; its failure never fails the command.
async fn ask_and_wait(client: &VoiceClient, question: &str) -> Result<()> {
    let id = client.ask(question)?;
    log::info!("Submitted query #{id}");

    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let Some(view) = client.query().current_view() else {
            continue;
        };
        if view.id != id {
            return Ok(());
        }
        match &view.answer {
            crate::AnswerState::Pending => continue,
            crate::AnswerState::Failed(message) => {
                println!("Error: {message}");
                return Ok(());
            }
            crate::AnswerState::Ready(reply) => {
                println!("{reply}");
                wait_for_narration(client, id).await;
                return Ok(());
            }
        }
    }
}

async fn wait_for_narration(client: &VoiceClient, id: u64) {
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        match client.query().current_view() {
            Some(view) if view.id == id => match view.audio {
                crate::AudioState::Pending => continue,
                crate::AudioState::Ready(clip) => {
                    if let Some(seconds) = client.playback().clip_duration_secs(clip) {
                        tokio::time::sleep(Duration::from_secs_f64(seconds + 0.5)).await;
                    }
                    return;
                }
                _ => return,
            },
            _ => return,
        }
    }
}

async fn record_batch(client: &VoiceClient) -> Result<String> {
    client.start_recording()?;
    println!("Recording... press Enter to stop (or pause for auto-stop).");

    let enter = tokio::task::spawn_blocking(read_line);
    tokio::pin!(enter);
    loop {
        tokio::select! {
            _ = &mut enter => break,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                if !client.recording().is_recording() {
                    break;
                }
            }
        }
    }

    let audio = client
        .stop_recording()
        .ok_or_else(|| anyhow!("Nothing was recorded"))?;
    let text = client.transcribe(&audio).await?;
    Ok(text)
}

async fn record_streaming(client: &VoiceClient) -> Result<String> {
    client.start_recording()?;
    let mut session = client.start_streaming_transcription().await?;
    println!("Recording (streaming)... press Enter to stop.");

    let enter = tokio::task::spawn_blocking(read_line);
    tokio::pin!(enter);
    let mut display = String::new();
    let mut input_open = true;

    let result = loop {
        tokio::select! {
            update = session.next_update() => match update {
                Some(StreamingUpdate::Partial(text)) => {
                    display = text;
                    print!("\r{display}        ");
                }
                Some(StreamingUpdate::Final(text)) => break Ok(text),
                Some(StreamingUpdate::Failed(message)) => {
                    break Err(anyhow!("Streaming transcription failed: {message}"));
                }
                None => break Ok(display.clone()),
            },

            _ = &mut enter, if input_open => {
                let _ = client.recording().stop();
                client.finish_streaming();
                input_open = false;
            }

            _ = tokio::time::sleep(Duration::from_millis(100)), if input_open => {
                // Silence auto-stop ends the recording from under us; close
                // the chunk route so the server finalizes.
                if !client.recording().is_recording() {
                    client.finish_streaming();
                    input_open = false;
                }
            }
        }
    };

    client.recording().cancel();
    client.finish_streaming();
    println!();
    result
}

fn read_line() {
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
}
