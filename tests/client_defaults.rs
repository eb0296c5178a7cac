//! Crate-level behavior through the public API, no device or network needed.

use std::sync::Arc;

use vaani::events::NoopEventSink;
use vaani::managers::playback::NullOutput;
use vaani::settings::AppSettings;
use vaani::{AnswerState, ClipId, ClipState, VoiceClient};

fn headless_client() -> VoiceClient {
    VoiceClient::with_output(
        AppSettings::default(),
        Arc::new(NoopEventSink),
        Box::new(NullOutput),
    )
    .expect("client construction")
}

#[test]
fn default_settings_match_the_backend_contract() {
    let settings = AppSettings::default();
    assert_eq!(settings.backend_url, "http://localhost:8000");
    assert_eq!(settings.request_timeout_secs, 120);
    assert_eq!(settings.streaming_ceiling_secs, 20);
    assert!((settings.silence_stop_secs - 2.0).abs() < f32::EPSILON);
    assert_eq!(vaani::settings::SUPPORTED_LANGUAGES, ["en", "hi", "mr"]);
}

#[tokio::test]
async fn queries_are_locked_until_documents_are_uploaded() {
    let client = headless_client();
    let result = client.ask("मुख्य योजना दाखवा");
    assert!(result.is_err(), "query must not fire before an upload");
}

#[test]
fn unsupported_script_never_reaches_the_backend() {
    let client = headless_client();
    client.query().set_model_key("kb".into());

    assert!(client.query().submit_local("Что это такое?").is_err());
    assert!(client.query().submit_local("मुख्यमंत्री योजना काय आहे?").is_ok());
}

#[test]
fn one_clip_audible_across_unrelated_panels() {
    let client = headless_client();
    let wav = vaani::audio_toolkit::audio::samples_to_wav(&vec![0.1; 16000], 16000).unwrap();

    let answer = ClipId::Query(1);
    let history = ClipId::History(4);
    client.playback().attach_clip(answer, wav.clone()).unwrap();
    client.playback().attach_clip(history, wav).unwrap();

    client.playback().request_play(answer).unwrap();
    client.playback().request_play(history).unwrap();

    assert_eq!(client.playback().playing_clip(), Some(history));
    assert_eq!(client.playback().clip_state(answer), ClipState::Paused);
}

#[test]
fn last_submission_wins_through_the_client() {
    let client = headless_client();
    client.query().set_model_key("kb".into());

    let q1 = client.query().submit_local("first question").unwrap();
    let q2 = client.query().submit_local("second question").unwrap();

    client
        .query()
        .apply_answer(q1, "first question", Ok("stale".into()));
    let view = client.query().current_view().unwrap();
    assert_eq!(view.id, q2);
    assert_eq!(view.answer, AnswerState::Pending);
}
