//! Global speech playback controller.
//!
//! One rule, enforced here and nowhere else: at most one clip is audible at
//! any time, application-wide. Every play request goes through this manager;
//! whichever clip was audible before is paused with its position preserved,
//! so switching between the current answer and history entries never layers
//! audio. The arbitration state machine is separate from the rodio actuator
//! (`AudioOutput`) so the invariant is testable without a sound card.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio_toolkit::audio::wav_duration_secs;
use crate::audio_toolkit::text::{clean_for_speech, is_speakable};
use crate::backend::BackendClient;
use crate::events::{ClientEvent, EventSink};

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Audio output is blocked; narration will start on the next interaction")]
    Blocked,
    #[error("No audio output device is available")]
    NoOutputDevice,
    #[error("Could not decode the audio clip: {0}")]
    Decode(String),
    #[error("No audio is attached to this message")]
    UnknownClip,
    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("Nothing to speak for this message")]
    NothingToSpeak,
    #[error("Audio output error: {0}")]
    Output(String),
}

/// Identity of a playable clip: the answer panel clip for a query, or a
/// chat-history entry's clip. Holders of a ClipId never control the audio
/// directly; they can only ask this manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClipId {
    Query(u64),
    History(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipState {
    Stopped,
    Playing,
    Paused,
}

/// Actuator seam: what the manager needs from an audio output.
pub trait AudioOutput: Send {
    /// Load a WAV clip, paused, positioned at `start_at`.
    fn load(&mut self, wav: &[u8], start_at: Duration) -> Result<(), PlaybackError>;
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self);
    fn seek(&mut self, position: Duration) -> Result<(), PlaybackError>;
    fn position(&mut self) -> Duration;
    fn clear(&mut self);
}

struct Clip {
    wav: Option<Vec<u8>>,
    duration_secs: f64,
    position: Duration,
    state: ClipState,
}

struct PlaybackInner {
    clips: HashMap<ClipId, Clip>,
    /// Clip currently loaded into the output, if any.
    current: Option<ClipId>,
    /// Clip waiting for a user interaction after a blocked start.
    blocked: Option<ClipId>,
    /// Most recent play target; synthesis that finishes late must not
    /// steal the speaker back from it.
    latest_request: Option<ClipId>,
}

pub struct PlaybackManager {
    inner: Mutex<PlaybackInner>,
    output: Mutex<Box<dyn AudioOutput>>,
    events: Arc<dyn EventSink>,
}

impl PlaybackManager {
    pub fn new(output: Box<dyn AudioOutput>, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Mutex::new(PlaybackInner {
                clips: HashMap::new(),
                current: None,
                blocked: None,
                latest_request: None,
            }),
            output: Mutex::new(output),
            events,
        }
    }

    /// Register decoded WAV audio under a clip id. Replacing a clip releases
    /// the superseded buffer.
    pub fn attach_clip(&self, id: ClipId, wav: Vec<u8>) -> Result<(), PlaybackError> {
        let duration_secs = wav_duration_secs(&wav).map_err(|e| {
            warn!("Rejecting undecodable clip for {id:?}: {e}");
            PlaybackError::Decode(e.to_string())
        })?;

        let mut inner = self.inner.lock().unwrap();
        if inner.current == Some(id) {
            inner.current = None;
            self.output.lock().unwrap().clear();
        }
        inner.clips.insert(
            id,
            Clip {
                wav: Some(wav),
                duration_secs,
                position: Duration::ZERO,
                state: ClipState::Stopped,
            },
        );
        debug!("Attached clip {id:?} ({duration_secs:.1}s)");
        Ok(())
    }

    pub fn has_clip(&self, id: ClipId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .clips
            .get(&id)
            .is_some_and(|c| c.wav.is_some())
    }

    pub fn clip_state(&self, id: ClipId) -> ClipState {
        self.inner
            .lock()
            .unwrap()
            .clips
            .get(&id)
            .map(|c| c.state)
            .unwrap_or(ClipState::Stopped)
    }

    pub fn clip_duration_secs(&self, id: ClipId) -> Option<f64> {
        self.inner.lock().unwrap().clips.get(&id).map(|c| c.duration_secs)
    }

    /// The clip currently in the Playing state, if any.
    pub fn playing_clip(&self) -> Option<ClipId> {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .filter(|id| inner.clips.get(id).map(|c| c.state) == Some(ClipState::Playing))
    }

    /// Make `id` the audible clip. Any other audible clip is paused first,
    /// its position preserved. Non-blocking when the platform refuses to
    /// start audio: the request is parked and replayed on the next
    /// interaction.
    pub fn request_play(&self, id: ClipId) -> Result<(), PlaybackError> {
        let mut events = Vec::new();
        let result = self.request_play_locked(id, &mut events);
        for event in events {
            self.events.on_event(event);
        }
        result
    }

    fn request_play_locked(
        &self,
        id: ClipId,
        events: &mut Vec<ClientEvent>,
    ) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock().unwrap();
        let mut output = self.output.lock().unwrap();
        inner.latest_request = Some(id);

        if !inner.clips.get(&id).is_some_and(|c| c.wav.is_some()) {
            return Err(PlaybackError::UnknownClip);
        }

        // Hand over the speaker: pause whatever was audible, keep its spot.
        if let Some(previous) = inner.current.filter(|p| *p != id) {
            let position = output.position();
            if let Some(clip) = inner.clips.get_mut(&previous) {
                if clip.state == ClipState::Playing {
                    output.pause();
                    clip.state = ClipState::Paused;
                    events.push(ClientEvent::PlaybackChanged {
                        clip: previous,
                        state: ClipState::Paused,
                    });
                }
                clip.position = position;
            }
            inner.current = None;
        }

        let resume_at = {
            let clip = inner.clips.get(&id).expect("clip checked above");
            clip.position
        };

        let started = {
            let clip_wav = inner.clips.get(&id).and_then(|c| c.wav.as_deref());
            let wav = clip_wav.expect("clip audio checked above");
            if inner.current != Some(id) {
                output.load(wav, resume_at)?;
            }
            output.play()
        };

        match started {
            Ok(()) => {
                inner.current = Some(id);
                inner.blocked = None;
                let clip = inner.clips.get_mut(&id).expect("clip checked above");
                clip.state = ClipState::Playing;
                events.push(ClientEvent::PlaybackChanged {
                    clip: id,
                    state: ClipState::Playing,
                });
                info!("Now playing {id:?}");
                Ok(())
            }
            Err(PlaybackError::Blocked) | Err(PlaybackError::NoOutputDevice) => {
                inner.blocked = Some(id);
                events.push(ClientEvent::PlaybackBlocked { clip: id });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// No-op unless `id` owns the speaker.
    pub fn pause(&self, id: ClipId) {
        let paused = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current != Some(id) {
                return;
            }
            let mut output = self.output.lock().unwrap();
            let position = output.position();
            match inner.clips.get_mut(&id) {
                Some(clip) if clip.state == ClipState::Playing => {
                    output.pause();
                    clip.state = ClipState::Paused;
                    clip.position = position;
                    true
                }
                _ => false,
            }
        };
        if paused {
            self.events.on_event(ClientEvent::PlaybackChanged {
                clip: id,
                state: ClipState::Paused,
            });
        }
    }

    /// No-op unless `id` owns the speaker and is paused.
    pub fn resume(&self, id: ClipId) {
        let should_emit = {
            let mut inner = self.inner.lock().unwrap();
            if inner.current != Some(id) {
                return;
            }
            let clip = match inner.clips.get_mut(&id) {
                Some(c) if c.state == ClipState::Paused => c,
                _ => return,
            };
            match self.output.lock().unwrap().play() {
                Ok(()) => {
                    clip.state = ClipState::Playing;
                    true
                }
                Err(e) => {
                    warn!("Resume failed for {id:?}: {e}");
                    false
                }
            }
        };
        if should_emit {
            self.events.on_event(ClientEvent::PlaybackChanged {
                clip: id,
                state: ClipState::Playing,
            });
        }
    }

    /// Restart the owning clip from the beginning.
    pub fn replay(&self, id: ClipId) {
        {
            let inner = self.inner.lock().unwrap();
            if inner.current != Some(id) {
                return;
            }
        }
        let _ = self.seek(id, Duration::ZERO);
        self.resume(id);
    }

    /// Seek within the owning clip. While playing, playback continues from
    /// the new position; while paused, the position is stored without
    /// resuming.
    pub fn seek(&self, id: ClipId, position: Duration) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current != Some(id) {
            return Ok(());
        }
        let clip = match inner.clips.get_mut(&id) {
            Some(c) => c,
            None => return Ok(()),
        };
        let capped = Duration::from_secs_f64(position.as_secs_f64().min(clip.duration_secs));
        self.output.lock().unwrap().seek(capped)?;
        clip.position = capped;
        Ok(())
    }

    /// Global stop: nothing keeps playing after this, wherever it lives.
    pub fn stop_all(&self) {
        let stopped = {
            let mut inner = self.inner.lock().unwrap();
            self.output.lock().unwrap().clear();
            let current = inner.current.take();
            inner.blocked = None;
            if let Some(id) = current {
                if let Some(clip) = inner.clips.get_mut(&id) {
                    clip.state = ClipState::Stopped;
                    clip.position = Duration::ZERO;
                }
            }
            current
        };
        if let Some(id) = stopped {
            info!("Global stop: {id:?} silenced");
            self.events.on_event(ClientEvent::PlaybackChanged {
                clip: id,
                state: ClipState::Stopped,
            });
        }
    }

    /// Drop a clip's decoded audio (message unmounted).
    pub fn release_clip(&self, id: ClipId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current == Some(id) {
            self.output.lock().unwrap().clear();
            inner.current = None;
        }
        if inner.blocked == Some(id) {
            inner.blocked = None;
        }
        inner.clips.remove(&id);
        debug!("Released clip {id:?}");
    }

    /// A user interaction happened (click, keypress): retry a play request
    /// that the platform previously refused.
    pub fn notify_user_interaction(&self) {
        let parked = self.inner.lock().unwrap().blocked.take();
        if let Some(id) = parked {
            info!("Retrying blocked playback for {id:?}");
            if let Err(e) = self.request_play(id) {
                warn!("Blocked playback retry failed: {e}");
            }
        }
    }

    /// Synthesize narration for `text`, attach it under `id`, then start
    /// playback - unless a newer play request has taken the speaker in the
    /// meantime, in which case the clip is left attached but silent.
    pub async fn synthesize_then_play(
        &self,
        id: ClipId,
        text: &str,
        lang_preference: &str,
        backend: &BackendClient,
        autoplay: bool,
    ) -> Result<(), PlaybackError> {
        let cleaned = clean_for_speech(text);
        if !is_speakable(&cleaned) {
            debug!("Skipping synthesis for {id:?}: nothing speakable");
            return Err(PlaybackError::NothingToSpeak);
        }

        if autoplay {
            self.inner.lock().unwrap().latest_request = Some(id);
        }

        let wav = backend
            .synthesize(&cleaned, lang_preference)
            .await
            .map_err(|e| PlaybackError::Synthesis(e.to_string()))?;

        self.attach_clip(id, wav)?;
        self.events.on_event(ClientEvent::NarrationReady { clip: id });

        let still_wanted = self.inner.lock().unwrap().latest_request == Some(id);
        if autoplay && still_wanted {
            self.request_play(id)
        } else {
            debug!("Synthesis for {id:?} finished after losing the speaker; not auto-playing");
            Ok(())
        }
    }
}

/// Output that accepts every command and produces no sound. Used when the
/// process has no audio device (CI, servers) so the rest of the engine keeps
/// working; position tracking is not simulated.
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn load(&mut self, _wav: &[u8], _start_at: Duration) -> Result<(), PlaybackError> {
        Ok(())
    }
    fn play(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }
    fn pause(&mut self) {}
    fn seek(&mut self, _position: Duration) -> Result<(), PlaybackError> {
        Ok(())
    }
    fn position(&mut self) -> Duration {
        Duration::ZERO
    }
    fn clear(&mut self) {}
}

/* ---------------- rodio actuator ---------------- */

enum OutputCmd {
    Load {
        wav: Vec<u8>,
        start_at: Duration,
        reply: Sender<Result<(), PlaybackError>>,
    },
    Play {
        reply: Sender<Result<(), PlaybackError>>,
    },
    Pause,
    Seek {
        position: Duration,
        reply: Sender<Result<(), PlaybackError>>,
    },
    Position {
        reply: Sender<Duration>,
    },
    Clear,
    Shutdown,
}

/// rodio-backed output. The OutputStream and Sink are not Send, so they live
/// on a dedicated thread and this handle just talks to it.
pub struct RodioOutput {
    tx: Sender<OutputCmd>,
    join: Option<JoinHandle<()>>,
}

impl RodioOutput {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<OutputCmd>();
        let join = std::thread::Builder::new()
            .name("speech-output".to_string())
            .spawn(move || output_worker(rx))
            .expect("spawn audio output thread");
        Self {
            tx,
            join: Some(join),
        }
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> OutputCmd, fallback: T) -> T {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(build(reply_tx)).is_err() {
            return fallback;
        }
        reply_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or(fallback)
    }
}

impl AudioOutput for RodioOutput {
    fn load(&mut self, wav: &[u8], start_at: Duration) -> Result<(), PlaybackError> {
        let wav = wav.to_vec();
        self.request(
            |reply| OutputCmd::Load {
                wav,
                start_at,
                reply,
            },
            Err(PlaybackError::Output("Audio output thread gone".into())),
        )
    }

    fn play(&mut self) -> Result<(), PlaybackError> {
        self.request(
            |reply| OutputCmd::Play { reply },
            Err(PlaybackError::Output("Audio output thread gone".into())),
        )
    }

    fn pause(&mut self) {
        let _ = self.tx.send(OutputCmd::Pause);
    }

    fn seek(&mut self, position: Duration) -> Result<(), PlaybackError> {
        self.request(
            |reply| OutputCmd::Seek { position, reply },
            Err(PlaybackError::Output("Audio output thread gone".into())),
        )
    }

    fn position(&mut self) -> Duration {
        self.request(|reply| OutputCmd::Position { reply }, Duration::ZERO)
    }

    fn clear(&mut self) {
        let _ = self.tx.send(OutputCmd::Clear);
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        let _ = self.tx.send(OutputCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn output_worker(rx: mpsc::Receiver<OutputCmd>) {
    let mut stream: Option<(rodio::OutputStream, rodio::OutputStreamHandle)> = None;
    let mut sink: Option<rodio::Sink> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            OutputCmd::Load {
                wav,
                start_at,
                reply,
            } => {
                let _ = reply.send(load_clip(&mut stream, &mut sink, wav, start_at));
            }
            OutputCmd::Play { reply } => {
                let result = match &sink {
                    Some(sink) => {
                        sink.play();
                        Ok(())
                    }
                    None => Err(PlaybackError::Output("No clip loaded".into())),
                };
                let _ = reply.send(result);
            }
            OutputCmd::Pause => {
                if let Some(sink) = &sink {
                    sink.pause();
                }
            }
            OutputCmd::Seek { position, reply } => {
                let result = match &sink {
                    Some(sink) => sink
                        .try_seek(position)
                        .map_err(|e| PlaybackError::Output(format!("Seek failed: {e:?}"))),
                    None => Err(PlaybackError::Output("No clip loaded".into())),
                };
                let _ = reply.send(result);
            }
            OutputCmd::Position { reply } => {
                let position = sink.as_ref().map(|s| s.get_pos()).unwrap_or(Duration::ZERO);
                let _ = reply.send(position);
            }
            OutputCmd::Clear => {
                sink = None;
            }
            OutputCmd::Shutdown => break,
        }
    }
}

fn load_clip(
    stream: &mut Option<(rodio::OutputStream, rodio::OutputStreamHandle)>,
    sink: &mut Option<rodio::Sink>,
    wav: Vec<u8>,
    start_at: Duration,
) -> Result<(), PlaybackError> {
    if stream.is_none() {
        match rodio::OutputStream::try_default() {
            Ok(pair) => *stream = Some(pair),
            Err(e) => {
                warn!("No audio output available: {e}");
                return Err(PlaybackError::NoOutputDevice);
            }
        }
    }
    let handle = &stream.as_ref().expect("stream initialized above").1;

    let new_sink =
        rodio::Sink::try_new(handle).map_err(|e| PlaybackError::Output(e.to_string()))?;
    let decoder = rodio::Decoder::new(std::io::Cursor::new(wav))
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;

    new_sink.pause();
    new_sink.append(decoder);
    if start_at > Duration::ZERO {
        if let Err(e) = new_sink.try_seek(start_at) {
            debug!("Could not restore clip position: {e:?}");
        }
    }

    *sink = Some(new_sink);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_toolkit::audio::samples_to_wav;
    use crate::events::NoopEventSink;

    struct FakeOutput {
        state: ClipState,
        position: Duration,
        loaded: bool,
        fail_plays: usize,
        play_calls: usize,
    }

    impl FakeOutput {
        fn new() -> Self {
            Self {
                state: ClipState::Stopped,
                position: Duration::ZERO,
                loaded: false,
                fail_plays: 0,
                play_calls: 0,
            }
        }
    }

    impl AudioOutput for FakeOutput {
        fn load(&mut self, _wav: &[u8], start_at: Duration) -> Result<(), PlaybackError> {
            self.loaded = true;
            self.position = start_at;
            self.state = ClipState::Paused;
            Ok(())
        }

        fn play(&mut self) -> Result<(), PlaybackError> {
            self.play_calls += 1;
            if self.fail_plays > 0 {
                self.fail_plays -= 1;
                return Err(PlaybackError::Blocked);
            }
            self.state = ClipState::Playing;
            Ok(())
        }

        fn pause(&mut self) {
            self.state = ClipState::Paused;
        }

        fn seek(&mut self, position: Duration) -> Result<(), PlaybackError> {
            self.position = position;
            Ok(())
        }

        fn position(&mut self) -> Duration {
            self.position
        }

        fn clear(&mut self) {
            self.loaded = false;
            self.state = ClipState::Stopped;
            self.position = Duration::ZERO;
        }
    }

    fn test_wav(seconds: usize) -> Vec<u8> {
        samples_to_wav(&vec![0.1f32; 16000 * seconds], 16000).unwrap()
    }

    fn manager() -> PlaybackManager {
        PlaybackManager::new(Box::new(FakeOutput::new()), Arc::new(NoopEventSink))
    }

    #[test]
    fn test_single_speaker_across_requests() {
        let manager = manager();
        let answer = ClipId::Query(1);
        let history = ClipId::History(0);
        manager.attach_clip(answer, test_wav(3)).unwrap();
        manager.attach_clip(history, test_wav(2)).unwrap();

        manager.request_play(answer).unwrap();
        assert_eq!(manager.playing_clip(), Some(answer));

        // A play request from an unrelated chat entry takes the speaker;
        // the first clip ends up paused, never layered.
        manager.request_play(history).unwrap();
        assert_eq!(manager.playing_clip(), Some(history));
        assert_eq!(manager.clip_state(answer), ClipState::Paused);
        assert_eq!(manager.clip_state(history), ClipState::Playing);
    }

    #[test]
    fn test_handover_preserves_position() {
        let manager = manager();
        let a = ClipId::Query(1);
        let b = ClipId::Query(2);
        manager.attach_clip(a, test_wav(5)).unwrap();
        manager.attach_clip(b, test_wav(5)).unwrap();

        manager.request_play(a).unwrap();
        manager.seek(a, Duration::from_secs(2)).unwrap();
        manager.request_play(b).unwrap();

        // a kept its spot and resumes from it when it regains the speaker.
        manager.request_play(a).unwrap();
        let inner = manager.inner.lock().unwrap();
        assert_eq!(inner.clips[&a].position, Duration::from_secs(2));
    }

    #[test]
    fn test_transport_controls_ignore_non_owner() {
        let manager = manager();
        let owner = ClipId::Query(1);
        let other = ClipId::History(3);
        manager.attach_clip(owner, test_wav(3)).unwrap();
        manager.attach_clip(other, test_wav(3)).unwrap();
        manager.request_play(owner).unwrap();

        manager.pause(other);
        manager.resume(other);
        manager.seek(other, Duration::from_secs(1)).unwrap();
        assert_eq!(manager.clip_state(owner), ClipState::Playing);
        assert_eq!(manager.clip_state(other), ClipState::Stopped);
    }

    #[test]
    fn test_seek_while_paused_does_not_resume() {
        let manager = manager();
        let id = ClipId::Query(7);
        manager.attach_clip(id, test_wav(5)).unwrap();
        manager.request_play(id).unwrap();
        manager.pause(id);

        manager.seek(id, Duration::from_secs(3)).unwrap();
        assert_eq!(manager.clip_state(id), ClipState::Paused);
        assert_eq!(
            manager.inner.lock().unwrap().clips[&id].position,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_replay_restarts_from_zero() {
        let manager = manager();
        let id = ClipId::Query(1);
        manager.attach_clip(id, test_wav(5)).unwrap();
        manager.request_play(id).unwrap();
        manager.seek(id, Duration::from_secs(4)).unwrap();

        manager.replay(id);
        assert_eq!(manager.clip_state(id), ClipState::Playing);
        assert_eq!(
            manager.inner.lock().unwrap().clips[&id].position,
            Duration::ZERO
        );
    }

    #[test]
    fn test_blocked_playback_retries_on_interaction() {
        let mut output = FakeOutput::new();
        output.fail_plays = 1;
        let manager = PlaybackManager::new(Box::new(output), Arc::new(NoopEventSink));
        let id = ClipId::Query(1);
        manager.attach_clip(id, test_wav(2)).unwrap();

        // First start is refused; the request parks instead of failing.
        manager.request_play(id).unwrap();
        assert_eq!(manager.playing_clip(), None);

        manager.notify_user_interaction();
        assert_eq!(manager.playing_clip(), Some(id));
    }

    #[test]
    fn test_stop_all_silences_everything() {
        let manager = manager();
        let id = ClipId::History(1);
        manager.attach_clip(id, test_wav(2)).unwrap();
        manager.request_play(id).unwrap();

        manager.stop_all();
        assert_eq!(manager.playing_clip(), None);
        assert_eq!(manager.clip_state(id), ClipState::Stopped);
    }

    #[test]
    fn test_released_clip_cannot_play() {
        let manager = manager();
        let id = ClipId::Query(1);
        manager.attach_clip(id, test_wav(2)).unwrap();
        manager.release_clip(id);

        assert!(matches!(
            manager.request_play(id),
            Err(PlaybackError::UnknownClip)
        ));
    }

    #[test]
    fn test_attach_rejects_garbage() {
        let manager = manager();
        assert!(matches!(
            manager.attach_clip(ClipId::Query(1), vec![1, 2, 3]),
            Err(PlaybackError::Decode(_))
        ));
    }
}
