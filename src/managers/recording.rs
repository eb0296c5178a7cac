//! Recording session manager.
//!
//! Owns the microphone exclusively: at most one session may be recording at
//! a time, and every exit path (user stop, silence auto-stop, error,
//! teardown) releases the device before control returns. The silence
//! auto-stop policy lives here, not in the transcription layer.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audio_toolkit::audio::{AudioRecorder, CaptureBackend, MicError, CAPTURE_SAMPLE_RATE};
use crate::events::{ClientEvent, EventSink};
use crate::settings::AppSettings;

const WATCHDOG_TICK: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Requesting,
    Recording,
    Stopping,
}

/// A finished capture: mono samples at the capture rate.
#[derive(Debug, Clone)]
pub struct RecordedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl RecordedAudio {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Tracks how long the input has been quiet after speech was first heard.
struct SilenceTracker {
    threshold: f32,
    heard_speech: AtomicBool,
    quiet_since: Mutex<Option<Instant>>,
}

impl SilenceTracker {
    fn new(threshold: f32) -> Self {
        Self {
            threshold,
            heard_speech: AtomicBool::new(false),
            quiet_since: Mutex::new(None),
        }
    }

    fn reset(&self) {
        self.heard_speech.store(false, Ordering::Release);
        *self.quiet_since.lock().unwrap() = None;
    }

    fn observe(&self, level: f32) {
        if level > self.threshold {
            self.heard_speech.store(true, Ordering::Release);
            *self.quiet_since.lock().unwrap() = None;
        } else if self.heard_speech.load(Ordering::Acquire) {
            let mut quiet = self.quiet_since.lock().unwrap();
            if quiet.is_none() {
                *quiet = Some(Instant::now());
            }
        }
    }

    fn silent_for(&self) -> Option<Duration> {
        self.quiet_since.lock().unwrap().map(|t| t.elapsed())
    }
}

#[derive(Clone)]
pub struct RecordingManager {
    state: Arc<Mutex<RecordingState>>,
    backend: Arc<Mutex<Box<dyn CaptureBackend>>>,
    events: Arc<dyn EventSink>,
    silence: Arc<SilenceTracker>,
    silence_stop: Duration,
    /// Result of the most recent auto-stopped capture, held until collected.
    auto_capture: Arc<Mutex<Option<RecordedAudio>>>,
    /// Set by a stop that races an in-flight start; the start path honors it
    /// by releasing the device immediately.
    abort: Arc<AtomicBool>,
}

impl RecordingManager {
    pub fn new(settings: &AppSettings, events: Arc<dyn EventSink>) -> Self {
        let silence = Arc::new(SilenceTracker::new(settings.silence_threshold));

        let recorder = AudioRecorder::new()
            .with_device(settings.selected_microphone.clone())
            .with_level_callback({
                let silence = silence.clone();
                let events = events.clone();
                move |level| {
                    silence.observe(level);
                    events.on_event(ClientEvent::InputLevel { level });
                }
            });

        Self {
            state: Arc::new(Mutex::new(RecordingState::Idle)),
            backend: Arc::new(Mutex::new(Box::new(recorder))),
            events,
            silence,
            silence_stop: Duration::from_secs_f32(settings.silence_stop_secs),
            auto_capture: Arc::new(Mutex::new(None)),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build against an arbitrary capture backend (used by tests).
    pub fn with_backend(
        backend: Box<dyn CaptureBackend>,
        events: Arc<dyn EventSink>,
        silence_stop: Duration,
        silence_threshold: f32,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RecordingState::Idle)),
            backend: Arc::new(Mutex::new(backend)),
            events,
            silence: Arc::new(SilenceTracker::new(silence_threshold)),
            silence_stop,
            auto_capture: Arc::new(Mutex::new(None)),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.state.lock().unwrap()
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state(), RecordingState::Recording)
    }

    /// Begin a recording session. Fails with AlreadyRecording while another
    /// session is anywhere between start and full release.
    pub fn start(&self) -> Result<(), MicError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RecordingState::Idle {
                return Err(MicError::AlreadyRecording);
            }
            *state = RecordingState::Requesting;
        }
        self.abort.store(false, Ordering::Release);

        let result = {
            let mut backend = self.backend.lock().unwrap();
            backend.open().and_then(|()| backend.start())
        };

        match result {
            Ok(()) if self.abort.swap(false, Ordering::AcqRel) => {
                // A stop arrived while the device was being acquired.
                let mut backend = self.backend.lock().unwrap();
                let _ = backend.stop();
                backend.close();
                *self.state.lock().unwrap() = RecordingState::Idle;
                debug!("Start aborted by concurrent stop; device released");
                Err(MicError::Stream("Recording stopped before it began".into()))
            }
            Ok(()) => {
                self.silence.reset();
                *self.auto_capture.lock().unwrap() = None;
                *self.state.lock().unwrap() = RecordingState::Recording;
                self.events.on_event(ClientEvent::RecordingStarted);
                info!("Recording session started");
                self.spawn_silence_watchdog();
                Ok(())
            }
            Err(e) => {
                // Failed acquisition still releases whatever was acquired.
                self.backend.lock().unwrap().close();
                *self.state.lock().unwrap() = RecordingState::Idle;
                error!("Failed to start recording: {e}");
                Err(e)
            }
        }
    }

    /// End the session and return the capture. Always valid: calling while
    /// Idle is a no-op returning None, and a second stop changes nothing.
    pub fn stop(&self) -> Option<RecordedAudio> {
        self.finish(false)
    }

    /// End the session and discard the capture.
    pub fn cancel(&self) {
        if self.finish(false).is_some() {
            debug!("Recording cancelled, capture discarded");
        }
    }

    /// The capture from the most recent silence auto-stop, if any.
    pub fn take_auto_capture(&self) -> Option<RecordedAudio> {
        self.auto_capture.lock().unwrap().take()
    }

    /// Route live chunks to a streaming transcription session. Pass None to
    /// close the route and signal end-of-input downstream.
    pub fn route_chunks(&self, tx: Option<crate::audio_toolkit::audio::ChunkSender>) {
        self.backend.lock().unwrap().route_chunks(tx);
    }

    fn finish(&self, auto: bool) -> Option<RecordedAudio> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                RecordingState::Recording => *state = RecordingState::Stopping,
                RecordingState::Requesting => {
                    self.abort.store(true, Ordering::Release);
                    return None;
                }
                _ => return None,
            }
        }

        let samples = {
            let mut backend = self.backend.lock().unwrap();
            let samples = backend.stop();
            backend.close();
            samples
        };

        *self.state.lock().unwrap() = RecordingState::Idle;

        let audio = RecordedAudio {
            samples,
            sample_rate: CAPTURE_SAMPLE_RATE,
        };
        self.events.on_event(ClientEvent::RecordingStopped {
            seconds: audio.duration_secs(),
            auto,
        });
        info!(
            "Recording stopped after {:.1}s ({})",
            audio.duration_secs(),
            if auto { "silence" } else { "user" }
        );
        Some(audio)
    }

    /// Watch the level stream and stop the session once the input has been
    /// quiet long enough after speech was heard.
    fn spawn_silence_watchdog(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("No async runtime; silence auto-stop disabled");
                return;
            }
        };

        let manager = self.clone();
        handle.spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_TICK).await;
                if !manager.is_recording() {
                    return;
                }
                if let Some(quiet) = manager.silence.silent_for() {
                    if quiet >= manager.silence_stop {
                        warn!(
                            "Input quiet for {:.1}s, stopping automatically",
                            quiet.as_secs_f32()
                        );
                        if let Some(audio) = manager.finish(true) {
                            *manager.auto_capture.lock().unwrap() = Some(audio);
                        }
                        return;
                    }
                }
            }
        });
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        // Last clone out closes the device even if nobody called stop.
        if Arc::strong_count(&self.backend) == 1 {
            if let Ok(mut backend) = self.backend.lock() {
                backend.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventSink;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct BackendCounters {
        opens: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeBackend {
        counters: Arc<BackendCounters>,
        open: bool,
        fail_open: bool,
    }

    impl FakeBackend {
        fn new(counters: Arc<BackendCounters>) -> Self {
            Self {
                counters,
                open: false,
                fail_open: false,
            }
        }
    }

    impl CaptureBackend for FakeBackend {
        fn open(&mut self) -> Result<(), MicError> {
            if self.fail_open {
                return Err(MicError::DeviceUnavailable);
            }
            self.open = true;
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn start(&mut self) -> Result<(), MicError> {
            self.counters.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> Vec<f32> {
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
            vec![0.1; 16000]
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.counters.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn manager_with_counters() -> (RecordingManager, Arc<BackendCounters>) {
        let counters = Arc::new(BackendCounters::default());
        let manager = RecordingManager::with_backend(
            Box::new(FakeBackend::new(counters.clone())),
            Arc::new(NoopEventSink),
            Duration::from_secs(2),
            0.01,
        );
        (manager, counters)
    }

    #[test]
    fn test_second_start_is_rejected() {
        let (manager, _) = manager_with_counters();
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(MicError::AlreadyRecording)));
        assert!(manager.is_recording());
    }

    #[test]
    fn test_stop_releases_device_exactly_once() {
        let (manager, counters) = manager_with_counters();
        manager.start().unwrap();

        let audio = manager.stop().expect("first stop returns the capture");
        assert_eq!(audio.sample_rate, CAPTURE_SAMPLE_RATE);
        assert!(audio.duration_secs() > 0.9);

        // Second stop is a no-op: no extra release, no capture.
        assert!(manager.stop().is_none());
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), RecordingState::Idle);
    }

    #[test]
    fn test_failed_start_leaves_manager_reusable() {
        let counters = Arc::new(BackendCounters::default());
        let mut backend = FakeBackend::new(counters.clone());
        backend.fail_open = true;
        let manager = RecordingManager::with_backend(
            Box::new(backend),
            Arc::new(NoopEventSink),
            Duration::from_secs(2),
            0.01,
        );

        assert!(matches!(
            manager.start(),
            Err(MicError::DeviceUnavailable)
        ));
        assert_eq!(manager.state(), RecordingState::Idle);
        // Nothing was acquired, so nothing is released.
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let (manager, counters) = manager_with_counters();
        manager.start().unwrap();
        manager.stop();
        manager.start().unwrap();
        manager.stop();
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_silence_tracker_arms_after_speech() {
        let tracker = SilenceTracker::new(0.01);
        // Quiet before any speech never arms the timer.
        tracker.observe(0.001);
        assert!(tracker.silent_for().is_none());

        tracker.observe(0.5);
        assert!(tracker.silent_for().is_none());

        tracker.observe(0.001);
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.silent_for().unwrap() >= Duration::from_millis(5));

        // Speech resets the timer.
        tracker.observe(0.5);
        assert!(tracker.silent_for().is_none());
    }

    #[tokio::test]
    async fn test_silence_watchdog_auto_stops() {
        let counters = Arc::new(BackendCounters::default());
        let manager = RecordingManager::with_backend(
            Box::new(FakeBackend::new(counters.clone())),
            Arc::new(NoopEventSink),
            Duration::from_millis(50),
            0.01,
        );

        manager.start().unwrap();
        manager.silence.observe(0.5);
        manager.silence.observe(0.001);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.state(), RecordingState::Idle);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(manager.take_auto_capture().is_some());
    }
}
