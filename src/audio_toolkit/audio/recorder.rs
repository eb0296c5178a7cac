//! Microphone capture on a dedicated worker thread.
//!
//! cpal streams are not Send, so the stream lives on its own thread for the
//! whole time the device is open. The worker owns the stream; dropping it on
//! worker exit is the single point where the device is released, no matter
//! which path (stop, error, teardown) got us there.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use std::thread::JoinHandle;
use std::time::Duration;

use super::resampler::FrameResampler;
use super::utils::CAPTURE_SAMPLE_RATE;
use super::visualizer::LevelMeter;

/// Frame duration for resampled capture output.
const FRAME_DUR: Duration = Duration::from_millis(20);
/// Bound on the live-chunk channel; when the consumer stalls we drop
/// chunks rather than grow without limit.
pub const CHUNK_CHANNEL_BOUND: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum MicError {
    #[error("Microphone access was denied")]
    PermissionDenied,
    #[error("No usable microphone device")]
    DeviceUnavailable,
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("Capture stream error: {0}")]
    Stream(String),
}

/// Live 16 kHz mono frames, delivered while a recording is in progress.
pub type ChunkSender = tokio::sync::mpsc::Sender<Vec<f32>>;

/// Seam between the recording manager and the actual capture device.
pub trait CaptureBackend: Send {
    /// Acquire the device and begin the capture stream.
    fn open(&mut self) -> Result<(), MicError>;
    /// Begin buffering samples.
    fn start(&mut self) -> Result<(), MicError>;
    /// Stop buffering and return the captured 16 kHz mono samples.
    /// Safe to call repeatedly; later calls return an empty buffer.
    fn stop(&mut self) -> Vec<f32>;
    /// Release the device. Idempotent.
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Route live chunks somewhere (streaming transcription). Default: no-op.
    fn route_chunks(&mut self, _tx: Option<ChunkSender>) {}
}

/// State shared between the cpal callback and the recorder handle.
struct CaptureShared {
    recording: AtomicBool,
    buffer: Mutex<Vec<f32>>,
    chunk_tx: Mutex<Option<ChunkSender>>,
}

struct CaptureWorker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

pub struct AudioRecorder {
    device_name: Option<String>,
    level_cb: Option<Arc<dyn Fn(f32) + Send + Sync>>,
    shared: Arc<CaptureShared>,
    worker: Option<CaptureWorker>,
}

impl AudioRecorder {
    pub fn new() -> Self {
        Self {
            device_name: None,
            level_cb: None,
            shared: Arc::new(CaptureShared {
                recording: AtomicBool::new(false),
                buffer: Mutex::new(Vec::new()),
                chunk_tx: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Capture from a named device instead of the system default.
    pub fn with_device(mut self, name: Option<String>) -> Self {
        self.device_name = name;
        self
    }

    /// Receive a normalized input level (0.0-1.0) at the meter cadence.
    pub fn with_level_callback(mut self, cb: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.level_cb = Some(Arc::new(cb));
        self
    }

    /// Route live 16 kHz chunks to `tx` while recording (streaming mode).
    /// Passing None stops forwarding. May be called while the device is open.
    pub fn set_chunk_sender(&self, tx: Option<ChunkSender>) {
        *self.shared.chunk_tx.lock().unwrap() = tx;
    }

    fn resolve_device(&self) -> Result<cpal::Device, MicError> {
        let host = cpal::default_host();
        if let Some(wanted) = &self.device_name {
            let mut devices = host
                .input_devices()
                .map_err(|e| MicError::Stream(e.to_string()))?;
            if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(wanted)) {
                return Ok(device);
            }
            log::warn!("Input device '{wanted}' not found, using default");
        }
        host.default_input_device().ok_or(MicError::DeviceUnavailable)
    }
}

impl Default for AudioRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_build_error(e: cpal::BuildStreamError) -> MicError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => MicError::DeviceUnavailable,
        cpal::BuildStreamError::BackendSpecific { err } => {
            let msg = err.to_string();
            if msg.to_lowercase().contains("permission") || msg.to_lowercase().contains("denied") {
                MicError::PermissionDenied
            } else {
                MicError::Stream(msg)
            }
        }
        other => MicError::Stream(other.to_string()),
    }
}

fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<CaptureShared>,
    level_cb: Option<Arc<dyn Fn(f32) + Send + Sync>>,
) -> Result<cpal::Stream, MicError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut resampler = FrameResampler::new(
        config.sample_rate.0 as usize,
        CAPTURE_SAMPLE_RATE as usize,
        FRAME_DUR,
    );
    let mut meter = LevelMeter::for_capture();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Fold interleaved channels to mono before resampling.
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame
                            .iter()
                            .map(|&v| cpal::Sample::to_sample::<f32>(v))
                            .sum::<f32>()
                            / channels as f32
                    })
                    .collect();

                resampler.push(&mono, &mut |frame| {
                    if shared.recording.load(Ordering::Acquire) {
                        shared.buffer.lock().unwrap().extend_from_slice(frame);

                        if let Some(tx) = shared.chunk_tx.lock().unwrap().as_ref() {
                            match tx.try_send(frame.to_vec()) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    log::warn!("Live chunk channel full, dropping frame")
                                }
                                Err(TrySendError::Closed(_)) => {}
                            }
                        }
                    }

                    if let Some(cb) = &level_cb {
                        meter.push(frame, &mut |level| cb(level));
                    }
                });
            },
            |err| log::error!("Capture stream error: {err}"),
            None,
        )
        .map_err(classify_build_error)
}

impl CaptureBackend for AudioRecorder {
    fn open(&mut self) -> Result<(), MicError> {
        if self.worker.is_some() {
            log::debug!("Capture device already open");
            return Ok(());
        }

        let device = self.resolve_device()?;
        let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());

        let shared = self.shared.clone();
        let level_cb = self.level_cb.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), MicError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let join = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                capture_worker(device, shared, level_cb, ready_tx, stop_rx);
            })
            .map_err(|e| MicError::Stream(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                log::info!("Capture stream open on '{device_label}'");
                self.worker = Some(CaptureWorker { stop_tx, join });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(MicError::Stream("Timed out opening capture stream".into()))
            }
        }
    }

    fn start(&mut self) -> Result<(), MicError> {
        if self.worker.is_none() {
            return Err(MicError::Stream("Capture device not open".into()));
        }
        self.shared.buffer.lock().unwrap().clear();
        self.shared.recording.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Vec<f32> {
        self.shared.recording.store(false, Ordering::Release);
        std::mem::take(&mut *self.shared.buffer.lock().unwrap())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.recording.store(false, Ordering::Release);
            let _ = worker.stop_tx.send(());
            if worker.join.join().is_err() {
                log::error!("Capture worker panicked during shutdown");
            }
            log::debug!("Capture device released");
        }
    }

    fn is_open(&self) -> bool {
        self.worker.is_some()
    }

    fn route_chunks(&mut self, tx: Option<ChunkSender>) {
        self.set_chunk_sender(tx);
    }
}

impl Drop for AudioRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_worker(
    device: cpal::Device,
    shared: Arc<CaptureShared>,
    level_cb: Option<Arc<dyn Fn(f32) + Send + Sync>>,
    ready_tx: Sender<Result<(), MicError>>,
    stop_rx: Receiver<()>,
) {
    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(MicError::Stream(e.to_string())));
            return;
        }
    };
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    log::debug!(
        "Capture config: {} ch, {} Hz, {:?}",
        config.channels,
        config.sample_rate.0,
        sample_format
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_capture_stream::<f32>(&device, &config, shared, level_cb),
        cpal::SampleFormat::I16 => build_capture_stream::<i16>(&device, &config, shared, level_cb),
        cpal::SampleFormat::U16 => build_capture_stream::<u16>(&device, &config, shared, level_cb),
        other => Err(MicError::Stream(format!(
            "Unsupported sample format: {other:?}"
        ))),
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(MicError::Stream(e.to_string())));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Hold the stream alive until asked to stop; the sender side hanging up
    // also counts as a stop so a dropped handle can never leak the device.
    loop {
        match stop_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    drop(stream);
}
