// Re-export all audio components
pub mod recorder;
pub mod resampler;
pub mod utils;
pub mod visualizer;

pub use recorder::{AudioRecorder, CaptureBackend, ChunkSender, MicError, CHUNK_CHANNEL_BOUND};
pub use resampler::FrameResampler;
pub use utils::{
    samples_to_pcm16_bytes, samples_to_wav, wav_duration_secs, wav_to_samples,
    CAPTURE_SAMPLE_RATE,
};
pub use visualizer::{rms, LevelMeter};
