use rubato::{FftFixedIn, Resampler};
use std::time::Duration;

const CHUNK_SIZE: usize = 1024;

/// Streaming resampler that re-chunks its output into fixed-length frames.
///
/// Capture devices deliver audio at whatever rate they like; everything
/// downstream (level metering, the transcription services) wants fixed
/// frames at 16 kHz mono. Input is buffered until a full FFT chunk is
/// available, so frames trail the input by up to one chunk.
pub struct FrameResampler {
    inner: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    frame: Vec<f32>,
    frame_len: usize,
}

impl FrameResampler {
    pub fn new(in_hz: usize, out_hz: usize, frame_dur: Duration) -> Self {
        let frame_len = ((out_hz as f64 * frame_dur.as_secs_f64()).round()) as usize;
        assert!(frame_len > 0, "frame duration too short");

        let inner = (in_hz != out_hz).then(|| {
            FftFixedIn::<f32>::new(in_hz, out_hz, CHUNK_SIZE, 1, 1)
                .expect("resampler construction with static parameters")
        });

        Self {
            inner,
            input: Vec::with_capacity(CHUNK_SIZE),
            frame: Vec::with_capacity(frame_len),
            frame_len,
        }
    }

    /// Feed samples in; `emit` is called once per completed output frame.
    pub fn push(&mut self, mut src: &[f32], emit: &mut impl FnMut(&[f32])) {
        if self.inner.is_none() {
            self.collect_frames(src, emit);
            return;
        }

        while !src.is_empty() {
            let space = CHUNK_SIZE - self.input.len();
            let take = space.min(src.len());
            self.input.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.input.len() == CHUNK_SIZE {
                self.process_chunk(emit);
            }
        }
    }

    /// Flush buffered input, padding the tail with silence.
    pub fn finish(&mut self, emit: &mut impl FnMut(&[f32])) {
        if self.inner.is_some() && !self.input.is_empty() {
            self.input.resize(CHUNK_SIZE, 0.0);
            self.process_chunk(emit);
        }

        if !self.frame.is_empty() {
            self.frame.resize(self.frame_len, 0.0);
            emit(&self.frame);
            self.frame.clear();
        }
    }

    fn process_chunk(&mut self, emit: &mut impl FnMut(&[f32])) {
        let resampler = self.inner.as_mut().expect("chunk processing without resampler");
        match resampler.process(&[&self.input[..]], None) {
            Ok(out) => self.collect_frames_owned(&out[0], emit),
            Err(e) => log::warn!("Resampling failed, dropping chunk: {e}"),
        }
        self.input.clear();
    }

    fn collect_frames(&mut self, data: &[f32], emit: &mut impl FnMut(&[f32])) {
        let owned = data.to_vec();
        self.collect_frames_owned(&owned, emit);
    }

    fn collect_frames_owned(&mut self, mut data: &[f32], emit: &mut impl FnMut(&[f32])) {
        while !data.is_empty() {
            let space = self.frame_len - self.frame.len();
            let take = space.min(data.len());
            self.frame.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.frame.len() == self.frame_len {
                emit(&self.frame);
                self.frame.clear();
            }
        }
    }
}

/// One-shot convenience: resample a whole buffer to `out_hz`.
pub fn resample_buffer(samples: &[f32], in_hz: u32, out_hz: u32) -> Vec<f32> {
    if in_hz == out_hz || samples.is_empty() {
        return samples.to_vec();
    }

    let mut resampler = FrameResampler::new(
        in_hz as usize,
        out_hz as usize,
        Duration::from_millis(20),
    );
    let mut output = Vec::new();
    resampler.push(samples, &mut |frame| output.extend_from_slice(frame));
    resampler.finish(&mut |frame| output.extend_from_slice(frame));

    // finish() pads with silence; trim to the expected length
    let expected = (samples.len() as f64 * out_hz as f64 / in_hz as f64).round() as usize;
    output.truncate(expected.max(1).min(output.len()));
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_when_rates_match() {
        let samples: Vec<f32> = (0..3200).map(|i| (i as f32 / 3200.0).sin()).collect();
        let out = resample_buffer(&samples, 16000, 16000);
        assert_eq!(out, samples);
    }

    #[test]
    fn test_downsample_halves_length() {
        let samples = vec![0.1f32; 32000];
        let out = resample_buffer(&samples, 32000, 16000);
        // One second of audio either way, within a chunk of slack.
        assert!((out.len() as i64 - 16000).unsigned_abs() < 2048);
    }

    #[test]
    fn test_fixed_frames() {
        let mut resampler = FrameResampler::new(16000, 16000, Duration::from_millis(20));
        let mut frames = Vec::new();
        resampler.push(&vec![0.5f32; 1000], &mut |f| frames.push(f.len()));
        resampler.finish(&mut |f| frames.push(f.len()));

        // 20ms at 16kHz = 320 samples per frame; 1000 samples => 4 frames
        assert_eq!(frames, vec![320, 320, 320, 320]);
    }
}
