use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

use super::utils::CAPTURE_SAMPLE_RATE;

/// Samples per metering frame (~32 ms at 16 kHz).
pub const METER_FRAME_LEN: usize = 512;

/// Root-mean-square amplitude of a sample buffer.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Produces a normalized 0.0-1.0 input level at a fixed frame cadence.
///
/// The level is the mean spectral energy across the speech band, which reads
/// better on a meter than raw RMS. Metering is cosmetic: if the FFT path is
/// unavailable the meter degrades to a synthetic waveform instead of taking
/// the capture pipeline down with it.
pub struct LevelMeter {
    fft: Option<Arc<dyn Fft<f32>>>,
    frame: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    band: std::ops::Range<usize>,
    fallback_tick: u32,
}

impl LevelMeter {
    fn with_fft(fft: Option<Arc<dyn Fft<f32>>>) -> Self {
        // Speech band ~85 Hz to 4 kHz mapped onto FFT bins.
        let hz_per_bin = CAPTURE_SAMPLE_RATE as f32 / METER_FRAME_LEN as f32;
        let low = (85.0 / hz_per_bin).ceil() as usize;
        let high = ((4000.0 / hz_per_bin) as usize).min(METER_FRAME_LEN / 2);

        Self {
            fft,
            frame: Vec::with_capacity(METER_FRAME_LEN),
            spectrum: vec![Complex::new(0.0, 0.0); METER_FRAME_LEN],
            band: low..high,
            fallback_tick: 0,
        }
    }

    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self::with_fft(Some(planner.plan_fft_forward(METER_FRAME_LEN)))
    }

    /// A meter that only produces the synthetic waveform.
    pub fn synthetic() -> Self {
        Self::with_fft(None)
    }

    /// Meter for the capture path: if spectral analysis cannot be set up,
    /// degrade to the synthetic meter rather than break recording.
    pub fn for_capture() -> Self {
        match std::panic::catch_unwind(Self::new) {
            Ok(meter) => meter,
            Err(_) => {
                log::warn!("Level analysis unavailable, using synthetic meter");
                Self::synthetic()
            }
        }
    }

    /// Feed capture samples; `emit` fires once per completed frame.
    pub fn push(&mut self, mut samples: &[f32], emit: &mut impl FnMut(f32)) {
        while !samples.is_empty() {
            let space = METER_FRAME_LEN - self.frame.len();
            let take = space.min(samples.len());
            self.frame.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.frame.len() == METER_FRAME_LEN {
                let level = self.frame_level();
                self.frame.clear();
                emit(level);
            }
        }
    }

    fn frame_level(&mut self) -> f32 {
        let fft = match &self.fft {
            Some(fft) => fft.clone(),
            None => return self.synthetic_level(),
        };

        for (slot, &sample) in self.spectrum.iter_mut().zip(self.frame.iter()) {
            *slot = Complex::new(sample, 0.0);
        }
        fft.process(&mut self.spectrum);

        let band = &self.spectrum[self.band.clone()];
        if band.is_empty() {
            return rms(&self.frame).min(1.0);
        }
        let mean_mag = band.iter().map(|c| c.norm()).sum::<f32>()
            / (band.len() as f32 * METER_FRAME_LEN as f32).sqrt();

        // Compression so quiet speech still moves the meter.
        (mean_mag * 6.0).sqrt().clamp(0.0, 1.0)
    }

    fn synthetic_level(&mut self) -> f32 {
        self.fallback_tick = self.fallback_tick.wrapping_add(1);
        let phase = self.fallback_tick as f32 * 0.35;
        0.25 + 0.15 * phase.sin().abs()
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_meters_near_zero() {
        let mut meter = LevelMeter::new();
        let mut levels = Vec::new();
        meter.push(&vec![0.0f32; METER_FRAME_LEN * 3], &mut |l| levels.push(l));

        assert_eq!(levels.len(), 3);
        assert!(levels.iter().all(|&l| l < 0.05));
    }

    #[test]
    fn test_tone_meters_above_silence() {
        let tone: Vec<f32> = (0..METER_FRAME_LEN)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16000.0).sin() * 0.5)
            .collect();
        let mut meter = LevelMeter::new();
        let mut levels = Vec::new();
        meter.push(&tone, &mut |l| levels.push(l));

        assert_eq!(levels.len(), 1);
        assert!(levels[0] > 0.1);
        assert!(levels[0] <= 1.0);
    }

    #[test]
    fn test_synthetic_fallback_keeps_emitting() {
        let mut meter = LevelMeter::synthetic();
        let mut levels = Vec::new();
        meter.push(&vec![0.0f32; METER_FRAME_LEN * 2], &mut |l| levels.push(l));

        assert_eq!(levels.len(), 2);
        assert!(levels.iter().all(|&l| (0.0..=1.0).contains(&l)));
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
