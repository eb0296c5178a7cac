use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;

pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Encode mono f32 samples as an in-memory 16-bit PCM WAV.
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buffer, spec)?;
        for &sample in samples {
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(sample_i16)?;
        }
        writer.finalize()?;
    }

    Ok(buffer.into_inner())
}

/// Decode an in-memory WAV into mono f32 samples plus its sample rate.
///
/// Multi-channel audio is averaged down to mono.
pub fn wav_to_samples(wav_bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = WavReader::new(Cursor::new(wav_bytes))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                .collect::<Result<_, _>>()?,
            32 => reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / i32::MAX as f32))
                .collect::<Result<_, _>>()?,
            bits => return Err(anyhow::anyhow!("Unsupported bit depth: {bits}")),
        },
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        mono.push(frame.iter().sum::<f32>() / channels as f32);
    }
    Ok((mono, spec.sample_rate))
}

/// Duration in seconds of an in-memory WAV, without decoding the samples.
pub fn wav_duration_secs(wav_bytes: &[u8]) -> Result<f64> {
    let reader = WavReader::new(Cursor::new(wav_bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(anyhow::anyhow!("Invalid WAV header"));
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Encode f32 samples as raw little-endian 16-bit PCM bytes (no header),
/// the framing the streaming transcription socket expects.
pub fn samples_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&sample_i16.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_roundtrip() {
        let samples = vec![0.0f32, 0.25, -0.25, 0.9, -0.9];
        let wav = samples_to_wav(&samples, CAPTURE_SAMPLE_RATE).unwrap();
        let (decoded, rate) = wav_to_samples(&wav).unwrap();

        assert_eq!(rate, CAPTURE_SAMPLE_RATE);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.001);
        }
    }

    #[test]
    fn test_wav_duration() {
        let samples = vec![0.0f32; 16000];
        let wav = samples_to_wav(&samples, CAPTURE_SAMPLE_RATE).unwrap();
        let duration = wav_duration_secs(&wav).unwrap();
        assert!((duration - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_pcm16_encoding() {
        let bytes = samples_to_pcm16_bytes(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -32767);
    }
}
