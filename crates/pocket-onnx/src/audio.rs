//! WAV I/O, channel mixing, resampling and peak normalization.

use crate::error::{Result, TtsError};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::{Read, Seek, Write};
use std::path::Path;

/// Decoded WAV contents. `samples` are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct WavData {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<WavData> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .map_err(|e| TtsError::Audio(format!("cannot read {:?}: {}", path, e)))?;
    read_wav_internal(reader)
}

pub fn read_wav_from_bytes(bytes: &[u8]) -> Result<WavData> {
    let reader = WavReader::new(std::io::Cursor::new(bytes))?;
    read_wav_internal(reader)
}

fn read_wav_internal<R: Read>(mut reader: WavReader<R>) -> Result<WavData> {
    let spec = reader.spec();
    if spec.channels == 0 {
        return Err(TtsError::Audio("WAV declares zero channels".into()));
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            if !(1..=32).contains(&spec.bits_per_sample) {
                return Err(TtsError::Audio(format!(
                    "unsupported bit depth {}",
                    spec.bits_per_sample
                )));
            }
            let max_val = (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
    };

    Ok(WavData {
        samples,
        channels: spec.channels as usize,
        sample_rate: spec.sample_rate,
    })
}

/// Average interleaved channels into one.
pub fn to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample mono audio with a septic polynomial interpolator.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(TtsError::Input(format!(
            "cannot resample {} Hz to {} Hz",
            from_rate, to_rate
        )));
    }

    use rubato::{FastFixedIn, PolynomialDegree, Resampler};

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0,
        PolynomialDegree::Septic,
        samples.len(),
        1,
    )
    .map_err(|e| TtsError::Audio(format!("resampler setup failed: {}", e)))?;

    let mut out = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| TtsError::Audio(format!("resampling failed: {}", e)))?;

    Ok(out.pop().unwrap_or_default())
}

/// Scale so the peak magnitude is 1.0, only when it currently exceeds 1.0.
pub fn normalize_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 1.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

/// Read a WAV file as mono samples at `target_rate`, peak-limited to 1.0.
pub fn load<P: AsRef<Path>>(path: P, target_rate: u32) -> Result<Vec<f32>> {
    let wav = read_wav(path)?;
    decode_reference(wav, target_rate)
}

/// [`load`] for an in-memory WAV payload.
pub fn load_from_bytes(bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
    let wav = read_wav_from_bytes(bytes)?;
    decode_reference(wav, target_rate)
}

fn decode_reference(wav: WavData, target_rate: u32) -> Result<Vec<f32>> {
    let mono = to_mono(&wav.samples, wav.channels);
    let mut samples = resample(&mono, wav.sample_rate, target_rate)?;
    normalize_peak(&mut samples);
    Ok(samples)
}

fn float_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    }
}

/// Write mono 32-bit float WAV.
pub fn write_wav<P: AsRef<Path>>(path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_wav_to_writer(file, samples, sample_rate)
}

pub fn write_wav_to_writer<W: Write + Seek>(
    writer: W,
    samples: &[f32],
    sample_rate: u32,
) -> Result<()> {
    let mut wav_writer = WavWriter::new(writer, float_spec(sample_rate))?;
    for &s in samples {
        wav_writer.write_sample(s)?;
    }
    wav_writer.finalize()?;
    Ok(())
}

/// Encode a complete WAV file in memory.
pub fn wav_bytes(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    write_wav_to_writer(&mut cursor, samples, sample_rate)?;
    Ok(cursor.into_inner())
}

/// Raw little-endian 16-bit PCM, hard-clamped to [-1, 1].
pub fn to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_peak_only_above_one() {
        let mut quiet = vec![-0.5f32, 0.2, 0.5];
        normalize_peak(&mut quiet);
        assert_eq!(quiet, vec![-0.5, 0.2, 0.5]);

        let mut loud = vec![-2.0f32, 1.0, 0.5];
        normalize_peak(&mut loud);
        assert_eq!(loud, vec![-1.0, 0.5, 0.25]);
    }

    #[test]
    fn test_to_mono() {
        let stereo = [0.25f32, 0.75, -1.0, 1.0, 0.5, 0.5];
        assert_eq!(to_mono(&stereo, 2), vec![0.5, 0.0, 0.5]);
        assert_eq!(to_mono(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_resample() -> Result<()> {
        let input_samples = 1024;
        let data: Vec<f32> = (0..input_samples).map(|i| (i as f32 * 0.1).sin()).collect();

        // Resample 100Hz to 200Hz (Ratio 2.0)
        let out = resample(&data, 100, 200)?;
        let diff = (out.len() as i64 - 2048).abs();
        assert!(diff <= 50, "got {} samples", out.len());

        assert_eq!(resample(&data, 24000, 24000)?, data);
        assert!(resample(&[], 16000, 24000)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_wav_roundtrip_in_memory() -> Result<()> {
        let samples = vec![0.0f32, 0.5, -0.5, 0.1];
        let bytes = wav_bytes(&samples, 16000)?;

        let wav = read_wav_from_bytes(&bytes)?;
        assert_eq!(wav.sample_rate, 16000);
        assert_eq!(wav.channels, 1);
        assert_eq!(wav.samples, samples);
        Ok(())
    }

    #[test]
    fn test_int16_stereo_reference() -> Result<()> {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 24000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut w = WavWriter::new(&mut cursor, spec)?;
            for _ in 0..100 {
                w.write_sample(16384i16)?;
                w.write_sample(0i16)?;
            }
            w.finalize()?;
        }

        let samples = load_from_bytes(cursor.get_ref(), 24000)?;
        assert_eq!(samples.len(), 100);
        assert!(samples.iter().all(|s| (s - 0.25).abs() < 1e-4));
        Ok(())
    }

    #[test]
    fn test_pcm16_clamps() {
        let bytes = to_pcm16_bytes(&[2.0, -2.0, 0.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 0);
    }

    #[test]
    fn test_garbage_is_audio_error() {
        let err = read_wav_from_bytes(b"not a wav").unwrap_err();
        assert!(matches!(err, TtsError::Audio(_)));
    }
}
