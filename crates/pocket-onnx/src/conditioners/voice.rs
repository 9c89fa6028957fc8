//! Voice embeddings and the per-engine voice cache

use crate::audio;
use crate::config::{EMBEDDING_DIM, MAX_REFERENCE_SAMPLES, SAMPLE_RATE};
use crate::error::{Result, TtsError};
use crate::unit::{TensorUnit, take_output, to_f32_vec};
use candle_core::{Device, Tensor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

use super::to_rank3;

/// Encoded reference voice, shaped `[1, N, D]`.
///
/// Cloning is cheap; clones share the same tensor storage.
#[derive(Debug, Clone)]
pub struct VoiceEmbedding {
    tensor: Tensor,
}

impl VoiceEmbedding {
    /// Wrap precomputed embedding values.
    ///
    /// `shape` must be `[1, N, EMBEDDING_DIM]` and match `data.len()`.
    pub fn from_parts(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        if shape.len() != 3 || shape[0] != 1 || shape[2] != EMBEDDING_DIM {
            return Err(TtsError::Input(format!(
                "voice embedding shape must be [1, N, {}], got {:?}",
                EMBEDDING_DIM, shape
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TtsError::Input(format!(
                "voice embedding shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
        Ok(Self { tensor })
    }

    fn from_encoder_output(tensor: Tensor, unit: &str) -> Result<Self> {
        let tensor = to_rank3(tensor, unit)?;
        let dims = tensor.dims();
        if dims[0] != 1 || dims[2] != EMBEDDING_DIM {
            return Err(TtsError::Inference(format!(
                "{} returned shape {:?}, expected [1, N, {}]",
                unit, dims, EMBEDDING_DIM
            )));
        }
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.dims()
    }

    /// Number of embedding positions (N).
    pub fn frames(&self) -> usize {
        self.tensor.dims()[1]
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        to_f32_vec(&self.tensor)
    }
}

/// Where reference audio comes from.
#[derive(Debug, Clone, Copy)]
pub enum VoiceSource<'a> {
    /// A WAV file on disk
    File(&'a Path),
    /// Mono samples at the given rate
    Samples { samples: &'a [f32], sample_rate: u32 },
}

impl VoiceSource<'_> {
    /// Cache key identifying this source.
    ///
    /// Files are keyed by path. Sample buffers are keyed by a SHA-256 digest
    /// of their contents and rate, so equal buffers share one cache entry.
    pub fn cache_key(&self) -> String {
        match self {
            VoiceSource::File(path) => format!("file:{}", path.display()),
            VoiceSource::Samples {
                samples,
                sample_rate,
            } => {
                let mut hasher = Sha256::new();
                hasher.update(sample_rate.to_le_bytes());
                for s in samples.iter() {
                    hasher.update(s.to_le_bytes());
                }
                format!("samples:{}", hex::encode(hasher.finalize()))
            }
        }
    }

    /// Load mono samples at the engine's sample rate, peak-limited to 1.0.
    pub fn load(&self) -> Result<Vec<f32>> {
        match self {
            VoiceSource::File(path) => audio::load(path, SAMPLE_RATE),
            VoiceSource::Samples {
                samples,
                sample_rate,
            } => {
                if *sample_rate == 0 {
                    return Err(TtsError::Input("sample rate must be positive".into()));
                }
                let mut resampled = audio::resample(samples, *sample_rate, SAMPLE_RATE)?;
                audio::normalize_peak(&mut resampled);
                Ok(resampled)
            }
        }
    }
}

/// Encoded voices keyed by source.
///
/// Each key is encoded at most once per cache.
#[derive(Debug, Default)]
pub struct VoiceCache {
    entries: HashMap<String, VoiceEmbedding>,
}

impl VoiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached embedding for `key`, or load and encode it.
    ///
    /// On a hit neither `loader` nor `encoder` is called. On a miss the
    /// loaded audio is cut to [`MAX_REFERENCE_SAMPLES`] and passed to the
    /// encoder as `audio` `[1, 1, n]`; its `latents` output is stored.
    pub fn encode<U, F>(
        &mut self,
        key: &str,
        encoder: Option<&mut U>,
        loader: F,
    ) -> Result<VoiceEmbedding>
    where
        U: TensorUnit + ?Sized,
        F: FnOnce() -> Result<Vec<f32>>,
    {
        if let Some(hit) = self.entries.get(key) {
            tracing::debug!("voice cache hit: {}", key);
            return Ok(hit.clone());
        }

        let Some(encoder) = encoder else {
            return Err(TtsError::Input(
                "voice encoder is not loaded (load_voice_encoder = false)".into(),
            ));
        };

        let mut samples = loader()?;
        if samples.is_empty() {
            return Err(TtsError::Input("reference audio is empty".into()));
        }
        if samples.len() > MAX_REFERENCE_SAMPLES {
            tracing::debug!(
                "truncating reference from {} to {} samples",
                samples.len(),
                MAX_REFERENCE_SAMPLES
            );
            samples.truncate(MAX_REFERENCE_SAMPLES);
        }

        let n = samples.len();
        let input = Tensor::from_vec(samples, (1, 1, n), &Device::Cpu)?;
        let mut outputs = encoder.run(vec![("audio".to_string(), input)])?;
        let latents = take_output(&mut outputs, encoder.name(), "latents")?;
        let embedding = VoiceEmbedding::from_encoder_output(latents, encoder.name())?;

        tracing::debug!(
            "encoded voice {} ({} samples -> {:?})",
            key,
            n,
            embedding.shape()
        );
        self.entries.insert(key.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// [`VoiceCache::encode`] for a [`VoiceSource`].
    pub fn encode_source<U: TensorUnit + ?Sized>(
        &mut self,
        source: VoiceSource<'_>,
        encoder: Option<&mut U>,
    ) -> Result<VoiceEmbedding> {
        let key = source.cache_key();
        self.encode(&key, encoder, || source.load())
    }

    pub fn get(&self, key: &str) -> Option<&VoiceEmbedding> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEncoder;

    #[test]
    fn test_cache_hit_skips_loader_and_encoder() -> Result<()> {
        let mut cache = VoiceCache::new();
        let mut encoder = MockEncoder::new();
        let calls = encoder.calls();

        let first = cache.encode("a", Some(&mut encoder), || Ok(vec![0.1; 4800]))?;
        let second = cache.encode("a", Some(&mut encoder), || {
            panic!("loader must not run on a cache hit")
        })?;

        assert_eq!(calls.count(), 1);
        assert_eq!(first.to_vec()?, second.to_vec()?);
        assert_eq!(first.shape(), &[1, 2, EMBEDDING_DIM]);
        assert!(cache.contains("a"));
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn test_reference_truncated_to_five_seconds() -> Result<()> {
        let mut cache = VoiceCache::new();
        let mut encoder = MockEncoder::new();
        let calls = encoder.calls();

        // 10 s at 24 kHz
        cache.encode("long", Some(&mut encoder), || Ok(vec![0.0; 240_000]))?;
        assert_eq!(calls.last_input_len(), Some(120_000));

        cache.encode("short", Some(&mut encoder), || Ok(vec![0.0; 1000]))?;
        assert_eq!(calls.last_input_len(), Some(1000));
        Ok(())
    }

    #[test]
    fn test_missing_encoder() {
        let mut cache = VoiceCache::new();
        let err = cache
            .encode::<MockEncoder, _>("a", None, || Ok(vec![0.0; 10]))
            .unwrap_err();
        assert!(matches!(err, TtsError::Input(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_encoder_output_gets_batch_axis() -> Result<()> {
        let mut cache = VoiceCache::new();
        let mut encoder = MockEncoder::new().with_rank2_output();
        let emb = cache.encode("a", Some(&mut encoder), || Ok(vec![0.0; 1920]))?;
        assert_eq!(emb.shape(), &[1, 1, EMBEDDING_DIM]);
        Ok(())
    }

    #[test]
    fn test_sample_keys() {
        let a = [0.1f32, 0.2, 0.3];
        let b = [0.1f32, 0.2, 0.4];
        let key = |s: &[f32], r| {
            VoiceSource::Samples {
                samples: s,
                sample_rate: r,
            }
            .cache_key()
        };
        assert_eq!(key(&a, 24000), key(&a, 24000));
        assert_ne!(key(&a, 24000), key(&b, 24000));
        assert_ne!(key(&a, 24000), key(&a, 16000));
        assert!(
            VoiceSource::File(Path::new("v.wav"))
                .cache_key()
                .starts_with("file:")
        );
    }

    #[test]
    fn test_encoder_output_of_wrong_width() {
        let mut cache = VoiceCache::new();
        let mut encoder = MockEncoder::new().with_output_width(512);
        let err = cache
            .encode("a", Some(&mut encoder), || Ok(vec![0.0; 1920]))
            .unwrap_err();
        assert!(matches!(err, TtsError::Inference(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_loud_samples_match_loud_file() -> Result<()> {
        // Peak 2.0 survives a float WAV, so both paths must normalize it
        let loud: Vec<f32> = (0..4800).map(|i| if i % 2 == 0 { 2.0 } else { 0.5 }).collect();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("loud.wav");
        audio::write_wav(&path, &loud, SAMPLE_RATE)?;

        let mut cache = VoiceCache::new();
        let mut encoder = MockEncoder::new();
        let from_file = cache.encode_source(VoiceSource::File(&path), Some(&mut encoder))?;
        let from_samples = cache.encode_source(
            VoiceSource::Samples {
                samples: &loud,
                sample_rate: SAMPLE_RATE,
            },
            Some(&mut encoder),
        )?;

        assert_eq!(cache.len(), 2);
        assert_eq!(from_file.to_vec()?, from_samples.to_vec()?);
        // Mean of the normalized buffer: (1.0 + 0.25) / 2
        assert!((from_samples.to_vec()?[0] - 0.625).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_from_parts_validates_shape() {
        let d = EMBEDDING_DIM;
        assert!(VoiceEmbedding::from_parts(vec![0.0; 2 * d], &[1, 2, d]).is_ok());
        assert!(VoiceEmbedding::from_parts(vec![0.0; 2 * d], &[2, 1, d]).is_err());
        assert!(VoiceEmbedding::from_parts(vec![0.0; 2 * d], &[2 * d]).is_err());
        assert!(VoiceEmbedding::from_parts(vec![0.0; 2 * d - 1], &[1, 2, d]).is_err());
        assert!(VoiceEmbedding::from_parts(vec![0.0; 8], &[1, 2, 4]).is_err());
    }
}
