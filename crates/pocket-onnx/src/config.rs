//! Engine configuration and fixed model constants.

use crate::error::{Result, TtsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Output sample rate of the decoder.
pub const SAMPLE_RATE: u32 = 24_000;
/// Audio samples produced per latent frame (80 ms).
pub const SAMPLES_PER_FRAME: usize = 1920;
/// Duration of one latent frame in seconds.
pub const FRAME_DURATION: f32 = SAMPLES_PER_FRAME as f32 / SAMPLE_RATE as f32;
/// Width of a latent frame.
pub const LATENT_DIM: usize = 32;
/// Feature width of voice and text embeddings.
pub const EMBEDDING_DIM: usize = 1024;
/// EOS logits above this value mark end of speech.
pub const EOS_THRESHOLD: f32 = -4.0;
/// Frames stacked into one decoder call.
pub const DECODE_CHUNK_FRAMES: usize = 15;
/// Reference clips are cut to this many seconds before encoding.
pub const MAX_REFERENCE_SECONDS: usize = 5;
/// Reference clip cap in samples at [`SAMPLE_RATE`].
pub const MAX_REFERENCE_SAMPLES: usize = SAMPLE_RATE as usize * MAX_REFERENCE_SECONDS;

/// Default generation parameters
pub mod defaults {
    pub const MODELS_DIR: &str = "models/onnx";
    pub const TOKENIZER_PATH: &str = "models/tokenizer.model";
    pub const TEMPERATURE: f32 = 0.7;
    pub const LSD_STEPS: usize = 10;
    pub const MAX_FRAMES: usize = 500;
    pub const FRAMES_AFTER_EOS: usize = 3;
    pub const INTRA_THREADS: usize = 3;
    /// Frames buffered before each streaming flush (~400 ms).
    pub const STREAM_CHUNK_FRAMES: usize = 5;
}

/// Numeric precision of the main, flow and decoder units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Int8,
    Fp32,
}

impl Precision {
    /// File-name suffix of the model variant for this precision.
    pub fn model_suffix(self) -> &'static str {
        match self {
            Precision::Int8 => "_int8",
            Precision::Fp32 => "",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = TtsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" => Ok(Precision::Int8),
            "fp32" => Ok(Precision::Fp32),
            other => Err(TtsError::Input(format!(
                "unknown precision '{}', expected int8 or fp32",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Int8 => f.write_str("int8"),
            Precision::Fp32 => f.write_str("fp32"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the `.onnx` model files
    pub models_dir: PathBuf,
    /// SentencePiece tokenizer model
    pub tokenizer_path: PathBuf,
    pub precision: Precision,
    /// Noise variance for flow integration; 0 makes generation deterministic
    pub temperature: f32,
    /// Euler steps per latent frame
    pub lsd_steps: usize,
    /// Hard cap on generated frames
    pub max_frames: usize,
    /// Extra frames generated after the EOS frame
    pub frames_after_eos: usize,
    /// Log per-call summaries at info level
    pub verbose: bool,
    /// Load the voice encoder (needed for cloning from audio)
    pub load_voice_encoder: bool,
    /// Intra-op threads per model session
    pub intra_threads: usize,
    /// Truncate initial noise to [-clamp, clamp]
    pub noise_clamp: Option<f32>,
    /// Seed for the noise generator
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from(defaults::MODELS_DIR),
            tokenizer_path: PathBuf::from(defaults::TOKENIZER_PATH),
            precision: Precision::default(),
            temperature: defaults::TEMPERATURE,
            lsd_steps: defaults::LSD_STEPS,
            max_frames: defaults::MAX_FRAMES,
            frames_after_eos: defaults::FRAMES_AFTER_EOS,
            verbose: true,
            load_voice_encoder: true,
            intra_threads: defaults::INTRA_THREADS,
            noise_clamp: None,
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lsd_steps == 0 {
            return Err(TtsError::Input("lsd_steps must be at least 1".into()));
        }
        if self.max_frames == 0 {
            return Err(TtsError::Input("max_frames must be at least 1".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(TtsError::Input(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if let Some(clamp) = self.noise_clamp
            && !(clamp.is_finite() && clamp > 0.0)
        {
            return Err(TtsError::Input(format!(
                "noise_clamp must be positive, got {}",
                clamp
            )));
        }
        Ok(())
    }

    /// Path of a model file inside `models_dir`.
    pub fn model_path(&self, stem: &str, quantizable: bool) -> PathBuf {
        let suffix = if quantizable {
            self.precision.model_suffix()
        } else {
            ""
        };
        self.models_dir.join(format!("{}{}.onnx", stem, suffix))
    }
}

/// Load an [`EngineConfig`] from a YAML file. Missing fields keep their defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| TtsError::Setup(format!("cannot read config {:?}: {}", path, e)))?;
    parse_config(&text)
}

pub fn parse_config(yaml: &str) -> Result<EngineConfig> {
    let config: EngineConfig = serde_yaml::from_str(yaml)
        .map_err(|e| TtsError::Setup(format!("invalid config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.precision, Precision::Int8);
        assert_eq!(cfg.lsd_steps, 10);
        assert_eq!(cfg.max_frames, 500);
        assert_eq!(cfg.frames_after_eos, 3);
        assert!((cfg.temperature - 0.7).abs() < 1e-6);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_reference_cap() {
        assert_eq!(MAX_REFERENCE_SAMPLES, 120_000);
        assert!((FRAME_DURATION - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_model_path_suffix() {
        let cfg = EngineConfig::default();
        assert_eq!(
            cfg.model_path("flow_lm_main", true),
            PathBuf::from("models/onnx/flow_lm_main_int8.onnx")
        );
        assert_eq!(
            cfg.model_path("mimi_encoder", false),
            PathBuf::from("models/onnx/mimi_encoder.onnx")
        );

        let fp32 = EngineConfig {
            precision: Precision::Fp32,
            ..Default::default()
        };
        assert_eq!(
            fp32.model_path("mimi_decoder", true),
            PathBuf::from("models/onnx/mimi_decoder.onnx")
        );
    }

    #[test]
    fn test_parse_partial_yaml() {
        let cfg = parse_config("temperature: 0.0\nprecision: fp32\nseed: 7\n").unwrap();
        assert_eq!(cfg.temperature, 0.0);
        assert_eq!(cfg.precision, Precision::Fp32);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.max_frames, defaults::MAX_FRAMES);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_steps = EngineConfig {
            lsd_steps: 0,
            ..Default::default()
        };
        assert!(bad_steps.validate().is_err());

        let bad_temp = EngineConfig {
            temperature: -1.0,
            ..Default::default()
        };
        assert!(bad_temp.validate().is_err());

        let bad_clamp = EngineConfig {
            noise_clamp: Some(0.0),
            ..Default::default()
        };
        assert!(bad_clamp.validate().is_err());
    }

    #[test]
    fn test_precision_from_str() {
        assert_eq!("INT8".parse::<Precision>().unwrap(), Precision::Int8);
        assert_eq!("fp32".parse::<Precision>().unwrap(), Precision::Fp32);
        assert!("fp16".parse::<Precision>().is_err());
    }
}
