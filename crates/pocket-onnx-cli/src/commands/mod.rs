//! Subcommands and the engine options they share.

pub mod generate;
pub mod serve;

use anyhow::{Context, Result};
use clap::Args;
use pocket_onnx::config::load_config;
use pocket_onnx::{EngineConfig, Precision, TtsEngine};
use std::path::PathBuf;

/// Model and sampling options. Flags override values from `--config`.
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// YAML engine configuration; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding the .onnx model files
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// SentencePiece tokenizer model
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Model precision: int8 or fp32
    #[arg(long)]
    pub precision: Option<Precision>,

    /// Sampling temperature (0 = deterministic)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Flow integration steps per frame (more = better quality, slower)
    #[arg(long)]
    pub lsd_steps: Option<usize>,

    /// Maximum number of latent frames (80 ms each)
    #[arg(long)]
    pub max_frames: Option<usize>,

    /// Frames to generate after end of speech is detected
    #[arg(long)]
    pub frames_after_eos: Option<usize>,

    /// Seed for reproducible sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Clamp initial noise to [-v, v]
    #[arg(long)]
    pub noise_clamp: Option<f32>,
}

impl EngineArgs {
    /// Resolve the effective engine configuration.
    pub fn to_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            None => EngineConfig::default(),
        };

        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(path) = &self.tokenizer {
            config.tokenizer_path = path.clone();
        }
        if let Some(precision) = self.precision {
            config.precision = precision;
        }
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(steps) = self.lsd_steps {
            config.lsd_steps = steps;
        }
        if let Some(max) = self.max_frames {
            config.max_frames = max;
        }
        if let Some(n) = self.frames_after_eos {
            config.frames_after_eos = n;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.noise_clamp.is_some() {
            config.noise_clamp = self.noise_clamp;
        }

        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }

    pub fn load_engine(&self) -> Result<TtsEngine> {
        let config = self.to_config()?;
        let models_dir = config.models_dir.clone();
        TtsEngine::new(config)
            .with_context(|| format!("Failed to load models from {:?}", models_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = EngineArgs {
            precision: Some(Precision::Fp32),
            temperature: Some(0.0),
            seed: Some(3),
            ..Default::default()
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.precision, Precision::Fp32);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.lsd_steps, EngineConfig::default().lsd_steps);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let args = EngineArgs {
            lsd_steps: Some(0),
            ..Default::default()
        };
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "temperature: 0.3\nmax_frames: 100\n").unwrap();

        let args = EngineArgs {
            config: Some(path),
            max_frames: Some(50),
            ..Default::default()
        };
        let config = args.to_config().unwrap();
        assert!((config.temperature - 0.3).abs() < 1e-6);
        assert_eq!(config.max_frames, 50);
    }
}
