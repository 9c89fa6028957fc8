//! End-to-end runs against the exported ONNX models.
//!
//! Run with `cargo test --features onnx -- --ignored`. Models are looked
//! up under `<workspace>/models`; tests skip when they are missing.
#![cfg(feature = "onnx")]

use anyhow::Result;
use pocket_onnx::config::{SAMPLE_RATE, SAMPLES_PER_FRAME};
use pocket_onnx::{EngineConfig, StreamingConfig, TtsEngine};
use std::path::PathBuf;

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest
        .ancestors()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or(manifest)
}

fn load_engine() -> Result<Option<(TtsEngine, PathBuf)>> {
    let root = workspace_root();
    let config = EngineConfig {
        models_dir: root.join("models").join("onnx"),
        tokenizer_path: root.join("models").join("tokenizer.model"),
        temperature: 0.0,
        verbose: false,
        ..Default::default()
    };
    let reference = root.join("assets").join("ref.wav");
    if !config.models_dir.exists() || !config.tokenizer_path.exists() || !reference.exists() {
        println!("Skipping test: models or ref.wav not found under {:?}", root);
        return Ok(None);
    }
    Ok(Some((TtsEngine::new(config)?, reference)))
}

#[test]
#[ignore = "needs exported ONNX models"]
fn test_generate_produces_speech() -> Result<()> {
    let Some((mut engine, reference)) = load_engine()? else {
        return Ok(());
    };
    let audio = engine.generate_from_file("Hello world, this is a test.", &reference)?;

    assert!(!audio.is_empty());
    assert_eq!(audio.len() % SAMPLES_PER_FRAME, 0);
    let seconds = audio.len() as f32 / SAMPLE_RATE as f32;
    assert!(seconds > 0.5 && seconds < 20.0, "unexpected duration {}", seconds);
    assert!(audio.iter().all(|s| s.is_finite()));
    Ok(())
}

#[test]
#[ignore = "needs exported ONNX models"]
fn test_streaming_matches_batch_with_real_models() -> Result<()> {
    let Some((mut engine, reference)) = load_engine()? else {
        return Ok(());
    };
    let voice = engine.encode_voice(&reference)?;
    let text = "Streaming should sound the same.";

    let batch = engine.generate(text, &voice)?;
    let mut streamed = Vec::new();
    engine.generate_streaming(
        text,
        &voice,
        |samples, _| streamed.extend_from_slice(samples),
        StreamingConfig::default(),
    )?;

    assert_eq!(batch.len(), streamed.len());
    let max_diff = batch
        .iter()
        .zip(&streamed)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    assert!(max_diff < 1e-3, "streamed audio differs by {}", max_diff);
    Ok(())
}
