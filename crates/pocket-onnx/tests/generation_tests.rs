use anyhow::Result;
use pocket_onnx::config::{EMBEDDING_DIM, MAX_REFERENCE_SAMPLES, SAMPLE_RATE, SAMPLES_PER_FRAME};
use pocket_onnx::testing::{FailingUnit, MockTokenizer, mock_engine, mock_units};
use pocket_onnx::{EngineConfig, ErrorKind, TtsEngine, VoiceEmbedding};

fn quiet_config() -> EngineConfig {
    EngineConfig {
        temperature: 0.0,
        max_frames: 60,
        verbose: false,
        ..Default::default()
    }
}

fn reference_clip(seconds: f32) -> Vec<f32> {
    tone((SAMPLE_RATE as f32 * seconds) as usize)
}

fn tone(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32).sin() * 0.3)
        .collect()
}

#[test]
fn test_zero_temperature_is_deterministic() -> Result<()> {
    let (mut engine, _) = mock_engine(quiet_config(), Some(10))?;
    let voice = engine.encode_voice_from_samples(&reference_clip(1.0), SAMPLE_RATE)?;

    let first = engine.generate_latents("Hello world.", &voice)?;
    let second = engine.generate_latents("Hello world.", &voice)?;
    assert_eq!(first, second);

    let audio_a = engine.generate("Hello world.", &voice)?;
    let audio_b = engine.generate("Hello world.", &voice)?;
    assert_eq!(audio_a, audio_b);
    Ok(())
}

#[test]
fn test_eos_grace_sets_audio_length() -> Result<()> {
    let (mut engine, probes) = mock_engine(quiet_config(), Some(10))?;
    let voice = engine.encode_voice_from_samples(&reference_clip(1.0), SAMPLE_RATE)?;

    let audio = engine.generate("Short sentence", &voice)?;
    // EOS frame plus three grace frames
    assert_eq!(audio.len(), 13 * SAMPLES_PER_FRAME);
    assert_eq!(probes.decoder_chunks.get(), vec![13]);
    Ok(())
}

#[test]
fn test_max_frames_caps_generation() -> Result<()> {
    let config = EngineConfig {
        max_frames: 32,
        ..quiet_config()
    };
    let (mut engine, probes) = mock_engine(config, None)?;
    let voice = engine.encode_voice_from_samples(&reference_clip(0.5), SAMPLE_RATE)?;

    let audio = engine.generate("This never ends", &voice)?;
    assert_eq!(audio.len(), 32 * SAMPLES_PER_FRAME);
    assert_eq!(probes.decoder_chunks.get(), vec![15, 15, 2]);
    Ok(())
}

#[test]
fn test_priming_runs_voice_then_text() -> Result<()> {
    let (mut engine, probes) = mock_engine(quiet_config(), Some(0))?;
    let voice = engine.encode_voice_from_samples(&tone(4800), SAMPLE_RATE)?;
    assert_eq!(voice.shape(), &[1, 2, EMBEDDING_DIM]);

    engine.generate_latents("hi", &voice)?;
    let lengths = probes.main.conditioning_lengths();
    // "hi" is prepared to "Hi." which is three byte tokens
    assert_eq!(&lengths[..2], &[2, 3]);
    assert!(lengths[2..].iter().all(|&n| n == 0));
    Ok(())
}

#[test]
fn test_voice_encoded_once_per_source() -> Result<()> {
    let (mut engine, probes) = mock_engine(quiet_config(), Some(5))?;
    let clip = reference_clip(1.0);

    let a = engine.encode_voice_from_samples(&clip, SAMPLE_RATE)?;
    let b = engine.encode_voice_from_samples(&clip, SAMPLE_RATE)?;
    assert_eq!(probes.encoder.count(), 1);
    assert_eq!(a.to_vec()?, b.to_vec()?);
    assert_eq!(engine.voice_cache().len(), 1);

    let other = reference_clip(0.5);
    engine.encode_voice_from_samples(&other, SAMPLE_RATE)?;
    assert_eq!(probes.encoder.count(), 2);

    engine.clear_voice_cache();
    engine.encode_voice_from_samples(&clip, SAMPLE_RATE)?;
    assert_eq!(probes.encoder.count(), 3);
    Ok(())
}

#[test]
fn test_long_reference_is_truncated() -> Result<()> {
    let (mut engine, probes) = mock_engine(quiet_config(), Some(5))?;
    engine.encode_voice_from_samples(&reference_clip(10.0), SAMPLE_RATE)?;
    assert_eq!(probes.encoder.last_input_len(), Some(MAX_REFERENCE_SAMPLES));
    Ok(())
}

#[test]
fn test_voice_from_wav_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ref.wav");
    pocket_onnx::audio::write_wav(&path, &reference_clip(1.0), SAMPLE_RATE)?;

    let (mut engine, probes) = mock_engine(quiet_config(), Some(4))?;
    let audio = engine.generate_from_file("From a file", &path)?;
    assert_eq!(audio.len(), 7 * SAMPLES_PER_FRAME);

    engine.encode_voice(&path)?;
    assert_eq!(probes.encoder.count(), 1);
    Ok(())
}

#[test]
fn test_missing_voice_file_is_input_error() -> Result<()> {
    let (mut engine, _) = mock_engine(quiet_config(), Some(4))?;
    let err = engine.encode_voice("/definitely/not/here.wav").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputError);
    Ok(())
}

#[test]
fn test_empty_text_is_input_error() -> Result<()> {
    let (mut engine, _) = mock_engine(quiet_config(), Some(4))?;
    let voice = engine.encode_voice_from_samples(&reference_clip(0.5), SAMPLE_RATE)?;

    let err = engine.generate("   ", &voice).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputError);
    // The engine stays usable
    assert!(engine.generate("Recovered", &voice).is_ok());
    Ok(())
}

#[test]
fn test_last_error_tracks_failures() -> Result<()> {
    let (mut engine, _) = mock_engine(quiet_config(), Some(4))?;
    assert!(engine.last_error().is_none());

    let voice = engine.encode_voice_from_samples(&reference_clip(0.5), SAMPLE_RATE)?;
    assert!(engine.generate("", &voice).is_err());
    let recorded = engine.last_error().map(|e| e.kind());
    assert_eq!(recorded, Some(ErrorKind::InputError));

    // A later success does not clear it
    engine.generate("Fine", &voice)?;
    assert!(engine.last_error().is_some());
    Ok(())
}

#[test]
fn test_flow_failure_mid_generation_is_recoverable() -> Result<()> {
    let config = quiet_config();
    let fail_on = 3 * config.lsd_steps + 1;
    let (mut units, _) = mock_units(Some(10));
    let failing = FailingUnit::new(units.flow_net, fail_on);
    let flow_calls = failing.calls();
    units.flow_net = Box::new(failing);
    let mut engine = TtsEngine::from_parts(config.clone(), units, Box::new(MockTokenizer))?;

    let voice = engine.encode_voice_from_samples(&reference_clip(1.0), SAMPLE_RATE)?;
    let (mut healthy, _) = mock_engine(config, Some(10))?;
    let expected = healthy.generate("Try this twice", &voice)?;

    // Fails while integrating the fourth frame
    let err = engine.generate("Try this twice", &voice).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InferenceFailure);
    assert_eq!(flow_calls.get(), fail_on);
    assert_eq!(
        engine.last_error().map(|e| e.kind()),
        Some(ErrorKind::InferenceFailure)
    );

    // Session state is rebuilt per call, so the same engine recovers fully
    let audio = engine.generate("Try this twice", &voice)?;
    assert_eq!(audio, expected);
    Ok(())
}

#[test]
fn test_without_voice_encoder() -> Result<()> {
    let config = EngineConfig {
        load_voice_encoder: false,
        ..quiet_config()
    };
    let (units, probes) = mock_units(Some(3));
    let mut engine = TtsEngine::from_parts(config, units, Box::new(MockTokenizer))?;

    let err = engine
        .encode_voice_from_samples(&reference_clip(0.5), SAMPLE_RATE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputError);
    assert_eq!(probes.encoder.count(), 0);

    // Precomputed embeddings still work
    let voice = VoiceEmbedding::from_parts(vec![0.1; 4 * EMBEDDING_DIM], &[1, 4, EMBEDDING_DIM])?;
    let audio = engine.generate("Precomputed voice", &voice)?;
    assert_eq!(audio.len(), 6 * SAMPLES_PER_FRAME);
    Ok(())
}

#[test]
fn test_invalid_config_is_setup_failure() {
    let config = EngineConfig {
        lsd_steps: 0,
        ..quiet_config()
    };
    let Err(err) = mock_engine(config, None) else {
        panic!("engine accepted lsd_steps = 0");
    };
    assert_eq!(err.kind(), ErrorKind::SetupFailure);
}

#[test]
fn test_seeded_noise_is_reproducible() -> Result<()> {
    let config = EngineConfig {
        temperature: 0.7,
        seed: Some(42),
        ..quiet_config()
    };
    let (mut a, _) = mock_engine(config.clone(), Some(8))?;
    let (mut b, _) = mock_engine(config, Some(8))?;
    let clip = reference_clip(0.5);
    let va = a.encode_voice_from_samples(&clip, SAMPLE_RATE)?;
    let vb = b.encode_voice_from_samples(&clip, SAMPLE_RATE)?;

    assert_eq!(a.generate_latents("Seeded", &va)?, b.generate_latents("Seeded", &vb)?);
    Ok(())
}
