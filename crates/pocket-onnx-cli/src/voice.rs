//! Voice resolution utilities for CLI and server
//!
//! A voice specification is either:
//! - a local WAV file path
//! - base64-encoded WAV data, raw or as a `data:audio/wav;base64,` URL

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose};
use pocket_onnx::{TtsEngine, VoiceEmbedding, audio};
use std::path::Path;

/// Resolve a voice specification to an embedding, through the engine's cache.
pub fn resolve_voice(engine: &mut TtsEngine, spec: &str) -> Result<VoiceEmbedding> {
    let spec = spec.trim();

    let path = Path::new(spec);
    if path.exists() {
        return resolve_file_voice(engine, path);
    }

    if is_base64_audio(spec) {
        return resolve_base64_voice(engine, spec);
    }

    anyhow::bail!(
        "Voice '{}' not found. Expected one of:\n\
         - File path: /path/to/voice.wav\n\
         - Base64 audio: data:audio/wav;base64,...",
        truncate(spec, 60)
    )
}

/// Encode inline base64 / data-URL WAV data, ignoring the filesystem.
pub fn resolve_base64_voice(engine: &mut TtsEngine, spec: &str) -> Result<VoiceEmbedding> {
    let (samples, sample_rate) = decode_base64_wav(spec.trim())?;
    engine
        .encode_voice_from_samples(&samples, sample_rate)
        .context("Failed to encode base64 audio for voice cloning")
}

fn resolve_file_voice(engine: &mut TtsEngine, path: &Path) -> Result<VoiceEmbedding> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "wav" | "wave" => engine
            .encode_voice(path)
            .with_context(|| format!("Failed to process audio from {:?}", path)),
        _ => anyhow::bail!(
            "Unsupported file extension '{}' for voice file. Expected .wav",
            ext
        ),
    }
}

/// Check if a string looks like base64 audio
pub fn is_base64_audio(spec: &str) -> bool {
    if spec.starts_with("data:audio/") && spec.contains("base64,") {
        return true;
    }

    // A WAV header alone is 44 bytes, ~60 base64 chars
    if spec.len() > 100 {
        return spec
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=');
    }

    false
}

/// Decode base64 WAV data into mono samples and their rate.
pub fn decode_base64_wav(spec: &str) -> Result<(Vec<f32>, u32)> {
    let b64 = match spec.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => spec,
    };

    let bytes = general_purpose::STANDARD
        .decode(b64.trim())
        .context("Failed to decode base64 audio")?;
    let wav = audio::read_wav_from_bytes(&bytes).context("Failed to parse WAV from base64 data")?;
    Ok((audio::to_mono(&wav.samples, wav.channels), wav.sample_rate))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_base64_audio() {
        assert!(is_base64_audio(
            "data:audio/wav;base64,UklGRi4AAABXQVZFZm10IBAAAAABAAIAQB8AAEAfAAABAAgAZGF0YQoAAAAA"
        ));
        assert!(!is_base64_audio("alba"));
        assert!(!is_base64_audio("/path/to/file.wav"));
        assert!(!is_base64_audio("short"));
    }

    #[test]
    fn test_decode_base64_wav() {
        let samples = vec![0.25f32; 480];
        let bytes = audio::wav_bytes(&samples, 16_000).unwrap();
        let url = format!(
            "data:audio/wav;base64,{}",
            general_purpose::STANDARD.encode(&bytes)
        );

        let (decoded, rate) = decode_base64_wav(&url).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded, samples);

        let raw = general_purpose::STANDARD.encode(&bytes);
        assert_eq!(decode_base64_wav(&raw).unwrap().0.len(), 480);
    }

    #[test]
    fn test_bad_base64_is_error() {
        assert!(decode_base64_wav("data:audio/wav;base64,!!!not base64!!!").is_err());
    }

    #[test]
    fn test_truncate_long_spec() {
        let long = "x".repeat(200);
        assert_eq!(truncate(&long, 10), "xxxxxxx...");
        assert_eq!(truncate("short", 10), "short");
    }
}
