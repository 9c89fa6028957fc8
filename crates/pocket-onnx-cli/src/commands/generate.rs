//! Generate command implementation
//!
//! Provides `pocket-onnx generate` for text-to-speech synthesis.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use pocket_onnx::config::{FRAME_DURATION, defaults};
use pocket_onnx::{StreamingConfig, TtsEngine, VoiceEmbedding, audio};
use std::io::Write;
use std::path::PathBuf;

use super::EngineArgs;
use crate::voice::resolve_voice;

/// Default text shown when user runs without --text
pub const DEFAULT_TEXT: &str = "Hello world! This voice was cloned from a few seconds of audio.";

#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Text to synthesize (defaults to a greeting if not specified)
    #[arg(short, long, default_value = DEFAULT_TEXT)]
    pub text: String,

    /// Reference voice: path to a .wav file, or base64 / data-URL WAV data
    #[arg(short, long)]
    pub voice: String,

    /// Output audio file path
    #[arg(short, long, default_value = "output.wav")]
    pub output: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Stream raw 16-bit PCM audio to stdout (for piping to audio players)
    #[arg(long)]
    pub stream: bool,

    /// Latent frames per streamed chunk (80 ms each)
    #[arg(long, default_value_t = defaults::STREAM_CHUNK_FRAMES)]
    pub chunk_frames: usize,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Print styled message (respects quiet mode)
macro_rules! info {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}

pub fn run(args: GenerateArgs) -> Result<()> {
    // stdout carries audio when streaming
    let quiet = args.quiet || args.stream;

    if !quiet {
        print_banner();
    }

    info!(quiet, "{} Loading models...", "▶".cyan());
    let mut engine = args.engine.load_engine()?;
    info!(
        quiet,
        "  {} Models loaded ({}, sample rate: {}Hz)",
        "✓".green(),
        engine.config().precision,
        engine.sample_rate()
    );

    info!(
        quiet,
        "{} Using voice: {}",
        "▶".cyan(),
        truncate_text(&args.voice, 60).yellow()
    );
    let voice = resolve_voice(&mut engine, &args.voice)?;
    info!(
        quiet,
        "  {} Voice ready ({} frames)",
        "✓".green(),
        voice.frames()
    );

    let streaming = StreamingConfig::default().with_chunk_size(args.chunk_frames);
    if args.stream {
        run_streaming(&mut engine, &args.text, &voice, streaming)
    } else {
        run_to_file(&mut engine, &args, &voice, streaming, quiet)
    }
}

/// Run streaming generation to stdout
fn run_streaming(
    engine: &mut TtsEngine,
    text: &str,
    voice: &VoiceEmbedding,
    config: StreamingConfig,
) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    let cancel = engine.cancel_handle();
    let mut write_error = None;

    engine.generate_streaming(
        text,
        voice,
        |samples, _| {
            if write_error.is_some() {
                return;
            }
            let result = stdout
                .write_all(&audio::to_pcm16_bytes(samples))
                .and_then(|_| stdout.flush());
            if let Err(e) = result {
                // Reader went away (e.g. closed pipe); stop generating
                cancel.cancel();
                write_error = Some(e);
            }
        },
        config,
    )?;

    match write_error {
        Some(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Some(e) => Err(e).context("Failed to write audio to stdout"),
        None => Ok(()),
    }
}

/// Run generation to file with progress bar
fn run_to_file(
    engine: &mut TtsEngine,
    args: &GenerateArgs,
    voice: &VoiceEmbedding,
    config: StreamingConfig,
    quiet: bool,
) -> Result<()> {
    info!(
        quiet,
        "{} Generating: \"{}\"",
        "▶".cyan(),
        truncate_text(&args.text, 60).italic()
    );

    let max_frames = engine.config().max_frames as u64;
    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(max_frames);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
                )
                .context("Invalid progress template")?
                .progress_chars("█▓░"),
        );
        pb.set_message("generating...");
        pb
    };

    let progress = pb.clone();
    let config = config.with_progress(move |frames, _| {
        progress.set_position(frames as u64);
        progress.set_message(format!(
            "{:.2}s generated",
            frames as f32 * FRAME_DURATION
        ));
    });

    let mut samples = Vec::new();
    engine.generate_streaming(
        &args.text,
        voice,
        |chunk, _| samples.extend_from_slice(chunk),
        config,
    )?;
    pb.finish_and_clear();

    if samples.is_empty() {
        anyhow::bail!("No audio generated - text may be too short or invalid");
    }

    let sample_rate = engine.sample_rate();
    let duration_sec = samples.len() as f32 / sample_rate as f32;

    info!(
        quiet,
        "{} Saving to: {}",
        "▶".cyan(),
        args.output.display().yellow()
    );
    audio::write_wav(&args.output, &samples, sample_rate)
        .with_context(|| format!("Failed to write {:?}", args.output))?;

    if !quiet {
        println!();
        println!(
            "  {} {}",
            "✓".green().bold(),
            "Audio generated successfully!".green().bold()
        );
        println!(
            "    Duration: {:.2}s ({} samples @ {}Hz)",
            duration_sec,
            samples.len(),
            sample_rate
        );
        println!("    Output:   {}", args.output.display().cyan());
        println!();
        println!(
            "  {}",
            format!("Play with: ffplay -autoexit {:?}", args.output).dimmed()
        );
    }

    Ok(())
}

/// Print startup banner
fn print_banner() {
    println!();
    println!("  {}", "pocket-onnx".bold().cyan());
    println!(
        "      {} {}",
        "Pocket TTS on ONNX Runtime".dimmed(),
        format!("v{}", pocket_onnx::version()).dimmed()
    );
    println!();
}

/// Truncate text for display
fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
