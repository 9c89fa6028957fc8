//! pocket-onnx CLI
//!
//! Voice-cloning text-to-speech from the command line or over HTTP.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pocket_onnx_cli::commands;

/// pocket-onnx - clone a voice from a few seconds of audio and speak any text
#[derive(Parser)]
#[command(
    name = "pocket-onnx",
    author,
    version,
    about = "Pocket TTS voice cloning on ONNX Runtime",
    long_about = "Runs the Pocket TTS ONNX export on CPU.\n\n\
                  Generate speech from text in the voice of a short reference clip,\n\
                  to a WAV file, as raw PCM on stdout, or from an HTTP server."
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Generate audio from text
    ///
    /// Synthesizes speech in the voice of the reference clip and saves it
    /// to a WAV file, or streams raw 16-bit PCM to stdout with --stream.
    Generate(commands::generate::GenerateArgs),

    /// Start the HTTP API server
    ///
    /// Serves generation over REST, including a chunked streaming endpoint
    /// and an OpenAI-style /v1/audio/speech adapter.
    Serve(commands::serve::ServeArgs),
}

/// Logs go to stderr so `--stream` can own stdout.
fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Generate(cmd_args) => {
            init_tracing(cmd_args.quiet || cmd_args.stream);
            // Generate is CPU-bound, run synchronously
            commands::generate::run(cmd_args)
        }
        Commands::Serve(cmd_args) => {
            init_tracing(false);
            commands::serve::run(cmd_args).await
        }
    }
}
