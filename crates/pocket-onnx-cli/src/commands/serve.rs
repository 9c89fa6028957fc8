use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;

use super::EngineArgs;

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Host to bind (default: 127.0.0.1)
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on (default: 8000)
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Voice used when a request names none (.wav path or base64 WAV)
    #[arg(long)]
    pub voice: Option<String>,

    /// Reject request voices that name server-side files; only inline
    /// base64 WAV data is accepted from clients
    #[arg(long)]
    pub no_voice_files: bool,

    #[command(flatten)]
    pub engine: EngineArgs,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    crate::server::start_server(args).await
}

pub fn print_endpoints(host: &str, port: u16) {
    let base = format!("http://{}:{}", host, port);
    println!();
    println!("  {} {}", "▶".cyan(), format!("Listening on {}", base).bold());
    println!("    GET  {}/health", base);
    println!("    POST {}/generate          {}", base, "WAV".dimmed());
    println!("    POST {}/stream            {}", base, "raw PCM16, 24 kHz mono".dimmed());
    println!("    POST {}/v1/audio/speech   {}", base, "OpenAI-compatible".dimmed());
    println!();
}
