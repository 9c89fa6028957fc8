//! HTTP API Server
//!
//! Axum-based server providing TTS generation endpoints.

use anyhow::Result;
use owo_colors::OwoColorize;

use crate::commands::serve::{ServeArgs, print_endpoints};
use crate::voice::resolve_voice;

pub mod handlers;
pub mod routes;
pub mod state;

pub async fn start_server(args: ServeArgs) -> Result<()> {
    let engine_args = args.engine.clone();
    let default_voice = args.voice.clone();

    // Model loading is blocking work
    let (engine, voice) = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut engine = engine_args.load_engine()?;
        let voice = default_voice
            .map(|spec| resolve_voice(&mut engine, &spec))
            .transpose()?;
        Ok((engine, voice))
    })
    .await??;

    println!(
        "  {} Models loaded ({}, sample rate: {}Hz)",
        "✓".green(),
        engine.config().precision,
        engine.sample_rate()
    );
    if voice.is_some() {
        println!("  {} Default voice ready", "✓".green());
    }

    if args.no_voice_files {
        println!("  {} Request voices limited to base64 data", "✓".green());
    }

    let state = state::AppState::new(engine, voice).with_voice_files(!args.no_voice_files);
    let app = routes::create_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    print_endpoints(&args.host, args.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
