use crate::server::state::AppState;
use crate::voice::{is_base64_audio, resolve_base64_voice, resolve_voice};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use pocket_onnx::{ErrorKind, StreamingConfig, TtsEngine, TtsError, VoiceEmbedding, audio};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: pocket_onnx::version().to_string(),
    })
}

#[derive(Deserialize)]
pub struct GenerateRequest {
    text: String,
    /// Base64 / data-URL WAV, or a .wav path readable by the server process.
    /// Paths are refused when the server runs with `--no-voice-files`.
    voice: Option<String>,
}

/// Failure of one request, with the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        // Errors that are not engine errors come from voice parsing
        let status = match e.downcast_ref::<TtsError>().map(TtsError::kind) {
            Some(ErrorKind::SetupFailure) | Some(ErrorKind::InferenceFailure) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Some(ErrorKind::InputError) | None => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: format!("{:#}", e),
        }
    }
}

impl From<TtsError> for ApiError {
    fn from(e: TtsError) -> Self {
        anyhow::Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!("request failed ({}): {}", self.status, self.message);
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

fn request_voice(
    engine: &mut TtsEngine,
    spec: Option<&str>,
    options: &VoiceOptions,
) -> Result<VoiceEmbedding, ApiError> {
    match (spec, options.default_voice.as_ref()) {
        (Some(spec), _) if options.allow_files => Ok(resolve_voice(engine, spec)?),
        (Some(spec), _) if is_base64_audio(spec.trim()) => {
            Ok(resolve_base64_voice(engine, spec)?)
        }
        (Some(_), _) => Err(ApiError::bad_request(
            "voice files are disabled on this server, send base64 WAV data",
        )),
        (None, Some(voice)) => Ok(voice.clone()),
        (None, None) => Err(ApiError::bad_request(
            "no voice given and the server has no default voice",
        )),
    }
}

/// Voice settings copied out of [`AppState`] for a blocking task.
struct VoiceOptions {
    default_voice: Option<VoiceEmbedding>,
    allow_files: bool,
}

impl From<&AppState> for VoiceOptions {
    fn from(state: &AppState) -> Self {
        Self {
            default_voice: state.default_voice.clone(),
            allow_files: state.allow_voice_files,
        }
    }
}

async fn synthesize_wav(
    state: AppState,
    text: String,
    voice: Option<String>,
) -> Result<Vec<u8>, ApiError> {
    // Held for the whole generation; requests run one at a time
    let mut engine = state.engine.clone().lock_owned().await;
    let options = VoiceOptions::from(&state);

    tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ApiError> {
        let voice = request_voice(&mut engine, voice.as_deref(), &options)?;
        let samples = engine.generate(&text, &voice)?;
        Ok(audio::wav_bytes(&samples, engine.sample_rate())?)
    })
    .await
    .map_err(|e| ApiError::internal(format!("Task join error: {}", e)))?
}

pub async fn generate(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let wav = synthesize_wav(state, payload.text, payload.voice).await?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], Body::from(wav)).into_response())
}

#[derive(Deserialize)]
pub struct OpenAIRequest {
    /// Accepted for compatibility; there is one model
    #[allow(dead_code)]
    model: Option<String>,
    input: String,
    voice: Option<String>,
    /// "wav" (default) or "pcm"
    response_format: Option<String>,
}

pub async fn openai_speech(
    State(state): State<AppState>,
    Json(payload): Json<OpenAIRequest>,
) -> Result<Response, ApiError> {
    match payload.response_format.as_deref().unwrap_or("wav") {
        "wav" => {
            let wav = synthesize_wav(state, payload.input, payload.voice).await?;
            Ok(([(header::CONTENT_TYPE, "audio/wav")], Body::from(wav)).into_response())
        }
        "pcm" => Ok(stream_pcm(state, payload.input, payload.voice)),
        other => Err(ApiError::bad_request(format!(
            "unsupported response_format '{}', expected wav or pcm",
            other
        ))),
    }
}

pub async fn generate_stream(
    State(state): State<AppState>,
    Json(payload): Json<GenerateRequest>,
) -> Response {
    stream_pcm(state, payload.text, payload.voice)
}

/// Chunked raw PCM16 response. Dropping the body (client disconnect)
/// cancels the running session.
fn stream_pcm(state: AppState, text: String, voice: Option<String>) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    tokio::spawn(async move {
        let mut engine = state.engine.clone().lock_owned().await;
        let options = VoiceOptions::from(&state);
        let tx_inner = tx.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<usize, ApiError> {
            let voice = request_voice(&mut engine, voice.as_deref(), &options)?;
            let cancel = engine.cancel_handle();
            let delivered = engine.generate_streaming(
                &text,
                &voice,
                |samples, _| {
                    if samples.is_empty() {
                        return;
                    }
                    let bytes = Bytes::from(audio::to_pcm16_bytes(samples));
                    if tx_inner.blocking_send(Ok(bytes)).is_err() {
                        tracing::debug!("client disconnected, cancelling stream");
                        cancel.cancel();
                    }
                },
                StreamingConfig::default(),
            )?;
            Ok(delivered)
        })
        .await;

        let failure = match result {
            Ok(Ok(samples)) => {
                tracing::debug!("streamed {} samples", samples);
                None
            }
            Ok(Err(e)) => Some(e.message),
            Err(join_err) => Some(format!("Task join error: {}", join_err)),
        };
        if let Some(message) = failure {
            tracing::warn!("stream failed: {}", message);
            let _ = tx.send(Err(std::io::Error::other(message))).await;
        }
    });

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}
