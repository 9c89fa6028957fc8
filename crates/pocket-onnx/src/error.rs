//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, TtsError>;

/// Coarse failure classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A model unit or the tokenizer could not be loaded. Fatal for the engine.
    SetupFailure,
    /// Bad text, unreadable or malformed audio, bad arguments. The engine stays usable.
    InputError,
    /// A tensor-transform call failed mid-pipeline. The current call is aborted.
    InferenceFailure,
}

#[derive(Error, Debug, Clone)]
pub enum TtsError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl TtsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TtsError::Setup(_) => ErrorKind::SetupFailure,
            TtsError::Input(_) | TtsError::Audio(_) | TtsError::Io(_) => ErrorKind::InputError,
            TtsError::Inference(_) => ErrorKind::InferenceFailure,
        }
    }

    /// Reclassify any failure as a setup failure, keeping its message.
    pub(crate) fn into_setup(self) -> Self {
        match self {
            TtsError::Setup(msg) => TtsError::Setup(msg),
            other => TtsError::Setup(other.to_string()),
        }
    }
}

impl From<candle_core::Error> for TtsError {
    fn from(e: candle_core::Error) -> Self {
        TtsError::Inference(e.to_string())
    }
}

impl From<hound::Error> for TtsError {
    fn from(e: hound::Error) -> Self {
        TtsError::Audio(e.to_string())
    }
}

impl From<std::io::Error> for TtsError {
    fn from(e: std::io::Error) -> Self {
        TtsError::Io(e.to_string())
    }
}

#[cfg(feature = "onnx")]
impl From<ort::Error> for TtsError {
    fn from(e: ort::Error) -> Self {
        TtsError::Inference(e.to_string())
    }
}
