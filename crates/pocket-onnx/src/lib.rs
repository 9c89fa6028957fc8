//! Voice-cloning text-to-speech over the Pocket TTS ONNX export.
//!
//! [`TtsEngine`] turns text plus a few seconds of reference audio into
//! 24 kHz mono speech, in one call or streamed chunk by chunk. The five
//! models are driven through the [`TensorUnit`] trait; enable the `onnx`
//! feature for the ONNX Runtime backend.

pub mod audio;
pub mod conditioners;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod models;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod state;
pub mod streaming;
#[doc(hidden)]
pub mod testing;
pub mod unit;

pub use conditioners::voice::{VoiceCache, VoiceEmbedding, VoiceSource};
pub use config::{EngineConfig, Precision};
pub use engine::{EngineUnits, TtsEngine, version};
pub use error::{ErrorKind, Result, TtsError};
pub use generation::CancelHandle;
pub use models::flow_lm::LatentFrame;
pub use streaming::StreamingConfig;
pub use unit::{TensorSpec, TensorUnit};
