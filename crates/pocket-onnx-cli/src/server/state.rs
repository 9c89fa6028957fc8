use pocket_onnx::{TtsEngine, VoiceEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AppState {
    /// One engine, one generation at a time
    pub engine: Arc<Mutex<TtsEngine>>,
    /// Used when a request names no voice
    pub default_voice: Option<VoiceEmbedding>,
    /// Whether requests may name `.wav` files on the server's filesystem
    pub allow_voice_files: bool,
}

impl AppState {
    pub fn new(engine: TtsEngine, default_voice: Option<VoiceEmbedding>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            default_voice,
            allow_voice_files: true,
        }
    }

    pub fn with_voice_files(mut self, allow: bool) -> Self {
        self.allow_voice_files = allow;
        self
    }
}
