//! Main TtsEngine struct - orchestrates the TTS pipeline
//!
//! Text and a reference voice go in; 24 kHz mono samples come out, either
//! all at once or chunk by chunk through a callback.

use crate::conditioners::prime;
use crate::conditioners::text::{TextTokenizer, embed_text};
use crate::conditioners::voice::{VoiceCache, VoiceEmbedding, VoiceSource};
use crate::config::{EngineConfig, FRAME_DURATION, SAMPLE_RATE};
use crate::error::{Result, TtsError};
use crate::generation::{CancelHandle, FrameGenerator, StopPolicy};
use crate::models::flow_lm::{FlowLmMain, FlowNet, FlowSchedule, LatentFrame, NoiseSampler};
use crate::models::mimi::MimiDecoder;
use crate::state::UnitState;
use crate::streaming::{self, StreamingConfig};
use crate::unit::TensorUnit;
use std::path::Path;
use std::time::Instant;

/// The five model units the engine drives.
pub struct EngineUnits {
    /// Reference audio to voice embedding. Only needed for cloning from audio.
    pub voice_encoder: Option<Box<dyn TensorUnit>>,
    /// Token ids to text embeddings
    pub text_conditioner: Box<dyn TensorUnit>,
    /// Recurrent main step (stateful)
    pub flow_main: Box<dyn TensorUnit>,
    /// Flow velocity step
    pub flow_net: Box<dyn TensorUnit>,
    /// Latents to audio (stateful)
    pub decoder: Box<dyn TensorUnit>,
}

/// Text-to-speech engine.
///
/// One engine runs one generation at a time; calls take `&mut self`.
/// Use separate engines for concurrent sessions.
pub struct TtsEngine {
    config: EngineConfig,
    tokenizer: Box<dyn TextTokenizer>,
    voice_encoder: Option<Box<dyn TensorUnit>>,
    text_conditioner: Box<dyn TensorUnit>,
    main: FlowLmMain,
    flow: FlowNet,
    decoder: MimiDecoder,
    schedule: FlowSchedule,
    noise: NoiseSampler,
    voices: VoiceCache,
    cancel: CancelHandle,
    last_error: Option<TtsError>,
}

impl TtsEngine {
    /// Load the ONNX models and tokenizer named by `config`.
    #[cfg(feature = "onnx")]
    pub fn new(config: EngineConfig) -> Result<Self> {
        use crate::conditioners::text::SentencePieceTokenizer;

        config.validate().map_err(TtsError::into_setup)?;
        let start = Instant::now();
        let units = crate::onnx::load_units(&config)?;
        let tokenizer = SentencePieceTokenizer::open(&config.tokenizer_path)?;
        tracing::info!("Tokenizer vocabulary: {} pieces", tokenizer.vocab_size());
        let engine = Self::from_parts(config, units, Box::new(tokenizer))?;
        tracing::info!(
            "Loaded {} models in {:.2}s",
            engine.config.precision,
            start.elapsed().as_secs_f32()
        );
        Ok(engine)
    }

    /// Build an engine from already-loaded units.
    pub fn from_parts(
        config: EngineConfig,
        units: EngineUnits,
        tokenizer: Box<dyn TextTokenizer>,
    ) -> Result<Self> {
        config.validate().map_err(TtsError::into_setup)?;

        let voice_encoder = if config.load_voice_encoder {
            units.voice_encoder
        } else {
            None
        };
        let main = FlowLmMain::new(units.flow_main).map_err(TtsError::into_setup)?;
        let decoder = MimiDecoder::new(units.decoder).map_err(TtsError::into_setup)?;
        let schedule = FlowSchedule::new(config.lsd_steps).map_err(TtsError::into_setup)?;
        let noise = NoiseSampler::new(config.temperature, config.noise_clamp, config.seed)
            .map_err(TtsError::into_setup)?;

        Ok(Self {
            tokenizer,
            voice_encoder,
            text_conditioner: units.text_conditioner,
            main,
            flow: FlowNet::new(units.flow_net),
            decoder,
            schedule,
            noise,
            voices: VoiceCache::new(),
            cancel: CancelHandle::new(),
            last_error: None,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    pub fn voice_cache(&self) -> &VoiceCache {
        &self.voices
    }

    pub fn clear_voice_cache(&mut self) {
        self.voices.clear();
    }

    /// Message of the most recent failed call on this engine.
    ///
    /// Successful calls leave it in place.
    pub fn last_error(&self) -> Option<&TtsError> {
        self.last_error.as_ref()
    }

    /// Handle for cancelling streaming sessions from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Ask the running streaming session to stop. A no-op when none runs.
    pub fn cancel_streaming(&self) {
        self.cancel.cancel();
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::debug!("call failed: {}", e);
            self.last_error = Some(e.clone());
        }
        result
    }

    fn report(&self, what: &str, frames: usize, samples: usize, start: Instant) {
        let audio_secs = samples as f32 / SAMPLE_RATE as f32;
        let elapsed = start.elapsed().as_secs_f32();
        let rtf = if audio_secs > 0.0 {
            elapsed / audio_secs
        } else {
            0.0
        };
        if self.config.verbose {
            tracing::info!(
                "{}: {} frames, {:.2}s audio in {:.2}s (RTF {:.3})",
                what,
                frames,
                audio_secs,
                elapsed,
                rtf
            );
        } else {
            tracing::debug!(
                "{}: {} frames, {:.2}s audio in {:.2}s (RTF {:.3})",
                what,
                frames,
                audio_secs,
                elapsed,
                rtf
            );
        }
    }

    /// Encode a reference WAV file, cached by path.
    pub fn encode_voice<P: AsRef<Path>>(&mut self, path: P) -> Result<VoiceEmbedding> {
        let result = self
            .voices
            .encode_source(VoiceSource::File(path.as_ref()), self.voice_encoder.as_deref_mut());
        self.record(result)
    }

    /// Encode reference samples at `sample_rate`, cached by content.
    pub fn encode_voice_from_samples(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<VoiceEmbedding> {
        let source = VoiceSource::Samples {
            samples,
            sample_rate,
        };
        let result = self
            .voices
            .encode_source(source, self.voice_encoder.as_deref_mut());
        self.record(result)
    }

    /// Fresh main-step state, primed with the voice and then the text.
    fn prime_session(&mut self, text: &str, voice: &VoiceEmbedding) -> Result<UnitState> {
        let ids = self.tokenizer.encode(text)?;
        let text_embeddings = embed_text(&mut self.text_conditioner, &ids)?;
        tracing::debug!(
            "prompt: {} tokens, {} voice frames",
            ids.len(),
            voice.frames()
        );
        let state = self.main.init_state()?;
        prime(&mut self.main, &state, voice.tensor(), &text_embeddings)
    }

    fn stop_policy(&self) -> StopPolicy {
        StopPolicy {
            max_frames: self.config.max_frames,
            frames_after_eos: self.config.frames_after_eos,
        }
    }

    fn latents_inner(&mut self, text: &str, voice: &VoiceEmbedding) -> Result<Vec<LatentFrame>> {
        let state = self.prime_session(text, voice)?;
        let policy = self.stop_policy();
        let generator = FrameGenerator::new(
            &mut self.main,
            &mut self.flow,
            &self.schedule,
            &mut self.noise,
            state,
            policy,
        )?;
        let (frames, reason) = generator.run()?;
        tracing::debug!("{} latent frames ({:?})", frames.len(), reason);
        Ok(frames)
    }

    /// Generate latent frames without decoding them.
    pub fn generate_latents(
        &mut self,
        text: &str,
        voice: &VoiceEmbedding,
    ) -> Result<Vec<LatentFrame>> {
        let result = self.latents_inner(text, voice);
        self.record(result)
    }

    fn generate_inner(&mut self, text: &str, voice: &VoiceEmbedding) -> Result<Vec<f32>> {
        let start = Instant::now();
        let frames = self.latents_inner(text, voice)?;
        let state = self.decoder.init_state()?;
        let (audio, _) = self.decoder.decode(&frames, &state)?;
        self.report("generate", frames.len(), audio.len(), start);
        Ok(audio)
    }

    /// Generate the whole utterance, decoded once at the end.
    pub fn generate(&mut self, text: &str, voice: &VoiceEmbedding) -> Result<Vec<f32>> {
        let result = self.generate_inner(text, voice);
        self.record(result)
    }

    /// [`TtsEngine::generate`] with a voice encoded from a WAV file.
    pub fn generate_from_file<P: AsRef<Path>>(&mut self, text: &str, voice: P) -> Result<Vec<f32>> {
        let voice = self.encode_voice(voice)?;
        self.generate(text, &voice)
    }

    fn streaming_inner<F>(
        &mut self,
        text: &str,
        voice: &VoiceEmbedding,
        on_chunk: F,
        config: &mut StreamingConfig,
    ) -> Result<usize>
    where
        F: FnMut(&[f32], bool),
    {
        let start = Instant::now();
        config.validate()?;
        let state = self.prime_session(text, voice)?;
        let policy = self.stop_policy();

        let mut generator = FrameGenerator::new(
            &mut self.main,
            &mut self.flow,
            &self.schedule,
            &mut self.noise,
            state,
            policy,
        )?;
        if config.enable_cancellation {
            generator = generator.with_cancellation(self.cancel.clone());
        }

        let summary = streaming::stream(generator, &mut self.decoder, config, on_chunk)?;
        tracing::debug!(
            "stream: {} chunks, stopped by {:?} at EOS frame {:?} ({:.2}s of latents)",
            summary.chunks,
            summary.stop,
            summary.eos_frame,
            summary.frames as f32 * FRAME_DURATION
        );
        self.report("stream", summary.frames, summary.samples, start);
        Ok(summary.samples)
    }

    /// Generate and deliver audio incrementally.
    ///
    /// `on_chunk(samples, is_final)` is called on this thread every
    /// `chunk_size_frames` frames and once more with `is_final = true`
    /// when generation ends on its own. Returns the number of samples
    /// delivered. A cancelled session delivers no final chunk.
    pub fn generate_streaming<F>(
        &mut self,
        text: &str,
        voice: &VoiceEmbedding,
        on_chunk: F,
        mut config: StreamingConfig,
    ) -> Result<usize>
    where
        F: FnMut(&[f32], bool),
    {
        self.cancel.reset();
        let result = self.streaming_inner(text, voice, on_chunk, &mut config);
        self.record(result)
    }
}

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
