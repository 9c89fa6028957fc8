//! Incremental decode of a running generation session

use crate::config::defaults;
use crate::error::{Result, TtsError};
use crate::generation::{FrameGenerator, FrameStep, StopReason};
use crate::models::flow_lm::LatentFrame;
use crate::models::mimi::MimiDecoder;

/// Progress callback: `(frames_generated, total)`; total is 0 (unknown).
pub type ProgressFn = Box<dyn FnMut(usize, usize) + Send>;

pub struct StreamingConfig {
    /// Frames buffered before each decode and flush
    pub chunk_size_frames: usize,
    /// Called once per generated frame
    pub on_progress: Option<ProgressFn>,
    /// Honor [`crate::TtsEngine::cancel_streaming`] during this session
    pub enable_cancellation: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size_frames: defaults::STREAM_CHUNK_FRAMES,
            on_progress: None,
            enable_cancellation: true,
        }
    }
}

impl StreamingConfig {
    pub fn with_chunk_size(mut self, frames: usize) -> Self {
        self.chunk_size_frames = frames;
        self
    }

    pub fn with_progress(mut self, f: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_frames == 0 {
            return Err(TtsError::Input("chunk_size_frames must be at least 1".into()));
        }
        Ok(())
    }
}

/// What a streaming session delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Samples handed to the chunk callback
    pub samples: usize,
    /// Latent frames generated, including any discarded on cancel
    pub frames: usize,
    pub chunks: usize,
    pub stop: StopReason,
    /// Frame at which EOS was detected, if it was
    pub eos_frame: Option<usize>,
}

/// Drive `generator` to the end, decoding and delivering audio every
/// `chunk_size_frames` frames.
///
/// `on_chunk(samples, is_final)` runs on this thread. The stop-triggered
/// flush is the only final chunk; it carries no samples when nothing was
/// pending, and no decoder call is made for it. On cancellation pending
/// frames are dropped undecoded and no final chunk is sent.
pub fn stream<F>(
    mut generator: FrameGenerator<'_>,
    decoder: &mut MimiDecoder,
    config: &mut StreamingConfig,
    mut on_chunk: F,
) -> Result<StreamSummary>
where
    F: FnMut(&[f32], bool),
{
    config.validate()?;
    let chunk_size = config.chunk_size_frames;

    let mut decoder_state = decoder.init_state()?;
    let mut pending: Vec<LatentFrame> = Vec::with_capacity(chunk_size);
    let mut delivered = 0usize;
    let mut chunks = 0usize;

    let stop = loop {
        match generator.step()? {
            FrameStep::Frame(frame) => {
                pending.push(frame);
                if pending.len() >= chunk_size {
                    let (samples, next) = decoder.decode(&pending, &decoder_state)?;
                    decoder_state = next;
                    pending.clear();
                    on_chunk(&samples, false);
                    delivered += samples.len();
                    chunks += 1;
                }
                if let Some(progress) = config.on_progress.as_mut() {
                    progress(generator.frames_generated(), 0);
                }
            }
            FrameStep::Stopped(StopReason::Cancelled) => {
                if !pending.is_empty() {
                    tracing::debug!("discarding {} undecoded frames", pending.len());
                }
                break StopReason::Cancelled;
            }
            FrameStep::Stopped(reason) => {
                let samples = if pending.is_empty() {
                    Vec::new()
                } else {
                    decoder.decode(&pending, &decoder_state)?.0
                };
                on_chunk(&samples, true);
                delivered += samples.len();
                chunks += 1;
                break reason;
            }
        }
    };

    Ok(StreamSummary {
        samples: delivered,
        frames: generator.frames_generated(),
        chunks,
        stop,
        eos_frame: generator.eos_step(),
    })
}
