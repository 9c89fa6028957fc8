//! Mimi audio decoder driven in fixed-size latent chunks

use crate::config::DECODE_CHUNK_FRAMES;
use crate::error::{Result, TtsError};
use crate::models::flow_lm::{LatentFrame, stack_frames};
use crate::state::{StatefulUnit, UnitState};
use crate::unit::{TensorUnit, to_f32_vec};

pub struct MimiDecoder {
    unit: StatefulUnit,
}

impl MimiDecoder {
    pub fn new(unit: Box<dyn TensorUnit>) -> Result<Self> {
        Ok(Self {
            unit: StatefulUnit::new(unit)?,
        })
    }

    pub fn init_state(&self) -> Result<UnitState> {
        self.unit.init_state()
    }

    /// Decode frames to samples, [`DECODE_CHUNK_FRAMES`] frames per call.
    ///
    /// The decoder state is threaded through every call and returned so a
    /// caller can keep decoding the same session later.
    pub fn decode(
        &mut self,
        frames: &[LatentFrame],
        state: &UnitState,
    ) -> Result<(Vec<f32>, UnitState)> {
        let mut state = state.clone();
        let mut samples = Vec::new();

        for chunk in frames.chunks(DECODE_CHUNK_FRAMES) {
            let latent = stack_frames(chunk)?;
            let (outputs, next) = self
                .unit
                .apply(vec![("latent".to_string(), latent)], &state)?;
            let (_, audio) = outputs.into_iter().next().ok_or_else(|| {
                TtsError::Inference(format!("{} returned no audio", self.unit.name()))
            })?;
            samples.extend(to_f32_vec(&audio)?);
            state = next;
            tracing::trace!("decoded {} frames", chunk.len());
        }

        Ok((samples, state))
    }
}
