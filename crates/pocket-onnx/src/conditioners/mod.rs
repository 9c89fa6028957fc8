//! Conditioning inputs: text embeddings, voice embeddings, and the priming
//! passes that feed both into the main step's carried state.

pub mod text;
pub mod voice;

use crate::config::LATENT_DIM;
use crate::error::{Result, TtsError};
use crate::models::flow_lm::FlowLmMain;
use crate::state::UnitState;
use candle_core::{DType, Device, Tensor};

/// Reshape a unit output to `[1, N, D]`.
///
/// Leading axes beyond three must all be singletons and are dropped; a
/// missing batch axis is inserted.
pub(crate) fn to_rank3(tensor: Tensor, unit: &str) -> Result<Tensor> {
    let dims = tensor.dims().to_vec();
    match dims.len() {
        3 => Ok(tensor),
        0 | 1 => Err(TtsError::Inference(format!(
            "{} returned a rank-{} tensor, expected [1, N, D]",
            unit,
            dims.len()
        ))),
        2 => Ok(tensor.unsqueeze(0)?),
        n => {
            let (lead, tail) = dims.split_at(n - 3);
            if lead.iter().any(|&d| d != 1) {
                return Err(TtsError::Inference(format!(
                    "{} returned shape {:?}, leading axes must be 1",
                    unit, dims
                )));
            }
            Ok(tensor.reshape(tail)?)
        }
    }
}

/// Seed the main step's state with the voice, then the text.
///
/// Both passes run with an empty latent sequence and discard the
/// conditioning and EOS outputs. The order is fixed.
pub fn prime(
    main: &mut FlowLmMain,
    state: &UnitState,
    voice: &Tensor,
    text: &Tensor,
) -> Result<UnitState> {
    let empty = Tensor::zeros((1, 0, LATENT_DIM), DType::F32, &Device::Cpu)?;
    let (_, state) = main.step(&empty, voice, state)?;
    let (_, state) = main.step(&empty, text, &state)?;
    tracing::trace!(
        "primed main state with {} voice and {} text positions",
        voice.dims().get(1).copied().unwrap_or(0),
        text.dims().get(1).copied().unwrap_or(0)
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MainScript, MockMain};

    #[test]
    fn test_to_rank3() -> Result<()> {
        let t = Tensor::zeros((1, 1, 4, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(to_rank3(t, "u")?.dims(), &[1, 4, 8]);

        let t = Tensor::zeros((4, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(to_rank3(t, "u")?.dims(), &[1, 4, 8]);

        let t = Tensor::zeros((2, 1, 4, 8), DType::F32, &Device::Cpu)?;
        assert!(to_rank3(t, "u").is_err());
        Ok(())
    }

    #[test]
    fn test_prime_runs_voice_then_text() -> Result<()> {
        let script = MainScript::new();
        let mut main = FlowLmMain::new(Box::new(MockMain::new(script.clone(), None)))?;
        let state = main.init_state()?;

        let voice = Tensor::zeros((1, 7, 16), DType::F32, &Device::Cpu)?;
        let text = Tensor::zeros((1, 3, 16), DType::F32, &Device::Cpu)?;
        prime(&mut main, &state, &voice, &text)?;

        // Each call records the length of its conditioning input
        assert_eq!(script.conditioning_lengths(), vec![7, 3]);
        assert_eq!(script.sequence_lengths(), vec![0, 0]);
        Ok(())
    }
}
