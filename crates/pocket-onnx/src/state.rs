//! Carried state for stateful units
//!
//! Stateful units declare extra inputs named `state_<N>` and return the
//! updated values as `out_state_<N>`. The names are parsed once when a unit
//! is wrapped; at run time the state is a plain vector indexed by slot.

use crate::error::{Result, TtsError};
use crate::unit::{NamedTensors, TensorSpec, TensorUnit};
use candle_core::Tensor;

const STATE_INPUT_PREFIX: &str = "state_";
const STATE_OUTPUT_PREFIX: &str = "out_state_";

#[derive(Debug, Clone)]
struct StateSlot {
    index: usize,
    input: TensorSpec,
    output_name: String,
}

/// Ordered state signature of one unit.
#[derive(Debug, Clone, Default)]
pub struct StateLayout {
    slots: Vec<StateSlot>,
}

fn slot_index(name: &str, prefix: &str) -> Option<usize> {
    name.strip_prefix(prefix)?.parse().ok()
}

impl StateLayout {
    /// Scan a unit's declared inputs and outputs for state slots.
    ///
    /// Slots are sorted by numeric index. Every `state_<N>` input must have
    /// an `out_state_<N>` output.
    pub fn from_unit<U: TensorUnit + ?Sized>(unit: &U) -> Result<Self> {
        let mut slots: Vec<StateSlot> = Vec::new();
        for spec in unit.inputs() {
            let Some(index) = slot_index(&spec.name, STATE_INPUT_PREFIX) else {
                continue;
            };
            let output_name = unit
                .outputs()
                .iter()
                .find(|o| slot_index(&o.name, STATE_OUTPUT_PREFIX) == Some(index))
                .map(|o| o.name.clone())
                .ok_or_else(|| {
                    TtsError::Setup(format!(
                        "{}: state input '{}' has no matching output",
                        unit.name(),
                        spec.name
                    ))
                })?;
            slots.push(StateSlot {
                index,
                input: spec.clone(),
                output_name,
            });
        }
        slots.sort_by_key(|s| s.index);
        if slots.windows(2).any(|w| w[0].index == w[1].index) {
            return Err(TtsError::Setup(format!(
                "{}: duplicate state slot index",
                unit.name()
            )));
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Zero-filled state from the declared input shapes.
    pub fn init(&self) -> Result<UnitState> {
        let tensors = self
            .slots
            .iter()
            .map(|s| s.input.zeros())
            .collect::<Result<Vec<_>>>()?;
        Ok(UnitState { tensors })
    }

    fn position_of_output(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.output_name == name)
    }
}

/// State tensors of one unit for one generation session.
#[derive(Debug, Clone)]
pub struct UnitState {
    tensors: Vec<Tensor>,
}

impl UnitState {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Tensor> {
        self.tensors.get(slot)
    }
}

/// A unit together with its parsed state layout.
pub struct StatefulUnit<U: TensorUnit = Box<dyn TensorUnit>> {
    unit: U,
    layout: StateLayout,
}

impl<U: TensorUnit> StatefulUnit<U> {
    pub fn new(unit: U) -> Result<Self> {
        let layout = StateLayout::from_unit(&unit)?;
        tracing::debug!("{}: {} state slots", unit.name(), layout.len());
        Ok(Self { unit, layout })
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn init_state(&self) -> Result<UnitState> {
        self.layout.init()
    }

    /// Run the unit with `inputs` plus the carried state.
    ///
    /// Returns the non-state outputs (in declared order) and the new state.
    /// `state` itself is never modified, so a failed call leaves the caller
    /// holding the previous state.
    pub fn apply(
        &mut self,
        mut inputs: NamedTensors,
        state: &UnitState,
    ) -> Result<(NamedTensors, UnitState)> {
        if state.len() != self.layout.len() {
            return Err(TtsError::Inference(format!(
                "{}: state has {} slots, unit expects {}",
                self.unit.name(),
                state.len(),
                self.layout.len()
            )));
        }
        inputs.reserve(state.len());
        for (slot, tensor) in self.layout.slots.iter().zip(&state.tensors) {
            inputs.push((slot.input.name.clone(), tensor.clone()));
        }

        let outputs = self.unit.run(inputs)?;

        let mut new_state: Vec<Option<Tensor>> = vec![None; self.layout.len()];
        let mut plain = Vec::with_capacity(outputs.len().saturating_sub(new_state.len()));
        for (name, tensor) in outputs {
            match self.layout.position_of_output(&name) {
                Some(pos) => {
                    let dtype = self.layout.slots[pos].input.element_type.dtype();
                    let tensor = if tensor.dtype() == dtype {
                        tensor
                    } else {
                        tensor.to_dtype(dtype)?
                    };
                    new_state[pos] = Some(tensor);
                }
                None => plain.push((name, tensor)),
            }
        }

        let tensors = new_state
            .into_iter()
            .zip(&self.layout.slots)
            .map(|(t, slot)| {
                t.ok_or_else(|| {
                    TtsError::Inference(format!(
                        "{} did not return '{}'",
                        self.unit.name(),
                        slot.output_name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((plain, UnitState { tensors }))
    }
}
