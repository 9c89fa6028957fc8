//! Opaque tensor-transform units.
//!
//! Every model the engine drives (voice encoder, text conditioner, flow LM
//! main step, flow velocity step, audio decoder) is seen through the
//! [`TensorUnit`] trait: named tensors in, named tensors out. The engine
//! never looks inside a unit; backends differ only in where the numbers
//! come from.

use crate::error::{Result, TtsError};
use candle_core::{DType, Device, Tensor};

/// Inputs or outputs of a unit, in order.
pub type NamedTensors = Vec<(String, Tensor)>;

/// Element type of a declared unit tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Float32,
    Int64,
    /// Carried as `u8` (0/1) on the candle side.
    Bool,
}

impl ElementType {
    pub fn dtype(self) -> DType {
        match self {
            ElementType::Float32 => DType::F32,
            ElementType::Int64 => DType::I64,
            ElementType::Bool => DType::U8,
        }
    }
}

/// Declared signature of one unit input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub name: String,
    pub element_type: ElementType,
    /// `None` marks a dynamic dimension
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, element_type: ElementType, shape: &[Option<usize>]) -> Self {
        Self {
            name: name.into(),
            element_type,
            shape: shape.to_vec(),
        }
    }

    pub fn f32(name: impl Into<String>, shape: &[Option<usize>]) -> Self {
        Self::new(name, ElementType::Float32, shape)
    }

    pub fn i64(name: impl Into<String>, shape: &[Option<usize>]) -> Self {
        Self::new(name, ElementType::Int64, shape)
    }

    /// Zero-filled tensor matching this spec, with dynamic dims sized 0.
    pub fn zeros(&self) -> Result<Tensor> {
        let dims: Vec<usize> = self.shape.iter().map(|d| d.unwrap_or(0)).collect();
        Ok(Tensor::zeros(
            dims,
            self.element_type.dtype(),
            &Device::Cpu,
        )?)
    }
}

/// A tensor-transform unit.
///
/// `run` receives named inputs and returns every declared output, in the
/// order given by [`TensorUnit::outputs`].
pub trait TensorUnit: Send {
    /// Model identity, used in error messages and logs.
    fn name(&self) -> &str;

    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors>;
}

impl<U: TensorUnit + ?Sized> TensorUnit for Box<U> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn inputs(&self) -> &[TensorSpec] {
        (**self).inputs()
    }

    fn outputs(&self) -> &[TensorSpec] {
        (**self).outputs()
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        (**self).run(inputs)
    }
}

/// Take the output called `name` out of a unit's result.
pub fn take_output(outputs: &mut NamedTensors, unit: &str, name: &str) -> Result<Tensor> {
    let pos = outputs
        .iter()
        .position(|(n, _)| n == name)
        .ok_or_else(|| {
            TtsError::Inference(format!("{} produced no '{}' output", unit, name))
        })?;
    Ok(outputs.swap_remove(pos).1)
}

/// Flatten a float tensor into a plain vector.
pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor
        .flatten_all()?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?)
}

/// Read the first element of a float tensor.
pub fn first_f32(tensor: &Tensor, what: &str) -> Result<f32> {
    to_f32_vec(tensor)?
        .first()
        .copied()
        .ok_or_else(|| TtsError::Inference(format!("{} is empty", what)))
}
