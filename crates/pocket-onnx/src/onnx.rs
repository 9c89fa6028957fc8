//! ONNX Runtime backend for [`TensorUnit`].

use crate::config::EngineConfig;
use crate::engine::EngineUnits;
use crate::error::{Result, TtsError};
use crate::unit::{ElementType, NamedTensors, TensorSpec, TensorUnit};
use candle_core::{DType, Device, Tensor};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, ValueType};
use std::path::Path;

/// One ONNX model session.
pub struct OnnxUnit {
    name: String,
    session: Session,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

fn tensor_spec(name: &str, value_type: &ValueType, model: &str) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(TtsError::Setup(format!(
            "{}: '{}' is not a tensor",
            model, name
        )));
    };
    let element_type = match ty {
        TensorElementType::Float32 => ElementType::Float32,
        TensorElementType::Int64 => ElementType::Int64,
        TensorElementType::Bool => ElementType::Bool,
        other => {
            return Err(TtsError::Setup(format!(
                "{}: '{}' has unsupported element type {:?}",
                model, name, other
            )));
        }
    };
    // Dynamic dimensions are reported as -1
    let dims: Vec<Option<usize>> = shape
        .iter()
        .map(|&d| if d < 0 { None } else { Some(d as usize) })
        .collect();
    Ok(TensorSpec::new(name, element_type, &dims))
}

fn setup_error<E: std::fmt::Display>(model: &str) -> impl Fn(E) -> TtsError + '_ {
    move |e| TtsError::Setup(format!("{}: {}", model, e))
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}

impl OnnxUnit {
    pub fn load<P: AsRef<Path>>(path: P, intra_threads: usize) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TtsError::Setup(format!("model not found: {:?}", path)));
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        let session = Session::builder()
            .map_err(setup_error(&name))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(setup_error(&name))?
            .with_intra_threads(intra_threads)
            .map_err(setup_error(&name))?
            .commit_from_file(path)
            .map_err(setup_error(&name))?;

        let inputs = session
            .inputs
            .iter()
            .map(|i| tensor_spec(&i.name, &i.input_type, &name))
            .collect::<Result<Vec<_>>>()?;
        let outputs = session
            .outputs
            .iter()
            .map(|o| tensor_spec(&o.name, &o.output_type, &name))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "loaded {}: {} inputs, {} outputs",
            name,
            inputs.len(),
            outputs.len()
        );
        Ok(Self {
            name,
            session,
            inputs,
            outputs,
        })
    }
}

fn to_ort(tensor: &Tensor, element_type: ElementType) -> Result<DynValue> {
    let shape: Vec<i64> = tensor.dims().iter().map(|&d| d as i64).collect();
    let flat = tensor.flatten_all()?;
    let value = match element_type {
        ElementType::Float32 => {
            let data = flat.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        ElementType::Int64 => {
            let data = flat.to_dtype(DType::I64)?.to_vec1::<i64>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        ElementType::Bool => {
            let data: Vec<bool> = flat
                .to_dtype(DType::U8)?
                .to_vec1::<u8>()?
                .into_iter()
                .map(|v| v != 0)
                .collect();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
    };
    Ok(value)
}

fn from_ort(value: &DynValue, element_type: ElementType) -> Result<Tensor> {
    let tensor = match element_type {
        ElementType::Float32 => {
            let (shape, data) = value.try_extract_tensor::<f32>()?;
            Tensor::from_slice(data, dims(shape), &Device::Cpu)?
        }
        ElementType::Int64 => {
            let (shape, data) = value.try_extract_tensor::<i64>()?;
            Tensor::from_slice(data, dims(shape), &Device::Cpu)?
        }
        ElementType::Bool => {
            let (shape, data) = value.try_extract_tensor::<bool>()?;
            let bytes: Vec<u8> = data.iter().map(|&b| b as u8).collect();
            Tensor::from_vec(bytes, dims(shape), &Device::Cpu)?
        }
    };
    Ok(tensor)
}

impl TensorUnit for OnnxUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let mut feed: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let spec = self
                .inputs
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| {
                    TtsError::Inference(format!("{} has no input '{}'", self.name, name))
                })?;
            feed.push((name, to_ort(&tensor, spec.element_type)?));
        }

        let mut outputs = self.session.run(feed)?;

        let mut result = Vec::with_capacity(self.outputs.len());
        for spec in &self.outputs {
            let value = outputs.remove(spec.name.as_str()).ok_or_else(|| {
                TtsError::Inference(format!("{} produced no '{}'", self.name, spec.name))
            })?;
            result.push((spec.name.clone(), from_ort(&value, spec.element_type)?));
        }
        Ok(result)
    }
}

/// Load the five model units from `config.models_dir`.
///
/// The main, flow and decoder models follow `config.precision`; the
/// encoder and text conditioner exist in one precision only.
pub fn load_units(config: &EngineConfig) -> Result<EngineUnits> {
    let load = |stem: &str, quantizable: bool| -> Result<Box<dyn TensorUnit>> {
        let path = config.model_path(stem, quantizable);
        let unit = OnnxUnit::load(&path, config.intra_threads)?;
        Ok(Box::new(unit))
    };

    let voice_encoder = if config.load_voice_encoder {
        Some(load("mimi_encoder", false)?)
    } else {
        None
    };

    Ok(EngineUnits {
        voice_encoder,
        text_conditioner: load("text_conditioner", false)?,
        flow_main: load("flow_lm_main", true)?,
        flow_net: load("flow_lm_flow", true)?,
        decoder: load("mimi_decoder", true)?,
    })
}
