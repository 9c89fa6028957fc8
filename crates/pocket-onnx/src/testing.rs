//! Scripted stand-ins for the model units.
//!
//! They follow the same input/output names and state conventions as the
//! exported models but compute trivially, so the control flow of the engine
//! can be tested without model files. Not a stable API.

use crate::conditioners::text::{TextTokenizer, prepare_text};
use crate::config::{EMBEDDING_DIM, EngineConfig, LATENT_DIM, SAMPLES_PER_FRAME};
use crate::engine::{EngineUnits, TtsEngine};
use crate::error::{Result, TtsError};
use crate::unit::{ElementType, NamedTensors, TensorSpec, TensorUnit, first_f32, to_f32_vec};
use candle_core::{DType, Device, Tensor};
use std::sync::{Arc, Mutex, MutexGuard};

/// Width of the mock conditioning vector.
pub const CONDITIONING_DIM: usize = 16;

fn input<'a>(inputs: &'a NamedTensors, unit: &str, name: &str) -> Result<&'a Tensor> {
    inputs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, t)| t)
        .ok_or_else(|| TtsError::Inference(format!("{} missing input '{}'", unit, name)))
}

fn scalar(v: f32) -> Result<Tensor> {
    Ok(Tensor::from_slice(&[v], 1, &Device::Cpu)?)
}

/// Shared, cloneable record of what a mock saw.
#[derive(Debug, Default)]
pub struct Log<T>(Arc<Mutex<T>>);

impl<T> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Default> Log<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(T::default())))
    }
}

impl<T> Log<T> {
    fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: Clone> Log<T> {
    pub fn get(&self) -> T {
        self.lock().clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct MainCalls {
    conditioning_lengths: Vec<usize>,
    sequence_lengths: Vec<usize>,
    first_values: Vec<f32>,
}

/// Call record of a [`MockMain`].
pub type MainScript = Log<MainCalls>;

impl MainScript {
    /// Length of `text_embeddings` on every call, priming included.
    pub fn conditioning_lengths(&self) -> Vec<usize> {
        self.lock().conditioning_lengths.clone()
    }

    pub fn sequence_lengths(&self) -> Vec<usize> {
        self.lock().sequence_lengths.clone()
    }

    /// Calls that carried a latent frame.
    pub fn generation_calls(&self) -> usize {
        self.lock().first_values.len()
    }

    /// First element of each latent frame fed back in.
    pub fn first_sequence_values(&self) -> Vec<f32> {
        self.lock().first_values.clone()
    }
}

/// Main step with three state slots: a float call counter, a bool toggle
/// and an int64 count of generation calls.
///
/// The EOS logit is high from generation call `eos_at` on, low before.
pub struct MockMain {
    script: MainScript,
    eos_at: Option<usize>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl MockMain {
    pub fn new(script: MainScript, eos_at: Option<usize>) -> Self {
        Self {
            script,
            eos_at,
            inputs: vec![
                TensorSpec::f32("sequence", &[Some(1), None, Some(LATENT_DIM)]),
                TensorSpec::f32("text_embeddings", &[Some(1), None, None]),
                TensorSpec::f32("state_0", &[Some(1)]),
                TensorSpec::new("state_1", ElementType::Bool, &[Some(1)]),
                TensorSpec::i64("state_2", &[Some(1)]),
            ],
            outputs: vec![
                TensorSpec::f32("conditioning", &[Some(1), Some(CONDITIONING_DIM)]),
                TensorSpec::f32("eos_logit", &[Some(1), Some(1)]),
                TensorSpec::f32("out_state_0", &[Some(1)]),
                TensorSpec::new("out_state_1", ElementType::Bool, &[Some(1)]),
                TensorSpec::i64("out_state_2", &[Some(1)]),
            ],
        }
    }
}

impl TensorUnit for MockMain {
    fn name(&self) -> &str {
        "mock_flow_lm_main"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let name = self.name().to_string();
        let sequence = input(&inputs, &name, "sequence")?;
        let text = input(&inputs, &name, "text_embeddings")?;
        let calls = first_f32(input(&inputs, &name, "state_0")?, "state_0")?;
        let toggle = input(&inputs, &name, "state_1")?.to_vec1::<u8>()?[0];
        let generated = input(&inputs, &name, "state_2")?.to_vec1::<i64>()?[0];

        let seq_len = sequence.dims()[1];
        {
            let mut log = self.script.lock();
            log.conditioning_lengths.push(text.dims()[1]);
            log.sequence_lengths.push(seq_len);
            if seq_len > 0 {
                log.first_values.push(to_f32_vec(sequence)?[0]);
            }
        }

        let (eos, generated) = if seq_len > 0 {
            let step = generated as usize;
            (self.eos_at.is_some_and(|e| step >= e), generated + 1)
        } else {
            (false, generated)
        };

        let conditioning: Vec<f32> = (0..CONDITIONING_DIM)
            .map(|k| (calls + k as f32) * 0.01)
            .collect();
        Ok(vec![
            (
                "conditioning".to_string(),
                Tensor::from_vec(conditioning, (1, CONDITIONING_DIM), &Device::Cpu)?,
            ),
            (
                "eos_logit".to_string(),
                Tensor::from_slice(&[if eos { 0.0f32 } else { -10.0 }], (1, 1), &Device::Cpu)?,
            ),
            ("out_state_0".to_string(), scalar(calls + 1.0)?),
            (
                "out_state_1".to_string(),
                Tensor::from_slice(&[1 - toggle.min(1)], 1, &Device::Cpu)?,
            ),
            (
                "out_state_2".to_string(),
                Tensor::from_slice(&[generated], 1, &Device::Cpu)?,
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy)]
enum Velocity {
    Constant(f32),
    /// Element k of the conditioning vector, cycled over the latent width
    Conditioning,
}

/// Flow step returning a scripted velocity.
pub struct MockFlow {
    velocity: Velocity,
    seen: Log<Vec<(f32, f32)>>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl MockFlow {
    fn with_velocity(velocity: Velocity) -> Self {
        Self {
            velocity,
            seen: Log::new(),
            inputs: vec![
                TensorSpec::f32("c", &[Some(1), None]),
                TensorSpec::f32("s", &[Some(1), Some(1)]),
                TensorSpec::f32("t", &[Some(1), Some(1)]),
                TensorSpec::f32("x", &[Some(1), Some(LATENT_DIM)]),
            ],
            outputs: vec![TensorSpec::f32("flow_dir", &[Some(1), Some(LATENT_DIM)])],
        }
    }

    pub fn constant(v: f32) -> Self {
        Self::with_velocity(Velocity::Constant(v))
    }

    pub fn following_conditioning() -> Self {
        Self::with_velocity(Velocity::Conditioning)
    }

    /// Every `(s, t)` pair passed in, in call order.
    pub fn seen_times(&self) -> Log<Vec<(f32, f32)>> {
        self.seen.clone()
    }
}

impl TensorUnit for MockFlow {
    fn name(&self) -> &str {
        "mock_flow_lm_flow"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let name = self.name();
        let s = first_f32(input(&inputs, name, "s")?, "s")?;
        let t = first_f32(input(&inputs, name, "t")?, "t")?;
        let x = input(&inputs, name, "x")?;
        if x.dims() != [1, LATENT_DIM] {
            return Err(TtsError::Inference(format!("bad x shape {:?}", x.dims())));
        }
        self.seen.lock().push((s, t));

        let v: Vec<f32> = match self.velocity {
            Velocity::Constant(v) => vec![v; LATENT_DIM],
            Velocity::Conditioning => {
                let c = to_f32_vec(input(&inputs, name, "c")?)?;
                if c.is_empty() {
                    return Err(TtsError::Inference("empty conditioning".into()));
                }
                (0..LATENT_DIM).map(|k| c[k % c.len()]).collect()
            }
        };
        Ok(vec![(
            "flow_dir".to_string(),
            Tensor::from_vec(v, (1, LATENT_DIM), &Device::Cpu)?,
        )])
    }
}

/// Decoder emitting [`SAMPLES_PER_FRAME`] samples per frame.
///
/// Its state counts frames decoded so far; each sample of frame `i` (in
/// session order) equals `i * 1e-3`, so discontinuities in the threaded
/// state show up in the audio.
pub struct MockDecoder {
    chunks: Log<Vec<usize>>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl Default for MockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDecoder {
    pub fn new() -> Self {
        Self {
            chunks: Log::new(),
            inputs: vec![
                TensorSpec::f32("latent", &[Some(1), None, Some(LATENT_DIM)]),
                TensorSpec::f32("state_0", &[Some(1)]),
            ],
            outputs: vec![
                TensorSpec::f32("audio", &[Some(1), Some(1), None]),
                TensorSpec::f32("out_state_0", &[Some(1)]),
            ],
        }
    }

    /// Frame count of every decoder call.
    pub fn chunk_sizes(&self) -> Log<Vec<usize>> {
        self.chunks.clone()
    }
}

impl TensorUnit for MockDecoder {
    fn name(&self) -> &str {
        "mock_mimi_decoder"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let name = self.name();
        let latent = input(&inputs, name, "latent")?;
        let offset = first_f32(input(&inputs, name, "state_0")?, "state_0")?;
        let n = latent.dims()[1];
        self.chunks.lock().push(n);

        let mut audio = Vec::with_capacity(n * SAMPLES_PER_FRAME);
        for i in 0..n {
            let value = (offset + i as f32) * 1e-3;
            audio.extend(std::iter::repeat_n(value, SAMPLES_PER_FRAME));
        }
        let len = audio.len();
        Ok(vec![
            (
                "audio".to_string(),
                Tensor::from_vec(audio, (1, 1, len), &Device::Cpu)?,
            ),
            ("out_state_0".to_string(), scalar(offset + n as f32)?),
        ])
    }
}

#[derive(Debug, Default, Clone)]
struct EncoderLog {
    count: usize,
    last_len: Option<usize>,
}

/// Invocation record of a [`MockEncoder`].
#[derive(Debug, Clone)]
pub struct EncoderCalls(Log<EncoderLog>);

impl EncoderCalls {
    pub fn count(&self) -> usize {
        self.0.lock().count
    }

    /// Sample count of the most recent `audio` input.
    pub fn last_input_len(&self) -> Option<usize> {
        self.0.lock().last_len
    }
}

/// Voice encoder producing one [`EMBEDDING_DIM`] row per 1920 samples.
///
/// Every value is the mean of the input samples.
pub struct MockEncoder {
    log: Log<EncoderLog>,
    rank2: bool,
    width: usize,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl Default for MockEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEncoder {
    pub fn new() -> Self {
        Self {
            log: Log::new(),
            rank2: false,
            width: EMBEDDING_DIM,
            inputs: vec![TensorSpec::f32("audio", &[Some(1), Some(1), None])],
            outputs: vec![TensorSpec::f32(
                "latents",
                &[Some(1), None, Some(EMBEDDING_DIM)],
            )],
        }
    }

    /// Return `[N, D]` instead of `[1, N, D]`.
    pub fn with_rank2_output(mut self) -> Self {
        self.rank2 = true;
        self
    }

    /// Emit rows of `width` values instead of [`EMBEDDING_DIM`].
    pub fn with_output_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    pub fn calls(&self) -> EncoderCalls {
        EncoderCalls(self.log.clone())
    }
}

impl TensorUnit for MockEncoder {
    fn name(&self) -> &str {
        "mock_mimi_encoder"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let audio = input(&inputs, self.name(), "audio")?;
        let samples = to_f32_vec(audio)?;
        {
            let mut log = self.log.lock();
            log.count += 1;
            log.last_len = Some(samples.len());
        }

        let frames = (samples.len() / SAMPLES_PER_FRAME).max(1);
        let mean = samples.iter().sum::<f32>() / samples.len().max(1) as f32;
        let data = vec![mean; frames * self.width];
        let latents = if self.rank2 {
            Tensor::from_vec(data, (frames, self.width), &Device::Cpu)?
        } else {
            Tensor::from_vec(data, (1, frames, self.width), &Device::Cpu)?
        };
        Ok(vec![("latents".to_string(), latents)])
    }
}

/// Text conditioner mapping each token id to a row filled with that id.
///
/// Returns `[T, dim]`, without the batch axis.
pub struct MockTextConditioner {
    dim: usize,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
}

impl MockTextConditioner {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            inputs: vec![TensorSpec::i64("token_ids", &[Some(1), None])],
            outputs: vec![TensorSpec::f32("embeddings", &[None, Some(dim)])],
        }
    }
}

impl TensorUnit for MockTextConditioner {
    fn name(&self) -> &str {
        "mock_text_conditioner"
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let ids = input(&inputs, self.name(), "token_ids")?
            .flatten_all()?
            .to_vec1::<i64>()?;
        let data: Vec<f32> = ids
            .iter()
            .flat_map(|&id| std::iter::repeat_n(id as f32, self.dim))
            .collect();
        Ok(vec![(
            "embeddings".to_string(),
            Tensor::from_vec(data, (ids.len(), self.dim), &Device::Cpu)?.to_dtype(DType::F32)?,
        )])
    }
}

/// Wraps a unit and fails its `fail_on`-th call (1-based) with an
/// inference error. Every other call is passed through.
pub struct FailingUnit {
    inner: Box<dyn TensorUnit>,
    fail_on: usize,
    calls: Log<usize>,
}

impl FailingUnit {
    pub fn new(inner: Box<dyn TensorUnit>, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            calls: Log::new(),
        }
    }

    /// Calls seen so far, the failed one included.
    pub fn calls(&self) -> Log<usize> {
        self.calls.clone()
    }
}

impl TensorUnit for FailingUnit {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn inputs(&self) -> &[TensorSpec] {
        self.inner.inputs()
    }

    fn outputs(&self) -> &[TensorSpec] {
        self.inner.outputs()
    }

    fn run(&mut self, inputs: NamedTensors) -> Result<NamedTensors> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if call == self.fail_on {
            return Err(TtsError::Inference(format!(
                "{} failed on call {}",
                self.inner.name(),
                call
            )));
        }
        self.inner.run(inputs)
    }
}

/// Byte-level tokenizer over the prepared text.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockTokenizer;

impl TextTokenizer for MockTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i64>> {
        Ok(prepare_text(text)?.bytes().map(i64::from).collect())
    }

    fn vocab_size(&self) -> usize {
        256
    }
}

/// Handles onto the logs of a mock engine's units.
#[derive(Clone)]
pub struct MockProbes {
    pub main: MainScript,
    pub encoder: EncoderCalls,
    pub decoder_chunks: Log<Vec<usize>>,
}

/// Mock units wired like the real model set.
///
/// The flow velocity follows the main step's conditioning, so different
/// sessions produce different but reproducible latents.
pub fn mock_units(eos_at: Option<usize>) -> (EngineUnits, MockProbes) {
    let main = MainScript::new();
    let encoder = MockEncoder::new();
    let decoder = MockDecoder::new();
    let probes = MockProbes {
        main: main.clone(),
        encoder: encoder.calls(),
        decoder_chunks: decoder.chunk_sizes(),
    };
    let units = EngineUnits {
        voice_encoder: Some(Box::new(encoder)),
        text_conditioner: Box::new(MockTextConditioner::new(EMBEDDING_DIM)),
        flow_main: Box::new(MockMain::new(main, eos_at)),
        flow_net: Box::new(MockFlow::following_conditioning()),
        decoder: Box::new(decoder),
    };
    (units, probes)
}

/// Engine over [`mock_units`] and [`MockTokenizer`].
pub fn mock_engine(config: EngineConfig, eos_at: Option<usize>) -> Result<(TtsEngine, MockProbes)> {
    let (units, probes) = mock_units(eos_at);
    let engine = TtsEngine::from_parts(config, units, Box::new(MockTokenizer))?;
    Ok((engine, probes))
}
