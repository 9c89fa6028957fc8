//! Flow LM: the recurrent main step and the flow-matching velocity step

use crate::config::LATENT_DIM;
use crate::error::{Result, TtsError};
use crate::state::{StatefulUnit, UnitState};
use crate::unit::{TensorUnit, first_f32, take_output, to_f32_vec};
use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// One 32-wide latent frame (80 ms of audio once decoded).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatentFrame(pub [f32; LATENT_DIM]);

impl LatentFrame {
    pub fn zeros() -> Self {
        Self([0.0; LATENT_DIM])
    }

    /// "No previous frame" marker fed to the first generation step.
    pub fn bootstrap() -> Self {
        Self([f32::NAN; LATENT_DIM])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// As a `[1, 1, 32]` sequence input.
    pub fn to_sequence(&self) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.0, (1, 1, LATENT_DIM), &Device::Cpu)?)
    }

    fn from_tensor(t: &Tensor, what: &str) -> Result<Self> {
        let v = to_f32_vec(t)?;
        let arr: [f32; LATENT_DIM] = v.as_slice().try_into().map_err(|_| {
            TtsError::Inference(format!(
                "{} has {} values, expected {}",
                what,
                v.len(),
                LATENT_DIM
            ))
        })?;
        Ok(Self(arr))
    }
}

/// Stack frames into a `[1, n, 32]` tensor.
pub fn stack_frames(frames: &[LatentFrame]) -> Result<Tensor> {
    let data: Vec<f32> = frames.iter().flat_map(|f| f.0).collect();
    Ok(Tensor::from_vec(
        data,
        (1, frames.len(), LATENT_DIM),
        &Device::Cpu,
    )?)
}

/// Non-state outputs of one main step.
#[derive(Debug, Clone)]
pub struct MainOutput {
    pub conditioning: Tensor,
    pub eos_logit: f32,
}

/// Main recurrent step.
///
/// Inputs `sequence` `[1, S, 32]` and `text_embeddings` `[1, T, D]` plus
/// carried state; the first two plain outputs are the conditioning vector
/// and the EOS logit.
pub struct FlowLmMain {
    unit: StatefulUnit,
}

impl FlowLmMain {
    pub fn new(unit: Box<dyn TensorUnit>) -> Result<Self> {
        Ok(Self {
            unit: StatefulUnit::new(unit)?,
        })
    }

    pub fn init_state(&self) -> Result<UnitState> {
        self.unit.init_state()
    }

    pub fn step(
        &mut self,
        sequence: &Tensor,
        text_embeddings: &Tensor,
        state: &UnitState,
    ) -> Result<(MainOutput, UnitState)> {
        let inputs = vec![
            ("sequence".to_string(), sequence.clone()),
            ("text_embeddings".to_string(), text_embeddings.clone()),
        ];
        let (outputs, state) = self.unit.apply(inputs, state)?;
        let mut outputs = outputs.into_iter();
        let (Some((_, conditioning)), Some((_, eos))) = (outputs.next(), outputs.next()) else {
            return Err(TtsError::Inference(format!(
                "{} must return conditioning and eos_logit",
                self.unit.name()
            )));
        };
        let eos_logit = first_f32(&eos, "eos_logit")?;
        Ok((
            MainOutput {
                conditioning,
                eos_logit,
            },
            state,
        ))
    }
}

/// Euler time grid for one frame, fixed by the step count.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSchedule {
    pairs: Vec<(f32, f32)>,
    dt: f32,
}

impl FlowSchedule {
    /// `steps` pairs with `s = j / steps` and `t = s + 1 / steps`.
    pub fn new(steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(TtsError::Input("lsd_steps must be at least 1".into()));
        }
        let dt = 1.0 / steps as f32;
        let pairs = (0..steps)
            .map(|j| {
                let s = j as f32 / steps as f32;
                (s, s + dt)
            })
            .collect();
        Ok(Self { pairs, dt })
    }

    pub fn steps(&self) -> usize {
        self.pairs.len()
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn pairs(&self) -> &[(f32, f32)] {
        &self.pairs
    }
}

/// Initial noise for flow integration.
pub struct NoiseSampler {
    rng: StdRng,
    dist: Option<Normal<f32>>,
    clamp: Option<f32>,
}

impl NoiseSampler {
    /// Normal noise with variance `temperature`. A non-positive temperature
    /// yields all-zero frames.
    pub fn new(temperature: f32, clamp: Option<f32>, seed: Option<u64>) -> Result<Self> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let dist = if temperature > 0.0 {
            Some(
                Normal::new(0.0f32, temperature.sqrt())
                    .map_err(|e| TtsError::Input(format!("invalid temperature: {}", e)))?,
            )
        } else {
            None
        };
        Ok(Self { rng, dist, clamp })
    }

    pub fn sample(&mut self) -> LatentFrame {
        let Some(dist) = &self.dist else {
            return LatentFrame::zeros();
        };
        let mut frame = [0.0f32; LATENT_DIM];
        for v in frame.iter_mut() {
            *v = match self.clamp {
                None => dist.sample(&mut self.rng),
                // Rejection sampling for truncated normal
                Some(limit) => loop {
                    let x = dist.sample(&mut self.rng);
                    if x.abs() <= limit {
                        break x;
                    }
                },
            };
        }
        LatentFrame(frame)
    }
}

/// Flow velocity step: `(c, s, t, x) -> flow_dir`.
pub struct FlowNet {
    unit: Box<dyn TensorUnit>,
}

impl FlowNet {
    pub fn new(unit: Box<dyn TensorUnit>) -> Self {
        Self { unit }
    }

    /// Integrate from `x_0` over the schedule with explicit Euler steps.
    pub fn integrate(
        &mut self,
        conditioning: &Tensor,
        schedule: &FlowSchedule,
        x_0: LatentFrame,
    ) -> Result<LatentFrame> {
        let c = conditioning.reshape((1, conditioning.elem_count()))?;
        let mut current = Tensor::from_slice(&x_0.0, (1, LATENT_DIM), &Device::Cpu)?;
        let step_factor = schedule.dt() as f64;

        for &(s, t) in schedule.pairs() {
            let inputs = vec![
                ("c".to_string(), c.clone()),
                ("s".to_string(), scalar_input(s)?),
                ("t".to_string(), scalar_input(t)?),
                ("x".to_string(), current.clone()),
            ];
            let mut outputs = self.unit.run(inputs)?;
            let flow_dir = take_output(&mut outputs, self.unit.name(), "flow_dir")?
                .to_dtype(DType::F32)?
                .reshape((1, LATENT_DIM))?;
            current = (current + flow_dir.affine(step_factor, 0.0)?)?;
        }

        LatentFrame::from_tensor(&current, "flow output")
    }
}

fn scalar_input(v: f32) -> Result<Tensor> {
    Ok(Tensor::from_slice(&[v], (1, 1), &Device::Cpu)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFlow;

    #[test]
    fn test_schedule_pairs() -> Result<()> {
        let sched = FlowSchedule::new(4)?;
        assert_eq!(sched.steps(), 4);
        assert_eq!(sched.dt(), 0.25);
        assert_eq!(
            sched.pairs(),
            &[(0.0, 0.25), (0.25, 0.5), (0.5, 0.75), (0.75, 1.0)]
        );
        assert!(FlowSchedule::new(0).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_temperature_noise() -> Result<()> {
        let mut sampler = NoiseSampler::new(0.0, None, None)?;
        assert_eq!(sampler.sample(), LatentFrame::zeros());
        Ok(())
    }

    #[test]
    fn test_seeded_noise_is_reproducible() -> Result<()> {
        let mut a = NoiseSampler::new(0.7, None, Some(42))?;
        let mut b = NoiseSampler::new(0.7, None, Some(42))?;
        assert_eq!(a.sample(), b.sample());
        assert_ne!(a.sample(), LatentFrame::zeros());
        Ok(())
    }

    #[test]
    fn test_clamped_noise_stays_in_range() -> Result<()> {
        let mut sampler = NoiseSampler::new(4.0, Some(0.5), Some(1))?;
        for _ in 0..20 {
            assert!(sampler.sample().0.iter().all(|v| v.abs() <= 0.5));
        }
        Ok(())
    }

    #[test]
    fn test_euler_integration_of_constant_field() -> Result<()> {
        // Velocity is always 1.0, so x(1) = x(0) + 1
        let mut flow = FlowNet::new(Box::new(MockFlow::constant(1.0)));
        let sched = FlowSchedule::new(8)?;
        let cond = Tensor::zeros((1, 1, 16), DType::F32, &Device::Cpu)?;

        let out = flow.integrate(&cond, &sched, LatentFrame([0.5; LATENT_DIM]))?;
        for v in out.0 {
            assert!((v - 1.5).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_integration_sees_every_time_pair() -> Result<()> {
        let mock = MockFlow::constant(0.0);
        let seen = mock.seen_times();
        let mut flow = FlowNet::new(Box::new(mock));
        let sched = FlowSchedule::new(3)?;
        let cond = Tensor::zeros((1, 16), DType::F32, &Device::Cpu)?;

        flow.integrate(&cond, &sched, LatentFrame::zeros())?;
        assert_eq!(seen.get(), sched.pairs().to_vec());
        Ok(())
    }
}
