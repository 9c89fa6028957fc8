//! Autoregressive frame generation and its stopping policy

use crate::config::{EMBEDDING_DIM, EOS_THRESHOLD};
use crate::error::Result;
use crate::models::flow_lm::{FlowLmMain, FlowNet, FlowSchedule, LatentFrame, NoiseSampler};
use crate::state::UnitState;
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag that stops a streaming session at the next frame boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// EOS was seen and the grace frames are done
    Eos,
    /// `max_frames` frames were generated without EOS
    MaxFrames,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameStep {
    Frame(LatentFrame),
    Stopped(StopReason),
}

/// Frame budget for one session.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub max_frames: usize,
    pub frames_after_eos: usize,
}

impl StopPolicy {
    /// Frames after the EOS step at which generation stops.
    ///
    /// The EOS frame itself is always generated, so a zero grace window
    /// still yields it.
    fn grace(&self) -> usize {
        self.frames_after_eos.max(1)
    }

    fn should_stop(&self, frame: usize, eos_step: Option<usize>) -> bool {
        matches!(eos_step, Some(eos) if frame >= eos + self.grace())
    }
}

/// One generation session, stepped one frame at a time.
///
/// The main step's state is owned here and dropped with the generator.
pub struct FrameGenerator<'a> {
    main: &'a mut FlowLmMain,
    flow: &'a mut FlowNet,
    schedule: &'a FlowSchedule,
    noise: &'a mut NoiseSampler,
    state: UnitState,
    empty_text: Tensor,
    previous: LatentFrame,
    frame: usize,
    eos_step: Option<usize>,
    policy: StopPolicy,
    cancel: Option<CancelHandle>,
    stopped: Option<StopReason>,
}

impl<'a> FrameGenerator<'a> {
    /// `state` must already be primed with voice and text.
    pub fn new(
        main: &'a mut FlowLmMain,
        flow: &'a mut FlowNet,
        schedule: &'a FlowSchedule,
        noise: &'a mut NoiseSampler,
        state: UnitState,
        policy: StopPolicy,
    ) -> Result<Self> {
        let empty_text = Tensor::zeros((1, 0, EMBEDDING_DIM), DType::F32, &Device::Cpu)?;
        Ok(Self {
            main,
            flow,
            schedule,
            noise,
            state,
            empty_text,
            previous: LatentFrame::bootstrap(),
            frame: 0,
            eos_step: None,
            policy,
            cancel: None,
            stopped: None,
        })
    }

    /// Poll `cancel` before every frame.
    pub fn with_cancellation(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Frames produced so far.
    pub fn frames_generated(&self) -> usize {
        self.frame
    }

    /// Frame at which the EOS logit first crossed the threshold.
    pub fn eos_step(&self) -> Option<usize> {
        self.eos_step
    }

    fn stop(&mut self, reason: StopReason) -> FrameStep {
        tracing::debug!("generation stopped after {} frames: {:?}", self.frame, reason);
        self.stopped = Some(reason);
        FrameStep::Stopped(reason)
    }

    /// Advance by one frame.
    ///
    /// Once stopped, every later call returns the same stop reason without
    /// touching any unit.
    pub fn step(&mut self) -> Result<FrameStep> {
        if let Some(reason) = self.stopped {
            return Ok(FrameStep::Stopped(reason));
        }
        if self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled) {
            return Ok(self.stop(StopReason::Cancelled));
        }
        if self.frame >= self.policy.max_frames {
            return Ok(self.stop(StopReason::MaxFrames));
        }

        let sequence = self.previous.to_sequence()?;
        let (out, state) = self.main.step(&sequence, &self.empty_text, &self.state)?;
        self.state = state;

        if out.eos_logit > EOS_THRESHOLD && self.eos_step.is_none() {
            tracing::debug!("EOS at frame {} (logit {:.3})", self.frame, out.eos_logit);
            self.eos_step = Some(self.frame);
        }
        if self.policy.should_stop(self.frame, self.eos_step) {
            return Ok(self.stop(StopReason::Eos));
        }

        let x_0 = self.noise.sample();
        let latent = self.flow.integrate(&out.conditioning, self.schedule, x_0)?;
        tracing::trace!("frame {}: eos_logit {:.3}", self.frame, out.eos_logit);

        self.previous = latent;
        self.frame += 1;
        Ok(FrameStep::Frame(latent))
    }

    /// Run to completion, returning every frame.
    pub fn run(mut self) -> Result<(Vec<LatentFrame>, StopReason)> {
        let mut frames = Vec::new();
        loop {
            match self.step()? {
                FrameStep::Frame(f) => frames.push(f),
                FrameStep::Stopped(reason) => return Ok((frames, reason)),
            }
        }
    }
}
