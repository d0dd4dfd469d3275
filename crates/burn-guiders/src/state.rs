//! Per-run guidance state

/// Whether full CFG is currently allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidancePhase {
    /// Full CFG runs and the similarity check is live
    Armed,
    /// Locked to the cheap path
    Tripped,
}

/// Which evaluation a step used
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepPath {
    /// Single evaluation at CFG weight 1.0
    Bypass,
    /// Batched evaluation of every branch, blended with the configured scale
    Full {
        /// Cosine similarity between the branches, if it was measured
        similarity: Option<f32>,
    },
}

/// Mutable state of one sampling run
///
/// Create one per run and pass it to every
/// [`AdaptiveGuider::predict_noise`](crate::AdaptiveGuider::predict_noise)
/// call of that run. Never share it between runs.
#[derive(Debug, Clone, Default)]
pub struct GuidanceState {
    current_step: usize,
    threshold_timestep: Option<f32>,
    last_path: Option<StepPath>,
}

impl GuidanceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of prediction calls made so far
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Timestep at which the similarity trip last fired
    pub fn threshold_timestep(&self) -> Option<f32> {
        self.threshold_timestep
    }

    /// Path taken by the most recent step
    pub fn last_path(&self) -> Option<StepPath> {
        self.last_path
    }

    /// Phase for a step at `timestep`, ignoring the initial disabled window
    ///
    /// Only timesteps strictly below the trip timestep are locked out. A
    /// repeated timestep, as second-order samplers produce, runs full CFG and
    /// checks similarity again.
    pub fn phase(&self, timestep: f32) -> GuidancePhase {
        match self.threshold_timestep {
            Some(trip) if trip > timestep => GuidancePhase::Tripped,
            _ => GuidancePhase::Armed,
        }
    }

    /// Advance to the next step and decide whether it bypasses full CFG
    pub(crate) fn begin_step(&mut self, timestep: f32, initial_disabled_steps: usize) -> bool {
        self.current_step += 1;
        self.current_step <= initial_disabled_steps
            || self.phase(timestep) == GuidancePhase::Tripped
    }

    pub(crate) fn rearm(&mut self) {
        self.threshold_timestep = None;
    }

    pub(crate) fn trip(&mut self, timestep: f32) {
        self.threshold_timestep = Some(timestep);
    }

    pub(crate) fn record(&mut self, path: StepPath) {
        self.last_path = Some(path);
    }
}
