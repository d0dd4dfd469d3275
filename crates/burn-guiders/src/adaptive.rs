//! Adaptive guidance
//!
//! Runs full classifier-free guidance until the conditional and
//! unconditional predictions become nearly parallel, then drops to a single
//! CFG-1.0 evaluation for the rest of the schedule. Late in sampling the two
//! branches agree closely, so the second model evaluation buys almost
//! nothing.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Conditioning, GuidanceBackend, StepOptions};
use crate::error::{ConfigError, GuidanceError};
use crate::guidance::{
    cosine_similarity, first_scalar, perp_neg, zero_cond_function, SimilarityMode,
};
use crate::nodes;
use crate::state::{GuidanceState, StepPath};

/// Configuration for adaptive guidance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveGuidanceConfig {
    /// CFG scale for full-guidance steps
    pub cfg: f32,
    /// Cosine similarity at which CFG is switched off (>= 1.0 disables the check)
    pub threshold: f32,
    /// Number of leading steps that always bypass CFG
    pub initial_disabled_steps: usize,
    /// Strength of the zero-conditioning correction on bypassed steps (0.0 = off)
    pub uncond_zero_scale: f32,
    /// How batched predictions are reduced to one similarity score
    pub similarity: SimilarityMode,
}

impl Default for AdaptiveGuidanceConfig {
    fn default() -> Self {
        Self {
            cfg: 8.0,
            threshold: 0.99,
            initial_disabled_steps: 0,
            uncond_zero_scale: 0.0,
            similarity: SimilarityMode::Global,
        }
    }
}

impl AdaptiveGuidanceConfig {
    /// Check every field against the node input ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        nodes::CFG.check_f32(self.cfg)?;
        nodes::THRESHOLD.check_f32(self.threshold)?;
        nodes::INITIAL_DISABLED_STEPS.check_count(self.initial_disabled_steps)?;
        nodes::UNCOND_ZERO_SCALE.check_f32(self.uncond_zero_scale)?;
        Ok(())
    }
}

/// Extra configuration for the perpendicular-negative variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerpNegConfig {
    /// Weight of the perpendicular negative component
    pub neg_scale: f32,
}

impl Default for PerpNegConfig {
    fn default() -> Self {
        Self { neg_scale: 1.0 }
    }
}

impl PerpNegConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        nodes::NEG_SCALE.check_f32(self.neg_scale)
    }
}

/// How full-guidance steps combine the branch predictions
#[derive(Debug, Clone)]
pub enum GuidanceVariant<B: Backend> {
    /// `uncond + cfg * (cond - uncond)`
    Standard,
    /// Perpendicular-negative blend around a neutral prediction
    PerpNeg {
        empty: Conditioning<B>,
        neg_scale: f32,
    },
}

/// Guider that switches off CFG once the branches converge
///
/// The guider is immutable while sampling; everything that changes from step
/// to step lives in the [`GuidanceState`] passed to [`predict_noise`].
///
/// [`predict_noise`]: AdaptiveGuider::predict_noise
pub struct AdaptiveGuider<B: Backend, G> {
    backend: G,
    positive: Conditioning<B>,
    negative: Conditioning<B>,
    variant: GuidanceVariant<B>,
    config: AdaptiveGuidanceConfig,
}

impl<B: Backend, G: GuidanceBackend<B>> AdaptiveGuider<B, G> {
    /// Create a guider with the standard CFG blend
    pub fn new(
        backend: G,
        positive: Conditioning<B>,
        negative: Conditioning<B>,
        config: AdaptiveGuidanceConfig,
    ) -> Self {
        Self {
            backend,
            positive,
            negative,
            variant: GuidanceVariant::Standard,
            config,
        }
    }

    /// Create a guider with the perpendicular-negative blend
    pub fn perp_neg(
        backend: G,
        positive: Conditioning<B>,
        negative: Conditioning<B>,
        empty: Conditioning<B>,
        config: AdaptiveGuidanceConfig,
        perp_neg: PerpNegConfig,
    ) -> Self {
        Self {
            backend,
            positive,
            negative,
            variant: GuidanceVariant::PerpNeg {
                empty,
                neg_scale: perp_neg.neg_scale,
            },
            config,
        }
    }

    pub fn config(&self) -> &AdaptiveGuidanceConfig {
        &self.config
    }

    pub fn variant(&self) -> &GuidanceVariant<B> {
        &self.variant
    }

    pub fn backend(&self) -> &G {
        &self.backend
    }

    /// Fresh state for a new sampling run
    pub fn start(&self) -> GuidanceState {
        GuidanceState::new()
    }

    /// Predict the guided noise for one sampling step
    ///
    /// Must be called exactly once per step, in schedule order, with the
    /// state belonging to the current run.
    pub fn predict_noise(
        &self,
        state: &mut GuidanceState,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        options: &StepOptions<B>,
    ) -> Result<Tensor<B, 4>, GuidanceError> {
        let ts = first_scalar(timestep.clone())?;

        if state.begin_step(ts, self.config.initial_disabled_steps) {
            debug!(step = state.current_step(), timestep = ts, "CFG bypassed");
            let prediction = self.predict_bypass(x, timestep, options)?;
            state.record(StepPath::Bypass);
            return Ok(prediction);
        }

        state.rearm();

        let (uncond_pred, cond_pred, empty_pred) = match &self.variant {
            GuidanceVariant::Standard => {
                let (uncond, cond) = self.backend.evaluate_dual(
                    x,
                    timestep,
                    &self.positive,
                    &self.negative,
                    options,
                )?;
                (uncond, cond, None)
            }
            GuidanceVariant::PerpNeg { empty, .. } => {
                let predictions = self.backend.evaluate_batch(
                    x,
                    timestep,
                    &[&self.negative, &self.positive, empty],
                    options,
                )?;
                let [uncond, cond, empty] = crate::backend::expect_predictions(predictions)?;
                (uncond, cond, Some(empty))
            }
        };

        let similarity = if self.config.threshold < 1.0 {
            let similarity = cosine_similarity(&cond_pred, &uncond_pred, self.config.similarity)?;
            if similarity >= self.config.threshold {
                info!(
                    step = state.current_step(),
                    timestep = ts,
                    "AdaptiveGuidance: Cosine similarity {similarity:.4} exceeds threshold, setting CFG to 1.0"
                );
                state.trip(ts);
            }
            Some(similarity)
        } else {
            None
        };

        debug!(step = state.current_step(), timestep = ts, ?similarity, "full CFG");

        let prediction = match (&self.variant, empty_pred) {
            (GuidanceVariant::PerpNeg { neg_scale, .. }, Some(empty_pred)) => perp_neg(
                empty_pred,
                cond_pred,
                uncond_pred,
                *neg_scale,
                self.config.cfg,
            )?,
            _ => self.backend.blend_cfg(
                cond_pred,
                uncond_pred,
                self.config.cfg,
                x,
                timestep,
                options,
            )?,
        };

        state.record(StepPath::Full { similarity });
        Ok(prediction)
    }

    fn predict_bypass(
        &self,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        options: &StepOptions<B>,
    ) -> Result<Tensor<B, 4>, GuidanceError> {
        let options = if self.config.uncond_zero_scale > 0.0 {
            options.with_cfg_function(zero_cond_function(self.config.uncond_zero_scale))
        } else {
            options.clone()
        };

        self.backend
            .evaluate_single(x, timestep, &self.positive, &self.negative, 1.0, &options)
    }
}
