//! burn-guiders: adaptive classifier-free guidance for Burn
//!
//! Guiders decide, once per sampling step, how the conditional and
//! unconditional model predictions are combined. [`AdaptiveGuider`] runs full
//! CFG until the two branches become nearly parallel (cosine similarity above
//! a threshold), then locks into a single CFG-1.0 evaluation for the rest of
//! the schedule, roughly halving the cost of the remaining steps.
//!
//! # Example
//!
//! ```ignore
//! use burn_guiders::{AdaptiveGuidanceConfig, AdaptiveGuider, DenoiserBackend, StepOptions};
//!
//! let guider = AdaptiveGuider::new(
//!     DenoiserBackend::new(unet),
//!     positive,
//!     negative,
//!     AdaptiveGuidanceConfig::default(),
//! );
//!
//! let mut state = guider.start();
//! for t in timesteps {
//!     let noise_pred = guider.predict_noise(&mut state, &latent, &t, &StepOptions::default())?;
//!     latent = sampler.step(latent, noise_pred, t);
//! }
//! ```

pub mod adaptive;
pub mod backend;
pub mod error;
pub mod guidance;
pub mod nodes;
pub mod state;

pub use adaptive::{AdaptiveGuidanceConfig, AdaptiveGuider, GuidanceVariant, PerpNegConfig};
pub use backend::{
    expect_predictions, CfgArgs, CfgFunction, Conditioning, Denoiser, DenoiserBackend,
    GuidanceBackend, StepOptions,
};
pub use error::{ConfigError, GuidanceError};
pub use guidance::{
    apply_cfg, compute_tensor_std, cosine_similarity, perp_neg, zero_cond, zero_cond_function,
    SimilarityMode,
};
pub use nodes::{
    node_registrations, AdaptiveGuidanceNode, GuiderNode, NodeRegistration, NodeSchema,
    PerpNegAdaptiveGuidanceNode,
};
pub use state::{GuidancePhase, GuidanceState, StepPath};
