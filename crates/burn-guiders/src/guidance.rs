//! Classifier-Free Guidance utilities
//!
//! Tensor math shared by the guiders: the CFG blend, the perpendicular-negative
//! blend, cosine similarity between branch predictions, and the
//! zero-conditioning override used on the bypass path.

use std::sync::Arc;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::{CfgArgs, CfgFunction};
use crate::error::GuidanceError;

/// Lower bound on vector norms in cosine similarity
pub const COSINE_EPS: f32 = 1e-8;

/// How branch predictions are reduced to a single similarity score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimilarityMode {
    /// Flatten the whole batch into one vector per branch
    #[default]
    Global,
    /// Score each batch item separately and report the least similar one
    PerSampleMin,
}

/// Read a tensor back to the host as `f32` values
pub(crate) fn to_f32_vec<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, GuidanceError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| GuidanceError::TensorData(format!("{e:?}")))
}

/// First element of a tensor as `f32`
///
/// Timesteps arrive as `[batch]` tensors that all carry the same value,
/// so the first element is the step's timestep.
pub fn first_scalar<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<f32, GuidanceError> {
    to_f32_vec(tensor)?
        .first()
        .copied()
        .ok_or(GuidanceError::EmptyTensor)
}

fn check_same_shape<B: Backend, const D: usize>(
    context: &'static str,
    a: &Tensor<B, D>,
    b: &Tensor<B, D>,
) -> Result<(), GuidanceError> {
    let (da, db) = (a.dims(), b.dims());
    if da != db {
        return Err(GuidanceError::ShapeMismatch {
            context,
            expected: da.to_vec(),
            actual: db.to_vec(),
        });
    }
    Ok(())
}

/// Compute standard deviation of a tensor
///
/// Unbiased estimate over all elements, regardless of rank.
pub fn compute_tensor_std<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
) -> Result<f32, GuidanceError> {
    let flattened = tensor.clone().flatten::<1>(0, D - 1);
    let std_tensor = flattened.var(0).sqrt();
    first_scalar(std_tensor)
}

/// Standard classifier-free guidance
///
/// `uncond + scale * (cond - uncond)`. A scale of exactly 1.0 returns the
/// conditional prediction untouched.
pub fn apply_cfg<B: Backend>(
    noise_pred_uncond: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    guidance_scale: f32,
) -> Tensor<B, 4> {
    if guidance_scale == 1.0 {
        return noise_pred_cond;
    }
    noise_pred_uncond.clone() + (noise_pred_cond - noise_pred_uncond) * guidance_scale
}

/// Cosine similarity between two branch predictions
pub fn cosine_similarity<B: Backend>(
    a: &Tensor<B, 4>,
    b: &Tensor<B, 4>,
    mode: SimilarityMode,
) -> Result<f32, GuidanceError> {
    check_same_shape("cosine similarity", a, b)?;

    match mode {
        SimilarityMode::Global => {
            let a = a.clone().flatten::<1>(0, 3);
            let b = b.clone().flatten::<1>(0, 3);

            let dot = first_scalar((a.clone() * b.clone()).sum())?;
            let norm_a = first_scalar((a.clone() * a).sum().sqrt())?;
            let norm_b = first_scalar((b.clone() * b).sum().sqrt())?;

            Ok(dot / (norm_a.max(COSINE_EPS) * norm_b.max(COSINE_EPS)))
        }
        SimilarityMode::PerSampleMin => {
            let [batch, channels, height, width] = a.dims();
            if batch == 0 {
                return Err(GuidanceError::EmptyTensor);
            }
            let features = channels * height * width;
            let a = a.clone().reshape([batch, features]);
            let b = b.clone().reshape([batch, features]);

            let dot = (a.clone() * b.clone()).sum_dim(1);
            let norm_a = (a.clone() * a).sum_dim(1).sqrt().clamp_min(COSINE_EPS);
            let norm_b = (b.clone() * b).sum_dim(1).sqrt().clamp_min(COSINE_EPS);

            let per_sample = to_f32_vec(dot / (norm_a * norm_b))?;
            Ok(per_sample.into_iter().fold(f32::INFINITY, f32::min))
        }
    }
}

/// Perpendicular-negative guidance
///
/// Both the positive and negative predictions are taken relative to the
/// neutral (empty prompt) prediction. The component of the negative direction
/// parallel to the positive one is projected out before blending, so the
/// negative prompt cannot cancel the positive one.
pub fn perp_neg<B: Backend>(
    noise_pred_empty: Tensor<B, 4>,
    noise_pred_cond: Tensor<B, 4>,
    noise_pred_uncond: Tensor<B, 4>,
    neg_scale: f32,
    guidance_scale: f32,
) -> Result<Tensor<B, 4>, GuidanceError> {
    check_same_shape("perp-neg", &noise_pred_empty, &noise_pred_cond)?;
    check_same_shape("perp-neg", &noise_pred_empty, &noise_pred_uncond)?;

    let pos = noise_pred_cond - noise_pred_empty.clone();
    let neg = noise_pred_uncond - noise_pred_empty.clone();

    let dot = first_scalar((neg.clone() * pos.clone()).sum())?;
    let norm_sq = first_scalar((pos.clone() * pos.clone()).sum())?;

    // A zero positive direction has nothing to project onto
    let perp = if norm_sq > 0.0 {
        neg - pos.clone() * (dot / norm_sq)
    } else {
        neg
    };

    Ok(noise_pred_empty + (pos - perp * neg_scale) * guidance_scale)
}

fn center<B: Backend>(tensor: Tensor<B, 4>) -> Result<Tensor<B, 4>, GuidanceError> {
    let mean = first_scalar(tensor.clone().mean())?;
    Ok(tensor - mean)
}

/// Zero-conditioning correction for the bypass path
///
/// Centres the sample and the conditional prediction on their means and
/// returns `x - cond / sqrt(std(cond)) * scale`. The result is the final
/// prediction for the step, not a term the host subtracts from `x`.
pub fn zero_cond<B: Backend>(
    cond_denoised: Tensor<B, 4>,
    input: Tensor<B, 4>,
    scale: f32,
) -> Result<Tensor<B, 4>, GuidanceError> {
    check_same_shape("zero-cond", &input, &cond_denoised)?;

    let x = center(input)?;
    let cond = center(cond_denoised)?;
    let std = compute_tensor_std(&cond)?;

    Ok(x - cond / std.sqrt() * scale)
}

/// Wrap [`zero_cond`] as a step-scoped CFG override
pub fn zero_cond_function<B: Backend>(scale: f32) -> CfgFunction<B> {
    Arc::new(move |args: CfgArgs<B>| zero_cond(args.cond_denoised, args.input, scale))
}
