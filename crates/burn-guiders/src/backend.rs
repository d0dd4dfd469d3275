//! Model evaluation interface used by the guiders
//!
//! A guider never calls a model directly. It asks a [`GuidanceBackend`] to
//! evaluate one or more conditionings against the current sample, and to
//! blend the resulting predictions. [`DenoiserBackend`] provides the batched
//! evaluation for any [`Denoiser`] (UNet, DiT, ...).

use std::fmt;
use std::sync::Arc;

use burn::prelude::*;

use crate::error::GuidanceError;
use crate::guidance::apply_cfg;

/// Encoded prompt fed to the denoiser as cross-attention context
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Context tensor `[batch, tokens, dim]`
    pub context: Tensor<B, 3>,
}

impl<B: Backend> Conditioning<B> {
    pub fn new(context: Tensor<B, 3>) -> Self {
        Self { context }
    }
}

/// Inputs handed to a CFG override
pub struct CfgArgs<B: Backend> {
    pub cond_denoised: Tensor<B, 4>,
    pub uncond_denoised: Tensor<B, 4>,
    pub input: Tensor<B, 4>,
    pub timestep: Tensor<B, 1>,
    pub cond_scale: f32,
}

/// Replaces the CFG blend for the steps it is installed on
///
/// The return value is the step's final noise prediction. It is not
/// subtracted from `input` afterwards, so an override written for hosts that
/// compute `x - f(args)` must return `x - f(args)` itself.
pub type CfgFunction<B> =
    Arc<dyn Fn(CfgArgs<B>) -> Result<Tensor<B, 4>, GuidanceError> + Send + Sync>;

/// Per-step options, applied identically to every branch
#[derive(Clone)]
pub struct StepOptions<B: Backend> {
    /// Override for the CFG blend
    pub cfg_function: Option<CfgFunction<B>>,
    /// Evaluate the unconditional branch even when the CFG weight is 1.0
    pub disable_cfg1_optimization: bool,
}

impl<B: Backend> Default for StepOptions<B> {
    fn default() -> Self {
        Self {
            cfg_function: None,
            disable_cfg1_optimization: false,
        }
    }
}

impl<B: Backend> fmt::Debug for StepOptions<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOptions")
            .field("cfg_function", &self.cfg_function.as_ref().map(|_| "<fn>"))
            .field("disable_cfg1_optimization", &self.disable_cfg1_optimization)
            .finish()
    }
}

impl<B: Backend> StepOptions<B> {
    /// Copy of these options with a CFG override installed
    pub fn with_cfg_function(&self, cfg_function: CfgFunction<B>) -> Self {
        Self {
            cfg_function: Some(cfg_function),
            ..self.clone()
        }
    }
}

/// Split a batch of predictions into exactly `N` tensors
pub fn expect_predictions<B: Backend, const N: usize>(
    predictions: Vec<Tensor<B, 4>>,
) -> Result<[Tensor<B, 4>; N], GuidanceError> {
    predictions
        .try_into()
        .map_err(|rest: Vec<Tensor<B, 4>>| GuidanceError::PredictionCount {
            expected: N,
            actual: rest.len(),
        })
}

/// Evaluation primitives a guider needs from the sampling host
pub trait GuidanceBackend<B: Backend> {
    /// Evaluate the model for each conditioning in a single batched call
    ///
    /// Returns one prediction per conditioning, in order.
    fn evaluate_batch(
        &self,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        conds: &[&Conditioning<B>],
        options: &StepOptions<B>,
    ) -> Result<Vec<Tensor<B, 4>>, GuidanceError>;

    /// Evaluate negative and positive together, returning `(uncond, cond)`
    fn evaluate_dual(
        &self,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        positive: &Conditioning<B>,
        negative: &Conditioning<B>,
        options: &StepOptions<B>,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>), GuidanceError> {
        let predictions = self.evaluate_batch(x, timestep, &[negative, positive], options)?;
        let [uncond, cond] = expect_predictions(predictions)?;
        Ok((uncond, cond))
    }

    /// Combine branch predictions, honouring any installed override
    fn blend_cfg(
        &self,
        cond_pred: Tensor<B, 4>,
        uncond_pred: Tensor<B, 4>,
        cfg_scale: f32,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        options: &StepOptions<B>,
    ) -> Result<Tensor<B, 4>, GuidanceError> {
        match &options.cfg_function {
            Some(cfg_function) => cfg_function(CfgArgs {
                cond_denoised: cond_pred,
                uncond_denoised: uncond_pred,
                input: x.clone(),
                timestep: timestep.clone(),
                cond_scale: cfg_scale,
            }),
            None => Ok(apply_cfg(uncond_pred, cond_pred, cfg_scale)),
        }
    }

    /// Full guided prediction with an explicit CFG weight
    ///
    /// At weight 1.0 the unconditional branch cannot influence the blend, so
    /// only the positive conditioning is evaluated and the unconditional
    /// prediction is zero, unless `disable_cfg1_optimization` is set.
    fn evaluate_single(
        &self,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        positive: &Conditioning<B>,
        negative: &Conditioning<B>,
        cfg_weight: f32,
        options: &StepOptions<B>,
    ) -> Result<Tensor<B, 4>, GuidanceError> {
        let (uncond_pred, cond_pred) =
            if cfg_weight == 1.0 && !options.disable_cfg1_optimization {
                let [cond_pred] =
                    expect_predictions(self.evaluate_batch(x, timestep, &[positive], options)?)?;
                (cond_pred.zeros_like(), cond_pred)
            } else {
                self.evaluate_dual(x, timestep, positive, negative, options)?
            };

        self.blend_cfg(cond_pred, uncond_pred, cfg_weight, x, timestep, options)
    }
}

/// A noise-predicting model
///
/// Same shape contract as the UNet and DiT forward passes: latent
/// `[batch, channels, height, width]`, timestep `[batch]`, context
/// `[batch, tokens, dim]`.
pub trait Denoiser<B: Backend> {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
    ) -> Tensor<B, 4>;
}

/// [`GuidanceBackend`] over a plain [`Denoiser`]
///
/// All conditionings are stacked along the batch axis and run through one
/// forward pass. A length-1 timestep is repeated for every batch item.
#[derive(Debug, Clone)]
pub struct DenoiserBackend<M> {
    model: M,
}

impl<M> DenoiserBackend<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<B: Backend, M: Denoiser<B>> GuidanceBackend<B> for DenoiserBackend<M> {
    fn evaluate_batch(
        &self,
        x: &Tensor<B, 4>,
        timestep: &Tensor<B, 1>,
        conds: &[&Conditioning<B>],
        _options: &StepOptions<B>,
    ) -> Result<Vec<Tensor<B, 4>>, GuidanceError> {
        let first = conds.first().ok_or(GuidanceError::EmptyBatch)?;
        let [batch, ..] = x.dims();
        let [_, tokens, dim] = first.context.dims();

        for cond in conds {
            let dims = cond.context.dims();
            if dims != [batch, tokens, dim] {
                return Err(GuidanceError::ShapeMismatch {
                    context: "conditioning context",
                    expected: vec![batch, tokens, dim],
                    actual: dims.to_vec(),
                });
            }
        }

        let timestep = match timestep.dims() {
            [len] if len == batch => timestep.clone(),
            [1] => Tensor::cat(vec![timestep.clone(); batch], 0),
            dims => {
                return Err(GuidanceError::ShapeMismatch {
                    context: "timestep",
                    expected: vec![batch],
                    actual: dims.to_vec(),
                });
            }
        };

        let n = conds.len();
        let xs = Tensor::cat(vec![x.clone(); n], 0);
        let timesteps = Tensor::cat(vec![timestep; n], 0);
        let contexts = Tensor::cat(conds.iter().map(|c| c.context.clone()).collect(), 0);

        let out = self.model.forward(xs, timesteps, contexts);

        let expected = [n * batch, x.dims()[1], x.dims()[2], x.dims()[3]];
        if out.dims() != expected {
            return Err(GuidanceError::ShapeMismatch {
                context: "denoiser output",
                expected: expected.to_vec(),
                actual: out.dims().to_vec(),
            });
        }

        Ok(out.chunk(n, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Predicts `x + mean(context)` per batch item and counts forward calls
    struct ContextShift {
        calls: Cell<usize>,
    }

    impl Denoiser<TestBackend> for ContextShift {
        fn forward(
            &self,
            x: Tensor<TestBackend, 4>,
            _timestep: Tensor<TestBackend, 1>,
            context: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            self.calls.set(self.calls.get() + 1);
            let shift: Tensor<TestBackend, 4> = context.mean_dim(2).mean_dim(1).unsqueeze_dim(3);
            x + shift
        }
    }

    /// Predicts `x + t` per batch item, reshaping the timestep like a UNet embedding
    struct TimestepShift;

    impl Denoiser<TestBackend> for TimestepShift {
        fn forward(
            &self,
            x: Tensor<TestBackend, 4>,
            timestep: Tensor<TestBackend, 1>,
            _context: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            let [n, ..] = x.dims();
            x + timestep.reshape([n, 1, 1, 1])
        }
    }

    fn cond(value: f32, device: &<TestBackend as Backend>::Device) -> Conditioning<TestBackend> {
        Conditioning::new(Tensor::full([1, 3, 8], value, device))
    }

    fn backend() -> DenoiserBackend<ContextShift> {
        DenoiserBackend::new(ContextShift {
            calls: Cell::new(0),
        })
    }

    #[test]
    fn test_evaluate_dual_single_forward() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([999.0], &device);

        let (uncond, cond) = backend
            .evaluate_dual(&x, &t, &cond(2.0, &device), &cond(-1.0, &device), &StepOptions::default())
            .unwrap();

        assert_eq!(backend.model().calls.get(), 1);
        assert_eq!(uncond.dims(), [1, 4, 2, 2]);
        let uncond: Vec<f32> = uncond.into_data().to_vec().unwrap();
        let cond: Vec<f32> = cond.into_data().to_vec().unwrap();
        assert!(uncond.iter().all(|v| (v + 1.0).abs() < 1e-6));
        assert!(cond.iter().all(|v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_evaluate_single_cfg1_skips_uncond() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([500.0], &device);
        let (pos, neg) = (cond(3.0, &device), cond(7.0, &device));

        let out = backend
            .evaluate_single(&x, &t, &pos, &neg, 1.0, &StepOptions::default())
            .unwrap();

        let direct = backend
            .evaluate_batch(&x, &t, &[&pos], &StepOptions::default())
            .unwrap()
            .remove(0);
        let out: Vec<f32> = out.into_data().to_vec().unwrap();
        let direct: Vec<f32> = direct.into_data().to_vec().unwrap();
        assert_eq!(out, direct);
    }

    #[test]
    fn test_evaluate_single_cfg1_optimization_disabled() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([500.0], &device);
        let options = StepOptions {
            disable_cfg1_optimization: true,
            ..StepOptions::default()
        };
        let seen_uncond = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = seen_uncond.clone();
        let options = options.with_cfg_function(Arc::new(move |args: CfgArgs<TestBackend>| {
            let values: Vec<f32> = args.uncond_denoised.clone().into_data().to_vec().unwrap();
            recorder.lock().unwrap().extend(values);
            Ok::<_, GuidanceError>(args.cond_denoised)
        }));

        backend
            .evaluate_single(&x, &t, &cond(3.0, &device), &cond(7.0, &device), 1.0, &options)
            .unwrap();

        let seen = seen_uncond.lock().unwrap();
        assert!(seen.iter().all(|v| (v - 8.0).abs() < 1e-6));
    }

    #[test]
    fn test_mismatched_context_is_rejected() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0], &device);
        let short = Conditioning::new(Tensor::<TestBackend, 3>::zeros([1, 2, 8], &device));

        let err = backend
            .evaluate_dual(&x, &t, &cond(1.0, &device), &short, &StepOptions::default())
            .unwrap_err();

        assert!(matches!(err, GuidanceError::ShapeMismatch { .. }));
        assert_eq!(backend.model().calls.get(), 0);
    }

    #[test]
    fn test_scalar_timestep_is_broadcast_over_batch() {
        let device = Default::default();
        let backend = DenoiserBackend::new(TimestepShift);
        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 1, 1], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([5.0], &device);
        let context = Conditioning::new(Tensor::<TestBackend, 3>::zeros([2, 3, 8], &device));

        let (uncond, cond) = backend
            .evaluate_dual(&x, &t, &context, &context, &StepOptions::default())
            .unwrap();

        assert_eq!(cond.dims(), [2, 1, 1, 1]);
        let uncond: Vec<f32> = uncond.into_data().to_vec().unwrap();
        let cond: Vec<f32> = cond.into_data().to_vec().unwrap();
        assert_eq!(uncond, [5.0, 5.0]);
        assert_eq!(cond, [5.0, 5.0]);
    }

    #[test]
    fn test_per_item_timesteps_are_kept() {
        let device = Default::default();
        let backend = DenoiserBackend::new(TimestepShift);
        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 1, 1], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([5.0, 7.0], &device);
        let context = Conditioning::new(Tensor::<TestBackend, 3>::zeros([2, 3, 8], &device));

        let (uncond, cond) = backend
            .evaluate_dual(&x, &t, &context, &context, &StepOptions::default())
            .unwrap();

        let uncond: Vec<f32> = uncond.into_data().to_vec().unwrap();
        let cond: Vec<f32> = cond.into_data().to_vec().unwrap();
        assert_eq!(uncond, [5.0, 7.0]);
        assert_eq!(cond, [5.0, 7.0]);
    }

    #[test]
    fn test_mismatched_timestep_is_rejected() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::zeros([2, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([5.0, 6.0, 7.0], &device);
        let context = Conditioning::new(Tensor::<TestBackend, 3>::zeros([2, 3, 8], &device));

        let err = backend
            .evaluate_dual(&x, &t, &context, &context, &StepOptions::default())
            .unwrap_err();

        assert!(matches!(
            err,
            GuidanceError::ShapeMismatch {
                context: "timestep",
                ..
            }
        ));
        assert_eq!(backend.model().calls.get(), 0);
    }

    #[test]
    fn test_cfg_function_output_is_final_prediction() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], 3.0, &device);
        let t = Tensor::<TestBackend, 1>::from_floats([500.0], &device);
        let options = StepOptions::default().with_cfg_function(Arc::new(
            |args: CfgArgs<TestBackend>| {
                Ok::<_, GuidanceError>(args.cond_denoised.zeros_like() + 0.25)
            },
        ));

        let out = backend
            .blend_cfg(x.zeros_like(), x.zeros_like(), 8.0, &x, &t, &options)
            .unwrap();

        let out: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(out.iter().all(|v| *v == 0.25));
    }

    #[test]
    fn test_empty_batch() {
        let device = Default::default();
        let backend = backend();
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let t = Tensor::<TestBackend, 1>::from_floats([1.0], &device);

        let err = backend
            .evaluate_batch(&x, &t, &[], &StepOptions::default())
            .unwrap_err();

        assert!(matches!(err, GuidanceError::EmptyBatch));
    }
}
