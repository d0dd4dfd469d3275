//! Synthetic sampling run
//!
//! Drives a guider with a toy denoiser whose conditional and unconditional
//! predictions converge as the timestep falls, so the adaptive trip can be
//! observed without model weights.

use std::cell::Cell;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use burn::prelude::*;
use burn_guiders::{
    AdaptiveGuidanceConfig, AdaptiveGuidanceNode, AdaptiveGuider, Conditioning, Denoiser,
    DenoiserBackend, PerpNegAdaptiveGuidanceNode, PerpNegConfig, StepOptions, StepPath,
};
use burn_ndarray::NdArray;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;

use crate::{SimulateArgs, Variant};

type SimBackend = NdArray<f32>;

const NUM_TRAIN_STEPS: usize = 1000;
const CONTEXT_TOKENS: usize = 8;
const CONTEXT_DIM: usize = 16;
const LATENT_CHANNELS: usize = 4;

/// Guider settings loaded from `--config`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GuiderFile {
    guidance: AdaptiveGuidanceConfig,
    perp_neg: PerpNegConfig,
}

fn load_config(path: &Path) -> Result<GuiderFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
}

/// Descending timesteps spread over the training schedule
fn sampler_timesteps(num_steps: usize) -> Vec<f32> {
    let step_ratio = NUM_TRAIN_STEPS / num_steps;
    (0..num_steps)
        .rev()
        .map(|i| (i * step_ratio).min(NUM_TRAIN_STEPS - 1) as f32)
        .collect()
}

/// Noise prediction `x + mean(context) * (t / T)^2 / 2`
///
/// The prompt's influence fades quadratically with the timestep, so the
/// branches become nearly parallel late in the schedule.
struct FadingPromptDenoiser {
    forward_calls: Cell<usize>,
    evaluated_items: Cell<usize>,
}

impl Denoiser<SimBackend> for FadingPromptDenoiser {
    fn forward(
        &self,
        x: Tensor<SimBackend, 4>,
        timestep: Tensor<SimBackend, 1>,
        context: Tensor<SimBackend, 3>,
    ) -> Tensor<SimBackend, 4> {
        let [n, ..] = x.dims();
        self.forward_calls.set(self.forward_calls.get() + 1);
        self.evaluated_items.set(self.evaluated_items.get() + n);

        let prompt: Tensor<SimBackend, 4> = context.mean_dim(2).mean_dim(1).unsqueeze_dim(3);
        let fade = timestep.reshape([n, 1, 1, 1]) / NUM_TRAIN_STEPS as f32;
        let fade = fade.clone() * fade * 0.5;

        x + prompt * fade
    }
}

type Device = <SimBackend as Backend>::Device;

fn conditioning(value: f32, batch: usize, device: &Device) -> Conditioning<SimBackend> {
    Conditioning::new(Tensor::full([batch, CONTEXT_TOKENS, CONTEXT_DIM], value, device))
}

/// Deterministic structured starting latent
fn initial_latent(batch: usize, size: usize, device: &Device) -> Tensor<SimBackend, 4> {
    let len = batch * LATENT_CHANNELS * size * size;
    let values: Vec<f32> = (0..len).map(|i| (i as f32 * 0.7).sin()).collect();
    Tensor::from_data(TensorData::new(values, [batch, LATENT_CHANNELS, size, size]), device)
}

fn resolve_config(args: &SimulateArgs) -> Result<(AdaptiveGuidanceConfig, PerpNegConfig)> {
    let file = match &args.config {
        Some(path) => load_config(path)?,
        None => GuiderFile::default(),
    };

    let mut guidance = file.guidance;
    if let Some(cfg) = args.cfg {
        guidance.cfg = cfg;
    }
    if let Some(threshold) = args.threshold {
        guidance.threshold = threshold;
    }
    if let Some(steps) = args.initial_disabled_steps {
        guidance.initial_disabled_steps = steps;
    }
    if let Some(scale) = args.uncond_zero_scale {
        guidance.uncond_zero_scale = scale;
    }
    if let Some(similarity) = args.similarity {
        guidance.similarity = similarity.into();
    }

    let mut perp_neg = file.perp_neg;
    if let Some(neg_scale) = args.neg_scale {
        perp_neg.neg_scale = neg_scale;
    }

    Ok((guidance, perp_neg))
}

pub fn run(args: SimulateArgs) -> Result<()> {
    if args.steps == 0 || args.steps > NUM_TRAIN_STEPS {
        bail!("--steps must be between 1 and {NUM_TRAIN_STEPS}");
    }
    if args.batch == 0 || args.size == 0 {
        bail!("--batch and --size must be positive");
    }

    let (guidance, perp_neg) = resolve_config(&args)?;
    let device = Default::default();

    let model = DenoiserBackend::new(FadingPromptDenoiser {
        forward_calls: Cell::new(0),
        evaluated_items: Cell::new(0),
    });
    let positive = conditioning(1.0, args.batch, &device);
    let negative = conditioning(-1.0, args.batch, &device);

    let (guider, branches): (AdaptiveGuider<SimBackend, _>, usize) = match args.variant {
        Variant::Standard => (
            AdaptiveGuidanceNode::get_guider(model, positive, negative, guidance)?,
            2,
        ),
        Variant::PerpNeg => (
            PerpNegAdaptiveGuidanceNode::get_guider(
                model,
                positive,
                negative,
                conditioning(0.0, args.batch, &device),
                guidance,
                perp_neg,
            )?,
            3,
        ),
    };

    tracing::info!(variant = ?args.variant, config = ?guider.config(), "Starting simulation");

    let timesteps = sampler_timesteps(args.steps);
    let step_size = 1.0 / args.steps as f32;
    let options = StepOptions::default();

    let pb = if args.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(args.steps as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut latent = initial_latent(args.batch, args.size, &device);
    let mut state = guider.start();
    let mut report = Vec::with_capacity(timesteps.len());

    for &t in &timesteps {
        let timestep = Tensor::<SimBackend, 1>::full([args.batch], t, &device);
        let noise_pred = guider.predict_noise(&mut state, &latent, &timestep, &options)?;
        latent = latent - noise_pred * step_size;

        let path = state
            .last_path()
            .context("Guider did not record a step path")?;
        pb.set_message(format!("t={t:.0} {}", describe(&path)));
        pb.inc(1);
        report.push((t, path));
    }
    pb.finish_and_clear();

    for (i, (t, path)) in report.iter().enumerate() {
        println!("step {:>4}  t={:>6.1}  {}", i + 1, t, describe(path));
    }

    let full_steps = report
        .iter()
        .filter(|(_, path)| matches!(path, StepPath::Full { .. }))
        .count();
    let denoiser = guider.backend().model();
    let evaluated = denoiser.evaluated_items.get() / args.batch;
    let baseline = args.steps * branches;

    println!();
    println!("full CFG steps:    {full_steps}/{}", args.steps);
    match state.threshold_timestep() {
        Some(t) => println!("tripped at:        t={t:.1}"),
        None => println!("tripped at:        never"),
    }
    println!("forward passes:    {}", denoiser.forward_calls.get());
    println!(
        "branch evaluations: {evaluated} (vs {baseline} without adaptive guidance, {:.1}% saved)",
        100.0 * (baseline - evaluated) as f32 / baseline as f32
    );

    Ok(())
}

fn describe(path: &StepPath) -> String {
    match path {
        StepPath::Bypass => "bypass (cfg 1.0)".to_string(),
        StepPath::Full { similarity: Some(s) } => format!("full cfg (similarity {s:.4})"),
        StepPath::Full { similarity: None } => "full cfg".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_timesteps_descend() {
        let timesteps = sampler_timesteps(10);
        assert_eq!(timesteps.len(), 10);
        assert_eq!(timesteps[0], 900.0);
        assert_eq!(timesteps[9], 0.0);
        assert!(timesteps.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_guider_file_defaults() {
        let file: GuiderFile =
            serde_json::from_str(r#"{ "guidance": { "threshold": 0.95 } }"#).unwrap();
        assert_eq!(file.guidance.threshold, 0.95);
        assert_eq!(file.guidance.cfg, 8.0);
        assert_eq!(file.perp_neg.neg_scale, 1.0);
    }

    #[test]
    fn test_fading_prompt_trips_before_the_end() {
        let device = Default::default();
        let guider = AdaptiveGuider::new(
            DenoiserBackend::new(FadingPromptDenoiser {
                forward_calls: Cell::new(0),
                evaluated_items: Cell::new(0),
            }),
            conditioning(1.0, 1, &device),
            conditioning(-1.0, 1, &device),
            AdaptiveGuidanceConfig::default(),
        );
        let latent = initial_latent(1, 8, &device);
        let mut state = guider.start();

        for t in sampler_timesteps(20) {
            let timestep = Tensor::<SimBackend, 1>::full([1], t, &device);
            guider
                .predict_noise(&mut state, &latent, &timestep, &StepOptions::default())
                .unwrap();
        }

        let trip = state.threshold_timestep().expect("similarity should exceed 0.99");
        assert!(trip > 0.0 && trip < 900.0, "tripped at {trip}");
        // Every bypassed step evaluates one branch instead of two
        let model = guider.backend().model();
        assert_eq!(model.forward_calls.get(), 20);
        assert!(model.evaluated_items.get() < 40);
    }
}
