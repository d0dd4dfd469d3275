//! burn-guiders CLI
//!
//! Inspect the guider node registrations and watch adaptive guidance switch
//! off CFG over a synthetic sampling run.

use anyhow::Result;
use burn_guiders::SimilarityMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod simulate;

#[derive(Parser)]
#[command(name = "burn-guiders")]
#[command(about = "Adaptive classifier-free guidance for Burn diffusion samplers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the guider node registrations as JSON
    Schema {
        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Run a guider over a synthetic denoiser and report each step's path
    Simulate(SimulateArgs),
}

/// Guider variant
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Variant {
    /// Standard CFG blend
    #[default]
    Standard,
    /// Perpendicular-negative blend with a neutral prompt
    PerpNeg,
}

/// Similarity reduction for batched predictions
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Similarity {
    /// One score over the whole batch
    Global,
    /// Least similar batch item
    PerSampleMin,
}

impl From<Similarity> for SimilarityMode {
    fn from(value: Similarity) -> Self {
        match value {
            Similarity::Global => SimilarityMode::Global,
            Similarity::PerSampleMin => SimilarityMode::PerSampleMin,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct SimulateArgs {
    /// JSON file with `guidance` and `perp_neg` sections (flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of sampling steps
    #[arg(long, default_value = "30")]
    steps: usize,

    /// Guider variant
    #[arg(long, value_enum, default_value = "standard")]
    variant: Variant,

    /// CFG scale
    #[arg(long)]
    cfg: Option<f32>,

    /// Cosine similarity threshold (1.0 disables the check)
    #[arg(long)]
    threshold: Option<f32>,

    /// Leading steps that always bypass CFG
    #[arg(long)]
    initial_disabled_steps: Option<usize>,

    /// Zero-conditioning strength on bypassed steps
    #[arg(long)]
    uncond_zero_scale: Option<f32>,

    /// Perpendicular negative weight (perp-neg variant only)
    #[arg(long)]
    neg_scale: Option<f32>,

    /// Similarity reduction over the batch
    #[arg(long, value_enum)]
    similarity: Option<Similarity>,

    /// Batch size of the synthetic latent
    #[arg(long, default_value = "1")]
    batch: usize,

    /// Latent height and width
    #[arg(long, default_value = "16")]
    size: usize,

    /// Hide the progress bar
    #[arg(long)]
    quiet: bool,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Schema { pretty } => {
            let nodes = burn_guiders::node_registrations();
            let json = if pretty {
                serde_json::to_string_pretty(&nodes)?
            } else {
                serde_json::to_string(&nodes)?
            };
            println!("{json}");
            Ok(())
        }
        Commands::Simulate(args) => simulate::run(args),
    }
}
