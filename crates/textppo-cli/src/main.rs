//! Command-line entry points: config validation and a self-contained
//! smoke-training run over the embedded demo stack.

mod demo;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use textppo::driver::{self, TracingSink, VecQuerySource};
use textppo::policy::SamplingConfig;
use textppo::reward::RewardComputer;
use textppo::rollout::RolloutGenerator;
use textppo::sampler::LengthSampler;
use textppo::trainer::PpoTrainer;
use textppo::PpoConfig;

#[derive(Parser)]
#[command(name = "textppo", about = "PPO fine-tuning loop for causal language models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a training configuration file and report every violation.
    Validate {
        /// Path to a JSON PpoConfig; defaults to the built-in experiment config.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Train the embedded demo policy against the lexicon scorer.
    Smoke {
        /// Override the number of PPO steps.
        #[arg(long)]
        steps: Option<usize>,
        /// Override the RNG seed.
        #[arg(long)]
        seed: Option<u64>,
        /// Directory for weights, vocab, and trainer metadata.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<PpoConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(PpoConfig::default()),
    }
}

fn validate(config_path: Option<&PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    match config.validate() {
        Ok(()) => {
            println!(
                "configuration ok: {} steps x {} examples, lr {}, device {}",
                config.steps, config.batch_size, config.lr, config.device
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("error: {}", error);
            }
            bail!("{} configuration error(s)", errors.len());
        }
    }
}

fn smoke(steps: Option<usize>, seed: Option<u64>, out: Option<PathBuf>) -> Result<()> {
    let mut config = PpoConfig::smoke_test();
    if let Some(steps) = steps {
        config.steps = steps;
    }
    if let Some(seed) = seed {
        config.seed = seed;
    }
    config.ensure_valid()?;

    let device = config.device()?;
    let policy = demo::DemoPolicy::new(&device)?;
    let reference = policy.clone_frozen(&device)?;
    let vars = policy.trainable_vars();

    // Token 0 doubles as padding; the model is causal so pad positions
    // are never read.
    let mut trainer = PpoTrainer::new(policy, reference, vars, 0, config.clone())?;

    let mut source = VecQuerySource::new(demo::demo_queries()?)?;
    let rewarder = RewardComputer::new(demo::LexiconScorer, "POSITIVE", config.forward_batch_size)?;
    let rollouts = RolloutGenerator::new(
        LengthSampler::new(config.txt_out_min, config.txt_out_max)?,
        SamplingConfig::default(),
    );
    let mut sink = TracingSink;
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));

    driver::run_training(
        &mut trainer,
        &mut source,
        &demo::DemoCodec,
        &rewarder,
        &rollouts,
        &mut sink,
        &mut rng,
        out.as_deref(),
    )?;

    println!(
        "smoke run finished: {} steps, final KL coefficient {:.4}",
        trainer.step_index(),
        trainer.kl_controller().value()
    );
    if let Some(out) = out {
        println!("artifacts written to {}", out.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    textppo::logging::init_console_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { config } => validate(config.as_ref()),
        Commands::Smoke { steps, seed, out } => smoke(steps, seed, out),
    }
}
