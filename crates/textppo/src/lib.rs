//! PPO fine-tuning for causal language models against an external scorer.
//!
//! The loop: sample queries from a dataset, generate continuations with a
//! trainable policy, score the texts with an external classifier-style
//! scorer, and optimize the policy with clipped PPO while an adaptive KL
//! penalty keeps it close to a frozen reference copy.
//!
//! Model architecture, tokenization, and scoring are collaborators behind
//! traits ([`policy::PolicyModel`], [`policy::ReferencePolicy`],
//! [`reward::TextScorer`], [`policy::TextDecoder`]); the crate owns the
//! optimization itself.

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod kl;
pub mod logging;
pub mod policy;
pub mod ppo;
pub mod reward;
pub mod rollout;
pub mod sampler;
pub mod trainer;

pub use config::PpoConfig;
pub use driver::{run_training, LogSink, QueryRecord, QuerySource, StepRecord, VecQuerySource};
pub use error::{PpoError, PpoResult};
pub use kl::{AdaptiveKlController, FixedKlController, KlController};
pub use policy::{PolicyModel, ReferencePolicy, SamplingConfig, TextDecoder};
pub use reward::{ClassScores, RewardComputer, TextScorer};
pub use rollout::RolloutGenerator;
pub use sampler::LengthSampler;
pub use trainer::{PpoTrainer, StepStats};
