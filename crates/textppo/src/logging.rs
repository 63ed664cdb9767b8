//! Structured logging for PPO training with tracing.
//!
//! Provides JSON and console initializers plus a per-step record logger
//! with automatic anomaly warnings (KL blowout, negative explained
//! variance, non-finite loss).

use tracing::{debug, error, info, span, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::driver::StepRecord;

/// Initialize structured logging.
///
/// Reads log level from RUST_LOG (defaults to "info"). Outputs
/// JSON-formatted logs for production monitoring.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,textppo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for the CLI / debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,textppo=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Log one training step with structured metrics.
///
/// Automatically emits warnings for:
/// - KL estimate far above zero relative to the shaping coefficient's target
/// - negative explained variance (value head worse than a constant)
/// - non-finite loss values (should have been caught as an error upstream)
pub fn log_ppo_step(record: &StepRecord) {
    let stats = &record.stats;
    let span = span!(Level::INFO, "ppo_step", step = record.step);
    let _enter = span.enter();

    if !stats.policy_loss.is_finite() || !stats.value_loss.is_finite() {
        error!(
            policy_loss = stats.policy_loss,
            value_loss = stats.value_loss,
            step = record.step,
            "Non-finite loss in step statistics"
        );
        return;
    }

    info!(
        reward_mean = stats.reward_mean,
        reward_std = stats.reward_std,
        objective_kl = stats.objective_kl,
        kl_coef = stats.kl_coef,
        mean_non_score_reward = stats.mean_non_score_reward,
        policy_loss = stats.policy_loss,
        value_loss = stats.value_loss,
        entropy = stats.entropy,
        approx_kl = stats.approx_kl,
        clipfrac = stats.clipfrac,
        value_clipfrac = stats.value_clipfrac,
        explained_variance = stats.explained_variance,
        forward_ms = stats.timing.forward.as_millis() as u64,
        optimize_ms = stats.timing.optimize.as_millis() as u64,
        total_ms = stats.timing.total.as_millis() as u64,
        "PPO step completed"
    );

    if stats.explained_variance < 0.0 {
        warn!(
            explained_variance = stats.explained_variance,
            step = record.step,
            "Value head explains less variance than a constant predictor"
        );
    }

    if stats.clipfrac > 0.5 {
        warn!(
            clipfrac = stats.clipfrac,
            step = record.step,
            "More than half of the policy ratios were clipped; the policy is moving fast"
        );
    }

    for (i, row) in record.rows.iter().enumerate() {
        debug!(
            example = i,
            query = row.query.as_str(),
            response = row.response.as_str(),
            reward = row.reward,
            "rollout"
        );
    }
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str) {
    info!(
        step = step,
        path = path,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RolloutRow;
    use crate::trainer::{StepStats, StepTiming};

    fn stats() -> StepStats {
        StepStats {
            reward_mean: 0.5,
            reward_std: 0.2,
            objective_kl: 3.0,
            kl_coef: 0.2,
            mean_non_score_reward: -0.6,
            policy_loss: 0.01,
            value_loss: 0.4,
            entropy: 2.5,
            approx_kl: 0.002,
            policy_kl: 0.001,
            clipfrac: 0.7,
            value_clipfrac: 0.1,
            returns_mean: 0.3,
            returns_var: 0.8,
            value_error: 1.2,
            explained_variance: -0.5,
            rewards: vec![1.0, -1.0],
            advantages: vec![0.4, -0.4],
            timing: StepTiming::default(),
        }
    }

    #[test]
    fn test_logging_does_not_panic() {
        // Warnings fire for the negative explained variance and the high
        // clip fraction; none of it should panic.
        let record = StepRecord {
            step: 3,
            rows: vec![RolloutRow {
                query: "the movie was".to_string(),
                response: " great".to_string(),
                reward: 1.0,
            }],
            stats: stats(),
        };
        log_ppo_step(&record);
        log_checkpoint_save(3, "/tmp/run");
    }
}
