//! PPO training configuration.
//!
//! All hyperparameters live in one serde-serializable struct so a run can
//! be reproduced from its checkpoint metadata. `validate()` collects every
//! violation instead of stopping at the first one.

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{config_error, PpoError, PpoResult};

/// Configuration for PPO fine-tuning of a causal language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PpoConfig {
    /// Identifier of the policy / reference base model (informational).
    pub model_name: String,
    /// Identifier of the external text scorer (informational).
    pub scorer_name: String,

    /// Number of PPO optimization steps to run.
    pub steps: usize,
    /// Examples collected per PPO step.
    pub batch_size: usize,
    /// Sub-batch size for forward passes and minibatch updates.
    /// Must divide `batch_size`.
    pub forward_batch_size: usize,
    /// Optimization epochs over each collected batch.
    pub ppo_epochs: usize,

    /// Query length bounds, tokens, half-open `[min, max)`.
    pub txt_in_min: usize,
    pub txt_in_max: usize,
    /// Response length bounds, tokens, half-open `[min, max)`.
    pub txt_out_min: usize,
    pub txt_out_max: usize,

    /// AdamW learning rate.
    pub lr: f64,

    /// Use the adaptive KL controller; otherwise the coefficient stays
    /// at `init_kl_coef`.
    pub adap_kl_ctrl: bool,
    /// Initial KL penalty coefficient (beta).
    pub init_kl_coef: f64,
    /// Target per-batch KL for the adaptive controller.
    pub target: f64,
    /// Adaptation horizon (examples) for the adaptive controller.
    pub horizon: f64,

    /// Discount factor for generalized advantage estimation.
    pub gamma: f64,
    /// GAE lambda.
    pub lam: f64,
    /// Policy ratio clip range.
    pub cliprange: f64,
    /// Value prediction clip range.
    pub cliprange_value: f64,
    /// Value loss coefficient.
    pub vf_coef: f64,

    /// RNG seed for length sampling, generation, and minibatch shuffling.
    pub seed: u64,
    /// Compute device: "cpu" or "cuda:<ordinal>".
    pub device: String,
}

impl Default for PpoConfig {
    /// Defaults match the sentiment fine-tuning experiment this loop was
    /// built for (GPT-2 on IMDB with a sentiment classifier reward).
    fn default() -> Self {
        Self {
            model_name: "lvwerra/gpt2-imdb".to_string(),
            scorer_name: "lvwerra/distilbert-imdb".to_string(),
            steps: 100,
            batch_size: 256,
            forward_batch_size: 16,
            ppo_epochs: 4,
            txt_in_min: 2,
            txt_in_max: 8,
            txt_out_min: 4,
            txt_out_max: 16,
            lr: 1.41e-5,
            adap_kl_ctrl: true,
            init_kl_coef: 0.2,
            target: 6.0,
            horizon: 10_000.0,
            gamma: 1.0,
            lam: 0.95,
            cliprange: 0.2,
            cliprange_value: 0.2,
            vf_coef: 0.1,
            seed: 0,
            device: "cpu".to_string(),
        }
    }
}

impl PpoConfig {
    /// Tiny CPU preset for smoke tests: four-example batches, two steps,
    /// short texts, an aggressive learning rate so parameter movement is
    /// visible immediately.
    pub fn smoke_test() -> Self {
        Self {
            model_name: "demo".to_string(),
            scorer_name: "demo-lexicon".to_string(),
            steps: 2,
            batch_size: 4,
            forward_batch_size: 2,
            ppo_epochs: 2,
            txt_in_min: 2,
            txt_in_max: 5,
            txt_out_min: 3,
            txt_out_max: 6,
            lr: 1e-3,
            adap_kl_ctrl: true,
            init_kl_coef: 0.2,
            target: 6.0,
            horizon: 64.0,
            gamma: 1.0,
            lam: 0.95,
            cliprange: 0.2,
            cliprange_value: 0.2,
            vf_coef: 0.1,
            seed: 42,
            device: "cpu".to_string(),
        }
    }

    /// Validate the configuration, collecting all errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.steps == 0 {
            errors.push("steps must be > 0".to_string());
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be > 0".to_string());
        }
        if self.forward_batch_size == 0 {
            errors.push("forward_batch_size must be > 0".to_string());
        } else if self.batch_size % self.forward_batch_size != 0 {
            errors.push(format!(
                "forward_batch_size ({}) must divide batch_size ({})",
                self.forward_batch_size, self.batch_size
            ));
        }
        if self.ppo_epochs == 0 {
            errors.push("ppo_epochs must be > 0".to_string());
        }

        if self.txt_in_min == 0 || self.txt_in_min >= self.txt_in_max {
            errors.push(format!(
                "query length range [{}, {}) must be non-empty and start at >= 1",
                self.txt_in_min, self.txt_in_max
            ));
        }
        if self.txt_out_min == 0 || self.txt_out_min >= self.txt_out_max {
            errors.push(format!(
                "response length range [{}, {}) must be non-empty and start at >= 1",
                self.txt_out_min, self.txt_out_max
            ));
        }

        if self.lr <= 0.0 || !self.lr.is_finite() {
            errors.push(format!("lr must be finite and > 0, got {}", self.lr));
        }
        if self.init_kl_coef < 0.0 || !self.init_kl_coef.is_finite() {
            errors.push(format!(
                "init_kl_coef must be finite and >= 0, got {}",
                self.init_kl_coef
            ));
        }
        if self.target <= 0.0 {
            errors.push(format!("target KL must be > 0, got {}", self.target));
        }
        if self.horizon <= 0.0 {
            errors.push(format!("horizon must be > 0, got {}", self.horizon));
        }

        if !(0.0..=1.0).contains(&self.gamma) {
            errors.push(format!("gamma must be in [0, 1], got {}", self.gamma));
        }
        if !(0.0..=1.0).contains(&self.lam) {
            errors.push(format!("lam must be in [0, 1], got {}", self.lam));
        }
        if self.cliprange <= 0.0 {
            errors.push(format!("cliprange must be > 0, got {}", self.cliprange));
        }
        if self.cliprange_value <= 0.0 {
            errors.push(format!(
                "cliprange_value must be > 0, got {}",
                self.cliprange_value
            ));
        }
        if self.vf_coef < 0.0 {
            errors.push(format!("vf_coef must be >= 0, got {}", self.vf_coef));
        }

        // Non-fatal oddities worth flagging before a long run.
        if self.lr > 1e-2 {
            tracing::warn!(lr = self.lr, "unusually high learning rate for RL fine-tuning");
        }
        if self.adap_kl_ctrl && self.init_kl_coef == 0.0 {
            tracing::warn!("adaptive KL controller starting from a zero coefficient stays at zero");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold all violations into a single `PpoError::Config`.
    pub fn ensure_valid(&self) -> PpoResult<()> {
        self.validate()
            .map_err(|errors| config_error(errors.join("; ")))
    }

    /// Resolve the configured device string.
    pub fn device(&self) -> PpoResult<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            other => {
                if let Some(ordinal) = other.strip_prefix("cuda:") {
                    let ordinal: usize = ordinal.parse().map_err(|_| {
                        PpoError::Config(format!("bad cuda ordinal in device '{}'", other))
                    })?;
                    Ok(Device::new_cuda(ordinal)?)
                } else if other == "cuda" {
                    Ok(Device::new_cuda(0)?)
                } else {
                    Err(PpoError::Config(format!(
                        "unknown device '{}', expected 'cpu' or 'cuda:<n>'",
                        other
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(PpoConfig::default().validate().is_ok());
    }

    #[test]
    fn test_smoke_test_config_valid() {
        assert!(PpoConfig::smoke_test().validate().is_ok());
    }

    #[test]
    fn test_forward_batch_must_divide_batch() {
        let cfg = PpoConfig {
            batch_size: 10,
            forward_batch_size: 3,
            ..PpoConfig::default()
        };
        let errors = cfg.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must divide")));
    }

    #[test]
    fn test_collects_multiple_errors() {
        let cfg = PpoConfig {
            lr: -1.0,
            gamma: 2.0,
            txt_out_min: 8,
            txt_out_max: 8,
            ..PpoConfig::default()
        };
        let errors = cfg.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_ensure_valid_folds_errors() {
        let cfg = PpoConfig {
            steps: 0,
            ..PpoConfig::default()
        };
        match cfg.ensure_valid() {
            Err(PpoError::Config(msg)) => assert!(msg.contains("steps")),
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_device_parsing() {
        let cfg = PpoConfig::default();
        assert!(cfg.device().is_ok());

        let bad = PpoConfig {
            device: "tpu".to_string(),
            ..PpoConfig::default()
        };
        assert!(bad.device().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = PpoConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PpoConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, cfg.batch_size);
        assert_eq!(back.lr, cfg.lr);
        assert_eq!(back.device, cfg.device);
    }
}
