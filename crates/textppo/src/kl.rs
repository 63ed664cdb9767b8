//! KL penalty coefficient controllers.
//!
//! The coefficient (beta) scales the per-token divergence penalty against
//! the frozen reference policy. The controller is owned by the trainer and
//! serialized in checkpoint metadata so a resumed run keeps its adapted
//! coefficient.

use serde::{Deserialize, Serialize};

/// Lower clamp keeping the coefficient strictly positive under any
/// sequence of updates.
const MIN_KL_COEF: f64 = 1e-8;

/// Adapts the coefficient toward a target per-batch KL.
///
/// The proportional error `kl / target - 1` is clipped to `[-0.2, 0.2]`
/// before being applied, so a single wild batch moves the coefficient by
/// a bounded factor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveKlController {
    pub value: f64,
    target: f64,
    horizon: f64,
}

impl AdaptiveKlController {
    pub fn new(init_kl_coef: f64, target: f64, horizon: f64) -> Self {
        Self {
            value: init_kl_coef,
            target,
            horizon,
        }
    }

    pub fn update(&mut self, current_kl: f64, n_steps: usize) {
        let proportional_error = (current_kl / self.target - 1.0).clamp(-0.2, 0.2);
        let mult = 1.0 + proportional_error * n_steps as f64 / self.horizon;
        self.value = (self.value * mult).max(MIN_KL_COEF);
    }
}

/// Keeps the coefficient constant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedKlController {
    pub value: f64,
}

impl FixedKlController {
    pub fn new(kl_coef: f64) -> Self {
        Self { value: kl_coef }
    }
}

/// Controller selected by `PpoConfig::adap_kl_ctrl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KlController {
    Adaptive(AdaptiveKlController),
    Fixed(FixedKlController),
}

impl KlController {
    pub fn from_config(config: &crate::config::PpoConfig) -> Self {
        if config.adap_kl_ctrl {
            KlController::Adaptive(AdaptiveKlController::new(
                config.init_kl_coef,
                config.target,
                config.horizon,
            ))
        } else {
            KlController::Fixed(FixedKlController::new(config.init_kl_coef))
        }
    }

    /// Current coefficient.
    pub fn value(&self) -> f64 {
        match self {
            KlController::Adaptive(ctl) => ctl.value,
            KlController::Fixed(ctl) => ctl.value,
        }
    }

    /// Feed one batch's KL estimate; `n_steps` is the number of examples
    /// the estimate was computed over.
    pub fn update(&mut self, current_kl: f64, n_steps: usize) {
        match self {
            KlController::Adaptive(ctl) => ctl.update(current_kl, n_steps),
            KlController::Fixed(_) => {}
        }
    }
}
