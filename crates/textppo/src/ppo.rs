//! PPO math: reward shaping, advantage estimation, and loss terms.
//!
//! Advantages and returns are plain host-side vectors: they enter the loss
//! as fixed coefficients, so nothing here needs to stay on the autograd
//! graph. The differentiable parts (recomputed logprobs and values) live in
//! the trainer's minibatch pass and use the tensor helpers at the bottom.

use candle_core::{Tensor, D};

use crate::error::PpoResult;

/// Log-softmax over the vocabulary dimension of `[batch, time, vocab]`
/// logits.
pub fn logprobs_from_logits(logits: &Tensor) -> PpoResult<Tensor> {
    Ok(candle_nn::ops::log_softmax(logits, D::Minus1)?)
}

/// Per-token shaped rewards for one response.
///
/// Every token is penalized by `kl_coef * (logprob - ref_logprob)`; the
/// external score is added at the final token only, where the full
/// response first exists. Returns `(rewards, non_score_rewards)`.
pub fn shaped_rewards(
    score: f32,
    logprobs: &[f32],
    ref_logprobs: &[f32],
    kl_coef: f64,
) -> (Vec<f32>, Vec<f32>) {
    let non_score: Vec<f32> = logprobs
        .iter()
        .zip(ref_logprobs)
        .map(|(&lp, &ref_lp)| (-kl_coef * (lp - ref_lp) as f64) as f32)
        .collect();
    let mut rewards = non_score.clone();
    if let Some(last) = rewards.last_mut() {
        *last += score;
    }
    (rewards, non_score)
}

/// Generalized advantage estimation over one response.
///
/// `delta_t = r_t + gamma * V_{t+1} - V_t` with `V` past the final token
/// taken as zero; advantages accumulate as
/// `A_t = delta_t + gamma * lam * A_{t+1}`. Returns `(advantages, returns)`
/// with `returns = advantages + values`.
pub fn gae(rewards: &[f32], values: &[f32], gamma: f64, lam: f64) -> (Vec<f32>, Vec<f32>) {
    debug_assert_eq!(rewards.len(), values.len());
    let n = rewards.len();
    let mut advantages = vec![0.0f32; n];
    let mut lastgaelam = 0.0f64;
    for t in (0..n).rev() {
        let next_value = if t + 1 < n { values[t + 1] as f64 } else { 0.0 };
        let delta = rewards[t] as f64 + gamma * next_value - values[t] as f64;
        lastgaelam = delta + gamma * lam * lastgaelam;
        advantages[t] = lastgaelam as f32;
    }
    let returns = advantages
        .iter()
        .zip(values)
        .map(|(&a, &v)| a + v)
        .collect();
    (advantages, returns)
}

/// Whiten ragged per-example vectors in place to zero mean and unit
/// variance across the whole batch.
pub fn whiten(groups: &mut [Vec<f32>]) {
    let count: usize = groups.iter().map(Vec::len).sum();
    if count == 0 {
        return;
    }
    let n = count as f64;
    let mean: f64 = groups
        .iter()
        .flat_map(|g| g.iter())
        .map(|&x| x as f64)
        .sum::<f64>()
        / n;
    let var: f64 = groups
        .iter()
        .flat_map(|g| g.iter())
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let scale = 1.0 / (var + 1e-8).sqrt();
    for group in groups.iter_mut() {
        for x in group.iter_mut() {
            *x = ((*x as f64 - mean) * scale) as f32;
        }
    }
}

/// Clipped surrogate policy loss for one token, host side.
///
/// Returns the loss contribution `max(-A * r, -A * clip(r, 1-c, 1+c))`
/// and whether the clipped branch was the active one.
pub fn surrogate_terms(ratio: f64, advantage: f64, cliprange: f64) -> (f64, bool) {
    let unclipped = -advantage * ratio;
    let clipped = -advantage * ratio.clamp(1.0 - cliprange, 1.0 + cliprange);
    (unclipped.max(clipped), clipped > unclipped)
}

/// Clipped value loss for one token, host side.
///
/// The prediction is clipped to a band around the rollout-time value;
/// returns the larger squared error and whether clipping was active.
pub fn value_loss_terms(
    vpred: f64,
    old_value: f64,
    ret: f64,
    cliprange_value: f64,
) -> (f64, bool) {
    let clipped_pred = vpred.clamp(old_value - cliprange_value, old_value + cliprange_value);
    let unclipped_err = (vpred - ret) * (vpred - ret);
    let clipped_err = (clipped_pred - ret) * (clipped_pred - ret);
    (unclipped_err.max(clipped_err), clipped_err > unclipped_err)
}

/// Distribution entropy from one `[vocab]` row of log-probabilities.
pub fn entropy_from_logprob_row(row: &Tensor) -> PpoResult<f64> {
    let row = row.detach();
    let neg_entropy = (row.exp()? * &row)?.sum_all()?.to_scalar::<f32>()?;
    Ok(-neg_entropy as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_score_lands_on_final_token_only() {
        let logprobs = [-1.0f32, -2.0, -3.0];
        let ref_logprobs = [-1.5f32, -1.5, -1.5];
        let (rewards, non_score) = shaped_rewards(2.0, &logprobs, &ref_logprobs, 0.2);

        for t in 0..3 {
            let expected_kl = -0.2 * (logprobs[t] - ref_logprobs[t]);
            assert!((non_score[t] - expected_kl).abs() < 1e-6);
        }
        assert!((rewards[0] - non_score[0]).abs() < 1e-6);
        assert!((rewards[1] - non_score[1]).abs() < 1e-6);
        assert!((rewards[2] - (non_score[2] + 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_gae_single_token_is_reward_minus_value() {
        let (adv, ret) = gae(&[1.5], &[0.4], 1.0, 0.95);
        assert!((adv[0] - (1.5 - 0.4)).abs() < 1e-6);
        assert!((ret[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_gae_matches_hand_computation() {
        let rewards = [0.0f32, 0.0, 1.0];
        let values = [0.5f32, 0.25, 0.1];
        let gamma = 0.9;
        let lam = 0.8;

        let d2 = 1.0 + 0.9 * 0.0 - 0.1;
        let a2 = d2;
        let d1 = 0.0 + 0.9 * 0.1 - 0.25;
        let a1 = d1 + gamma * lam * a2;
        let d0 = 0.0 + 0.9 * 0.25 - 0.5;
        let a0 = d0 + gamma * lam * a1;

        let (adv, ret) = gae(&rewards, &values, gamma, lam);
        assert!((adv[0] as f64 - a0).abs() < 1e-6);
        assert!((adv[1] as f64 - a1).abs() < 1e-6);
        assert!((adv[2] as f64 - a2).abs() < 1e-6);
        assert!((ret[1] - (adv[1] + values[1])).abs() < 1e-6);
    }

    #[test]
    fn test_whiten_zero_mean_unit_variance() {
        let mut groups = vec![vec![1.0f32, 2.0, 3.0], vec![10.0, -4.0], vec![0.5]];
        whiten(&mut groups);

        let flat: Vec<f64> = groups
            .iter()
            .flat_map(|g| g.iter())
            .map(|&x| x as f64)
            .collect();
        let n = flat.len() as f64;
        let mean = flat.iter().sum::<f64>() / n;
        let var = flat.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_whiten_preserves_ordering() {
        let mut groups = vec![vec![3.0f32, 1.0, 2.0]];
        whiten(&mut groups);
        assert!(groups[0][0] > groups[0][2]);
        assert!(groups[0][2] > groups[0][1]);
    }

    #[test]
    fn test_surrogate_unclipped_inside_range() {
        let (loss, clipped) = surrogate_terms(1.05, 2.0, 0.2);
        assert!((loss - (-2.0 * 1.05)).abs() < 1e-12);
        assert!(!clipped);
    }

    #[test]
    fn test_surrogate_clips_large_ratio_with_positive_advantage() {
        // Ratio above 1+c with positive advantage: the clipped branch caps
        // the payoff.
        let (loss, clipped) = surrogate_terms(2.0, 1.0, 0.2);
        assert!((loss - (-1.2)).abs() < 1e-12);
        assert!(clipped);
    }

    #[test]
    fn test_surrogate_clips_small_ratio_with_negative_advantage() {
        let (loss, clipped) = surrogate_terms(0.3, -1.0, 0.2);
        assert!((loss - 0.8).abs() < 1e-12);
        assert!(clipped);
    }

    #[test]
    fn test_value_loss_takes_worse_error() {
        // Prediction drifted far from the rollout value: the clipped branch
        // dominates.
        let (err, clipped) = value_loss_terms(2.0, 0.0, 2.0, 0.2);
        assert!((err - (0.2 - 2.0f64) * (0.2 - 2.0f64)).abs() < 1e-12);
        assert!(clipped);

        let (err2, clipped2) = value_loss_terms(0.1, 0.0, 0.5, 0.2);
        assert!((err2 - 0.16).abs() < 1e-12);
        assert!(!clipped2);
    }

    #[test]
    fn test_entropy_of_uniform_distribution() {
        let device = Device::Cpu;
        let logits = Tensor::zeros(8, candle_core::DType::F32, &device).unwrap();
        let logp = logprobs_from_logits(&logits.reshape((1, 1, 8)).unwrap()).unwrap();
        let row = logp.get(0).unwrap().get(0).unwrap();
        let entropy = entropy_from_logprob_row(&row).unwrap();
        assert!((entropy - (8.0f64).ln()).abs() < 1e-5);
    }
}
