//! The PPO trainer: one `step()` per collected batch.
//!
//! A step runs sub-batched forward passes through the policy and the
//! frozen reference, shapes per-token rewards from the external scores and
//! the KL penalty, estimates advantages, then optimizes the policy for
//! `ppo_epochs` passes of shuffled minibatches. Rollout-time logprobs and
//! values stay fixed for the whole step; only the minibatch recomputation
//! is differentiated.

use std::time::{Duration, Instant};

use candle_core::{Device, IndexOp, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::PpoConfig;
use crate::error::{PpoError, PpoResult};
use crate::kl::KlController;
use crate::policy::{PolicyModel, ReferencePolicy};
use crate::ppo;

/// Rollout-time quantities for one batch, per response token, detached
/// from the graph. Outer index is the example, order matches the input.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub logprobs: Vec<Vec<f32>>,
    pub ref_logprobs: Vec<Vec<f32>>,
    pub values: Vec<Vec<f32>>,
}

/// Wall-clock breakdown of one step.
#[derive(Debug, Clone, Default)]
pub struct StepTiming {
    pub forward: Duration,
    pub optimize: Duration,
    pub total: Duration,
}

/// Diagnostics returned by `step()`. Per-example vectors are in input
/// order.
#[derive(Debug, Clone)]
pub struct StepStats {
    /// Mean and population std of the external scores.
    pub reward_mean: f64,
    pub reward_std: f64,
    /// Mean over examples of the summed per-token `logprob - ref_logprob`.
    pub objective_kl: f64,
    /// KL coefficient used to shape this batch's rewards.
    pub kl_coef: f64,
    /// Mean over examples of the summed KL penalty reward.
    pub mean_non_score_reward: f64,
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    /// `0.5 * mean((new_logprob - old_logprob)^2)`.
    pub approx_kl: f64,
    /// `mean(new_logprob - old_logprob)`.
    pub policy_kl: f64,
    pub clipfrac: f64,
    pub value_clipfrac: f64,
    pub returns_mean: f64,
    pub returns_var: f64,
    pub value_error: f64,
    pub explained_variance: f64,
    /// External score per example.
    pub rewards: Vec<f32>,
    /// Mean whitened advantage per example.
    pub advantages: Vec<f32>,
    pub timing: StepTiming,
}

#[derive(Debug, Default)]
struct MinibatchStats {
    policy_loss: f64,
    value_loss: f64,
    entropy: f64,
    approx_kl: f64,
    policy_kl: f64,
    clipfrac: f64,
    value_clipfrac: f64,
    value_error: f64,
}

/// One right-padded sub-batch of `query || response` sequences.
struct PaddedBatch {
    input_ids: Tensor,
    examples: Vec<PaddedExample>,
}

struct PaddedExample {
    ids: Vec<u32>,
    query_len: usize,
    response_len: usize,
}

impl PaddedBatch {
    /// Pad to the sub-batch max length on the right. Correct only for
    /// causal models, where positions never attend forward into padding.
    fn build(
        queries: &[Tensor],
        responses: &[Tensor],
        pad_token_id: u32,
        device: &Device,
    ) -> PpoResult<Self> {
        let mut examples = Vec::with_capacity(queries.len());
        let mut max_len = 0usize;
        for (query, response) in queries.iter().zip(responses) {
            let mut ids = query.to_vec1::<u32>()?;
            let query_len = ids.len();
            let response_ids = response.to_vec1::<u32>()?;
            let response_len = response_ids.len();
            ids.extend_from_slice(&response_ids);
            max_len = max_len.max(ids.len());
            examples.push(PaddedExample {
                ids,
                query_len,
                response_len,
            });
        }

        let n = examples.len();
        let mut flat = Vec::with_capacity(n * max_len);
        for ex in &examples {
            flat.extend_from_slice(&ex.ids);
            flat.resize(flat.len() + (max_len - ex.ids.len()), pad_token_id);
        }
        let input_ids = Tensor::from_vec(flat, (n, max_len), device)?;
        Ok(Self {
            input_ids,
            examples,
        })
    }
}

/// PPO trainer over a policy / frozen-reference pair.
pub struct PpoTrainer<P, R> {
    policy: P,
    reference: R,
    config: PpoConfig,
    kl_ctl: KlController,
    optimizer: AdamW,
    pad_token_id: u32,
    device: Device,
    rng: StdRng,
    step_index: usize,
}

impl<P, R> PpoTrainer<P, R> {
    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn kl_controller(&self) -> &KlController {
        &self.kl_ctl
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }
}

impl<P: PolicyModel, R: ReferencePolicy> PpoTrainer<P, R> {
    /// Build a trainer. `trainable_vars` are the policy's parameters
    /// (typically `varmap.all_vars()`); the reference holds none.
    pub fn new(
        policy: P,
        reference: R,
        trainable_vars: Vec<Var>,
        pad_token_id: u32,
        config: PpoConfig,
    ) -> PpoResult<Self> {
        config.ensure_valid()?;
        let device = config.device()?;
        let optimizer = AdamW::new(
            trainable_vars,
            ParamsAdamW {
                lr: config.lr,
                ..ParamsAdamW::default()
            },
        )?;
        let kl_ctl = KlController::from_config(&config);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            policy,
            reference,
            config,
            kl_ctl,
            optimizer,
            pad_token_id,
            device,
            rng,
            step_index: 0,
        })
    }

    /// Restore the KL controller and step counter from checkpoint metadata.
    pub fn restore(&mut self, kl_ctl: KlController, step_index: usize) {
        self.kl_ctl = kl_ctl;
        self.step_index = step_index;
    }

    /// Run one PPO optimization step over a collected batch.
    ///
    /// `queries` and `responses` are 1-D `u32` token tensors; `scores` is
    /// one external reward per example. All three must have exactly
    /// `batch_size` entries, in the same example order.
    pub fn step(
        &mut self,
        queries: &[Tensor],
        responses: &[Tensor],
        scores: &[f32],
    ) -> PpoResult<StepStats> {
        let step_started = Instant::now();
        self.check_batch(queries, responses, scores)?;

        let bs = self.config.batch_size;
        let fbs = self.config.forward_batch_size;
        let kl_coef = self.kl_ctl.value();

        let forward_started = Instant::now();
        let pass = self.batched_forward_pass(queries, responses)?;
        let forward_elapsed = forward_started.elapsed();

        // Shaped rewards, then advantage estimation per example.
        let mut non_score_sums = Vec::with_capacity(bs);
        let mut advantages = Vec::with_capacity(bs);
        let mut returns = Vec::with_capacity(bs);
        for i in 0..bs {
            let (rewards, non_score) = ppo::shaped_rewards(
                scores[i],
                &pass.logprobs[i],
                &pass.ref_logprobs[i],
                kl_coef,
            );
            non_score_sums.push(non_score.iter().map(|&x| x as f64).sum::<f64>());
            let (adv, ret) =
                ppo::gae(&rewards, &pass.values[i], self.config.gamma, self.config.lam);
            advantages.push(adv);
            returns.push(ret);
        }
        ppo::whiten(&mut advantages);
        for group in &advantages {
            for &a in group {
                if !a.is_finite() {
                    return Err(PpoError::NonFinite {
                        what: "whitened advantage".to_string(),
                        step: self.step_index,
                        minibatch: 0,
                    });
                }
            }
        }

        let optimize_started = Instant::now();
        let mut minibatch_stats = Vec::new();
        let mut indices: Vec<usize> = (0..bs).collect();
        for _ in 0..self.config.ppo_epochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(fbs) {
                let stats = self.train_minibatch(
                    chunk,
                    queries,
                    responses,
                    &pass,
                    &advantages,
                    &returns,
                    minibatch_stats.len(),
                )?;
                minibatch_stats.push(stats);
            }
        }
        let optimize_elapsed = optimize_started.elapsed();

        // Per-batch KL estimate for the controller: mean over examples of
        // the summed token divergence.
        let objective_kl = (0..bs)
            .map(|i| {
                pass.logprobs[i]
                    .iter()
                    .zip(&pass.ref_logprobs[i])
                    .map(|(&lp, &ref_lp)| (lp - ref_lp) as f64)
                    .sum::<f64>()
            })
            .sum::<f64>()
            / bs as f64;
        self.kl_ctl.update(objective_kl, bs);
        self.step_index += 1;

        let stats = self.assemble_stats(
            scores,
            kl_coef,
            objective_kl,
            &non_score_sums,
            &advantages,
            &returns,
            &minibatch_stats,
            StepTiming {
                forward: forward_elapsed,
                optimize: optimize_elapsed,
                total: step_started.elapsed(),
            },
        );
        Ok(stats)
    }

    fn check_batch(
        &self,
        queries: &[Tensor],
        responses: &[Tensor],
        scores: &[f32],
    ) -> PpoResult<()> {
        let bs = self.config.batch_size;
        if queries.len() != bs || responses.len() != bs || scores.len() != bs {
            return Err(PpoError::BatchMismatch {
                expected: bs,
                queries: queries.len(),
                responses: responses.len(),
                scores: scores.len(),
            });
        }
        for (i, query) in queries.iter().enumerate() {
            if query.dims().len() != 1 || query.dim(0)? == 0 {
                return Err(PpoError::Config(format!(
                    "query {} must be a non-empty 1-D token tensor",
                    i
                )));
            }
        }
        for (i, response) in responses.iter().enumerate() {
            let len = if response.dims().len() == 1 {
                response.dim(0)?
            } else {
                0
            };
            if len == 0 || len >= self.config.txt_out_max {
                return Err(PpoError::ResponseLength {
                    index: i,
                    len,
                    max: self.config.txt_out_max,
                });
            }
        }
        for (i, &score) in scores.iter().enumerate() {
            if !score.is_finite() {
                return Err(PpoError::NonFiniteReward {
                    index: i,
                    value: score as f64,
                });
            }
        }
        Ok(())
    }

    /// Rollout-time logprobs, reference logprobs, and values for every
    /// response token, computed in `forward_batch_size` sub-batches.
    ///
    /// The response token at absolute position `pos` was sampled from the
    /// state ending at `pos - 1`, so both its logprob and its value are
    /// read at that state position.
    pub fn batched_forward_pass(
        &self,
        queries: &[Tensor],
        responses: &[Tensor],
    ) -> PpoResult<ForwardPass> {
        let bs = queries.len();
        let fbs = self.config.forward_batch_size.min(bs).max(1);

        let mut logprobs = Vec::with_capacity(bs);
        let mut ref_logprobs = Vec::with_capacity(bs);
        let mut values = Vec::with_capacity(bs);

        for start in (0..bs).step_by(fbs) {
            let end = (start + fbs).min(bs);
            let batch = PaddedBatch::build(
                &queries[start..end],
                &responses[start..end],
                self.pad_token_id,
                &self.device,
            )?;
            let (logits, vals) = self.policy.forward_with_value(&batch.input_ids)?;
            let ref_logits = self.reference.forward(&batch.input_ids)?;
            let logp = ppo::logprobs_from_logits(&logits.detach())?;
            let ref_logp = ppo::logprobs_from_logits(&ref_logits.detach())?;
            let vals = vals.detach();

            for (j, ex) in batch.examples.iter().enumerate() {
                let mut lp = Vec::with_capacity(ex.response_len);
                let mut ref_lp = Vec::with_capacity(ex.response_len);
                let mut vv = Vec::with_capacity(ex.response_len);
                for t in 0..ex.response_len {
                    let pos = ex.query_len + t;
                    let state_pos = pos - 1;
                    let token = ex.ids[pos] as usize;
                    lp.push(logp.i((j, state_pos, token))?.to_scalar::<f32>()?);
                    ref_lp.push(ref_logp.i((j, state_pos, token))?.to_scalar::<f32>()?);
                    vv.push(vals.i((j, state_pos))?.to_scalar::<f32>()?);
                }
                logprobs.push(lp);
                ref_logprobs.push(ref_lp);
                values.push(vv);
            }
        }

        Ok(ForwardPass {
            logprobs,
            ref_logprobs,
            values,
        })
    }

    /// Recompute logprobs and values for one minibatch with gradients,
    /// build the clipped losses, and take one AdamW step.
    #[allow(clippy::too_many_arguments)]
    fn train_minibatch(
        &mut self,
        chunk: &[usize],
        queries: &[Tensor],
        responses: &[Tensor],
        old: &ForwardPass,
        advantages: &[Vec<f32>],
        returns: &[Vec<f32>],
        minibatch_index: usize,
    ) -> PpoResult<MinibatchStats> {
        let selected_queries: Vec<Tensor> =
            chunk.iter().map(|&i| queries[i].clone()).collect();
        let selected_responses: Vec<Tensor> =
            chunk.iter().map(|&i| responses[i].clone()).collect();
        let batch = PaddedBatch::build(
            &selected_queries,
            &selected_responses,
            self.pad_token_id,
            &self.device,
        )?;

        let (logits, vals) = self.policy.forward_with_value(&batch.input_ids)?;
        let logp = ppo::logprobs_from_logits(&logits)?;

        let cliprange = self.config.cliprange;
        let cliprange_value = self.config.cliprange_value;

        let mut pg_sum = Tensor::new(0.0f32, &self.device)?;
        let mut vf_sum = Tensor::new(0.0f32, &self.device)?;
        let mut stats = MinibatchStats::default();
        let mut n_tokens = 0usize;

        for (j, &i) in chunk.iter().enumerate() {
            let ex = &batch.examples[j];
            for t in 0..ex.response_len {
                let pos = ex.query_len + t;
                let state_pos = pos - 1;
                let token = ex.ids[pos] as usize;

                let old_logprob = old.logprobs[i][t] as f64;
                let old_value = old.values[i][t] as f64;
                let advantage = advantages[i][t] as f64;
                let ret = returns[i][t] as f64;

                // Policy term.
                let new_logprob = logp.i((j, state_pos, token))?;
                let ratio = ((&new_logprob - old_logprob)?).exp()?;
                let unclipped = (&ratio * (-advantage))?;
                let clipped =
                    (ratio.clamp(1.0 - cliprange, 1.0 + cliprange)? * (-advantage))?;
                pg_sum = (&pg_sum + &unclipped.maximum(&clipped)?)?;

                // Value term.
                let vpred = vals.i((j, state_pos))?;
                let vpred_clipped =
                    vpred.clamp(old_value - cliprange_value, old_value + cliprange_value)?;
                let err = ((&vpred - ret)?).sqr()?;
                let err_clipped = ((&vpred_clipped - ret)?).sqr()?;
                vf_sum = (&vf_sum + &err.maximum(&err_clipped)?)?;

                // Host-side mirrors for diagnostics.
                let new_logprob_val = new_logprob.detach().to_scalar::<f32>()? as f64;
                let ratio_val = (new_logprob_val - old_logprob).exp();
                let (_, pg_clipped) = ppo::surrogate_terms(ratio_val, advantage, cliprange);
                let vpred_val = vpred.detach().to_scalar::<f32>()? as f64;
                let (_, vf_clipped) =
                    ppo::value_loss_terms(vpred_val, old_value, ret, cliprange_value);

                stats.approx_kl += 0.5 * (new_logprob_val - old_logprob).powi(2);
                stats.policy_kl += new_logprob_val - old_logprob;
                stats.clipfrac += pg_clipped as usize as f64;
                stats.value_clipfrac += vf_clipped as usize as f64;
                stats.value_error += (vpred_val - ret).powi(2);
                stats.entropy += ppo::entropy_from_logprob_row(&logp.i((j, state_pos))?)?;
                n_tokens += 1;
            }
        }

        let n = n_tokens as f64;
        let pg_loss = (&pg_sum / n)?;
        let vf_loss = ((&vf_sum / n)? * 0.5)?;
        let loss = (&pg_loss + &(&vf_loss * self.config.vf_coef)?)?;

        let loss_val = loss.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            return Err(PpoError::NonFinite {
                what: "total loss".to_string(),
                step: self.step_index,
                minibatch: minibatch_index,
            });
        }
        self.optimizer.backward_step(&loss)?;

        stats.policy_loss = pg_loss.to_scalar::<f32>()? as f64;
        stats.value_loss = vf_loss.to_scalar::<f32>()? as f64;
        stats.approx_kl /= n;
        stats.policy_kl /= n;
        stats.clipfrac /= n;
        stats.value_clipfrac /= n;
        stats.value_error /= n;
        stats.entropy /= n;
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_stats(
        &self,
        scores: &[f32],
        kl_coef: f64,
        objective_kl: f64,
        non_score_sums: &[f64],
        advantages: &[Vec<f32>],
        returns: &[Vec<f32>],
        minibatch_stats: &[MinibatchStats],
        timing: StepTiming,
    ) -> StepStats {
        let bs = scores.len() as f64;
        let reward_mean = scores.iter().map(|&s| s as f64).sum::<f64>() / bs;
        let reward_std = (scores
            .iter()
            .map(|&s| (s as f64 - reward_mean).powi(2))
            .sum::<f64>()
            / bs)
            .sqrt();

        let flat_returns: Vec<f64> = returns
            .iter()
            .flat_map(|g| g.iter())
            .map(|&r| r as f64)
            .collect();
        let n_ret = flat_returns.len().max(1) as f64;
        let returns_mean = flat_returns.iter().sum::<f64>() / n_ret;
        let returns_var = flat_returns
            .iter()
            .map(|r| (r - returns_mean).powi(2))
            .sum::<f64>()
            / n_ret;

        let n_mb = minibatch_stats.len().max(1) as f64;
        let mb_mean = |f: fn(&MinibatchStats) -> f64| -> f64 {
            minibatch_stats.iter().map(f).sum::<f64>() / n_mb
        };
        let value_error = mb_mean(|s| s.value_error);

        StepStats {
            reward_mean,
            reward_std,
            objective_kl,
            kl_coef,
            mean_non_score_reward: non_score_sums.iter().sum::<f64>() / bs,
            policy_loss: mb_mean(|s| s.policy_loss),
            value_loss: mb_mean(|s| s.value_loss),
            entropy: mb_mean(|s| s.entropy),
            approx_kl: mb_mean(|s| s.approx_kl),
            policy_kl: mb_mean(|s| s.policy_kl),
            clipfrac: mb_mean(|s| s.clipfrac),
            value_clipfrac: mb_mean(|s| s.value_clipfrac),
            returns_mean,
            returns_var,
            value_error,
            explained_variance: 1.0 - value_error / (returns_var + 1e-8),
            rewards: scores.to_vec(),
            advantages: advantages
                .iter()
                .map(|g| g.iter().sum::<f32>() / g.len().max(1) as f32)
                .collect(),
            timing,
        }
    }
}
