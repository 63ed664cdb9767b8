//! Response generation for a batch of queries.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{PpoError, PpoResult};
use crate::policy::{PolicyModel, SamplingConfig};
use crate::sampler::LengthSampler;

/// Generates one response per query with a freshly sampled target length.
#[derive(Debug, Clone)]
pub struct RolloutGenerator {
    out_len: LengthSampler,
    sampling: SamplingConfig,
}

impl RolloutGenerator {
    pub fn new(out_len: LengthSampler, sampling: SamplingConfig) -> Self {
        Self { out_len, sampling }
    }

    /// Generate responses for `queries`, preserving order.
    ///
    /// Each response is truncated to the last `gen_len` tokens of whatever
    /// the policy returned, which strips any echoed prompt. A policy
    /// returning fewer tokens than requested is a generation failure and
    /// aborts the whole batch.
    pub fn generate_batch<P: PolicyModel>(
        &self,
        policy: &P,
        queries: &[Tensor],
        rng: &mut StdRng,
    ) -> PpoResult<Vec<Tensor>> {
        let mut responses = Vec::with_capacity(queries.len());
        for query in queries {
            let gen_len = self.out_len.sample(rng);
            let out = policy.generate(query, gen_len, &self.sampling, rng)?;
            let n = out.dim(0)?;
            if n < gen_len {
                return Err(PpoError::Generation(format!(
                    "policy returned {} tokens, {} requested",
                    n, gen_len
                )));
            }
            responses.push(out.narrow(0, n - gen_len, gen_len)?);
        }
        Ok(responses)
    }
}

/// Draw one token from a logits row by full-vocabulary multinomial
/// sampling. Returns the token and its post-softmax log-probability.
///
/// Shared by policy implementations and tests; temperature is floored so
/// a zero temperature cannot produce NaNs.
///
/// # Panics
///
/// Panics if `logits` is empty; a vocabulary has at least one token.
pub fn sample_from_logits(logits: &[f32], temperature: f64, rng: &mut StdRng) -> (u32, f64) {
    assert!(!logits.is_empty(), "logits row must be non-empty");
    let temp = temperature.max(0.05) as f32;

    let mut max_logit = f32::NEG_INFINITY;
    for &l in logits {
        max_logit = max_logit.max(l / temp);
    }

    let mut probs: Vec<f64> = Vec::with_capacity(logits.len());
    let mut sum = 0.0f64;
    for &l in logits {
        let p = (((l / temp) - max_logit) as f64).exp();
        probs.push(p);
        sum += p;
    }

    let r: f64 = rng.gen::<f64>() * sum;
    let mut cumulative = 0.0f64;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return (i as u32, (p / sum).ln());
        }
    }
    // Floating point slack: fall back to the last token.
    let last = probs.len() - 1;
    (last as u32, (probs[last] / sum).ln())
}
