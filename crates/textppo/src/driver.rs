//! Training loop orchestration.
//!
//! One iteration: draw dataset records, truncate queries to a sampled
//! length, generate responses, decode, score, run the PPO step, and emit a
//! structured record. Collaborator failures propagate to the caller; this
//! layer never retries.

use std::path::Path;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

use crate::checkpoint::{self, TrainerMeta};
use crate::error::{IoResultExt, PpoError, PpoResult};
use crate::policy::{PolicyModel, ReferencePolicy, TextDecoder};
use crate::reward::{RewardComputer, TextScorer};
use crate::rollout::RolloutGenerator;
use crate::sampler::LengthSampler;
use crate::trainer::{PpoTrainer, StepStats};

/// One dataset entry: the original text and its token ids.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub text: String,
    pub ids: Vec<u32>,
}

/// Source of training queries.
pub trait QuerySource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Draw `n` records using the injected RNG.
    fn sample_batch(&mut self, n: usize, rng: &mut StdRng) -> PpoResult<Vec<QueryRecord>>;
}

/// In-memory query source drawing uniformly with replacement.
#[derive(Debug, Clone)]
pub struct VecQuerySource {
    records: Vec<QueryRecord>,
}

impl VecQuerySource {
    pub fn new(records: Vec<QueryRecord>) -> PpoResult<Self> {
        if records.is_empty() {
            return Err(PpoError::Config("query source has no records".to_string()));
        }
        if let Some(bad) = records.iter().position(|r| r.ids.is_empty()) {
            return Err(PpoError::Config(format!(
                "query record {} has no tokens",
                bad
            )));
        }
        Ok(Self { records })
    }
}

impl QuerySource for VecQuerySource {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn sample_batch(&mut self, n: usize, rng: &mut StdRng) -> PpoResult<Vec<QueryRecord>> {
        Ok((0..n)
            .map(|_| self.records[rng.gen_range(0..self.records.len())].clone())
            .collect())
    }
}

/// One query / response / reward row of a step.
#[derive(Debug, Clone)]
pub struct RolloutRow {
    pub query: String,
    pub response: String,
    pub reward: f32,
}

/// Everything produced by one training step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: usize,
    pub rows: Vec<RolloutRow>,
    pub stats: StepStats,
}

/// Receives per-step records.
pub trait LogSink {
    fn log_step(&mut self, record: &StepRecord);
}

/// Default sink forwarding records to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_step(&mut self, record: &StepRecord) {
        crate::logging::log_ppo_step(record);
    }
}

/// Run the full training loop, then persist policy weights, the text
/// codec, and trainer metadata into `output_dir` (when given).
#[allow(clippy::too_many_arguments)]
pub fn run_training<P, R, S, Q, D, L>(
    trainer: &mut PpoTrainer<P, R>,
    source: &mut Q,
    decoder: &D,
    rewarder: &RewardComputer<S>,
    rollouts: &RolloutGenerator,
    sink: &mut L,
    rng: &mut StdRng,
    output_dir: Option<&Path>,
) -> PpoResult<()>
where
    P: PolicyModel,
    R: ReferencePolicy,
    S: TextScorer,
    Q: QuerySource,
    D: TextDecoder,
    L: LogSink,
{
    let config = trainer.config().clone();
    let in_len = LengthSampler::new(config.txt_in_min, config.txt_in_max)?;
    let device = trainer.device().clone();

    for _ in 0..config.steps {
        let step = trainer.step_index();
        let records = source.sample_batch(config.batch_size, rng)?;

        let mut queries = Vec::with_capacity(records.len());
        let mut query_texts = Vec::with_capacity(records.len());
        for record in &records {
            let want = in_len.sample(rng);
            let query_len = want.min(record.ids.len());
            let ids = &record.ids[..query_len];
            query_texts.push(decoder.decode(ids)?);
            queries.push(Tensor::new(ids, &device)?);
        }

        let responses = rollouts.generate_batch(trainer.policy(), &queries, rng)?;

        let mut response_texts = Vec::with_capacity(responses.len());
        let mut texts = Vec::with_capacity(responses.len());
        for (query_text, response) in query_texts.iter().zip(&responses) {
            let response_ids = response.to_vec1::<u32>()?;
            let response_text = decoder.decode(&response_ids)?;
            texts.push(format!("{}{}", query_text, response_text));
            response_texts.push(response_text);
        }

        let scores = rewarder.compute(&texts)?;
        let stats = trainer.step(&queries, &responses, &scores)?;

        let rows = query_texts
            .into_iter()
            .zip(response_texts)
            .zip(&scores)
            .map(|((query, response), &reward)| RolloutRow {
                query,
                response,
                reward,
            })
            .collect();
        sink.log_step(&StepRecord { step, rows, stats });
    }

    if let Some(dir) = output_dir {
        persist(trainer, decoder, dir)?;
    }
    Ok(())
}

/// Save policy weights, the text codec, and trainer metadata into `dir`.
pub fn persist<P: PolicyModel, R, D: TextDecoder>(
    trainer: &PpoTrainer<P, R>,
    decoder: &D,
    dir: &Path,
) -> PpoResult<()> {
    std::fs::create_dir_all(dir).with_path(dir)?;
    trainer.policy().save(dir)?;
    decoder.save(dir)?;
    checkpoint::save_meta(
        dir,
        &TrainerMeta {
            config: trainer.config().clone(),
            step: trainer.step_index(),
            kl_ctl: trainer.kl_controller().clone(),
        },
    )?;
    crate::logging::log_checkpoint_save(trainer.step_index(), &dir.display().to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn record(text: &str, ids: &[u32]) -> QueryRecord {
        QueryRecord {
            text: text.to_string(),
            ids: ids.to_vec(),
        }
    }

    #[test]
    fn test_vec_source_rejects_empty() {
        assert!(VecQuerySource::new(vec![]).is_err());
        assert!(VecQuerySource::new(vec![record("x", &[])]).is_err());
    }

    #[test]
    fn test_vec_source_draws_requested_count() {
        let mut source = VecQuerySource::new(vec![
            record("a", &[1]),
            record("b", &[2, 3]),
            record("c", &[4, 5, 6]),
        ])
        .unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let batch = source.sample_batch(16, &mut rng).unwrap();
        assert_eq!(batch.len(), 16);
        for r in &batch {
            assert!(!r.ids.is_empty());
        }
    }
}
