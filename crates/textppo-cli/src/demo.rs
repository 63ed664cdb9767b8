//! Self-contained demo stack for smoke runs: a tiny token-local language
//! model, a frozen copy of it, a word-list codec, and a lexicon scorer.
//!
//! This exists so the training loop can be exercised end to end on a CPU
//! in seconds; it is a fixture, not a model offering.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, Module, VarBuilder, VarMap};
use rand::rngs::StdRng;

use textppo::driver::QueryRecord;
use textppo::policy::{PolicyModel, ReferencePolicy, SamplingConfig, TextDecoder};
use textppo::reward::{ClassScores, TextScorer};
use textppo::rollout::sample_from_logits;
use textppo::{PpoError, PpoResult};

pub const WORDS: [&str; 16] = [
    "the",
    "movie",
    "was",
    "great",
    "terrible",
    "plot",
    "acting",
    "boring",
    "brilliant",
    "fun",
    "dull",
    "loved",
    "hated",
    "a",
    "masterpiece",
    "mess",
];

const POSITIVE_WORDS: [&str; 5] = ["great", "brilliant", "fun", "loved", "masterpiece"];
const NEGATIVE_WORDS: [&str; 5] = ["terrible", "boring", "dull", "hated", "mess"];

const DIM: usize = 16;

/// Whitespace word-list codec over the demo vocabulary.
pub struct DemoCodec;

impl DemoCodec {
    pub fn encode(&self, text: &str) -> PpoResult<Vec<u32>> {
        text.split_whitespace()
            .map(|word| {
                WORDS
                    .iter()
                    .position(|&w| w == word)
                    .map(|i| i as u32)
                    .ok_or_else(|| {
                        PpoError::Tokenizer(format!("word '{}' not in demo vocabulary", word))
                    })
            })
            .collect()
    }
}

impl TextDecoder for DemoCodec {
    fn decode(&self, ids: &[u32]) -> PpoResult<String> {
        let words: PpoResult<Vec<&str>> = ids
            .iter()
            .map(|&id| {
                WORDS
                    .get(id as usize)
                    .copied()
                    .ok_or_else(|| PpoError::Tokenizer(format!("token {} out of range", id)))
            })
            .collect();
        Ok(words?.join(" "))
    }

    fn save(&self, dir: &Path) -> PpoResult<()> {
        let json = serde_json::to_string_pretty(&WORDS.to_vec())
            .map_err(|e| PpoError::Tokenizer(e.to_string()))?;
        std::fs::write(dir.join("vocab.json"), json)?;
        Ok(())
    }
}

/// Token-local language model: embedding, tied-size LM head, value head.
/// Logits at position `p` depend only on the token at `p`, so the model
/// is trivially causal.
pub struct DemoPolicy {
    varmap: VarMap,
    embed: Embedding,
    lm_head: Linear,
    value_head: Linear,
}

impl DemoPolicy {
    pub fn new(device: &Device) -> PpoResult<Self> {
        let varmap = VarMap::new();
        let model = Self::build(varmap, device)?;
        Ok(model)
    }

    fn build(varmap: VarMap, device: &Device) -> PpoResult<Self> {
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let embed = embedding(WORDS.len(), DIM, vb.pp("embed"))?;
        let lm_head = linear_no_bias(DIM, WORDS.len(), vb.pp("lm_head"))?;
        let value_head = linear(DIM, 1, vb.pp("value_head"))?;
        Ok(Self {
            varmap,
            embed,
            lm_head,
            value_head,
        })
    }

    pub fn trainable_vars(&self) -> Vec<candle_core::Var> {
        self.varmap.all_vars()
    }

    /// A frozen weight-for-weight copy to serve as the reference policy.
    pub fn clone_frozen(&self, device: &Device) -> PpoResult<DemoReference> {
        let tmp = tempfile::tempdir()?;
        let weights = tmp.path().join("reference.safetensors");
        self.varmap.save(&weights)?;

        let varmap = VarMap::new();
        let mut model = Self::build(varmap, device)?;
        model.varmap.load(&weights)?;
        Ok(DemoReference { model })
    }
}

impl PolicyModel for DemoPolicy {
    fn generate(
        &self,
        query: &Tensor,
        max_new_tokens: usize,
        sampling: &SamplingConfig,
        rng: &mut StdRng,
    ) -> PpoResult<Tensor> {
        let device = query.device().clone();
        let mut ids = query.to_vec1::<u32>()?;
        for _ in 0..max_new_tokens {
            let input = Tensor::new(ids.as_slice(), &device)?.unsqueeze(0)?;
            let (logits, _values) = self.forward_with_value(&input)?;
            let last = logits.i((0, ids.len() - 1))?.to_vec1::<f32>()?;
            let (token, _logprob) = sample_from_logits(&last, sampling.temperature, rng);
            ids.push(token);
        }
        Ok(Tensor::new(ids.as_slice(), &device)?)
    }

    fn forward_with_value(&self, input_ids: &Tensor) -> PpoResult<(Tensor, Tensor)> {
        let hidden = self.embed.forward(input_ids)?;
        let logits = self.lm_head.forward(&hidden)?;
        let values = self.value_head.forward(&hidden)?.squeeze(D::Minus1)?;
        Ok((logits, values))
    }

    fn save(&self, dir: &Path) -> PpoResult<()> {
        self.varmap.save(dir.join("model.safetensors"))?;
        Ok(())
    }
}

pub struct DemoReference {
    model: DemoPolicy,
}

impl ReferencePolicy for DemoReference {
    fn forward(&self, input_ids: &Tensor) -> PpoResult<Tensor> {
        let (logits, _values) = self.model.forward_with_value(input_ids)?;
        Ok(logits.detach())
    }
}

/// Counts positive and negative lexicon words; the difference becomes the
/// POSITIVE score and its negation the NEGATIVE score.
pub struct LexiconScorer;

impl TextScorer for LexiconScorer {
    fn score_batch(&self, texts: &[String]) -> PpoResult<Vec<ClassScores>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut score = 0.0f32;
                for word in text.split_whitespace() {
                    if POSITIVE_WORDS.contains(&word) {
                        score += 1.0;
                    } else if NEGATIVE_WORDS.contains(&word) {
                        score -= 1.0;
                    }
                }
                let score = score.clamp(-2.0, 2.0);
                ClassScores::from_pairs([("POSITIVE", score), ("NEGATIVE", -score)])
            })
            .collect())
    }
}

/// Fixed prompt set for smoke runs.
pub fn demo_queries() -> PpoResult<Vec<QueryRecord>> {
    let codec = DemoCodec;
    [
        "the movie was",
        "the plot was",
        "the acting was",
        "a movie was",
    ]
    .iter()
    .map(|&text| {
        Ok(QueryRecord {
            text: text.to_string(),
            ids: codec.encode(text)?,
        })
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_codec_roundtrip() {
        let codec = DemoCodec;
        let ids = codec.encode("the movie was great").unwrap();
        assert_eq!(codec.decode(&ids).unwrap(), "the movie was great");
        assert!(codec.encode("the zebra").is_err());
    }

    #[test]
    fn test_lexicon_scorer_counts_words() {
        let scorer = LexiconScorer;
        let scores = scorer
            .score_batch(&[
                "the movie was great fun".to_string(),
                "a dull mess".to_string(),
                "the plot".to_string(),
            ])
            .unwrap();
        assert_eq!(scores[0].get("POSITIVE"), Some(2.0));
        assert_eq!(scores[1].get("POSITIVE"), Some(-2.0));
        assert_eq!(scores[2].get("POSITIVE"), Some(0.0));
        assert_eq!(scores[0].get("NEGATIVE"), Some(-2.0));
    }

    #[test]
    fn test_policy_shapes_and_generation() {
        let device = Device::Cpu;
        let policy = DemoPolicy::new(&device).unwrap();
        let input = Tensor::new(&[[0u32, 1, 2], [3u32, 4, 5]], &device).unwrap();
        let (logits, values) = policy.forward_with_value(&input).unwrap();
        assert_eq!(logits.dims(), &[2, 3, WORDS.len()]);
        assert_eq!(values.dims(), &[2, 3]);

        let mut rng = StdRng::seed_from_u64(0);
        let query = Tensor::new(&[0u32, 1], &device).unwrap();
        let out = policy
            .generate(&query, 5, &SamplingConfig::default(), &mut rng)
            .unwrap();
        assert_eq!(out.dim(0).unwrap(), 7);
        for id in out.to_vec1::<u32>().unwrap() {
            assert!((id as usize) < WORDS.len());
        }
    }

    #[test]
    fn test_frozen_clone_matches_policy() {
        let device = Device::Cpu;
        let policy = DemoPolicy::new(&device).unwrap();
        let reference = policy.clone_frozen(&device).unwrap();

        let input = Tensor::new(&[[0u32, 5, 9]], &device).unwrap();
        let (logits, _values) = policy.forward_with_value(&input).unwrap();
        let ref_logits = reference.forward(&input).unwrap();

        let diff = (logits - ref_logits)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }
}
