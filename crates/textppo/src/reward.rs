//! External scoring of generated text.

use std::collections::HashMap;

use crate::error::{PpoError, PpoResult};

/// Label-keyed scores returned by a classifier-style scorer.
#[derive(Debug, Clone, Default)]
pub struct ClassScores {
    scores: HashMap<String, f32>,
}

impl ClassScores {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: Into<String>,
    {
        Self {
            scores: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.scores.get(label).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.scores.keys().map(String::as_str)
    }
}

/// External text scorer collaborator.
pub trait TextScorer {
    /// Score a batch of texts, one `ClassScores` per input, order preserved.
    fn score_batch(&self, texts: &[String]) -> PpoResult<Vec<ClassScores>>;
}

/// Turns scored texts into scalar rewards for a fixed target label.
///
/// Texts are scored in sub-batches of at most `forward_batch_size`, the
/// same chunking the trainer uses for model forwards. Output order always
/// matches input order.
#[derive(Debug)]
pub struct RewardComputer<S> {
    scorer: S,
    target_label: String,
    forward_batch_size: usize,
}

impl<S: TextScorer> RewardComputer<S> {
    pub fn new(
        scorer: S,
        target_label: impl Into<String>,
        forward_batch_size: usize,
    ) -> PpoResult<Self> {
        if forward_batch_size == 0 {
            return Err(PpoError::Config(
                "reward forward_batch_size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            scorer,
            target_label: target_label.into(),
            forward_batch_size,
        })
    }

    /// Score `texts` and extract the target-label scalar for each.
    ///
    /// A missing target label or a wrong-sized scorer response is a scorer
    /// contract violation; a NaN/Inf score is a fatal input error.
    pub fn compute(&self, texts: &[String]) -> PpoResult<Vec<f32>> {
        let mut rewards = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.forward_batch_size) {
            let scored = self.scorer.score_batch(chunk)?;
            if scored.len() != chunk.len() {
                return Err(PpoError::Scorer(format!(
                    "scorer returned {} results for {} texts",
                    scored.len(),
                    chunk.len()
                )));
            }
            for scores in &scored {
                let value = scores.get(&self.target_label).ok_or_else(|| {
                    PpoError::Scorer(format!(
                        "scorer output missing target label '{}' (has: {})",
                        self.target_label,
                        scores.labels().collect::<Vec<_>>().join(", ")
                    ))
                })?;
                if !value.is_finite() {
                    return Err(PpoError::NonFiniteReward {
                        index: rewards.len(),
                        value: value as f64,
                    });
                }
                rewards.push(value);
            }
        }
        Ok(rewards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Scores each text by its length; records the chunk sizes it saw.
    struct LengthScorer {
        chunks_seen: RefCell<Vec<usize>>,
    }

    impl LengthScorer {
        fn new() -> Self {
            Self {
                chunks_seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl TextScorer for LengthScorer {
        fn score_batch(&self, texts: &[String]) -> PpoResult<Vec<ClassScores>> {
            self.chunks_seen.borrow_mut().push(texts.len());
            Ok(texts
                .iter()
                .map(|t| {
                    let s = t.len() as f32;
                    ClassScores::from_pairs([("POSITIVE", s), ("NEGATIVE", -s)])
                })
                .collect())
        }
    }

    struct NoLabelScorer;

    impl TextScorer for NoLabelScorer {
        fn score_batch(&self, texts: &[String]) -> PpoResult<Vec<ClassScores>> {
            Ok(texts
                .iter()
                .map(|_| ClassScores::from_pairs([("OTHER", 0.5f32)]))
                .collect())
        }
    }

    struct NanScorer;

    impl TextScorer for NanScorer {
        fn score_batch(&self, texts: &[String]) -> PpoResult<Vec<ClassScores>> {
            Ok(texts
                .iter()
                .map(|_| ClassScores::from_pairs([("POSITIVE", f32::NAN)]))
                .collect())
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| "x".repeat(i + 1)).collect()
    }

    #[test]
    fn test_sub_batching_preserves_order() {
        let computer = RewardComputer::new(LengthScorer::new(), "POSITIVE", 3).unwrap();
        let rewards = computer.compute(&texts(8)).unwrap();
        assert_eq!(rewards, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(*computer.scorer.chunks_seen.borrow(), vec![3, 3, 2]);
    }

    #[test]
    fn test_negative_label_selection() {
        let computer = RewardComputer::new(LengthScorer::new(), "NEGATIVE", 4).unwrap();
        let rewards = computer.compute(&texts(2)).unwrap();
        assert_eq!(rewards, vec![-1.0, -2.0]);
    }

    #[test]
    fn test_missing_label_is_scorer_error() {
        let computer = RewardComputer::new(NoLabelScorer, "POSITIVE", 4).unwrap();
        let err = computer.compute(&texts(2));
        match err {
            Err(PpoError::Scorer(msg)) => assert!(msg.contains("POSITIVE")),
            other => panic!("expected scorer error, got {:?}", other),
        }
    }

    #[test]
    fn test_nan_reward_is_fatal() {
        let computer = RewardComputer::new(NanScorer, "POSITIVE", 4).unwrap();
        assert!(matches!(
            computer.compute(&texts(1)),
            Err(PpoError::NonFiniteReward { index: 0, .. })
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(RewardComputer::new(NanScorer, "POSITIVE", 0).is_err());
    }
}
