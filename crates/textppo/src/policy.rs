//! Collaborator traits around the language models and the tokenizer.
//!
//! The trainer never sees a concrete architecture: it drives a trainable
//! `PolicyModel`, compares it against a frozen `ReferencePolicy`, and
//! leaves text reconstruction to a `TextDecoder`.

use std::path::Path;

use candle_core::Tensor;
use rand::rngs::StdRng;

use crate::error::{PpoError, PpoResult};

/// Sampling knobs for generation. Token selection is always full-vocabulary
/// multinomial; there is no top-k or nucleus truncation here.
#[derive(Debug, Clone, Copy)]
pub struct SamplingConfig {
    /// Softmax temperature, floored at a small positive value by samplers.
    pub temperature: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

/// The trainable causal language model with a value head.
///
/// `forward_with_value` must be causal: logits and values at position `p`
/// may depend only on tokens `0..=p`. Right-padded batches rely on this.
pub trait PolicyModel {
    /// Autoregressively extend `query` (a 1-D `u32` tensor) by
    /// `max_new_tokens` tokens using multinomial sampling. Implementations
    /// may return either the full `query || response` sequence or just the
    /// continuation; callers keep the trailing `max_new_tokens` tokens.
    fn generate(
        &self,
        query: &Tensor,
        max_new_tokens: usize,
        sampling: &SamplingConfig,
        rng: &mut StdRng,
    ) -> PpoResult<Tensor>;

    /// Forward a `[batch, time]` token tensor, returning
    /// `(logits [batch, time, vocab], values [batch, time])`. Both outputs
    /// participate in autograd.
    fn forward_with_value(&self, input_ids: &Tensor) -> PpoResult<(Tensor, Tensor)>;

    /// Serialize the model weights into `dir`.
    fn save(&self, dir: &Path) -> PpoResult<()>;
}

/// The frozen reference policy. Logits only, never updated.
pub trait ReferencePolicy {
    fn forward(&self, input_ids: &Tensor) -> PpoResult<Tensor>;
}

/// Token ids back to text, plus persistence of the codec itself.
pub trait TextDecoder {
    fn decode(&self, ids: &[u32]) -> PpoResult<String>;

    /// Serialize the codec into `dir` so generations can be decoded later.
    fn save(&self, dir: &Path) -> PpoResult<()>;
}

impl TextDecoder for tokenizers::Tokenizer {
    // Calls go through the Deref target (`TokenizerImpl`); a plain method
    // call here would resolve back to this trait impl and recurse.
    fn decode(&self, ids: &[u32]) -> PpoResult<String> {
        (**self)
            .decode(ids, true)
            .map_err(|e| PpoError::Tokenizer(e.to_string()))
    }

    fn save(&self, dir: &Path) -> PpoResult<()> {
        (**self)
            .save(&dir.join("tokenizer.json"), false)
            .map_err(|e| PpoError::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;

    #[test]
    fn test_default_sampling_is_temperature_one() {
        let sampling = SamplingConfig::default();
        assert_eq!(sampling.temperature, 1.0);
    }

    fn word_tokenizer() -> tokenizers::Tokenizer {
        let vocab: HashMap<String, u32> = [
            ("hello".to_string(), 0u32),
            ("world".to_string(), 1),
            ("[UNK]".to_string(), 2),
        ]
        .into_iter()
        .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        tokenizers::Tokenizer::new(model)
    }

    #[test]
    fn test_tokenizer_decode_adapter() {
        let tokenizer = word_tokenizer();
        let text = TextDecoder::decode(&tokenizer, &[0, 1]).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn test_tokenizer_save_adapter() {
        let tokenizer = word_tokenizer();
        let dir = tempfile::tempdir().unwrap();
        TextDecoder::save(&tokenizer, dir.path()).unwrap();
        assert!(dir.path().join("tokenizer.json").exists());
    }
}
