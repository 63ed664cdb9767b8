//! Uniform length sampling over a half-open interval.

use rand::Rng;

use crate::error::{PpoError, PpoResult};

/// Draws lengths uniformly from `[min, max)`.
///
/// Used for both query truncation and response generation lengths so the
/// policy sees varied context sizes during fine-tuning.
#[derive(Debug, Clone, Copy)]
pub struct LengthSampler {
    min: usize,
    max: usize,
}

impl LengthSampler {
    /// Create a sampler over `[min, max)`. Fails when the interval is empty.
    pub fn new(min: usize, max: usize) -> PpoResult<Self> {
        if min >= max {
            return Err(PpoError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Draw one length from the injected RNG.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        rng.gen_range(self.min..self.max)
    }

    /// The configured `(min, max)` bounds.
    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_empty_interval_rejected() {
        assert!(matches!(
            LengthSampler::new(5, 5),
            Err(PpoError::InvalidRange { min: 5, max: 5 })
        ));
        assert!(LengthSampler::new(8, 2).is_err());
    }

    #[test]
    fn test_samples_stay_in_bounds() {
        let sampler = LengthSampler::new(4, 16).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let len = sampler.sample(&mut rng);
            assert!((4..16).contains(&len));
        }
    }

    #[test]
    fn test_all_values_reachable() {
        let sampler = LengthSampler::new(2, 8);
        let sampler = sampler.unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut counts = [0usize; 8];
        for _ in 0..6_000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        for len in 2..8 {
            // 6000 draws over 6 values: each should appear roughly 1000 times.
            assert!(counts[len] > 700, "length {} drawn {} times", len, counts[len]);
        }
        assert_eq!(counts[0] + counts[1], 0);
    }

    #[test]
    fn test_single_value_interval() {
        let sampler = LengthSampler::new(3, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(sampler.sample(&mut rng), 3);
        }
    }
}
