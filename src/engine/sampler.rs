//! Token sampling strategies.
//!
//! This module provides sampling methods for selecting the next token
//! from a probability distribution:
//!
//! - **Arg-max** when sampling is disabled (or temperature is 0)
//! - **Temperature**: Controls randomness (lower = more deterministic)
//! - **Top-k**: Limits choices to k most likely tokens
//! - **Top-p (nucleus)**: Limits choices to tokens covering p probability mass
//!
//! ## Sampling Pipeline
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Temperature scaling
//! Logits / temperature
//!     │
//!     ▼ Top-k filtering (optional)
//! Keep top k tokens
//!     │
//!     ▼ Softmax
//! Probabilities
//!     │
//!     ▼ Top-p filtering (optional)
//! Cumulative prob ≤ p
//!     │
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use candle_core::{DType, Tensor, D};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Token sampler with configurable sampling strategies.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Arg-max when false.
    do_sample: bool,
    /// Temperature for scaling logits.
    temperature: f32,
    /// Top-k value (0 = disabled).
    top_k: usize,
    /// Top-p value (1.0 = disabled).
    top_p: f32,
    /// Random number generator.
    rng: StdRng,
}

impl Sampler {
    /// Creates a sampler seeded from the config, or from entropy without a seed.
    pub fn new(config: &SamplingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            do_sample: config.do_sample,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Creates a new sampler with a specific seed for reproducibility.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self::new(&SamplingConfig {
            seed: Some(seed),
            ..config.clone()
        })
    }

    /// Reseeds the generator.
    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Sample a token from 1D logits `[vocab_size]`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        if logits.rank() != 1 {
            return Err(Error::InvariantViolation(format!(
                "expected 1D logits, got shape {:?}",
                logits.dims()
            )));
        }
        let logits = logits.to_dtype(DType::F32)?;
        let vocab_size = logits.dim(0)?;

        if !self.do_sample || self.temperature <= 0.0 {
            return self.argmax(&logits);
        }

        // Apply temperature
        let logits = if self.temperature != 1.0 {
            (logits / self.temperature as f64)?
        } else {
            logits
        };

        // Apply top-k filtering
        let (logits, indices) = if self.top_k > 0 && self.top_k < vocab_size {
            self.apply_top_k(&logits, self.top_k)?
        } else {
            (logits.to_vec1::<f32>()?, (0..vocab_size as u32).collect())
        };

        // Compute probabilities with softmax
        let probs = Tensor::new(logits.as_slice(), &candle_core::Device::Cpu)?;
        let probs: Vec<f32> = candle_nn::ops::softmax(&probs, D::Minus1)?.to_vec1()?;

        // Apply top-p filtering
        let (probs, indices) = if self.top_p < 1.0 && self.top_p > 0.0 {
            Self::apply_top_p(&probs, &indices, self.top_p)
        } else {
            (probs, indices)
        };

        // Sample from the distribution
        self.sample_from_probs(&probs, &indices)
    }

    /// Greedy decoding: select the token with highest logit.
    fn argmax(&self, logits: &Tensor) -> Result<u32> {
        Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
    }

    /// Keep only the k tokens with highest logits, as (logits, ids).
    fn apply_top_k(&self, logits: &Tensor, k: usize) -> Result<(Vec<f32>, Vec<u32>)> {
        let logits_vec: Vec<f32> = logits.to_vec1()?;
        let mut indexed: Vec<(usize, f32)> = logits_vec.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(k);

        let indices = indexed.iter().map(|(i, _)| *i as u32).collect();
        let values = indexed.iter().map(|(_, v)| *v).collect();
        Ok((values, indices))
    }

    /// Keep tokens until cumulative probability exceeds p.
    fn apply_top_p(probs: &[f32], indices: &[u32], p: f32) -> (Vec<f32>, Vec<u32>) {
        // Sort by probability (descending)
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        // Find cutoff where cumulative prob exceeds p
        let mut cumulative = 0.0f32;
        let mut cutoff = indexed.len();
        for (i, (_, prob)) in indexed.iter().enumerate() {
            cumulative += prob;
            if cumulative > p {
                cutoff = i + 1; // Include the token that pushed us over
                break;
            }
        }
        indexed.truncate(cutoff);

        let new_probs = indexed.iter().map(|(_, v)| *v).collect();
        let new_indices = indexed.iter().map(|(i, _)| indices[*i]).collect();
        (new_probs, new_indices)
    }

    /// Sample from probability distribution using the stored RNG.
    fn sample_from_probs(&mut self, probs: &[f32], indices: &[u32]) -> Result<u32> {
        let dist = rand::distributions::WeightedIndex::new(probs)
            .map_err(|e| Error::InvariantViolation(format!("bad sampling distribution: {e}")))?;
        Ok(indices[dist.sample(&mut self.rng)])
    }
}
