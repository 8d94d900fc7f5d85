//! Positional encoding strategies selected per layer configuration.

use candle_core::{Result, Tensor};

use super::alibi::AlibiBias;
use super::rope::RotaryEmbedding;
use crate::config::{ModelConfig, PositionalConfig};

/// Where a forward pass sits in the sequence.
///
/// `n_past` counts cached rows (cache coordinates). `n_past_offset` counts
/// positions evicted by shifting, so `n_past + n_past_offset + i` is the
/// logical position of the `i`-th new token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionContext {
    /// Valid cached positions.
    pub n_past: usize,
    /// Cumulative positions discarded by shifting.
    pub n_past_offset: usize,
}

impl PositionContext {
    pub fn new(n_past: usize, n_past_offset: usize) -> Self {
        Self {
            n_past,
            n_past_offset,
        }
    }

    /// Logical positions of `qlen` new tokens.
    pub fn logical_positions(&self, qlen: usize) -> Vec<usize> {
        let start = self.n_past + self.n_past_offset;
        (start..start + qlen).collect()
    }
}

/// Score-time positional strategy of an attention layer.
///
/// Learned absolute embeddings act on the model input, not on the scores, so
/// they map to [`PositionalEncoding::None`] here.
#[derive(Debug, Clone)]
pub enum PositionalEncoding {
    /// Rotate Q and K by logical position.
    Rotary(RotaryEmbedding),
    /// Add a per-head linear distance bias to the scores.
    Alibi(AlibiBias),
    /// No score-time transform.
    None,
}

impl PositionalEncoding {
    /// Strategy for the given model configuration.
    pub fn from_config(config: &ModelConfig) -> Self {
        match &config.positional {
            PositionalConfig::Rotary { theta, scaling } => {
                Self::Rotary(
                    RotaryEmbedding::new(config.head_dim(), *theta, scaling.clone())
                        .with_max_length(config.max_length),
                )
            }
            PositionalConfig::Alibi { max_bias } => {
                Self::Alibi(AlibiBias::new(config.num_attention_heads, *max_bias))
            }
            PositionalConfig::LearnedAbsolute { .. } | PositionalConfig::None => Self::None,
        }
    }

    /// Rotates Q and K when the strategy is rotary; otherwise returns them unchanged.
    pub fn apply_qk(&self, q: &Tensor, k: &Tensor, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Rotary(rope) => rope.apply(q, k, positions),
            Self::Alibi(_) | Self::None => Ok((q.clone(), k.clone())),
        }
    }

    /// ALiBi slopes, if any.
    pub fn alibi(&self) -> Option<&AlibiBias> {
        match self {
            Self::Alibi(alibi) => Some(alibi),
            _ => None,
        }
    }
}

/// Scales queries by `log(pos) / log(trained_length)` past the trained length.
#[derive(Debug, Clone, Copy)]
pub struct LognScaling {
    trained_length: usize,
}

impl LognScaling {
    pub fn new(trained_length: usize) -> Self {
        Self { trained_length }
    }

    /// Multiplier for a logical position.
    pub fn factor(&self, pos: usize) -> f32 {
        if pos > self.trained_length && self.trained_length > 1 {
            ((pos as f64).ln() / (self.trained_length as f64).ln()) as f32
        } else {
            1.0
        }
    }

    /// Scales each row of `q` `[qlen, num_heads, head_dim]`.
    pub fn apply(&self, q: &Tensor, positions: &[usize]) -> Result<Tensor> {
        if positions.iter().all(|&p| p <= self.trained_length) {
            return Ok(q.clone());
        }
        let factors: Vec<f32> = positions.iter().map(|&p| self.factor(p)).collect();
        let factors = Tensor::from_vec(factors, (positions.len(), 1, 1), q.device())?
            .to_dtype(q.dtype())?;
        q.broadcast_mul(&factors)
    }
}
