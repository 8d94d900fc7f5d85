//! Rotary Position Embeddings (RoPE) with frequency rescaling.
//!
//! RoPE encodes position information by rotating pairs of elements in the
//! query and key vectors. Angles are computed per logical position rather
//! than read from a fixed table, so positions that grow past the cache
//! capacity (after shifting) stay valid, and dynamic NTK can pick
//! frequencies from the length reached at each position.
//!
//! SU scaling picks its short or long factor table once, from the configured
//! context length. Switching tables per position breaks the model.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{Device, Result, Tensor};

use crate::config::RopeScaling;

/// Rotary Position Embedding.
///
/// Key insight: `dot(rotate(q, pos_q), rotate(k, pos_k))` depends on
/// `pos_q - pos_k`, naturally capturing relative position.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Head dimension (must be even for rotation pairs).
    dim: usize,
    /// Frequency base.
    theta: f64,
    /// Unscaled inverse frequencies `1 / theta^(2i/dim)`.
    inv_freq: Vec<f64>,
    scaling: RopeScaling,
    /// Configured context length; selects the SU factor table.
    max_length: usize,
}

impl RotaryEmbedding {
    /// Creates a new RotaryEmbedding.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even, checked by `ModelConfig::validate`)
    /// * `theta` - Base frequency (typically 10000)
    /// * `scaling` - Optional inverse-frequency rescaling
    pub fn new(dim: usize, theta: f64, scaling: RopeScaling) -> Self {
        let inv_freq = Self::base_inv_freq(dim, theta);
        Self {
            dim,
            theta,
            inv_freq,
            scaling,
            max_length: 0,
        }
    }

    /// Sets the context length the model is configured for.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn base_inv_freq(dim: usize, theta: f64) -> Vec<f64> {
        (0..dim / 2)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64))
            .collect()
    }

    /// Returns the head dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Inverse frequencies in effect once the sequence has `seq_len` positions.
    pub fn inv_freq(&self, seq_len: usize) -> Vec<f64> {
        let dim = self.dim as f64;
        match &self.scaling {
            RopeScaling::None => self.inv_freq.clone(),
            RopeScaling::NtkDynamic { trained_length } => {
                if seq_len <= *trained_length {
                    return self.inv_freq.clone();
                }
                let ratio = seq_len as f64 / *trained_length as f64;
                let alpha = (2f64.powf((ratio.log2() + 1.0).ceil()) - 1.0).max(1.0);
                let base = self.theta * alpha.powf(dim / (dim - 2.0));
                Self::base_inv_freq(self.dim, base)
            }
            RopeScaling::NtkMixed { factor, power } => {
                let a = factor.ln() / (dim / 2.0).powf(*power);
                self.inv_freq
                    .iter()
                    .enumerate()
                    .map(|(i, f)| f / (a * ((i + 1) as f64).powf(*power)).exp())
                    .collect()
            }
            RopeScaling::Su {
                original_max_position_embeddings,
                short_factor,
                long_factor,
                ..
            } => {
                let factors = if self.max_length > *original_max_position_embeddings {
                    long_factor
                } else {
                    short_factor
                };
                self.inv_freq
                    .iter()
                    .zip(factors)
                    .map(|(f, &s)| f / s as f64)
                    .collect()
            }
        }
    }

    /// Cosine and sine tables `[positions.len(), dim]` for the given positions.
    ///
    /// Each row is laid out as `[freq_0 .. freq_{dim/2-1}, freq_0 .. freq_{dim/2-1}]`
    /// to match [`rotate_half`]. SU scaling multiplies both tables by its
    /// `scaling_factor`.
    pub fn cos_sin(&self, positions: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let half = self.dim / 2;
        let mut cos = Vec::with_capacity(positions.len() * self.dim);
        let mut sin = Vec::with_capacity(positions.len() * self.dim);
        let mut inv_freq = Vec::new();
        let mut freq_len = None;
        let magnitude = match &self.scaling {
            RopeScaling::Su { scaling_factor, .. } => *scaling_factor,
            _ => 1.0,
        };

        for &pos in positions {
            let seq_len = pos + 1;
            if freq_len.is_none() || (self.depends_on_length() && freq_len != Some(seq_len)) {
                inv_freq = self.inv_freq(seq_len);
                freq_len = Some(seq_len);
            }
            let row_start = cos.len();
            for f in inv_freq.iter().take(half) {
                let angle = pos as f64 * f;
                cos.push((angle.cos() * magnitude) as f32);
                sin.push((angle.sin() * magnitude) as f32);
            }
            cos.extend_from_within(row_start..row_start + half);
            sin.extend_from_within(row_start..row_start + half);
        }

        let shape = (positions.len(), self.dim);
        Ok((
            Tensor::from_vec(cos, shape, device)?,
            Tensor::from_vec(sin, shape, device)?,
        ))
    }

    fn depends_on_length(&self) -> bool {
        matches!(self.scaling, RopeScaling::NtkDynamic { .. })
    }

    /// Applies rotary embedding to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor [seq_len, num_heads, head_dim]
    /// * `k` - Key tensor [seq_len, num_kv_heads, head_dim]
    /// * `positions` - Logical position of each row
    ///
    /// # Returns
    ///
    /// Tuple of rotated (q, k) tensors with same shapes as input.
    pub fn apply(&self, q: &Tensor, k: &Tensor, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        let (cos, sin) = self.cos_sin(positions, q.device())?;

        // [seq_len, 1, dim] for broadcasting over heads
        let cos = cos.to_dtype(q.dtype())?.unsqueeze(1)?;
        let sin = sin.to_dtype(q.dtype())?.unsqueeze(1)?;

        let q_rot = apply_rotation(q, &cos, &sin)?;
        let k_rot = apply_rotation(k, &cos, &sin)?;

        Ok((q_rot, k_rot))
    }
}

/// `x * cos + rotate_half(x) * sin`
fn apply_rotation(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let x_rotated = rotate_half(x)?;
    let x_cos = x.broadcast_mul(cos)?;
    let x_sin = x_rotated.broadcast_mul(sin)?;
    x_cos.add(&x_sin)
}

/// For input `[x1, x2]` split on the last dimension, produces `[-x2, x1]`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dim(last)? / 2;

    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;

    Tensor::cat(&[&x2.neg()?, &x1], last)
}
