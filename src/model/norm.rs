//! Normalization layers.
//!
//! Two flavors are supported and selected by [`NormKind`]:
//!
//! - **RMSNorm** rescales by the root mean square without centering.
//!   Reference: <https://arxiv.org/abs/1910.07467>
//! - **LayerNorm** centers, rescales and adds a learned bias.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use crate::config::NormKind;

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [hidden_size].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Creates a new RmsNorm layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - Learnable scale tensor of shape [hidden_size]
    /// * `eps` - Small constant for numerical stability (typically 1e-6)
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Creates a new RmsNorm layer with ones as weights.
    pub fn new_ones(
        hidden_size: usize,
        eps: f64,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Loads `weight` from the given VarBuilder prefix.
    pub fn load(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        Ok(Self { weight, eps })
    }

    /// Returns a reference to the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Returns the epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Applies RMS normalization over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Statistics in f32 regardless of the weight dtype
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        // mean(x^2) -> [..., 1]
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;

        let normalized = x.broadcast_div(&rms)?.to_dtype(dtype)?;
        normalized.broadcast_mul(&self.weight)
    }
}

/// Normalization selected by the model configuration.
#[derive(Debug, Clone)]
pub enum Norm {
    Rms(RmsNorm),
    Layer(LayerNorm),
}

impl Norm {
    /// Loads a norm of the given kind. LayerNorm expects `weight` and `bias`.
    pub fn load(kind: NormKind, hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        match kind {
            NormKind::RmsNorm => Ok(Self::Rms(RmsNorm::load(hidden_size, eps, vb)?)),
            NormKind::LayerNorm => Ok(Self::Layer(candle_nn::layer_norm(hidden_size, eps, vb)?)),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Rms(norm) => norm.forward(x),
            Self::Layer(norm) => norm.forward(x),
        }
    }
}

/// Tensor names a norm of `kind` reads under `prefix`.
pub(crate) fn norm_params(kind: NormKind, prefix: &str, hidden_size: usize) -> Vec<(String, Vec<usize>)> {
    let mut params = vec![(format!("{prefix}.weight"), vec![hidden_size])];
    if kind == NormKind::LayerNorm {
        params.push((format!("{prefix}.bias"), vec![hidden_size]));
    }
    params
}
