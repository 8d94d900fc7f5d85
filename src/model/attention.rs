//! Self-attention block: Q/K/V/O projections around a [`CoreAttention`].
//!
//! Projections work on a single sequence `[seq_len, hidden_size]`; the
//! per-head split, positional transform, cache and scoring all live in the
//! core engine.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear_b, Linear, VarBuilder};

use crate::attention::{CoreAttention, ForwardContext};
use crate::config::ModelConfig;
use crate::error::Result;

/// Multi-head self-attention with grouped KV heads.
#[derive(Debug)]
pub struct SelfAttention {
    /// Query projection [hidden_size] -> [num_heads * head_dim].
    q_proj: Linear,
    /// Key projection [hidden_size] -> [num_kv_heads * head_dim].
    k_proj: Linear,
    /// Value projection [hidden_size] -> [num_kv_heads * head_dim].
    v_proj: Linear,
    /// Output projection [num_heads * head_dim] -> [hidden_size].
    o_proj: Linear,
    core: CoreAttention,
}

impl SelfAttention {
    /// Loads the projections and creates the layer's attention engine.
    pub fn new(config: &ModelConfig, dtype: DType, device: &Device, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.num_key_value_heads * head_dim;

        let q_proj = linear_b(hidden, q_dim, config.qkv_bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(hidden, kv_dim, config.qkv_bias, vb.pp("k_proj"))?;
        let v_proj = linear_b(hidden, kv_dim, config.qkv_bias, vb.pp("v_proj"))?;
        let o_proj = linear_b(q_dim, hidden, config.o_bias, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            core: CoreAttention::new(config, dtype, device)?,
        })
    }

    pub fn core(&self) -> &CoreAttention {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut CoreAttention {
        &mut self.core
    }

    /// `[seq_len, hidden_size]` -> `[seq_len, hidden_size]`.
    pub fn forward(&mut self, ctx: &ForwardContext, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(0)?;
        let heads = self.core.num_heads();
        let kv_heads = self.core.num_kv_heads();
        let head_dim = self.core.head_dim();

        let q = self.q_proj.forward(x)?.reshape((seq_len, heads, head_dim))?;
        let k = self.k_proj.forward(x)?.reshape((seq_len, kv_heads, head_dim))?;
        let v = self.v_proj.forward(x)?.reshape((seq_len, kv_heads, head_dim))?;

        let context = self.core.forward(ctx, &q, &k, &v)?;
        Ok(self.o_proj.forward(&context)?)
    }
}

/// Tensor names and shapes a self-attention block reads under `prefix`.
pub(crate) fn attention_params(config: &ModelConfig, prefix: &str) -> Vec<(String, Vec<usize>)> {
    let hidden = config.hidden_size;
    let head_dim = config.head_dim();
    let q_dim = config.num_attention_heads * head_dim;
    let kv_dim = config.num_key_value_heads * head_dim;

    let mut params = Vec::new();
    for (name, out_dim) in [("q_proj", q_dim), ("k_proj", kv_dim), ("v_proj", kv_dim)] {
        params.push((format!("{prefix}.{name}.weight"), vec![out_dim, hidden]));
        if config.qkv_bias {
            params.push((format!("{prefix}.{name}.bias"), vec![out_dim]));
        }
    }
    params.push((format!("{prefix}.o_proj.weight"), vec![hidden, q_dim]));
    if config.o_bias {
        params.push((format!("{prefix}.o_proj.bias"), vec![hidden]));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::PositionContext;
    use std::collections::HashMap;

    fn test_device() -> Device {
        Device::Cpu
    }

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 1,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            max_length: 16,
            qkv_bias: true,
            ..ModelConfig::default()
        }
    }

    fn random_attention(config: &ModelConfig) -> SelfAttention {
        let device = test_device();
        let tensors: HashMap<String, Tensor> = attention_params(config, "attn")
            .into_iter()
            .map(|(name, shape)| (name, Tensor::randn(0.0f32, 0.1, shape, &device).unwrap()))
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        SelfAttention::new(config, DType::F32, &device, vb.pp("attn")).unwrap()
    }

    #[test]
    fn test_params_include_bias() {
        let params = attention_params(&config(), "attn");
        assert_eq!(params.len(), 7);
        assert_eq!(params[2], ("attn.k_proj.weight".to_string(), vec![16, 32]));
    }

    #[test]
    fn test_forward_shape_and_cache_growth() {
        let config = config();
        let mut attn = random_attention(&config);
        let device = test_device();

        let x = Tensor::randn(0.0f32, 1.0, (3, 32), &device).unwrap();
        let ctx = attn.core().prepare(PositionContext::new(0, 0), 3, &device).unwrap();
        let out = attn.forward(&ctx, &x).unwrap();
        assert_eq!(out.dims(), &[3, 32]);

        let x = Tensor::randn(0.0f32, 1.0, (1, 32), &device).unwrap();
        let ctx = attn.core().prepare(PositionContext::new(3, 0), 1, &device).unwrap();
        attn.forward(&ctx, &x).unwrap();
        assert_eq!(attn.core().cache().unwrap().len(), 4);
    }
}
