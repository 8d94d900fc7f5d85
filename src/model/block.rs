//! Generic transformer block.
//!
//! Every supported architecture is one [`Block`]: a normalization, a
//! self-attention and an MLP, joined by residual connections. Decoder
//! (causal) blocks normalize before each sub-layer; encoder blocks
//! normalize after the residual add.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::attention::{attention_params, SelfAttention};
use super::mlp::{mlp_params, Mlp};
use super::norm::{norm_params, Norm};
use crate::attention::ForwardContext;
use crate::config::ModelConfig;
use crate::error::Result;

/// Where the norms sit relative to the residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormPlacement {
    Pre,
    Post,
}

/// One transformer layer.
#[derive(Debug)]
pub struct Block {
    /// Norm before attention (pre) or after the attention residual (post).
    input_layernorm: Norm,
    self_attn: SelfAttention,
    /// Norm before the MLP (pre) or after the MLP residual (post).
    post_attention_layernorm: Norm,
    mlp: Mlp,
    placement: NormPlacement,
}

impl Block {
    pub fn new(config: &ModelConfig, dtype: DType, device: &Device, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let input_layernorm = Norm::load(config.norm, hidden, config.norm_eps, vb.pp("input_layernorm"))?;
        let self_attn = SelfAttention::new(config, dtype, device, vb.pp("self_attn"))?;
        let post_attention_layernorm = Norm::load(
            config.norm,
            hidden,
            config.norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        let mlp = Mlp::new(
            config.mlp,
            config.activation,
            hidden,
            config.intermediate_size,
            vb.pp("mlp"),
        )?;
        let placement = if config.causal {
            NormPlacement::Pre
        } else {
            NormPlacement::Post
        };

        Ok(Self {
            input_layernorm,
            self_attn,
            post_attention_layernorm,
            mlp,
            placement,
        })
    }

    pub fn self_attn(&self) -> &SelfAttention {
        &self.self_attn
    }

    pub fn self_attn_mut(&mut self) -> &mut SelfAttention {
        &mut self.self_attn
    }

    pub fn placement(&self) -> NormPlacement {
        self.placement
    }

    /// Forward pass over `[seq_len, hidden_size]`.
    ///
    /// ```text
    /// pre:  h = x + attn(norm1(x));  out = h + mlp(norm2(h))
    /// post: h = norm1(x + attn(x));  out = norm2(h + mlp(h))
    /// ```
    pub fn forward(&mut self, ctx: &ForwardContext, x: &Tensor) -> Result<Tensor> {
        match self.placement {
            NormPlacement::Pre => {
                let h = self.input_layernorm.forward(x)?;
                let h = (x + self.self_attn.forward(ctx, &h)?)?;
                let m = self.mlp.forward(&self.post_attention_layernorm.forward(&h)?)?;
                Ok((h + m)?)
            }
            NormPlacement::Post => {
                let h = (x + self.self_attn.forward(ctx, x)?)?;
                let h = self.input_layernorm.forward(&h)?;
                let m = self.mlp.forward(&h)?;
                Ok(self.post_attention_layernorm.forward(&(h + m)?)?)
            }
        }
    }
}

/// Tensor names and shapes one block reads under `prefix`, in load order.
pub(crate) fn block_params(config: &ModelConfig, prefix: &str) -> Vec<(String, Vec<usize>)> {
    let hidden = config.hidden_size;
    let mut params = norm_params(config.norm, &format!("{prefix}.input_layernorm"), hidden);
    params.extend(attention_params(config, &format!("{prefix}.self_attn")));
    params.extend(norm_params(
        config.norm,
        &format!("{prefix}.post_attention_layernorm"),
        hidden,
    ));
    params.extend(mlp_params(
        config.mlp,
        &format!("{prefix}.mlp"),
        hidden,
        config.intermediate_size,
    ));
    params
}
