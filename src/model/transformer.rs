//! The full model: embeddings, blocks, final norm and LM head.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::debug;

use super::block::{block_params, Block};
use super::norm::{norm_params, Norm};
use crate::attention::{ForwardContext, PositionContext};
use crate::config::{ModelConfig, PositionalConfig};
use crate::error::{Error, Result};

/// Tensor names and shapes the model reads, in the order they are stored.
///
/// The weight loader checks records against this list, and random test
/// models are built from it, so both paths construct the model identically.
pub fn weight_manifest(config: &ModelConfig) -> Vec<(String, Vec<usize>)> {
    let hidden = config.hidden_size;
    let mut params = vec![(
        "model.embed_tokens.weight".to_string(),
        vec![config.vocab_size, hidden],
    )];
    if let PositionalConfig::LearnedAbsolute { max_positions, .. } = config.positional {
        params.push((
            "model.embed_positions.weight".to_string(),
            vec![max_positions, hidden],
        ));
    }
    for i in 0..config.num_hidden_layers {
        params.extend(block_params(config, &format!("model.layers.{i}")));
    }
    params.extend(norm_params(config.norm, "model.norm", hidden));
    if !config.tie_word_embeddings {
        params.push(("lm_head.weight".to_string(), vec![config.vocab_size, hidden]));
    }
    params
}

/// Random weights for every manifest entry.
///
/// Norm weights are ones and biases zeros; everything else is drawn from
/// `N(0, 0.02)` like a fresh initialization.
pub fn random_weights(config: &ModelConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for (name, shape) in weight_manifest(config) {
        let is_norm = name.contains("norm") && name.ends_with(".weight");
        let tensor = if is_norm {
            Tensor::ones(shape, DType::F32, device)?
        } else if name.ends_with(".bias") {
            Tensor::zeros(shape, DType::F32, device)?
        } else {
            Tensor::randn(0.0f32, 0.02, shape, device)?
        };
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Decoder (or encoder) transformer with a language-model head.
#[derive(Debug)]
pub struct Transformer {
    config: ModelConfig,
    embed_tokens: Embedding,
    /// Learned absolute position table, with its pad index.
    embed_positions: Option<(Embedding, usize, usize)>,
    layers: Vec<Block>,
    norm: Norm,
    lm_head: Linear,
    device: Device,
    dtype: DType,
}

impl Transformer {
    /// Creates the model from a VarBuilder holding every manifest tensor.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if config.num_hidden_layers == 0 {
            return Err(Error::Config("model needs at least one layer".into()));
        }
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let hidden = config.hidden_size;

        let embed_tokens = embedding(config.vocab_size, hidden, vb.pp("model.embed_tokens"))?;
        let embed_positions = match config.positional {
            PositionalConfig::LearnedAbsolute {
                max_positions,
                pad_index,
            } => Some((
                embedding(max_positions, hidden, vb.pp("model.embed_positions"))?,
                max_positions,
                pad_index,
            )),
            _ => None,
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Block::new(
                config,
                dtype,
                &device,
                vb.pp(format!("model.layers.{i}")),
            )?);
        }

        let norm = Norm::load(config.norm, hidden, config.norm_eps, vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(hidden, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            config: config.clone(),
            embed_tokens,
            embed_positions,
            layers,
            norm,
            lm_head,
            device,
            dtype,
        })
    }

    /// A model with random weights, for tests and benchmarks.
    pub fn new_random(config: &ModelConfig, device: &Device) -> Result<Self> {
        let tensors = random_weights(config, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Block] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Block] {
        &mut self.layers
    }

    /// Cached rows of the first layer (all layers agree).
    pub fn cache_len(&self) -> usize {
        self.layers[0]
            .self_attn()
            .core()
            .cache()
            .map_or(0, |cache| cache.len())
    }

    /// Hidden states after the final norm, `[seq_len, hidden_size]`.
    fn forward_hidden(&mut self, tokens: &[u32], pos: PositionContext) -> Result<Tensor> {
        let qlen = tokens.len();
        if qlen == 0 {
            return Err(Error::InvariantViolation("forward pass with no tokens".into()));
        }
        let ids = Tensor::new(tokens, &self.device)?;
        let mut hidden = self.embed_tokens.forward(&ids)?;

        let ctx: ForwardContext = self.layers[0].self_attn().core().prepare(pos, qlen, &self.device)?;

        if let Some((table, max_positions, pad_index)) = &self.embed_positions {
            let ids: Vec<u32> = ctx.positions().iter().map(|p| (p + pad_index) as u32).collect();
            if let Some(&last) = ids.last() {
                if last as usize >= *max_positions {
                    return Err(Error::InvariantViolation(format!(
                        "position {last} beyond the learned table ({max_positions})"
                    )));
                }
            }
            let ids = Tensor::new(ids.as_slice(), &self.device)?;
            hidden = (hidden + table.forward(&ids)?)?;
        }

        for layer in &mut self.layers {
            hidden = layer.forward(&ctx, &hidden)?;
        }
        debug!(n_past = pos.n_past, qlen, "forward pass");

        Ok(self.norm.forward(&hidden)?)
    }

    /// Logits of the last token, `[vocab_size]` in f32.
    pub fn forward(&mut self, tokens: &[u32], pos: PositionContext) -> Result<Tensor> {
        let hidden = self.forward_hidden(tokens, pos)?;
        let last = hidden.narrow(0, tokens.len() - 1, 1)?.squeeze(0)?;
        let logits = self.lm_head.forward(&last.unsqueeze(0)?)?.squeeze(0)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Logits of every token, `[seq_len, vocab_size]` in f32.
    pub fn forward_all(&mut self, tokens: &[u32], pos: PositionContext) -> Result<Tensor> {
        let hidden = self.forward_hidden(tokens, pos)?;
        Ok(self.lm_head.forward(&hidden)?.to_dtype(DType::F32)?)
    }

    /// Schedules eviction of `shift` rows after the first `keep` on every
    /// layer; applied at the start of the next forward pass.
    pub fn shift_memory(&mut self, keep: usize, shift: usize) -> Result<()> {
        for layer in &mut self.layers {
            layer.self_attn_mut().core_mut().schedule_shift(keep, shift)?;
        }
        Ok(())
    }

    /// Logically clears every layer's cache.
    pub fn reset_cache(&mut self) {
        for layer in &mut self.layers {
            layer.self_attn_mut().core_mut().reset_cache();
        }
    }
}
