//! Scaled-dot-product attention over a persistent KV cache.
//!
//! `CoreAttention` is the per-layer engine behind every self-attention block:
//! it applies the positional strategy to Q/K, writes the new K/V rows into its
//! own cache (after compacting any pending shift), scores the queries against
//! all live keys and mixes the values.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::softmax_last_dim;

use super::context::{ForwardContext, MaskSpec};
use super::positional::{LognScaling, PositionContext, PositionalEncoding};
use crate::config::ModelConfig;
use crate::core::kv_cache::{KVCacheConfig, LayerKVCache};
use crate::error::{Error, Result};

/// Attention engine of one layer.
#[derive(Debug)]
pub struct CoreAttention {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    /// Score scale, `1/sqrt(head_dim)` unless configured.
    scale: f64,
    mask: MaskSpec,
    positional: PositionalEncoding,
    logn: Option<LognScaling>,
    /// `None` for cacheless (encoder) layers.
    cache: Option<LayerKVCache>,
}

impl CoreAttention {
    /// Creates the engine and, for cached layouts, its cache.
    pub fn new(config: &ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;

        let head_dim = config.head_dim();
        let cache = if config.cache_layout.is_cached() {
            let cache_config =
                KVCacheConfig::new(config.max_length, config.num_key_value_heads, head_dim)
                    .with_dtype(dtype);
            Some(LayerKVCache::new(&cache_config, device)?)
        } else {
            None
        };

        Ok(Self {
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
            scale: config.attn_scale(),
            mask: MaskSpec::new(config.causal, config.cache_layout),
            positional: PositionalEncoding::from_config(config),
            logn: config.logn_trained_length.map(LognScaling::new),
            cache,
        })
    }

    /// Returns the number of query heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Returns the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Returns the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// The layer's cache, if it has one.
    pub fn cache(&self) -> Option<&LayerKVCache> {
        self.cache.as_ref()
    }

    /// Mutable access to the layer's cache.
    pub fn cache_mut(&mut self) -> Option<&mut LayerKVCache> {
        self.cache.as_mut()
    }

    /// Builds the per-pass context for `qlen` new tokens.
    ///
    /// The context only depends on configuration shared by all layers, so one
    /// context serves a whole forward pass.
    pub fn prepare(&self, pos: PositionContext, qlen: usize, device: &Device) -> Result<ForwardContext> {
        ForwardContext::new(
            pos,
            qlen,
            self.cache.is_some(),
            self.mask,
            self.positional.alibi(),
            device,
        )
    }

    /// Schedules an eviction of `shift` rows after the first `keep`.
    pub fn schedule_shift(&mut self, keep: usize, shift: usize) -> Result<()> {
        match &mut self.cache {
            Some(cache) => cache.schedule_shift(keep, shift),
            None => Ok(()),
        }
    }

    /// Logically clears the cache.
    pub fn reset_cache(&mut self) {
        if let Some(cache) = &mut self.cache {
            cache.reset();
        }
    }

    /// Attention for the new tokens.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Per-pass context from [`CoreAttention::prepare`]
    /// * `q` - Queries `[qlen, num_heads, head_dim]`
    /// * `k` - Keys `[qlen, num_kv_heads, head_dim]`
    /// * `v` - Values `[qlen, num_kv_heads, head_dim]`
    ///
    /// # Returns
    ///
    /// Context vectors `[qlen, num_heads * head_dim]`.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when the cache would overflow without a scheduled
    /// shift, or when `ctx.pos.n_past` disagrees with the cache.
    pub fn forward(&mut self, ctx: &ForwardContext, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let qlen = q.dim(0)?;
        if qlen != ctx.qlen || k.dim(0)? != qlen || v.dim(0)? != qlen {
            return Err(Error::InvariantViolation(format!(
                "forward context prepared for {} tokens, got q/k/v rows {qlen}/{}/{}",
                ctx.qlen,
                k.dim(0)?,
                v.dim(0)?
            )));
        }
        let positions = ctx.positions();

        // 1. Positional transform on Q/K
        let (q, k) = self.positional.apply_qk(q, k, positions)?;
        let q = match &self.logn {
            Some(logn) => logn.apply(&q, positions)?,
            None => q,
        };

        // 2. Write into the cache (compacting any pending shift first)
        let (keys, values) = match &mut self.cache {
            Some(cache) => cache.append(ctx.pos.n_past, &k, v, positions)?,
            None => (k, v.clone()),
        };

        // 3. Broadcast KV heads across their query groups
        let keys = self.repeat_kv(&keys)?;
        let values = self.repeat_kv(&values)?;

        // 4. Heads first: [num_heads, len, head_dim]
        let q = q.transpose(0, 1)?.contiguous()?;
        let keys = keys.transpose(0, 1)?.contiguous()?;
        let values = values.transpose(0, 1)?.contiguous()?;

        // 5. Scores: Q @ K^T * scale -> [num_heads, qlen, klen]
        let scores = (q.matmul(&keys.transpose(D::Minus2, D::Minus1)?)? * self.scale)?;
        let scores = scores.to_dtype(DType::F32)?;
        let scores = match ctx.bias() {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores,
        };

        // 6. Softmax and mix values
        let probs = softmax_last_dim(&scores)?.to_dtype(values.dtype())?;
        let output = probs.matmul(&values)?;

        // 7. Back to [qlen, num_heads * head_dim]
        let output = output.transpose(0, 1)?.contiguous()?;
        Ok(output.reshape((qlen, self.num_heads * self.head_dim))?)
    }

    /// `[len, num_kv_heads, head_dim]` -> `[len, num_heads, head_dim]`
    fn repeat_kv(&self, x: &Tensor) -> Result<Tensor> {
        let n_rep = self.num_heads / self.num_kv_heads;
        if n_rep == 1 {
            return Ok(x.clone());
        }
        let (len, num_kv_heads, head_dim) = x.dims3()?;
        let x = x
            .unsqueeze(2)?
            .expand((len, num_kv_heads, n_rep, head_dim))?
            .reshape((len, self.num_heads, head_dim))?;
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheLayout, PositionalConfig};

    fn test_device() -> Device {
        Device::Cpu
    }

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 1,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            max_length: 16,
            ..ModelConfig::default()
        }
    }

    fn qkv(qlen: usize) -> (Tensor, Tensor, Tensor) {
        let device = test_device();
        (
            Tensor::randn(0f32, 1.0, (qlen, 4, 4), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (qlen, 2, 4), &device).unwrap(),
            Tensor::randn(0f32, 1.0, (qlen, 2, 4), &device).unwrap(),
        )
    }

    fn run(attn: &mut CoreAttention, n_past: usize, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let ctx = attn.prepare(PositionContext::new(n_past, 0), q.dim(0)?, &test_device())?;
        attn.forward(&ctx, q, k, v)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_forward_shape_and_cache_growth() {
        let mut attn = CoreAttention::new(&config(), DType::F32, &test_device()).unwrap();
        let (q, k, v) = qkv(5);
        let out = run(&mut attn, 0, &q, &k, &v).unwrap();
        assert_eq!(out.dims(), &[5, 16]);
        assert_eq!(attn.cache().unwrap().len(), 5);
    }

    #[test]
    fn test_overflow_without_shift() {
        let mut attn = CoreAttention::new(&config(), DType::F32, &test_device()).unwrap();
        let (q, k, v) = qkv(12);
        run(&mut attn, 0, &q, &k, &v).unwrap();
        let (q, k, v) = qkv(5);
        let err = run(&mut attn, 12, &q, &k, &v).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_shift_then_write() {
        let mut attn = CoreAttention::new(&config(), DType::F32, &test_device()).unwrap();
        let (q, k, v) = qkv(12);
        run(&mut attn, 0, &q, &k, &v).unwrap();

        attn.schedule_shift(2, 6).unwrap();
        let (q, k, v) = qkv(5);
        let ctx = attn.prepare(PositionContext::new(6, 6), 5, &test_device()).unwrap();
        attn.forward(&ctx, &q, &k, &v).unwrap();

        let cache = attn.cache().unwrap();
        assert_eq!(cache.len(), 11);
        assert_eq!(&cache.positions()[..3], &[0, 1, 8]);
        assert_eq!(cache.positions()[10], 16);
    }

    #[test]
    fn test_single_key_returns_value() {
        // With one key, softmax is 1 and the output is that value (broadcast per group).
        let mut attn = CoreAttention::new(&config(), DType::F32, &test_device()).unwrap();
        let (q, k, v) = qkv(1);
        let out = run(&mut attn, 0, &q, &k, &v).unwrap();
        let expected = attn.repeat_kv(&v).unwrap().reshape((1, 16)).unwrap();
        assert!(max_diff(&out, &expected) < 1e-5);
    }

    #[test]
    fn test_incremental_matches_batch() {
        let device = test_device();
        let mut batch = CoreAttention::new(&config(), DType::F32, &device).unwrap();
        let mut step = CoreAttention::new(&config(), DType::F32, &device).unwrap();
        let (q, k, v) = qkv(6);

        let full = run(&mut batch, 0, &q, &k, &v).unwrap();
        let mut last = None;
        for i in 0..6 {
            let row = |t: &Tensor| t.narrow(0, i, 1).unwrap();
            last = Some(run(&mut step, i, &row(&q), &row(&k), &row(&v)).unwrap());
        }

        let last = last.unwrap();
        assert!(max_diff(&full.narrow(0, 5, 1).unwrap(), &last) < 1e-4);
        let keys_batch = batch.cache().unwrap().keys().unwrap();
        let keys_step = step.cache().unwrap().keys().unwrap();
        assert!(max_diff(&keys_batch, &keys_step) < 1e-5);
    }

    #[test]
    fn test_alibi_and_bidirectional_variants() {
        let device = test_device();
        let alibi = ModelConfig {
            positional: PositionalConfig::Alibi { max_bias: 8.0 },
            ..config()
        };
        let mut attn = CoreAttention::new(&alibi, DType::F32, &device).unwrap();
        let (q, k, v) = qkv(3);
        assert_eq!(run(&mut attn, 0, &q, &k, &v).unwrap().dims(), &[3, 16]);

        let encoder = ModelConfig {
            causal: false,
            cache_layout: CacheLayout::Cacheless,
            positional: PositionalConfig::None,
            ..config()
        };
        let mut attn = CoreAttention::new(&encoder, DType::F32, &device).unwrap();
        assert!(attn.cache().is_none());
        let out = run(&mut attn, 0, &q, &k, &v).unwrap();
        assert_eq!(out.dims(), &[3, 16]);
        // Every query sees every key, so permuting keys and values leaves the output unchanged.
        let perm = Tensor::new(&[2u32, 0, 1], &device).unwrap();
        let out_perm = run(
            &mut attn,
            0,
            &q,
            &k.index_select(&perm, 0).unwrap(),
            &v.index_select(&perm, 0).unwrap(),
        )
        .unwrap();
        assert!(max_diff(&out, &out_perm) < 1e-5);
    }
}
