//! Per-pass scratch shared by every attention layer.
//!
//! All layers of a model share one positional configuration, so the logical
//! positions and the additive score bias (causal mask, sliding window, ALiBi)
//! are built once per forward pass and borrowed by each layer. The context is
//! dropped when the pass ends; nothing in it outlives the pass.

use candle_core::{Device, Tensor};

use super::alibi::AlibiBias;
use super::positional::PositionContext;
use crate::config::CacheLayout;
use crate::error::Result;

/// Masking rules of an attention layer.
#[derive(Debug, Clone, Copy)]
pub struct MaskSpec {
    /// Hide keys after the query.
    pub causal: bool,
    /// Hide keys at least this far behind the query.
    pub window: Option<usize>,
}

impl MaskSpec {
    pub fn new(causal: bool, layout: CacheLayout) -> Self {
        let window = match layout {
            CacheLayout::SlidingWindow { window } => Some(window),
            CacheLayout::Full | CacheLayout::Cacheless => None,
        };
        Self { causal, window }
    }

    /// Whether the key at cache row `key` is hidden from the query at row `query`.
    pub fn is_masked(&self, query: usize, key: usize) -> bool {
        if self.causal && key > query {
            return true;
        }
        match self.window {
            Some(window) => key + window <= query,
            None => false,
        }
    }
}

/// Positions and score bias for one forward pass.
#[derive(Debug)]
pub struct ForwardContext {
    /// Cache bookkeeping at the start of the pass.
    pub pos: PositionContext,
    /// Number of new tokens.
    pub qlen: usize,
    /// Logical position of each new token.
    positions: Vec<usize>,
    /// Additive bias `[1 | num_heads, qlen, klen]`, if any rule applies.
    bias: Option<Tensor>,
}

impl ForwardContext {
    /// Builds the context for `qlen` new tokens.
    ///
    /// Keys are addressed in cache coordinates: with a cache, the new tokens
    /// occupy rows `[n_past, n_past + qlen)` and there are `n_past + qlen` keys;
    /// without one, the pass only sees its own `qlen` tokens.
    pub fn new(
        pos: PositionContext,
        qlen: usize,
        cached: bool,
        mask: MaskSpec,
        alibi: Option<&AlibiBias>,
        device: &Device,
    ) -> Result<Self> {
        let positions = pos.logical_positions(qlen);
        let query_start = if cached { pos.n_past } else { 0 };
        let klen = query_start + qlen;

        let needs_mask = (mask.causal && qlen > 1) || mask.window.is_some();
        let bias = match (alibi, needs_mask) {
            (None, false) => None,
            (None, true) => {
                let data: Vec<f32> = (0..qlen)
                    .flat_map(|i| {
                        (0..klen).map(move |j| {
                            if mask.is_masked(query_start + i, j) {
                                f32::NEG_INFINITY
                            } else {
                                0.0
                            }
                        })
                    })
                    .collect();
                Some(Tensor::from_vec(data, (1, qlen, klen), device)?)
            }
            (Some(alibi), _) => {
                let heads = alibi.slopes().len();
                let mut data = Vec::with_capacity(heads * qlen * klen);
                for h in 0..heads {
                    for i in 0..qlen {
                        let query = query_start + i;
                        for j in 0..klen {
                            data.push(if mask.is_masked(query, j) {
                                f32::NEG_INFINITY
                            } else {
                                alibi.bias(h, query, j)
                            });
                        }
                    }
                }
                Some(Tensor::from_vec(data, (heads, qlen, klen), device)?)
            }
        };

        Ok(Self {
            pos,
            qlen,
            positions,
            bias,
        })
    }

    /// Logical position of each new token.
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Additive score bias, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}
