//! Session persistence.
//!
//! A session file is a safetensors archive holding everything needed to
//! resume a conversation without recomputing it:
//!
//! - `layers.{i}.k` / `layers.{i}.v`: live cache rows `[n_past, kv_heads, head_dim]`
//! - `layers.{i}.positions`: logical position of each row (i64)
//! - `tokens`: the cached token timeline (u32)
//! - `meta`: `[n_past, n_past_offset, history_offset]` (i64)
//!
//! Empty tensors are omitted; a missing entry reads back as empty.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::error::{Error, Result};

/// Live rows of one layer's cache.
#[derive(Debug, Clone)]
pub struct LayerState {
    pub keys: Tensor,
    pub values: Tensor,
    pub positions: Vec<usize>,
}

/// Everything a session file stores.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub layers: Vec<Option<LayerState>>,
    pub tokens: Vec<u32>,
    pub n_past: usize,
    pub n_past_offset: usize,
    pub history_offset: usize,
}

impl SessionState {
    /// Writes the state to `path`.
    pub fn save(&self, path: impl AsRef<Path>, device: &Device) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        let meta = [
            self.n_past as i64,
            self.n_past_offset as i64,
            self.history_offset as i64,
        ];
        tensors.insert("meta".to_string(), Tensor::new(&meta, device)?);
        if !self.tokens.is_empty() {
            tensors.insert("tokens".to_string(), Tensor::new(self.tokens.as_slice(), device)?);
        }
        for (i, layer) in self.layers.iter().enumerate() {
            let Some(layer) = layer else { continue };
            if layer.positions.is_empty() {
                continue;
            }
            let positions: Vec<i64> = layer.positions.iter().map(|&p| p as i64).collect();
            tensors.insert(format!("layers.{i}.k"), layer.keys.clone());
            tensors.insert(format!("layers.{i}.v"), layer.values.clone());
            tensors.insert(
                format!("layers.{i}.positions"),
                Tensor::new(positions.as_slice(), device)?,
            );
        }
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            n_past = self.n_past,
            tokens = self.tokens.len(),
            "session saved"
        );
        Ok(())
    }

    /// Reads a state written by [`SessionState::save`] for a model with
    /// `num_layers` layers.
    pub fn load(path: impl AsRef<Path>, num_layers: usize, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path.as_ref(), device)?;

        let meta: Vec<i64> = tensors
            .remove("meta")
            .ok_or_else(|| Error::Session("missing meta entry".into()))?
            .to_dtype(DType::I64)?
            .to_vec1()?;
        let &[n_past, n_past_offset, history_offset] = meta.as_slice() else {
            return Err(Error::Session(format!("meta has {} entries, expected 3", meta.len())));
        };
        let tokens: Vec<u32> = match tensors.remove("tokens") {
            Some(t) => t.to_dtype(DType::U32)?.to_vec1()?,
            None => Vec::new(),
        };

        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let keys = tensors.remove(&format!("layers.{i}.k"));
            let values = tensors.remove(&format!("layers.{i}.v"));
            let positions = tensors.remove(&format!("layers.{i}.positions"));
            let layer = match (keys, values, positions) {
                (Some(keys), Some(values), Some(positions)) => {
                    let positions: Vec<i64> = positions.to_dtype(DType::I64)?.to_vec1()?;
                    Some(LayerState {
                        keys,
                        values,
                        positions: positions.into_iter().map(|p| p as usize).collect(),
                    })
                }
                (None, None, None) => None,
                _ => {
                    return Err(Error::Session(format!("layer {i} is incomplete")));
                }
            };
            layers.push(layer);
        }
        if let Some(extra) = tensors.keys().next() {
            return Err(Error::Session(format!(
                "unexpected entry {extra}: session was saved by a different model"
            )));
        }

        info!(path = %path.as_ref().display(), n_past, "session loaded");
        Ok(Self {
            layers,
            tokens,
            n_past: n_past as usize,
            n_past_offset: n_past_offset as usize,
            history_offset: history_offset as usize,
        })
    }
}
