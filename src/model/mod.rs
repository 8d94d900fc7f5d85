//! Transformer model.
//!
//! This module contains:
//! - Normalization (RMSNorm, LayerNorm)
//! - Feed-forward networks (gated, plain)
//! - Self-attention projections around the attention engine
//! - The generic block and the full model
//! - Weight file loading

pub mod attention;
pub mod block;
pub mod loader;
pub mod mlp;
pub mod norm;
pub mod transformer;

pub use attention::SelfAttention;
pub use block::{Block, NormPlacement};
pub use loader::{encode_model, load_from_bytes, load_model, save_model, LoadedModel};
pub use mlp::Mlp;
pub use norm::{Norm, RmsNorm};
pub use transformer::{random_weights, weight_manifest, Transformer};
