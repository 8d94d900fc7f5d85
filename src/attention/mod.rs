//! Attention engine.
//!
//! This module contains:
//! - `CoreAttention`, the per-layer scaled-dot-product attention over a KV cache
//! - Positional strategies: rotary (with NTK/SU rescaling), ALiBi, log-length scaling
//! - `ForwardContext`, the per-pass scratch (positions, masks) shared by all layers

pub mod alibi;
pub mod context;
pub mod core_attention;
pub mod positional;
pub mod rope;

pub use alibi::AlibiBias;
pub use context::{ForwardContext, MaskSpec};
pub use core_attention::CoreAttention;
pub use positional::{LognScaling, PositionContext, PositionalEncoding};
pub use rope::RotaryEmbedding;
