//! Core state owned by the attention layers and the pipeline.
//!
//! This module contains:
//! - `LayerKVCache`, the fixed-capacity per-layer key/value store with
//!   two-phase shifting
//! - `SessionState`, the on-disk form of a conversation's cache

pub mod kv_cache;
pub mod session;

pub use kv_cache::{KVCacheConfig, LayerKVCache, ShiftPending};
pub use session::{LayerState, SessionState};
