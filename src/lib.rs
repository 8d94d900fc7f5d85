//! nano-chat: a small local runtime for chat language models.
//!
//! The crate covers the whole path from a weight file to streamed text:
//! - Tokenizers (BPE variants and Unigram) with chat templates
//! - A generic transformer whose attention layers own a fixed-size KV cache
//! - Positional strategies: rotary (NTK/SU rescaling), ALiBi, learned absolute
//! - A chat pipeline that keeps long conversations inside the context by
//!   shifting or restarting the cache

pub mod config;
pub mod error;

pub mod attention;
pub mod core;
pub mod engine;
pub mod model;
pub mod tokenizer;

pub use config::{
    ExtendingMethod, GenerationConfig, ModelConfig, PositionalConfig, RopeScaling, SamplingConfig,
};
pub use engine::{
    CancellationToken, ChatOutput, FinishReason, NullStreamer, Pipeline, Sampler, Streamer,
    TextStreamer,
};
pub use error::{Error, Result};
pub use model::{load_model, save_model, Transformer};
pub use tokenizer::{ChatTemplate, Processor, Tokenizer};
