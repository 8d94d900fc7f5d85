//! Generation engine.
//!
//! This module contains:
//! - `Sampler` for token selection
//! - `Streamer` / `TextStreamer` for UTF-8-safe incremental output
//! - `CancellationToken` for cooperative aborts
//! - `Pipeline`, the prefill/decode state machine with context extension

pub mod cancel;
pub mod pipeline;
pub mod sampler;
pub mod streamer;

pub use cancel::CancellationToken;
pub use pipeline::{ChatOutput, FinishReason, Pipeline, PipelineState, PipelineStats};
pub use sampler::Sampler;
pub use streamer::{NullStreamer, Streamer, TextStreamer};
