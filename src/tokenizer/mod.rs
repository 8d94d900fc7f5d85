//! Tokenization.
//!
//! This module contains:
//! - `Vocab` and token types
//! - Text preprocessors
//! - `Processor` with BPE (v1/v2/v3) and Unigram segmentation
//! - Chat templates and the chat-level `Tokenizer`
//! - UTF-8 boundary helpers used by streaming

pub mod bpe;
pub mod chat;
pub mod preprocess;
pub mod processor;
pub mod template;
pub mod unigram;
pub mod utf8;
pub mod vocab;

pub use chat::{SpecialTokens, Tokenizer};
pub use preprocess::Preprocessor;
pub use processor::{Processor, Strategy};
pub use template::ChatTemplate;
pub use utf8::get_end_of_valid_utf8;
pub use vocab::{TokenScore, TokenType, Vocab};
