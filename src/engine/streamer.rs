//! Streaming output.
//!
//! The pipeline reports generated ids through a [`Streamer`]: `put` once per
//! decode step and `end` exactly once per call, including on abort or error.
//!
//! [`TextStreamer`] turns ids into text without ever splitting a multi-byte
//! character. It re-decodes the whole id cache on every step (token pieces
//! only make sense in context) and emits the new suffix up to the last
//! complete UTF-8 scalar; the rest is held back until more ids arrive or the
//! stream ends.

use crate::tokenizer::{get_end_of_valid_utf8, Processor};

/// Receiver of generated ids.
pub trait Streamer {
    /// New ids produced by one step.
    fn put(&mut self, ids: &[u32]);

    /// End of the current call.
    fn end(&mut self);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStreamer;

impl Streamer for NullStreamer {
    fn put(&mut self, _ids: &[u32]) {}

    fn end(&mut self) {}
}

/// Decodes ids incrementally and hands UTF-8-safe text to a sink.
///
/// Each `put` decodes the whole cache again, so a call that streams `n` ids
/// costs O(n²) decoding work. The cache is cleared on `end`.
pub struct TextStreamer<F: FnMut(&str)> {
    processor: Processor,
    sink: F,
    /// Every id seen since the last `end`.
    token_cache: Vec<u32>,
    /// Bytes of the decoded cache already handed to the sink.
    flushed_len: usize,
}

impl<F: FnMut(&str)> TextStreamer<F> {
    pub fn new(processor: Processor, sink: F) -> Self {
        Self {
            processor,
            sink,
            token_cache: Vec::new(),
            flushed_len: 0,
        }
    }

    /// Bytes emitted so far in the current stream.
    pub fn flushed_len(&self) -> usize {
        self.flushed_len
    }

    fn flush_until(&mut self, bytes: &[u8], end: usize) {
        if end > self.flushed_len {
            let text = String::from_utf8_lossy(&bytes[self.flushed_len..end]);
            (self.sink)(&text);
            self.flushed_len = end;
        }
    }
}

impl<F: FnMut(&str)> Streamer for TextStreamer<F> {
    fn put(&mut self, ids: &[u32]) {
        self.token_cache.extend_from_slice(ids);
        let bytes = self.processor.decode_bytes(&self.token_cache);
        let end = get_end_of_valid_utf8(&bytes, self.flushed_len);
        self.flush_until(&bytes, end);
    }

    fn end(&mut self) {
        let bytes = self.processor.decode_bytes(&self.token_cache);
        self.flush_until(&bytes, bytes.len());
        self.token_cache.clear();
        self.flushed_len = 0;
    }
}

impl<F: FnMut(&str)> std::fmt::Debug for TextStreamer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStreamer")
            .field("token_cache", &self.token_cache)
            .field("flushed_len", &self.flushed_len)
            .finish()
    }
}
