//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared abort flag, polled by the decode loop between tokens.
///
/// Clones share the flag, so one clone can be handed to another thread (or a
/// signal handler) while the pipeline holds the other.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an abort at the next step boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clears the flag so the token can be reused for another call.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
