use std::time::Duration;

use thiserror::Error;
use tonic::Status;

/// Errors surfaced by the call-shape adapter and its policies.
///
/// Transport errors pass through untouched; the other variants are produced
/// locally by the timeout and breaker policies.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(#[from] Status),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("circuit breaker \"{0}\" is open")]
    BreakerOpen(String),

    #[error("stream session already closed")]
    StreamClosed,
}

impl CallError {
    /// Breaker rejections are a non-fatal gating condition: the remote call
    /// was never attempted and the caller may retry after the cool-down.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, CallError::BreakerOpen(_))
    }
}
