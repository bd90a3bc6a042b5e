use std::future::Future;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::error::CallError;

/// Session-wide time bound for a call.
///
/// Captured once when the call is issued; every subsequent await on the
/// session (the round trip for unary shapes, each receive for streaming
/// shapes) is raced against the same instant. When no limit is given the
/// deadline is unbounded and awaits pass straight through.
///
/// The race is driven by `tokio::time::timeout_at`, so the timer is dropped
/// as soon as the guarded future completes. The in-flight future is dropped
/// when the deadline fires, which cancels it cooperatively.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    limit: Option<Duration>,
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(limit: Option<Duration>) -> Deadline {
        Deadline {
            limit,
            at: limit.map(|d| Instant::now() + d),
        }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// The error reported when this deadline fires.
    pub fn exceeded(&self) -> CallError {
        CallError::DeadlineExceeded(self.limit.unwrap_or_default())
    }

    /// Await `fut` within the deadline, flattening its error into `CallError`.
    pub async fn bound<T, E, F>(&self, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, E>>,
        CallError: From<E>,
    {
        match self.at {
            Some(at) => match timeout_at(at, fut).await {
                Ok(result) => result.map_err(CallError::from),
                Err(_) => Err(self.exceeded()),
            },
            None => fut.await.map_err(CallError::from),
        }
    }

    /// Await a plain future within the deadline.
    pub async fn bound_value<T, F>(&self, fut: F) -> Result<T, CallError>
    where
        F: Future<Output = T>,
    {
        match self.at {
            Some(at) => timeout_at(at, fut).await.map_err(|_| self.exceeded()),
            None => Ok(fut.await),
        }
    }
}
