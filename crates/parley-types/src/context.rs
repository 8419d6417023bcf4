//! Cancellation and deadline propagation for a single call.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ApiError;

/// Caller-supplied context governing one chat call or stream.
///
/// Cancellation propagates from a context to the contexts derived from it,
/// never the other way. A derived context inherits its parent's deadline and
/// may only tighten it.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child context that is cancelled when `self` is.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline` (or earlier, if the
    /// parent already expires earlier).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        child
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// The error this context reports if it is already done.
    pub fn error(&self) -> Option<ApiError> {
        if self.token.is_cancelled() {
            Some(ApiError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ApiError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ApiError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ApiError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ApiError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ApiError::Cancelled
            }
        }
    }
}
