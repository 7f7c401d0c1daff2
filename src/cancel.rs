//! Cooperative cancellation for multi-step transport operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, SessionError};

/// Races futures against a shared absolute deadline and a cancellation
/// signal.
///
/// A composite operation passes each sub-step through [`CancelScope::run`]
/// so the whole sequence aborts at the next step boundary once the deadline
/// elapses or the token fires, not only at the end. Cancellation is
/// cooperative: the abandoned future is dropped and its eventual result
/// discarded.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    /// A scope without a deadline; only the token can abort it.
    pub fn new(token: CancellationToken) -> Self {
        CancelScope { token, deadline: None }
    }

    /// A scope whose deadline is `timeout` from now, shared by every
    /// subsequent `run` call on this scope.
    pub fn with_timeout(token: CancellationToken, timeout: Duration) -> Self {
        CancelScope {
            token,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Resolve `fut`, or fail early with a distinguished cancellation
    /// error if the deadline or the signal wins the race.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, SessionError> {
        let deadline = async {
            match self.deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.token.cancelled() => Err(SessionError::Cancelled {
                reason: CancelReason::DisconnectRequested,
            }),
            _ = deadline => Err(SessionError::Cancelled {
                reason: CancelReason::Timeout,
            }),
            value = fut => Ok(value),
        }
    }
}
