//! Per-call deadlines and cancellation

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CancelReason, Result};

/// Bounds a single data layer call.
///
/// The store future is dropped as soon as the token fires or the deadline
/// passes, which aborts the in-flight network call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: Option<CancellationToken>,
}

impl CallContext {
    /// No deadline, never cancelled
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().deadline(deadline)
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self::background().token(token)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Drive `future` to completion unless the context gives up first.
    pub async fn run<F, T>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(cancelled(operation, CancelReason::Token));
        }

        let token = self.token.clone().unwrap_or_default();
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(cancelled(operation, CancelReason::Token)),
            _ = deadline => Err(cancelled(operation, CancelReason::Deadline)),
            result = future => result,
        }
    }
}

fn cancelled(operation: &'static str, reason: CancelReason) -> CacheError {
    tracing::warn!(operation, %reason, "call abandoned");
    CacheError::Cancelled { operation, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_completes() {
        let cx = CallContext::background();
        let value = cx.run("noop", async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
        assert!(cx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let cx = CallContext::with_timeout(Duration::from_millis(50));
        let err = cx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CacheError::Cancelled {
                operation: "slow",
                reason: CancelReason::Deadline
            }
        ));
    }

    #[tokio::test]
    async fn test_token_cancels_in_flight() {
        let token = CancellationToken::new();
        let cx = CallContext::with_token(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = cx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(
            err,
            CacheError::Cancelled {
                reason: CancelReason::Token,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_future() {
        let token = CancellationToken::new();
        token.cancel();
        let cx = CallContext::with_token(token);

        let mut polled = false;
        let err = cx
            .run::<_, ()>("get", async {
                polled = true;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!polled);
    }
}
