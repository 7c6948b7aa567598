//! Caller-supplied deadlines and cancellation for embed and search calls.
//!
//! A [`Deadline`] pairs an optional point in time with a
//! [`CancellationToken`]. Wrapping a future with [`Deadline::run`] drops
//! the future (and everything it holds) as soon as either fires, and
//! reports [`RagError::OperationTimedOut`]. Every `run` under the same
//! deadline shares one budget: a query that spends most of it embedding
//! has only the rest left for the search.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Default)]
pub struct Deadline {
    expires_at: Option<Instant>,
    token: CancellationToken,
}

impl Deadline {
    /// No timeout; only explicit cancellation through [`Deadline::token`].
    pub fn none() -> Self {
        Self::default()
    }

    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Time left before expiry; `None` when there is no time limit.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `fut` until it completes, the timeout elapses, or the token fires.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.token.is_cancelled() {
            return Err(RagError::OperationTimedOut { operation });
        }
        let bounded = async {
            match self.expires_at {
                Some(at) => tokio::time::timeout_at(at, fut)
                    .await
                    .map_err(|_| RagError::OperationTimedOut { operation })?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(RagError::OperationTimedOut { operation }),
            res = bounded => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_budget() {
        let d = Deadline::after(Duration::from_secs(5));
        let v = d.run("noop", async { Ok(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_times_out() {
        let d = Deadline::after(Duration::from_millis(10));
        let res: Result<()> = d
            .run("sleep", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            res,
            Err(RagError::OperationTimedOut { operation: "sleep" })
        ));
    }

    #[tokio::test]
    async fn test_budget_is_shared_across_calls() {
        let d = Deadline::after(Duration::from_millis(200));
        d.run("first", async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        })
        .await
        .unwrap();
        assert!(d.remaining().unwrap() <= Duration::from_millis(50));

        // A second call of the same length no longer fits.
        let res: Result<()> = d
            .run("second", async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            res,
            Err(RagError::OperationTimedOut { operation: "second" })
        ));
    }

    #[tokio::test]
    async fn test_cancel_from_other_task() {
        let d = Deadline::none();
        let handle = d.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });
        let res: Result<()> = d
            .run("wait", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(RagError::OperationTimedOut { .. })));
    }

    #[tokio::test]
    async fn test_already_cancelled_short_circuits() {
        let d = Deadline::none();
        d.cancel();
        let res = d.run("x", async { Ok(1) }).await;
        assert!(res.is_err());
    }
}
