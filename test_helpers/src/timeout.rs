//! Await a future with a deadline, panicking with context on expiry.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Extension trait bounding how long a test future may run.
#[async_trait]
pub trait FutureTimeout: Future + Send + Sized {
    /// Await `self`, panicking if it does not resolve within `duration`.
    async fn with_timeout_panic(self, duration: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self)
            .await
            .expect("timeout waiting for future")
    }

    /// Await `self`, returning `Err` if it does not resolve within `duration`.
    async fn with_timeout(self, duration: Duration) -> Result<Self::Output, ()>
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self).await.map_err(|_| ())
    }
}

#[async_trait]
impl<F> FutureTimeout for F where F: Future + Send {}
