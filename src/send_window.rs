//! Bounded concurrency for outbound network sends, so a burst of ready
//! flows cannot all dial/write at once and starve the poll loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

pub struct SendWindow {
    semaphore: Arc<Semaphore>,
}

impl SendWindow {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Waits up to `wait` for a send slot. Returns `None` on timeout, which
    /// callers should treat as backpressure rather than an error.
    pub async fn acquire(&self, wait: Duration) -> Option<SemaphorePermit<'_>> {
        match timeout(wait, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_)) => None, // semaphore closed
            Err(_) => None,     // timed out
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_while_permits_remain() {
        let window = SendWindow::new(1);
        let permit = window.acquire(Duration::from_millis(50)).await;
        assert!(permit.is_some());
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let window = SendWindow::new(1);
        let _held = window.acquire(Duration::from_millis(50)).await.unwrap();
        let second = window.acquire(Duration::from_millis(10)).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn releasing_a_permit_frees_capacity() {
        let window = SendWindow::new(1);
        {
            let _held = window.acquire(Duration::from_millis(50)).await.unwrap();
        }
        let second = window.acquire(Duration::from_millis(50)).await;
        assert!(second.is_some());
    }
}
