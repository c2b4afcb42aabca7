//! Concurrency slot token for the worker pool's bounded concurrency (spec §5).
//!
//! A `SlotToken` wraps a semaphore permit so the running-set size invariant
//! (`|running_set| <= N`) is enforced by RAII rather than manual bookkeeping.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A token representing one held worker-pool slot. Dropping it (or calling
/// [`SlotToken::release`]) frees the slot immediately.
pub struct SlotToken {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<Semaphore>,
}

impl SlotToken {
    /// Acquires a slot, waiting if the pool is at capacity.
    pub async fn acquire(semaphore: Arc<Semaphore>) -> Self {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        SlotToken { permit: Some(permit), semaphore }
    }

    /// Attempts to acquire a slot without waiting; `None` if the pool is
    /// currently at capacity. Used by the dispatch loop, which must never
    /// suspend while holding the scheduler's heap locks.
    pub fn try_acquire(semaphore: Arc<Semaphore>) -> Option<Self> {
        let permit = semaphore.clone().try_acquire_owned().ok()?;
        Some(SlotToken { permit: Some(permit), semaphore })
    }

    /// Releases the slot early, returning `true` if a permit was held.
    pub fn release(&mut self) -> bool {
        self.permit.take().is_some()
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_reduces_available_permits() {
        let semaphore = Arc::new(Semaphore::new(1));
        let token = SlotToken::acquire(semaphore.clone()).await;
        assert!(token.is_held());
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[tokio::test]
    async fn drop_returns_the_permit() {
        let semaphore = Arc::new(Semaphore::new(1));
        {
            let _token = SlotToken::acquire(semaphore.clone()).await;
            assert_eq!(semaphore.available_permits(), 0);
        }
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn release_frees_the_slot_early() {
        let semaphore = Arc::new(Semaphore::new(1));
        let mut token = SlotToken::acquire(semaphore.clone()).await;
        assert!(token.release());
        assert_eq!(semaphore.available_permits(), 1);
        assert!(!token.release());
    }

    #[tokio::test]
    async fn acquire_waits_for_availability() {
        let semaphore = Arc::new(Semaphore::new(1));
        let first = SlotToken::acquire(semaphore.clone()).await;

        let sem_clone = semaphore.clone();
        let handle = tokio::spawn(async move {
            SlotToken::acquire(sem_clone).await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(semaphore.available_permits(), 0);

        drop(first);
        let second = handle.await.unwrap();
        assert!(second.is_held());
    }
}
