//! Fixed pool of sandbox slots

use crate::error::OrchestrationError;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded set of concurrent execution slots, shared by every pipeline
#[derive(Debug, Clone)]
pub struct SlotPool {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a slot and create a fresh scratch directory for it.
    ///
    /// Both are released when the session drops, whichever way the run ends.
    pub async fn acquire(&self) -> Result<SandboxSession> {
        let permit = self.slots.clone().acquire_owned().await.map_err(|_| {
            OrchestrationError::ExecutionError("sandbox slot pool closed".to_string())
        })?;

        let scratch = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| {
                OrchestrationError::ExecutionError(format!("scratch dir unavailable: {}", e))
            })?;

        Ok(SandboxSession {
            scratch,
            _permit: permit,
        })
    }
}

/// One acquired slot plus its scratch area
#[derive(Debug)]
pub struct SandboxSession {
    scratch: TempDir,
    _permit: OwnedSemaphorePermit,
}

impl SandboxSession {
    pub fn scratch(&self) -> &Path {
        self.scratch.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_releases_slot_and_scratch_on_drop() {
        let pool = SlotPool::new(2);
        let session = pool.acquire().await.unwrap();
        let scratch = session.scratch().to_path_buf();

        assert!(scratch.exists());
        assert_eq!(pool.available(), 1);

        drop(session);
        assert_eq!(pool.available(), 2);
        assert!(!scratch.exists());
    }

    #[tokio::test]
    async fn test_acquire_waits_when_exhausted() {
        let pool = SlotPool::new(1);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            pool.acquire(),
        )
        .await;
        assert!(waiting.is_err());

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        assert_eq!(SlotPool::new(0).capacity(), 1);
    }
}
