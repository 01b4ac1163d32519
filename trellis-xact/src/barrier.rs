//! The barrier lock: keeps cluster-wide barriers from slicing through a
//! commit window.
//!
//! Between the first `COMMIT PREPARED` send and the last response, the
//! coordinator holds the shared side; the external snapshot/checkpoint
//! facility takes the exclusive side. The lock is write-preferring and
//! fair: a pending barrier blocks new commit windows from entering, but
//! never starves; readers are admitted in groups between writers.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static GLOBAL_BARRIER: Lazy<BarrierLock> = Lazy::new(BarrierLock::new);

#[derive(Clone, Default)]
pub struct BarrierLock {
    inner: Arc<RwLock<()>>,
}

impl BarrierLock {
    pub fn new() -> BarrierLock {
        BarrierLock::default()
    }

    /// The process-wide instance every session's commit path uses.
    pub fn global() -> &'static BarrierLock {
        &GLOBAL_BARRIER
    }

    /// Enter a commit window.
    pub async fn share(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    /// Block out every commit window (barrier facility only).
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn commit_windows_share() {
        let lock = BarrierLock::new();
        let a = lock.share().await;
        let b = lock.share().await;
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn barrier_excludes_commit_windows() {
        let lock = BarrierLock::new();
        let barrier = lock.exclusive().await;

        let contender = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _shared = lock.share().await;
            })
        };
        // the commit window cannot enter while the barrier holds the lock
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(barrier);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("commit window should proceed after the barrier lifts")
            .unwrap();
    }
}
