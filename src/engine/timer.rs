// Cojoin Engine — Inactivity Timer
//
// One resettable countdown per widget instance, backed by a tokio task.
// Every arm bumps a generation counter; the expiry callback receives the
// generation it was armed with so the owner can ignore a late firing that
// raced a reset. Cancel is idempotent and also runs on drop.

use log::{debug, warn};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct InactivityTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl InactivityTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start the countdown. Returns the new generation, or `None` when
    /// there is no runtime to host the task.
    pub fn arm<F>(&mut self, after: Duration, on_expire: F) -> Option<u64>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!("[timer] No async runtime; inactivity timer not armed");
            return None;
        };
        self.generation += 1;
        let generation = self.generation;
        self.handle = Some(rt.spawn(async move {
            tokio::time::sleep(after).await;
            on_expire(generation);
        }));
        debug!("[timer] Armed gen={} for {:?}", generation, after);
        Some(generation)
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("[timer] Cancelled gen={}", self.generation);
        }
    }

    /// True when `generation` is the live countdown. Consumes it, so a
    /// second firing with the same generation is rejected.
    pub fn take_expired(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && self.generation == generation {
            self.handle = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for InactivityTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_period() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut t = InactivityTimer::new();
        let f = fired.clone();
        let gen = t.arm(Duration::from_millis(30), move |g| f.store(g, Ordering::SeqCst)).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), gen);
        assert!(t.take_expired(gen));
        assert!(!t.take_expired(gen));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_countdown() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut t = InactivityTimer::new();
        let f1 = fired.clone();
        t.arm(Duration::from_millis(30), move |_| { f1.fetch_add(1, Ordering::SeqCst); });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let f2 = fired.clone();
        t.arm(Duration::from_millis(30), move |_| { f2.fetch_add(10, Ordering::SeqCst); });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let fired = Arc::new(AtomicU64::new(0));
        let mut t = InactivityTimer::new();
        let f = fired.clone();
        t.arm(Duration::from_millis(10), move |_| { f.fetch_add(1, Ordering::SeqCst); });
        t.cancel();
        t.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!t.is_armed());
    }

    #[test]
    fn no_runtime_means_not_armed() {
        let mut t = InactivityTimer::new();
        assert!(t.arm(Duration::from_millis(5), |_| {}).is_none());
        assert!(!t.is_armed());
    }
}
