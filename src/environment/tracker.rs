//! Accounting of live environments.
//!
//! Every [`Environment`](super::Environment) holds an [`EnvironmentLease`]
//! for its whole lifetime. The lease is released after the environment's
//! resources are gone, so `live() == 0` means nothing is left to clean up.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
struct TrackerState {
    live: AtomicUsize,
    peak: AtomicUsize,
    created: AtomicU64,
    torn_down: AtomicU64,
}

/// Shared counter of environments created, alive and torn down.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentTracker {
    state: Arc<TrackerState>,
}

/// Point-in-time view of an [`EnvironmentTracker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerSnapshot {
    pub live: usize,
    pub peak: usize,
    pub created: u64,
    pub torn_down: u64,
}

impl EnvironmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new environment. Dropping the lease marks it torn down.
    pub fn lease(&self) -> EnvironmentLease {
        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);
        self.state.created.fetch_add(1, Ordering::SeqCst);
        EnvironmentLease {
            state: Arc::clone(&self.state),
        }
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            live: self.live(),
            peak: self.peak(),
            created: self.state.created.load(Ordering::SeqCst),
            torn_down: self.state.torn_down.load(Ordering::SeqCst),
        }
    }
}

/// Proof that one environment is alive.
#[derive(Debug)]
pub struct EnvironmentLease {
    state: Arc<TrackerState>,
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.torn_down.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_accounting() {
        let tracker = EnvironmentTracker::new();
        assert_eq!(tracker.snapshot(), TrackerSnapshot::default());

        let a = tracker.lease();
        let b = tracker.lease();
        assert_eq!(tracker.live(), 2);
        drop(a);
        assert_eq!(tracker.live(), 1);
        let c = tracker.lease();
        assert_eq!(tracker.peak(), 2);
        drop(b);
        drop(c);

        let snap = tracker.snapshot();
        assert_eq!(snap.live, 0);
        assert_eq!(snap.peak, 2);
        assert_eq!(snap.created, 3);
        assert_eq!(snap.torn_down, 3);
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = EnvironmentTracker::new();
        let clone = tracker.clone();
        let _lease = clone.lease();
        assert_eq!(tracker.live(), 1);
    }

    #[test]
    fn test_peak_across_threads() {
        let tracker = EnvironmentTracker::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let t = tracker.clone();
                std::thread::spawn(move || {
                    let _lease = t.lease();
                    std::thread::sleep(std::time::Duration::from_millis(5));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.live(), 0);
        assert!(tracker.peak() >= 1 && tracker.peak() <= 8);
        assert_eq!(tracker.snapshot().created, 8);
    }
}
