//! Admission control for parallel dispatch.
//!
//! A [`ConcurrencyGate`] is a counting semaphore sized to the batch's worker
//! bound. A run may start only while holding a [`GatePermit`]; dropping the
//! permit frees the slot. The gate also keeps pool statistics so the bound
//! can be checked after the fact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::BatchError;

/// Statistics about the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Maximum simultaneous permits.
    pub capacity: usize,
    /// Permits currently held.
    pub in_flight: u64,
    /// Highest `in_flight` ever observed.
    pub peak_in_flight: u64,
    /// Permits handed out.
    pub admitted: u64,
    /// Permits returned.
    pub released: u64,
}

impl GateStats {
    /// Fraction of capacity in use, as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.in_flight as f64 / self.capacity as f64) * 100.0
    }
}

/// Shared counters behind a gate and its permits.
#[derive(Debug, Default)]
struct SharedGateStats {
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    admitted: AtomicU64,
    released: AtomicU64,
}

impl SharedGateStats {
    fn record_admission(&self) {
        self.admitted.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_gate_stats(&self, capacity: usize) -> GateStats {
        GateStats {
            capacity,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            admitted: self.admitted.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

/// Bounds the number of runs in flight.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    stats: Arc<SharedGateStats>,
}

impl ConcurrencyGate {
    /// Creates a gate admitting at most `capacity` runs (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            stats: Arc::new(SharedGateStats::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit, BatchError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::GateClosed)?;
        self.stats.record_admission();
        debug!(
            available = self.semaphore.available_permits(),
            capacity = self.capacity,
            "Slot acquired"
        );
        Ok(GatePermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Takes a free slot without waiting, if there is one.
    pub fn try_acquire(&self) -> Option<GatePermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.stats.record_admission();
        Some(GatePermit {
            _permit: permit,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Refuses all further admissions. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn stats(&self) -> GateStats {
        self.stats.to_gate_stats(self.capacity)
    }
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    stats: Arc<SharedGateStats>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.stats.record_release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinSet;

    use super::*;

    #[test]
    fn test_gate_capacity_floor() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(), 1);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_permits_free_slots_on_drop() {
        let gate = ConcurrencyGate::new(2);
        let first = gate.acquire().await.unwrap();
        let _second = gate.acquire().await.unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.stats().in_flight, 2);

        drop(first);
        assert_eq!(gate.available(), 1);
        let stats = gate.stats();
        assert_eq!(stats.admitted, 2);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.utilization(), 50.0);
    }

    #[tokio::test]
    async fn test_closed_gate_refuses_admission() {
        let gate = ConcurrencyGate::new(1);
        gate.close();
        assert!(gate.is_closed());
        assert!(matches!(gate.acquire().await, Err(BatchError::GateClosed)));
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_capacity() {
        let gate = ConcurrencyGate::new(3);
        let mut set = JoinSet::new();
        for _ in 0..10 {
            let permit = gate.acquire().await.unwrap();
            set.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(permit);
            });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap();
        }

        let stats = gate.stats();
        assert_eq!(stats.admitted, 10);
        assert_eq!(stats.released, 10);
        assert_eq!(stats.in_flight, 0);
        assert!(stats.peak_in_flight <= 3);
        assert!(stats.peak_in_flight >= 1);
    }
}
