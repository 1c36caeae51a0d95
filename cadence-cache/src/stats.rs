//! Cache usage counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a live entry.
    pub hits: u64,
    /// Reads that found no live entry and started (or would start) a computation.
    pub misses: u64,
    /// Callers that joined a computation already in flight.
    pub coalesced: u64,
    /// Live entries evicted due to capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL ran out.
    pub expirations: u64,
    /// Entries removed by `delete` or tag invalidation.
    pub invalidations: u64,
    /// Computations whose result was discarded because they were invalidated mid-flight.
    pub detached_flights: u64,
    /// Computations that failed.
    pub failures: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Number of computations currently running.
    pub in_flight: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Coalesced callers count as misses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub invalidations: AtomicU64,
    pub detached_flights: AtomicU64,
    pub failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        if by > 0 {
            counter.fetch_add(by, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, entry_count: u64, in_flight: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            detached_flights: self.detached_flights.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            entry_count,
            in_flight,
        }
    }
}
