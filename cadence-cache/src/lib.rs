//! CADENCE Cache - Tagged Result Cache
//!
//! Memoizes expensive aggregates (institution statistics, state overviews)
//! behind a get-or-compute call. Entries expire by TTL, carry tags for bulk
//! invalidation, and are bounded by an LRU capacity. Concurrent misses on one
//! key share a single computation.
//!
//! The storage itself sits behind [`CacheBackend`] so a distributed store can
//! replace [`InMemoryBackend`] without touching callers.

pub mod backend;
pub mod entry;
pub mod stats;
pub mod tagged;

pub use backend::{CacheBackend, InMemoryBackend, InsertOutcome, Lookup};
pub use entry::{CacheEntry, EntryOptions};
pub use stats::CacheStats;
pub use tagged::TaggedCache;
