//! Cache backing store.
//!
//! The backend owns the entry map and the tag index and keeps them consistent
//! as a pair: every mutation touches both under a single lock, so no reader can
//! observe an entry without its index records or an index record without its
//! entry. Single-flight coordination lives one level up in
//! [`crate::TaggedCache`]; a backend only has to be a correct, tag-aware map.

use crate::entry::CacheEntry;
use cadence_core::{CacheError, CadenceError, CadenceResult};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Result of a backend read.
#[derive(Debug)]
pub enum Lookup<V> {
    /// Live entry.
    Hit(Arc<V>),
    /// An entry existed but had expired; it has been removed.
    Expired,
    /// No entry under the key.
    Miss,
}

/// What an insert displaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// An entry under the same key was replaced.
    pub replaced: bool,
    /// Expired entries dropped to make room.
    pub expired: usize,
    /// Live entries evicted (least recently read first) to make room.
    pub evicted: usize,
}

/// Cache backend trait for pluggable stores.
///
/// Methods are synchronous: they are called while the cache holds its
/// in-flight registry lock, so they must not block on I/O. A distributed store
/// would sit behind a local write-through layer implementing this trait.
pub trait CacheBackend<V>: Send + Sync {
    /// Read a key, lazily removing it if expired.
    fn get(&self, key: &str, now: Instant) -> CadenceResult<Lookup<V>>;

    /// Insert or replace an entry, enforcing the capacity bound.
    fn insert(&self, entry: CacheEntry<V>, now: Instant) -> CadenceResult<InsertOutcome>;

    /// Remove one key. Returns whether an entry was present.
    fn remove(&self, key: &str) -> CadenceResult<bool>;

    /// Remove every entry carrying any of `tags`. Returns the number removed.
    fn remove_tagged(&self, tags: &BTreeSet<String>) -> CadenceResult<usize>;

    /// Drop all expired entries. Returns the number removed.
    fn purge_expired(&self, now: Instant) -> CadenceResult<usize>;

    /// Number of stored entries, expired or not.
    fn len(&self) -> CadenceResult<usize>;

    /// Keys currently indexed under `tag`.
    fn keys_for_tag(&self, tag: &str) -> CadenceResult<Vec<String>>;

    /// Every broken entry/tag-index invariant, described. Empty when consistent.
    fn tag_index_violations(&self) -> CadenceResult<Vec<String>>;
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

struct Slot<V> {
    entry: CacheEntry<V>,
    /// Logical read clock for LRU ordering; ties on `Instant` are common.
    access_seq: u64,
}

/// Entry map, tag index and the two ordering indexes, kept in step.
///
/// `by_access` maps each slot's `access_seq` to its key and `by_expiry` holds
/// `(expires_at, key)` for every slot, so eviction and purging touch only the
/// entries they remove.
struct BackendState<V> {
    entries: HashMap<String, Slot<V>>,
    tag_index: HashMap<String, HashSet<String>>,
    by_access: BTreeMap<u64, String>,
    by_expiry: BTreeSet<(Instant, String)>,
    access_clock: u64,
}

impl<V> BackendState<V> {
    fn next_seq(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    fn index(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn add_entry(&mut self, entry: CacheEntry<V>) {
        let access_seq = self.next_seq();
        let key = entry.key.clone();
        self.index(&key, &entry.tags);
        self.by_access.insert(access_seq, key.clone());
        self.by_expiry.insert((entry.expires_at, key.clone()));
        self.entries.insert(key, Slot { entry, access_seq });
    }

    fn remove_entry(&mut self, key: &str) -> Option<Slot<V>> {
        let slot = self.entries.remove(key)?;
        self.unindex(key, &slot.entry.tags);
        self.by_access.remove(&slot.access_seq);
        self.by_expiry.remove(&(slot.entry.expires_at, key.to_string()));
        Some(slot)
    }

    fn touch(&mut self, key: &str, now: Instant) -> Option<Arc<V>> {
        let seq = self.next_seq();
        let slot = self.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut slot.access_seq, seq);
        slot.entry.last_read = now;
        let value = Arc::clone(&slot.entry.value);
        self.by_access.remove(&previous);
        self.by_access.insert(seq, key.to_string());
        Some(value)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some((expires_at, key)) = self.by_expiry.first().cloned() {
            if expires_at > now {
                break;
            }
            self.remove_entry(&key);
            purged += 1;
        }
        purged
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, victim) = self.by_access.first_key_value()?;
        let victim = victim.clone();
        self.remove_entry(&victim);
        Some(victim)
    }
}

/// Default in-process backend: a hash map plus a tag index behind one mutex.
pub struct InMemoryBackend<V> {
    max_entries: usize,
    state: Mutex<BackendState<V>>,
}

impl<V> InMemoryBackend<V> {
    /// Create a backend holding at most `max_entries` entries (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            state: Mutex::new(BackendState {
                entries: HashMap::new(),
                tag_index: HashMap::new(),
                by_access: BTreeMap::new(),
                by_expiry: BTreeSet::new(),
                access_clock: 0,
            }),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn lock(&self) -> CadenceResult<MutexGuard<'_, BackendState<V>>> {
        self.state
            .lock()
            .map_err(|_| CadenceError::Cache(CacheError::LockPoisoned))
    }
}

impl<V: Send + Sync> CacheBackend<V> for InMemoryBackend<V> {
    fn get(&self, key: &str, now: Instant) -> CadenceResult<Lookup<V>> {
        let mut state = self.lock()?;
        let expired = match state.entries.get(key) {
            None => return Ok(Lookup::Miss),
            Some(slot) => slot.entry.is_expired(now),
        };
        if expired {
            state.remove_entry(key);
            return Ok(Lookup::Expired);
        }
        Ok(state.touch(key, now).map_or(Lookup::Miss, Lookup::Hit))
    }

    fn insert(&self, entry: CacheEntry<V>, now: Instant) -> CadenceResult<InsertOutcome> {
        let mut state = self.lock()?;
        let mut outcome = InsertOutcome {
            replaced: state.remove_entry(&entry.key).is_some(),
            ..Default::default()
        };

        if state.entries.len() >= self.max_entries {
            outcome.expired = state.purge_expired(now);
        }
        while state.entries.len() >= self.max_entries {
            if state.evict_least_recent().is_none() {
                break;
            }
            outcome.evicted += 1;
        }

        state.add_entry(entry);
        Ok(outcome)
    }

    fn remove(&self, key: &str) -> CadenceResult<bool> {
        let mut state = self.lock()?;
        Ok(state.remove_entry(key).is_some())
    }

    fn remove_tagged(&self, tags: &BTreeSet<String>) -> CadenceResult<usize> {
        let mut state = self.lock()?;
        let doomed: HashSet<String> = tags
            .iter()
            .filter_map(|tag| state.tag_index.get(tag))
            .flat_map(|keys| keys.iter().cloned())
            .collect();
        for key in &doomed {
            state.remove_entry(key);
        }
        Ok(doomed.len())
    }

    fn purge_expired(&self, now: Instant) -> CadenceResult<usize> {
        let mut state = self.lock()?;
        Ok(state.purge_expired(now))
    }

    fn len(&self) -> CadenceResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    fn keys_for_tag(&self, tag: &str) -> CadenceResult<Vec<String>> {
        let state = self.lock()?;
        let mut keys: Vec<String> = state
            .tag_index
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    fn tag_index_violations(&self) -> CadenceResult<Vec<String>> {
        let state = self.lock()?;
        let mut violations = Vec::new();

        for (tag, keys) in &state.tag_index {
            if keys.is_empty() {
                violations.push(format!("tag {tag} has an empty key set"));
            }
            for key in keys {
                match state.entries.get(key) {
                    None => violations.push(format!("tag {tag} references missing key {key}")),
                    Some(slot) if !slot.entry.tags.contains(tag) => violations.push(format!(
                        "tag {tag} references key {key} which does not carry it"
                    )),
                    Some(_) => {}
                }
            }
        }

        for (key, slot) in &state.entries {
            if slot.entry.key != *key {
                violations.push(format!("entry stored under {key} names itself {}", slot.entry.key));
            }
            for tag in &slot.entry.tags {
                let indexed = state
                    .tag_index
                    .get(tag)
                    .is_some_and(|keys| keys.contains(key));
                if !indexed {
                    violations.push(format!("key {key} carries tag {tag} but is not indexed"));
                }
            }
            if state.by_access.get(&slot.access_seq) != Some(key) {
                violations.push(format!("key {key} is missing from the access order"));
            }
            if !state.by_expiry.contains(&(slot.entry.expires_at, key.clone())) {
                violations.push(format!("key {key} is missing from the expiry order"));
            }
        }

        if state.by_access.len() != state.entries.len() || state.by_expiry.len() != state.entries.len() {
            violations.push(format!(
                "ordering indexes hold {} and {} keys for {} entries",
                state.by_access.len(),
                state.by_expiry.len(),
                state.entries.len()
            ));
        }

        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    fn entry(key: &str, value: u32, ttl_secs: u64, tag_list: &[&str], now: Instant) -> CacheEntry<u32> {
        CacheEntry::new(key, Arc::new(value), Duration::from_secs(ttl_secs), tags(tag_list), now)
    }

    #[test]
    fn test_insert_get_and_index() {
        let backend = InMemoryBackend::new(10);
        let now = Instant::now();
        backend.insert(entry("a", 1, 60, &["x", "y"], now), now).unwrap();

        assert!(matches!(backend.get("a", now).unwrap(), Lookup::Hit(v) if *v == 1));
        assert_eq!(backend.keys_for_tag("x").unwrap(), vec!["a".to_string()]);
        assert_eq!(backend.keys_for_tag("y").unwrap(), vec!["a".to_string()]);
        assert!(backend.tag_index_violations().unwrap().is_empty());
    }

    #[test]
    fn test_replace_reindexes_tags() {
        let backend = InMemoryBackend::new(10);
        let now = Instant::now();
        backend.insert(entry("a", 1, 60, &["old"], now), now).unwrap();
        let outcome = backend.insert(entry("a", 2, 60, &["new"], now), now).unwrap();

        assert!(outcome.replaced);
        assert!(backend.keys_for_tag("old").unwrap().is_empty());
        assert_eq!(backend.keys_for_tag("new").unwrap(), vec!["a".to_string()]);
        assert!(backend.tag_index_violations().unwrap().is_empty());
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let backend = InMemoryBackend::new(10);
        let now = Instant::now();
        backend.insert(entry("a", 1, 5, &["x"], now), now).unwrap();

        let later = now + Duration::from_secs(5);
        assert!(matches!(backend.get("a", later).unwrap(), Lookup::Expired));
        assert!(matches!(backend.get("a", later).unwrap(), Lookup::Miss));
        assert_eq!(backend.len().unwrap(), 0);
        assert!(backend.keys_for_tag("x").unwrap().is_empty());
    }

    #[test]
    fn test_remove_tagged_counts_each_key_once() {
        let backend = InMemoryBackend::new(10);
        let now = Instant::now();
        backend.insert(entry("a", 1, 60, &["x", "y"], now), now).unwrap();
        backend.insert(entry("b", 2, 60, &["y"], now), now).unwrap();
        backend.insert(entry("c", 3, 60, &["z"], now), now).unwrap();

        assert_eq!(backend.remove_tagged(&tags(&["x", "y"])).unwrap(), 2);
        assert_eq!(backend.len().unwrap(), 1);
        assert!(backend.tag_index_violations().unwrap().is_empty());
    }

    #[test]
    fn test_lru_eviction_prefers_least_recently_read() {
        let backend = InMemoryBackend::new(2);
        let now = Instant::now();
        backend.insert(entry("a", 1, 60, &[], now), now).unwrap();
        backend.insert(entry("b", 2, 60, &[], now), now).unwrap();
        // Reading "a" makes "b" the least recently used.
        assert!(matches!(backend.get("a", now).unwrap(), Lookup::Hit(_)));

        let outcome = backend.insert(entry("c", 3, 60, &[], now), now).unwrap();
        assert_eq!(outcome.evicted, 1);
        assert!(matches!(backend.get("b", now).unwrap(), Lookup::Miss));
        assert!(matches!(backend.get("a", now).unwrap(), Lookup::Hit(_)));
        assert!(matches!(backend.get("c", now).unwrap(), Lookup::Hit(_)));
    }

    #[test]
    fn test_capacity_prefers_dropping_expired() {
        let backend = InMemoryBackend::new(2);
        let now = Instant::now();
        backend.insert(entry("short", 1, 1, &["t"], now), now).unwrap();
        backend.insert(entry("long", 2, 60, &[], now), now).unwrap();

        let later = now + Duration::from_secs(2);
        let outcome = backend.insert(entry("new", 3, 60, &[], later), later).unwrap();
        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.evicted, 0);
        assert!(matches!(backend.get("long", later).unwrap(), Lookup::Hit(_)));
        assert!(backend.tag_index_violations().unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let backend: InMemoryBackend<u32> = InMemoryBackend::new(4);
        assert!(!backend.remove("missing").unwrap());
        let now = Instant::now();
        backend.insert(entry("a", 1, 60, &["x"], now), now).unwrap();
        assert!(backend.remove("a").unwrap());
        assert!(!backend.remove("a").unwrap());
        assert!(backend.keys_for_tag("x").unwrap().is_empty());
    }

    #[test]
    fn test_eviction_order_survives_reads_and_replacements() {
        let backend = InMemoryBackend::new(3);
        let now = Instant::now();
        for key in ["a", "b", "c"] {
            backend.insert(entry(key, 0, 60, &[], now), now).unwrap();
        }
        // Read order is now b, a; "c" was replaced and counts as fresh.
        assert!(matches!(backend.get("b", now).unwrap(), Lookup::Hit(_)));
        assert!(matches!(backend.get("a", now).unwrap(), Lookup::Hit(_)));
        backend.insert(entry("c", 1, 60, &[], now), now).unwrap();

        backend.insert(entry("d", 2, 60, &[], now), now).unwrap();
        assert!(matches!(backend.get("b", now).unwrap(), Lookup::Miss));
        backend.insert(entry("e", 3, 60, &[], now), now).unwrap();
        assert!(matches!(backend.get("a", now).unwrap(), Lookup::Miss));
        assert_eq!(backend.len().unwrap(), 3);
        assert!(backend.tag_index_violations().unwrap().is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let backend = InMemoryBackend::new(10);
        let now = Instant::now();
        backend.insert(entry("a", 1, 1, &["x"], now), now).unwrap();
        backend.insert(entry("b", 2, 100, &["x"], now), now).unwrap();

        assert_eq!(backend.purge_expired(now + Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(backend.keys_for_tag("x").unwrap(), vec!["b".to_string()]);
    }
}
