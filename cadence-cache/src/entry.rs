//! Cache entries and per-entry options.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Roughly a century. Used when `now + ttl` would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Options attached to an entry when it is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Time to live. `None` falls back to the cache's default TTL.
    pub ttl: Option<Duration>,
    /// Tags for bulk invalidation.
    pub tags: BTreeSet<String>,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Whether any of this entry's tags appear in `tags`.
    pub fn matches_any(&self, tags: &BTreeSet<String>) -> bool {
        !self.tags.is_disjoint(tags)
    }
}

/// One cached value.
///
/// Owned exclusively by a [`crate::CacheBackend`]; callers only ever see the
/// `Arc<V>` inside.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: Arc<V>,
    pub expires_at: Instant,
    pub tags: BTreeSet<String>,
    pub last_read: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: Arc<V>, ttl: Duration, tags: BTreeSet<String>, now: Instant) -> Self {
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        Self {
            key: key.into(),
            value,
            expires_at,
            tags,
            last_read: now,
        }
    }

    /// Expired entries are never served.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}
