//! Identity types for CADENCE entities

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Internship identifier. UUIDv7 keeps records sortable by creation time.
pub type InternshipId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Calendar date without a timezone. All cycle arithmetic happens on dates.
pub type Date = NaiveDate;

/// Generate a new UUIDv7 internship identifier.
pub fn new_internship_id() -> InternshipId {
    Uuid::now_v7()
}

/// Institution identifier as issued by the upstream registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstitutionId(u64);

impl InstitutionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for InstitutionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for InstitutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short, stable digest of arbitrary bytes, hex encoded.
///
/// Used for cache keys where the full parameter set is too long to embed.
/// 16 hex characters (64 bits) is plenty for distinguishing parameter sets of
/// one institution on one day.
pub fn short_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
