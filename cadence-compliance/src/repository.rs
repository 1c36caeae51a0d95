//! Counts repository seam.
//!
//! The aggregator never queries storage itself. Whatever owns the schema
//! implements [`CountsRepository`] and hands back raw counts and the date
//! windows of the institution's in-training internships.

use async_trait::async_trait;
use cadence_core::{CadenceResult, Date, InstitutionId, InternshipWindow};
use serde::{Deserialize, Serialize};

/// Raw headcounts for one institution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstitutionCounts {
    /// Students with an active internship.
    pub active_students: u32,
    /// Active students with a faculty mentor assigned.
    pub mentor_assignments: u32,
    /// Active students whose joining letter has been uploaded.
    pub joining_letters: u32,
}

impl InstitutionCounts {
    pub fn new(active_students: u32, mentor_assignments: u32, joining_letters: u32) -> Self {
        Self {
            active_students,
            mentor_assignments,
            joining_letters,
        }
    }
}

/// Source of the raw figures behind institution statistics.
///
/// Implementations should return `RepositoryError` variants for storage
/// failures so callers can tell a retryable outage from bad input.
#[async_trait]
pub trait CountsRepository: Send + Sync {
    /// Headcounts for the institution as of the given date.
    async fn institution_counts(
        &self,
        institution_id: InstitutionId,
        as_of: Date,
    ) -> CadenceResult<InstitutionCounts>;

    /// Every internship of the institution that is in training as of the date.
    async fn training_windows(
        &self,
        institution_id: InstitutionId,
        as_of: Date,
    ) -> CadenceResult<Vec<InternshipWindow>>;
}
