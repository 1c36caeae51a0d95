//! CADENCE Test Utilities
//!
//! Shared test infrastructure for the CADENCE workspace:
//! - An in-memory `CountsRepository` with call counting, failure injection
//!   and artificial latency
//! - Proptest generators for dates, intervals, windows and policies
//! - Fixtures for the common scenarios

pub use cadence_compliance::{CountsRepository, InstitutionCounts};
pub use cadence_core::{
    CadenceConfig, CadenceError, CadenceResult, CyclePolicy, Date, InstitutionId,
    InternshipWindow, ObligationInterval, RepositoryError,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

// ============================================================================
// IN-MEMORY REPOSITORY
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InstitutionRecord {
    counts: InstitutionCounts,
    windows: Vec<InternshipWindow>,
}

/// In-memory [`CountsRepository`] for tests.
///
/// Unknown institutions answer `RepositoryError::InstitutionNotFound`. Calls
/// are counted when they start, before any injected latency, so concurrent
/// callers are visible while a slow call is still running.
#[derive(Debug, Default)]
pub struct InMemoryCountsRepository {
    institutions: RwLock<HashMap<InstitutionId, InstitutionRecord>>,
    failure: RwLock<Option<CadenceError>>,
    latency: RwLock<Duration>,
    counts_calls: AtomicUsize,
    window_calls: AtomicUsize,
}

impl InMemoryCountsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Self::set_institution`].
    pub fn with_institution(
        self,
        institution_id: InstitutionId,
        counts: InstitutionCounts,
        windows: Vec<InternshipWindow>,
    ) -> Self {
        self.set_institution(institution_id, counts, windows);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_institution(
        &self,
        institution_id: InstitutionId,
        counts: InstitutionCounts,
        windows: Vec<InternshipWindow>,
    ) {
        self.write_institutions()
            .insert(institution_id, InstitutionRecord { counts, windows });
    }

    pub fn set_counts(&self, institution_id: InstitutionId, counts: InstitutionCounts) {
        self.write_institutions()
            .entry(institution_id)
            .or_default()
            .counts = counts;
    }

    pub fn push_window(&self, institution_id: InstitutionId, window: InternshipWindow) {
        self.write_institutions()
            .entry(institution_id)
            .or_default()
            .windows
            .push(window);
    }

    /// Make every subsequent call fail with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<CadenceError>) {
        *self.failure.write().unwrap_or_else(|p| p.into_inner()) = error;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    pub fn counts_calls(&self) -> usize {
        self.counts_calls.load(Ordering::SeqCst)
    }

    pub fn window_calls(&self) -> usize {
        self.window_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.counts_calls.store(0, Ordering::SeqCst);
        self.window_calls.store(0, Ordering::SeqCst);
    }

    fn read_institutions(&self) -> RwLockReadGuard<'_, HashMap<InstitutionId, InstitutionRecord>> {
        self.institutions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_institutions(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<InstitutionId, InstitutionRecord>> {
        self.institutions.write().unwrap_or_else(|p| p.into_inner())
    }

    async fn simulate(&self, counter: &AtomicUsize) -> CadenceResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read().unwrap_or_else(|p| p.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.failure.read().unwrap_or_else(|p| p.into_inner()).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn record(&self, institution_id: InstitutionId) -> CadenceResult<InstitutionRecord> {
        self.read_institutions()
            .get(&institution_id)
            .cloned()
            .ok_or_else(|| RepositoryError::InstitutionNotFound { institution_id }.into())
    }
}

#[async_trait]
impl CountsRepository for InMemoryCountsRepository {
    async fn institution_counts(
        &self,
        institution_id: InstitutionId,
        _as_of: Date,
    ) -> CadenceResult<InstitutionCounts> {
        self.simulate(&self.counts_calls).await?;
        Ok(self.record(institution_id)?.counts)
    }

    async fn training_windows(
        &self,
        institution_id: InstitutionId,
        _as_of: Date,
    ) -> CadenceResult<Vec<InternshipWindow>> {
        self.simulate(&self.window_calls).await?;
        Ok(self.record(institution_id)?.windows)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for CADENCE value types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// A date between 2020-01-01 and 2030-12-31.
    pub fn arb_date() -> impl Strategy<Value = Date> {
        (0u64..4018).prop_map(|offset| {
            let base = Date::from_ymd_opt(2020, 1, 1).unwrap_or(Date::MIN);
            base.checked_add_days(chrono::Days::new(offset))
                .unwrap_or(base)
        })
    }

    /// A valid interval: bounded (up to ~15 months) or open.
    pub fn arb_interval() -> impl Strategy<Value = ObligationInterval> {
        (arb_date(), prop::option::of(0u64..460)).prop_map(|(start, length)| {
            let end = length.and_then(|days| start.checked_add_days(chrono::Days::new(days)));
            ObligationInterval { start, end }
        })
    }

    pub fn arb_institution_id() -> impl Strategy<Value = InstitutionId> {
        (1u64..10_000).prop_map(InstitutionId::new)
    }

    /// Headcounts, occasionally over-counted or empty.
    pub fn arb_counts() -> impl Strategy<Value = InstitutionCounts> {
        (0u32..200, 0u32..250, 0u32..250).prop_map(|(active, mentors, letters)| {
            InstitutionCounts::new(active, mentors, letters)
        })
    }

    /// A window as the repository might hand it over, including unusable ones
    /// (missing start, end before start) about one time in ten.
    pub fn arb_window() -> impl Strategy<Value = InternshipWindow> {
        (
            any::<[u8; 16]>(),
            prop::option::weighted(0.95, arb_date()),
            prop::option::of(-30i64..460),
            0u32..20,
            0u32..20,
            any::<bool>(),
        )
            .prop_map(|(id, start, length, reports, visits, last_month)| {
                let end = match (start, length) {
                    (Some(start), Some(days)) if days >= 0 => {
                        start.checked_add_days(chrono::Days::new(days as u64))
                    }
                    (Some(start), Some(days)) => {
                        start.checked_sub_days(chrono::Days::new(days.unsigned_abs()))
                    }
                    _ => None,
                };
                InternshipWindow::new(Uuid::from_bytes(id), start, end)
                    .with_reports(reports)
                    .with_visits(visits)
                    .with_last_month_report(last_month)
            })
    }

    /// A policy that passes `CadenceConfig::validate`.
    pub fn arb_cycle_policy() -> impl Strategy<Value = CyclePolicy> {
        (0u32..=27, 0u32..=27, 1u32..400).prop_map(|(report, visit, horizon)| CyclePolicy {
            report_grace_days: report,
            visit_grace_days: visit,
            open_horizon_days: horizon,
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the common scenarios.

    use super::*;
    use uuid::Uuid;

    /// Shorthand for a calendar date. Panics on an invalid date.
    pub fn date(year: i32, month: u32, day: u32) -> Date {
        Date::from_ymd_opt(year, month, day)
            .unwrap_or_else(|| panic!("invalid fixture date {year}-{month}-{day}"))
    }

    /// Internship from 2024-01-10 to 2024-04-15.
    pub fn winter_interval() -> ObligationInterval {
        ObligationInterval {
            start: date(2024, 1, 10),
            end: Some(date(2024, 4, 15)),
        }
    }

    /// Evaluation date used with [`winter_interval`].
    pub fn winter_as_of() -> Date {
        date(2024, 3, 1)
    }

    /// A window over [`winter_interval`] with the given submissions.
    pub fn winter_window(reports: u32, visits: u32) -> InternshipWindow {
        InternshipWindow::new(
            Uuid::now_v7(),
            Some(date(2024, 1, 10)),
            Some(date(2024, 4, 15)),
        )
        .with_reports(reports)
        .with_visits(visits)
    }

    /// Default configuration with a small cache, suitable for tests.
    pub fn test_config() -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.cache.max_entries = 64;
        config
    }

    /// Repository with institution 42 (10 students, 12 mentor assignments,
    /// 5 joining letters, one winter internship) and institution 7 (empty).
    pub fn two_institution_repository() -> InMemoryCountsRepository {
        InMemoryCountsRepository::new()
            .with_institution(
                InstitutionId::new(42),
                InstitutionCounts::new(10, 12, 5),
                vec![winter_window(1, 2)],
            )
            .with_institution(InstitutionId::new(7), InstitutionCounts::default(), Vec::new())
    }
}
