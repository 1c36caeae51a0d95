//! Institution and directorate compliance aggregates.
//!
//! [`ComplianceAggregator`] turns the raw counts supplied by a
//! [`CountsRepository`] into [`InstitutionStats`] and memoizes the result in a
//! [`TaggedCache`]. Expected report and visit counts come from the
//! [`CycleCalculator`]; nothing in this module does month arithmetic itself.
//!
//! # Cache layout
//!
//! | Aggregate | Key | Tags |
//! |---|---|---|
//! | institution stats | `stats:<id>:<as_of>:<policy digest>` | `institution:<id>`, `stats` |
//! | state overview | `overview:<as_of>:<policy digest>:<ids digest>` | `overview`, `stats`, every member's `institution:<id>` |
//!
//! Any mutation upstream (a student enrolled, a mentor reassigned, a report or
//! visit recorded) calls [`ComplianceAggregator::invalidate_institution`],
//! which drops the institution's stats and every overview that includes it.

use crate::repository::{CountsRepository, InstitutionCounts};
use crate::score::{capped_rate, mean_rate, round_rate, ComplianceComponent, ComplianceScore};
use cadence_cache::{CacheStats, EntryOptions, TaggedCache};
use cadence_core::{
    previous_month_start, short_digest, CadenceConfig, CadenceError, CadenceResult,
    CycleCalculator, CyclePolicy, Date, InstitutionId, InternshipWindow, IntervalError,
    ObligationKind, RepositoryError, StatsConfig,
};
use futures_util::future::{try_join, try_join_all};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const STATS_TAG: &str = "stats";
const OVERVIEW_TAG: &str = "overview";

/// Cache tag shared by every aggregate that depends on one institution.
pub fn institution_tag(institution_id: InstitutionId) -> String {
    format!("institution:{}", institution_id)
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Report figures for the calendar month before `as_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyReportSummary {
    /// First day of the month being reported on.
    pub month: Date,
    /// Internships whose report for that month is due as of `as_of`.
    pub expected: u32,
    /// Of those, internships that submitted it.
    pub submitted: u32,
    pub missing: u32,
}

/// Compliance statistics for one institution on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstitutionStats {
    pub institution_id: InstitutionId,
    pub as_of: Date,
    pub counts: InstitutionCounts,
    /// Mentor assignment and joining letter coverage.
    pub score: ComplianceScore,
    /// In-training internships that were evaluated.
    pub in_training: u32,
    pub expected_visits: u64,
    pub completed_visits: u64,
    /// Informational; not part of `score`.
    pub visit_completion_rate: Option<f64>,
    pub expected_reports: u64,
    pub submitted_reports: u64,
    /// Informational; not part of `score`.
    pub report_submission_rate: Option<f64>,
    pub last_month: MonthlyReportSummary,
    /// Internships left out because their dates could not be evaluated.
    pub skipped_intervals: u32,
}

/// Directorate-wide roll-up over several institutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateOverview {
    pub as_of: Date,
    /// Per-institution stats, ordered by institution id.
    pub institutions: Vec<InstitutionStats>,
    /// Rounded mean of the non-null institution scores.
    pub mean_score: Option<u32>,
    /// Institutions whose score is null (no active students).
    pub unscored_institutions: u32,
    pub active_students: u64,
    pub last_month_missing_reports: u64,
}

impl StateOverview {
    fn from_institutions(as_of: Date, institutions: Vec<InstitutionStats>) -> Self {
        let mean_score = round_rate(mean_rate(
            institutions
                .iter()
                .map(|stats| stats.score.value.map(f64::from)),
        ));
        let unscored_institutions = institutions
            .iter()
            .filter(|stats| stats.score.is_null())
            .count() as u32;
        Self {
            as_of,
            mean_score,
            unscored_institutions,
            active_students: institutions
                .iter()
                .map(|stats| u64::from(stats.counts.active_students))
                .sum(),
            last_month_missing_reports: institutions
                .iter()
                .map(|stats| u64::from(stats.last_month.missing))
                .sum(),
            institutions,
        }
    }
}

/// Upstream writes that change an institution's figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Student,
    MentorAssignment,
    JoiningLetter,
    MonthlyReport,
    FacultyVisit,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Student => "student",
            Self::MentorAssignment => "mentor_assignment",
            Self::JoiningLetter => "joining_letter",
            Self::MonthlyReport => "monthly_report",
            Self::FacultyVisit => "faculty_visit",
        };
        f.write_str(name)
    }
}

/// Usage counters of both aggregate caches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorCacheStats {
    pub institutions: CacheStats,
    pub overviews: CacheStats,
}

// ============================================================================
// PURE AGGREGATION
// ============================================================================

struct WindowFigures {
    visits_due: u32,
    reports_due: u32,
    last_month_due: bool,
}

fn evaluate_window(
    calculator: &CycleCalculator,
    window: &InternshipWindow,
    as_of: Date,
    last_month: Date,
) -> Result<WindowFigures, IntervalError> {
    let interval = window.interval()?;
    Ok(WindowFigures {
        visits_due: calculator.expected_due(&interval, as_of, ObligationKind::Visit)?,
        reports_due: calculator.expected_due(&interval, as_of, ObligationKind::Report)?,
        last_month_due: calculator.expected_in_month(
            &interval,
            last_month,
            as_of,
            ObligationKind::Report,
        )?,
    })
}

/// Build an institution's stats from already-fetched figures.
///
/// Windows whose dates cannot be evaluated are skipped and counted; they never
/// contribute a zero to any denominator.
pub fn summarize_institution(
    calculator: &CycleCalculator,
    institution_id: InstitutionId,
    as_of: Date,
    counts: InstitutionCounts,
    windows: &[InternshipWindow],
) -> InstitutionStats {
    let active = u64::from(counts.active_students);
    let score = ComplianceScore::blend([
        (
            ComplianceComponent::MentorAssignment,
            capped_rate(u64::from(counts.mentor_assignments), active),
        ),
        (
            ComplianceComponent::JoiningLetter,
            capped_rate(u64::from(counts.joining_letters), active),
        ),
    ]);

    let month = previous_month_start(as_of);
    let mut last_month = MonthlyReportSummary {
        month,
        expected: 0,
        submitted: 0,
        missing: 0,
    };
    let mut in_training = 0u32;
    let mut skipped_intervals = 0u32;
    let (mut expected_visits, mut completed_visits) = (0u64, 0u64);
    let (mut expected_reports, mut submitted_reports) = (0u64, 0u64);

    for window in windows {
        let figures = match evaluate_window(calculator, window, as_of, month) {
            Ok(figures) => figures,
            Err(reason) => {
                skipped_intervals += 1;
                warn!(
                    %institution_id,
                    internship_id = %window.internship_id,
                    %reason,
                    "skipping internship with unusable dates"
                );
                continue;
            }
        };

        in_training += 1;
        expected_visits += u64::from(figures.visits_due);
        completed_visits += u64::from(window.visits_completed);
        expected_reports += u64::from(figures.reports_due);
        submitted_reports += u64::from(window.reports_submitted);
        if figures.last_month_due {
            last_month.expected += 1;
            if window.report_submitted_last_month {
                last_month.submitted += 1;
            }
        }
    }
    last_month.missing = last_month.expected.saturating_sub(last_month.submitted);

    InstitutionStats {
        institution_id,
        as_of,
        counts,
        score,
        in_training,
        expected_visits,
        completed_visits,
        visit_completion_rate: capped_rate(completed_visits, expected_visits),
        expected_reports,
        submitted_reports,
        report_submission_rate: capped_rate(submitted_reports, expected_reports),
        last_month,
        skipped_intervals,
    }
}

/// Key component identifying the counting rules a figure was computed under.
fn policy_digest(policy: &CyclePolicy) -> String {
    let params = format!(
        "report_grace={};visit_grace={};open_horizon={}",
        policy.report_grace_days, policy.visit_grace_days, policy.open_horizon_days
    );
    short_digest(params.as_bytes())
}

/// Callers get one retryable error kind regardless of which layer failed.
fn unavailable(scope: impl Into<String>, error: CadenceError) -> CadenceError {
    match error {
        already @ CadenceError::StatsUnavailable { .. } => already,
        other => CadenceError::StatsUnavailable {
            scope: scope.into(),
            reason: other.to_string(),
        },
    }
}

async fn with_timeout<T, F>(operation: &str, limit: Duration, call: F) -> CadenceResult<T>
where
    F: Future<Output = CadenceResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(operation, limit)),
    }
}

fn timeout_error(operation: &str, limit: Duration) -> CadenceError {
    RepositoryError::Timeout {
        operation: operation.to_string(),
        elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
    }
    .into()
}

// ============================================================================
// AGGREGATOR
// ============================================================================

/// Cached compliance figures over an injected counts repository.
///
/// Holds no per-request state; clones share the repository and both caches.
#[derive(Clone)]
pub struct ComplianceAggregator {
    repository: Arc<dyn CountsRepository>,
    calculator: CycleCalculator,
    settings: StatsConfig,
    sweep_interval: Option<Duration>,
    policy_digest: String,
    institutions: TaggedCache<InstitutionStats>,
    overviews: TaggedCache<StateOverview>,
}

impl ComplianceAggregator {
    /// Build an aggregator after validating `config`.
    pub fn new(repository: Arc<dyn CountsRepository>, config: &CadenceConfig) -> CadenceResult<Self> {
        config.validate()?;
        Ok(Self {
            repository,
            calculator: CycleCalculator::new(config.cycle),
            settings: config.stats.clone(),
            sweep_interval: config.cache.sweep_interval,
            policy_digest: policy_digest(&config.cycle),
            institutions: TaggedCache::new(&config.cache),
            overviews: TaggedCache::new(&config.cache),
        })
    }

    pub fn calculator(&self) -> &CycleCalculator {
        &self.calculator
    }

    /// Cache key for one institution's stats.
    pub fn stats_key(&self, institution_id: InstitutionId, as_of: Date) -> String {
        format!("stats:{}:{}:{}", institution_id, as_of, self.policy_digest)
    }

    /// Cache key for an overview over an already sorted, deduplicated id list.
    fn overview_key(&self, institution_ids: &[InstitutionId], as_of: Date) -> String {
        let ids = institution_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "overview:{}:{}:{}",
            as_of,
            self.policy_digest,
            short_digest(ids.as_bytes())
        )
    }

    /// Compliance statistics for one institution as of `as_of`.
    ///
    /// Served from cache while fresh. Concurrent requests for the same
    /// institution and day share one computation. Any repository or cache
    /// failure is reported as [`CadenceError::StatsUnavailable`]; a null score
    /// is a successful result.
    #[instrument(skip_all, fields(institution_id = %institution_id, as_of = %as_of))]
    pub async fn compute_institution_stats(
        &self,
        institution_id: InstitutionId,
        as_of: Date,
    ) -> CadenceResult<Arc<InstitutionStats>> {
        let key = self.stats_key(institution_id, as_of);
        let options = EntryOptions::new()
            .with_ttl(self.settings.institution_ttl)
            .with_tags([institution_tag(institution_id), STATS_TAG.to_string()]);

        let repository = Arc::clone(&self.repository);
        let calculator = self.calculator;
        let timeout = self.settings.repository_timeout;

        self.institutions
            .get_or_set(&key, options, move || async move {
                let started = Instant::now();
                let (counts, windows) = try_join(
                    with_timeout(
                        "institution_counts",
                        timeout,
                        repository.institution_counts(institution_id, as_of),
                    ),
                    with_timeout(
                        "training_windows",
                        timeout,
                        repository.training_windows(institution_id, as_of),
                    ),
                )
                .await?;

                let stats =
                    summarize_institution(&calculator, institution_id, as_of, counts, &windows);
                info!(
                    %institution_id,
                    %as_of,
                    score = ?stats.score.value,
                    in_training = stats.in_training,
                    skipped = stats.skipped_intervals,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "computed institution stats"
                );
                Ok(stats)
            })
            .await
            .map_err(|e| unavailable(format!("institution {}", institution_id), e))
    }

    /// Directorate roll-up over `institution_ids` as of `as_of`.
    ///
    /// Order and duplicates in `institution_ids` do not matter. Member stats
    /// are fetched through [`Self::compute_institution_stats`], so a warm
    /// institution cache makes a cold overview cheap.
    #[instrument(skip_all, fields(institutions = institution_ids.len(), as_of = %as_of))]
    pub async fn compute_state_overview(
        &self,
        institution_ids: &[InstitutionId],
        as_of: Date,
    ) -> CadenceResult<Arc<StateOverview>> {
        let mut ids = institution_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let key = self.overview_key(&ids, as_of);
        let options = EntryOptions::new()
            .with_ttl(self.settings.overview_ttl)
            .with_tags([OVERVIEW_TAG.to_string(), STATS_TAG.to_string()])
            .with_tags(ids.iter().copied().map(institution_tag));

        let aggregator = self.clone();
        self.overviews
            .get_or_set(&key, options, move || async move {
                let members = try_join_all(
                    ids.iter()
                        .map(|&id| aggregator.compute_institution_stats(id, as_of)),
                )
                .await?;
                let overview = StateOverview::from_institutions(
                    as_of,
                    members.iter().map(|stats| stats.as_ref().clone()).collect(),
                );
                info!(
                    %as_of,
                    institutions = overview.institutions.len(),
                    mean_score = ?overview.mean_score,
                    "computed state overview"
                );
                Ok(overview)
            })
            .await
            .map_err(|e| unavailable(format!("state overview {}", as_of), e))
    }

    /// Drop every cached aggregate that depends on `institution_id`.
    ///
    /// Returns the number of cache entries removed. Computations already
    /// running for the institution still answer their callers but are not
    /// cached.
    pub fn invalidate_institution(
        &self,
        institution_id: InstitutionId,
        kind: MutationKind,
    ) -> CadenceResult<usize> {
        let tag = institution_tag(institution_id);
        let removed = self.institutions.invalidate_by_tags([tag.as_str()])?
            + self.overviews.invalidate_by_tags([tag.as_str()])?;
        debug!(%institution_id, %kind, removed, "invalidated institution aggregates");
        Ok(removed)
    }

    /// Drop every cached aggregate, e.g. after a bulk import.
    pub fn invalidate_all_stats(&self) -> CadenceResult<usize> {
        let removed = self.institutions.invalidate_by_tags([STATS_TAG])?
            + self.overviews.invalidate_by_tags([STATS_TAG])?;
        info!(removed, "invalidated all compliance aggregates");
        Ok(removed)
    }

    /// Start background expiry sweeps when a sweep interval is configured.
    ///
    /// Must be called from within a Tokio runtime. Returns no handles when
    /// sweeping is disabled.
    pub fn start_sweepers(&self) -> Vec<JoinHandle<()>> {
        match self.sweep_interval {
            Some(every) => vec![
                self.institutions.spawn_sweeper(every),
                self.overviews.spawn_sweeper(every),
            ],
            None => Vec::new(),
        }
    }

    pub fn cache_stats(&self) -> CadenceResult<AggregatorCacheStats> {
        Ok(AggregatorCacheStats {
            institutions: self.institutions.stats()?,
            overviews: self.overviews.stats()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::InternshipId;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> Date {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn window(start: Option<Date>, end: Option<Date>) -> InternshipWindow {
        InternshipWindow::new(InternshipId::nil(), start, end)
    }

    fn calculator() -> CycleCalculator {
        CycleCalculator::new(CyclePolicy::default())
    }

    #[test]
    fn test_timeout_error_saturates_huge_limits() {
        let err = timeout_error("institution_counts", Duration::MAX);
        assert!(matches!(
            err,
            CadenceError::Repository(RepositoryError::Timeout { elapsed_ms: u64::MAX, .. })
        ));
        let err = timeout_error("training_windows", Duration::from_millis(2500));
        assert!(matches!(
            err,
            CadenceError::Repository(RepositoryError::Timeout { elapsed_ms: 2500, .. })
        ));
    }

    #[test]
    fn test_no_active_students_gives_null_score() {
        let stats = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 1),
            InstitutionCounts::new(0, 0, 0),
            &[],
        );
        assert!(stats.score.is_null());
        assert_eq!(stats.score.component(ComplianceComponent::MentorAssignment), None);
        assert_eq!(stats.score.component(ComplianceComponent::JoiningLetter), None);
        assert_eq!(stats.visit_completion_rate, None);
        assert_eq!(stats.report_submission_rate, None);
    }

    #[test]
    fn test_over_assignment_is_capped() {
        let stats = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 1),
            InstitutionCounts::new(10, 12, 10),
            &[],
        );
        assert_eq!(
            stats.score.component(ComplianceComponent::MentorAssignment),
            Some(100.0)
        );
        assert_eq!(stats.score.value, Some(100));
    }

    #[test]
    fn test_visit_and_report_rates_are_informational() {
        let windows = [window(Some(date(2024, 1, 10)), Some(date(2024, 4, 15)))
            .with_reports(1)
            .with_visits(2)];
        let stats = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 1),
            InstitutionCounts::new(1, 1, 0),
            &windows,
        );

        assert_eq!(stats.expected_reports, 2);
        assert_eq!(stats.report_submission_rate, Some(50.0));
        assert_eq!(stats.expected_visits, 2);
        assert_eq!(stats.visit_completion_rate, Some(100.0));
        // Score only reflects mentor (100) and joining letter (0) coverage.
        assert_eq!(stats.score.value, Some(50));
    }

    #[test]
    fn test_invalid_windows_are_skipped_and_counted() {
        let windows = [
            window(None, None),
            window(Some(date(2024, 3, 10)), Some(date(2024, 2, 1))),
            window(Some(date(2024, 1, 10)), None).with_reports(2),
        ];
        let stats = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 1),
            InstitutionCounts::new(3, 3, 3),
            &windows,
        );
        assert_eq!(stats.skipped_intervals, 2);
        assert_eq!(stats.in_training, 1);
        assert_eq!(stats.expected_reports, 2);
        assert_eq!(stats.submitted_reports, 2);
    }

    #[test]
    fn test_last_month_uses_its_own_deadline() {
        let windows = [
            window(Some(date(2024, 1, 10)), None).with_last_month_report(true),
            window(Some(date(2024, 1, 10)), None),
            // Starts this month: owes nothing for last month.
            window(Some(date(2024, 3, 2)), None),
        ];

        // February's report is not due until March 6.
        let early = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 3),
            InstitutionCounts::new(3, 3, 3),
            &windows,
        );
        assert_eq!(early.last_month.month, date(2024, 2, 1));
        assert_eq!(early.last_month.expected, 0);

        let late = summarize_institution(
            &calculator(),
            InstitutionId::new(1),
            date(2024, 3, 6),
            InstitutionCounts::new(3, 3, 3),
            &windows,
        );
        assert_eq!(late.last_month.expected, 2);
        assert_eq!(late.last_month.submitted, 1);
        assert_eq!(late.last_month.missing, 1);
    }

    #[test]
    fn test_unavailable_does_not_double_wrap() {
        let inner = CadenceError::StatsUnavailable {
            scope: "institution 4".to_string(),
            reason: "db down".to_string(),
        };
        assert_eq!(unavailable("state overview", inner.clone()), inner);

        let wrapped = unavailable(
            "institution 4",
            RepositoryError::Unavailable {
                reason: "db down".to_string(),
            }
            .into(),
        );
        assert!(matches!(wrapped, CadenceError::StatsUnavailable { .. }));
        assert!(wrapped.is_retryable());
    }

    #[test]
    fn test_policy_digest_tracks_policy() {
        let default = policy_digest(&CyclePolicy::default());
        let strict = policy_digest(&CyclePolicy {
            report_grace_days: 0,
            ..CyclePolicy::default()
        });
        assert_eq!(default.len(), 16);
        assert_ne!(default, strict);
    }

    #[test]
    fn test_state_overview_mean_ignores_null_scores() {
        let calc = calculator();
        let as_of = date(2024, 3, 1);
        let institutions = vec![
            summarize_institution(&calc, InstitutionId::new(1), as_of, InstitutionCounts::new(10, 10, 10), &[]),
            summarize_institution(&calc, InstitutionId::new(2), as_of, InstitutionCounts::new(10, 5, 5), &[]),
            summarize_institution(&calc, InstitutionId::new(3), as_of, InstitutionCounts::new(0, 0, 0), &[]),
        ];
        let overview = StateOverview::from_institutions(as_of, institutions);
        assert_eq!(overview.mean_score, Some(75));
        assert_eq!(overview.unscored_institutions, 1);
        assert_eq!(overview.active_students, 20);
    }
}
