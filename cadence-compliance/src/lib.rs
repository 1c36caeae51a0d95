//! CADENCE Compliance - Scoring and Cached Aggregates
//!
//! Turns raw institution counts into bounded, nullable compliance scores and
//! memoizes institution and directorate aggregates:
//! - [`score`]: capped rates and the blended [`ComplianceScore`]
//! - [`repository`]: the [`CountsRepository`] seam to storage
//! - [`aggregator`]: [`ComplianceAggregator`], cache keys, tags and invalidation
//! - [`telemetry`]: default tracing subscriber wiring

pub mod aggregator;
pub mod repository;
pub mod score;
pub mod telemetry;

pub use aggregator::{
    institution_tag, summarize_institution, AggregatorCacheStats, ComplianceAggregator,
    InstitutionStats, MonthlyReportSummary, MutationKind, StateOverview,
};
pub use repository::{CountsRepository, InstitutionCounts};
pub use score::{capped_rate, mean_rate, round_rate, ComplianceComponent, ComplianceScore};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, DEFAULT_FILTER};
