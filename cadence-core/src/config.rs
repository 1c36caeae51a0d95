//! Configuration types

use crate::{CadenceError, CadenceResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest grace period that still lands inside the following month.
pub const MAX_GRACE_DAYS: u32 = 27;

// ============================================================================
// CYCLE POLICY
// ============================================================================

/// Deadline and horizon constants for the monthly obligation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CyclePolicy {
    /// Days into the following month before a monthly report is due.
    pub report_grace_days: u32,
    /// Days into the following month before a monthly visit is due.
    pub visit_grace_days: u32,
    /// Counting horizon for internships without an end date.
    pub open_horizon_days: u32,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            report_grace_days: 5,
            visit_grace_days: 0,
            open_horizon_days: 180,
        }
    }
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration for the tagged result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a caller does not specify one.
    pub default_ttl: Duration,
    /// Maximum number of live entries before LRU eviction kicks in.
    pub max_entries: usize,
    /// Interval of the optional background sweep. `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 10_000,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the entry capacity.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Enable the background sweep.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }
}

// ============================================================================
// STATS CONFIGURATION
// ============================================================================

/// TTLs for the aggregates memoized by the compliance aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// TTL of a single institution's stats.
    pub institution_ttl: Duration,
    /// TTL of the directorate-wide overview.
    pub overview_ttl: Duration,
    /// Upper bound on each counts repository call.
    pub repository_timeout: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            institution_ttl: Duration::from_secs(300),
            overview_ttl: Duration::from_secs(600),
            repository_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// MASTER CONFIGURATION
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    pub cycle: CyclePolicy,
    pub cache: CacheConfig,
    pub stats: StatsConfig,
}

impl CadenceConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CADENCE_REPORT_GRACE_DAYS` (default: 5)
    /// - `CADENCE_VISIT_GRACE_DAYS` (default: 0)
    /// - `CADENCE_OPEN_HORIZON_DAYS` (default: 180)
    /// - `CADENCE_CACHE_TTL_SECS` (default: 300)
    /// - `CADENCE_CACHE_MAX_ENTRIES` (default: 10000)
    /// - `CADENCE_CACHE_SWEEP_SECS`: 0 or unset disables the sweep
    /// - `CADENCE_STATS_TTL_SECS` (default: 300)
    /// - `CADENCE_OVERVIEW_TTL_SECS` (default: 600)
    /// - `CADENCE_REPOSITORY_TIMEOUT_MS` (default: 10000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_u32 = |key: &str, fallback: u32| {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(fallback)
        };
        let parse_secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let sweep_interval = lookup("CADENCE_CACHE_SWEEP_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .or(defaults.cache.sweep_interval);

        Self {
            cycle: CyclePolicy {
                report_grace_days: parse_u32(
                    "CADENCE_REPORT_GRACE_DAYS",
                    defaults.cycle.report_grace_days,
                ),
                visit_grace_days: parse_u32(
                    "CADENCE_VISIT_GRACE_DAYS",
                    defaults.cycle.visit_grace_days,
                ),
                open_horizon_days: parse_u32(
                    "CADENCE_OPEN_HORIZON_DAYS",
                    defaults.cycle.open_horizon_days,
                ),
            },
            cache: CacheConfig {
                default_ttl: parse_secs("CADENCE_CACHE_TTL_SECS", defaults.cache.default_ttl),
                max_entries: lookup("CADENCE_CACHE_MAX_ENTRIES")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(defaults.cache.max_entries),
                sweep_interval,
            },
            stats: StatsConfig {
                institution_ttl: parse_secs(
                    "CADENCE_STATS_TTL_SECS",
                    defaults.stats.institution_ttl,
                ),
                overview_ttl: parse_secs(
                    "CADENCE_OVERVIEW_TTL_SECS",
                    defaults.stats.overview_ttl,
                ),
                repository_timeout: lookup("CADENCE_REPOSITORY_TIMEOUT_MS")
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stats.repository_timeout),
            },
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - grace days do not exceed [`MAX_GRACE_DAYS`]
    /// - open_horizon_days > 0
    /// - every TTL, the repository timeout and the sweep interval are positive
    /// - max_entries > 0
    pub fn validate(&self) -> CadenceResult<()> {
        for (field, value) in [
            ("cycle.report_grace_days", self.cycle.report_grace_days),
            ("cycle.visit_grace_days", self.cycle.visit_grace_days),
        ] {
            if value > MAX_GRACE_DAYS {
                return Err(invalid(
                    field,
                    value.to_string(),
                    format!("grace days must be at most {}", MAX_GRACE_DAYS),
                ));
            }
        }

        if self.cycle.open_horizon_days == 0 {
            return Err(invalid(
                "cycle.open_horizon_days",
                "0".to_string(),
                "open_horizon_days must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(invalid(
                "cache.max_entries",
                "0".to_string(),
                "max_entries must be greater than 0".to_string(),
            ));
        }

        for (field, ttl) in [
            ("cache.default_ttl", self.cache.default_ttl),
            ("stats.institution_ttl", self.stats.institution_ttl),
            ("stats.overview_ttl", self.stats.overview_ttl),
            ("stats.repository_timeout", self.stats.repository_timeout),
        ] {
            if ttl.is_zero() {
                return Err(invalid(
                    field,
                    format!("{:?}", ttl),
                    format!("{} must be positive", field),
                ));
            }
        }

        if let Some(interval) = self.cache.sweep_interval {
            if interval.is_zero() {
                return Err(invalid(
                    "cache.sweep_interval",
                    format!("{:?}", interval),
                    "sweep_interval must be positive when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: String) -> CadenceError {
    CadenceError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason,
    })
}
