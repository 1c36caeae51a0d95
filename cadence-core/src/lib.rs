//! CADENCE Core - Value Types and the Monthly Cycle Calculator
//!
//! Leaf crate of the workspace. Holds the value types shared by the cache and
//! the compliance aggregator, the master error type, configuration, and the
//! pure month-counting logic every compliance figure is built on.

pub mod config;
pub mod cycle;
pub mod error;
pub mod identity;
pub mod interval;

pub use config::{CacheConfig, CadenceConfig, CyclePolicy, StatsConfig, MAX_GRACE_DAYS};
pub use cycle::{
    month_start, previous_month_start, CycleCalculator, CycleCount, ObligationKind,
};
pub use error::{
    CacheError, CadenceError, CadenceResult, ConfigError, IntervalError, RepositoryError,
};
pub use identity::{
    new_internship_id, short_digest, Date, InstitutionId, InternshipId, Timestamp,
};
pub use interval::{InternshipWindow, ObligationInterval};
