//! Monthly obligation cycle calculator.
//!
//! Every internship owes one report and one faculty visit per calendar month it
//! is active. This module is the single definition of how many of those
//! obligations exist for an interval, and how many are already due on a given
//! date. Everything here is pure: no clock reads, no I/O.
//!
//! # Counting model
//!
//! A month is *in scope* once the interval touches any day of it, inclusive of
//! the start month. Open intervals are counted up to `start + open_horizon_days`.
//!
//! For the "due so far" figure the right boundary is `min(effective_end, now)`.
//! Every in-scope month before the boundary month counts once it has elapsed.
//! The boundary month itself counts only once its deadline has passed: the
//! first day of the following month plus the obligation's grace days. Reports
//! and visits therefore agree on the in-scope months and differ only on that
//! last month, which in practice is the final month of an internship that has
//! already ended.
//!
//! [`CycleCalculator::expected_in_month`] is stricter: it judges one month
//! against its own deadline, so a month still inside its grace window is not
//! yet due there even though the running total already includes it.

use crate::{CyclePolicy, Date, IntervalError, ObligationInterval};
use chrono::{Datelike, Days, Months};
use serde::{Deserialize, Serialize};

/// The kind of recurring obligation being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationKind {
    /// Monthly report submitted by the student.
    Report,
    /// Monthly visit by the faculty mentor.
    Visit,
}

/// Expected obligation counts for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CycleCount {
    /// Obligations over the internship's whole (effective) duration.
    pub total_expected: u32,
    /// Obligations whose deadline has passed as of the evaluation date.
    pub expected_as_of: u32,
}

/// Calculator for expected monthly obligations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleCalculator {
    policy: CyclePolicy,
}

impl CycleCalculator {
    pub fn new(policy: CyclePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CyclePolicy {
        &self.policy
    }

    /// Right edge used for counting: the real end, or the bounded horizon.
    pub fn effective_end(&self, interval: &ObligationInterval) -> Date {
        interval.end.unwrap_or_else(|| {
            interval
                .start
                .checked_add_days(Days::new(u64::from(self.policy.open_horizon_days)))
                .unwrap_or(Date::MAX)
        })
    }

    /// Number of calendar months touched by `[start, effective_end]`.
    pub fn expected_total(&self, interval: &ObligationInterval) -> Result<u32, IntervalError> {
        interval.validate()?;
        Ok(months_spanned(interval.start, self.effective_end(interval)))
    }

    /// Obligations that should already exist as of `now`, using the report deadline.
    ///
    /// Report grace is the later of the two deadlines, so this is the
    /// conservative figure for dashboards. Use [`Self::expected_due`] to pick
    /// the obligation kind explicitly.
    pub fn expected_as_of_today(
        &self,
        interval: &ObligationInterval,
        now: Date,
    ) -> Result<u32, IntervalError> {
        self.expected_due(interval, now, ObligationKind::Report)
    }

    /// Obligations of `kind` whose deadline has passed as of `now`.
    pub fn expected_due(
        &self,
        interval: &ObligationInterval,
        now: Date,
        kind: ObligationKind,
    ) -> Result<u32, IntervalError> {
        interval.validate()?;
        if interval.start > now {
            return Ok(0);
        }

        let boundary = self.effective_end(interval).min(now);
        let spanned = months_spanned(interval.start, boundary);
        if spanned == 0 {
            return Ok(0);
        }

        if self.is_due(boundary, now, kind) {
            Ok(spanned)
        } else {
            Ok(spanned - 1)
        }
    }

    /// Both figures at once.
    pub fn cycle_count(
        &self,
        interval: &ObligationInterval,
        now: Date,
    ) -> Result<CycleCount, IntervalError> {
        Ok(CycleCount {
            total_expected: self.expected_total(interval)?,
            expected_as_of: self.expected_as_of_today(interval, now)?,
        })
    }

    /// Whether the obligation for the calendar month containing `month` is in
    /// scope for this interval and past its own deadline as of `now`.
    ///
    /// This evaluates a single month on its own, which is what "missing last
    /// month" figures need: reusing the current month's running total would
    /// misattribute obligations between months and ignore the grace window.
    pub fn expected_in_month(
        &self,
        interval: &ObligationInterval,
        month: Date,
        now: Date,
        kind: ObligationKind,
    ) -> Result<bool, IntervalError> {
        interval.validate()?;
        if interval.start > now {
            return Ok(false);
        }
        let target = month_index(month);
        let in_scope = month_index(interval.start) <= target
            && target <= month_index(self.effective_end(interval));
        Ok(in_scope && self.is_due(month, now, kind))
    }

    /// Deadline of the obligation for the month containing `month`.
    pub fn deadline(&self, month: Date, kind: ObligationKind) -> Date {
        next_month_start(month)
            .checked_add_days(Days::new(u64::from(self.grace_days(kind))))
            .unwrap_or(Date::MAX)
    }

    pub fn grace_days(&self, kind: ObligationKind) -> u32 {
        match kind {
            ObligationKind::Report => self.policy.report_grace_days,
            ObligationKind::Visit => self.policy.visit_grace_days,
        }
    }

    fn is_due(&self, month: Date, now: Date, kind: ObligationKind) -> bool {
        now >= self.deadline(month, kind)
    }
}

/// First day of the month containing `date`.
pub fn month_start(date: Date) -> Date {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month preceding the one containing `date`.
pub fn previous_month_start(date: Date) -> Date {
    month_start(date)
        .checked_sub_months(Months::new(1))
        .unwrap_or(Date::MIN)
}

fn next_month_start(date: Date) -> Date {
    month_start(date)
        .checked_add_months(Months::new(1))
        .unwrap_or(Date::MAX)
}

fn month_index(date: Date) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn months_spanned(from: Date, to: Date) -> u32 {
    if from > to {
        return 0;
    }
    u32::try_from(month_index(to) - month_index(from) + 1).unwrap_or(u32::MAX)
}
