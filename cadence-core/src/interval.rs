//! Obligation intervals and the per-internship windows that feed them.

use crate::{Date, IntervalError, InternshipId};
use chrono::DateTime;
use serde::{Deserialize, Serialize};

/// The active window of one recurring-obligation subject (an internship).
///
/// `end == None` means the internship is still open. The calculator assumes a
/// bounded horizon for counting purposes only; no synthetic end is ever stored
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObligationInterval {
    pub start: Date,
    pub end: Option<Date>,
}

impl ObligationInterval {
    /// Create a validated interval.
    pub fn new(start: Date, end: Option<Date>) -> Result<Self, IntervalError> {
        let interval = Self { start, end };
        interval.validate()?;
        Ok(interval)
    }

    /// Create an open-ended interval.
    pub fn open(start: Date) -> Self {
        Self { start, end: None }
    }

    /// Create a bounded interval.
    pub fn bounded(start: Date, end: Date) -> Result<Self, IntervalError> {
        Self::new(start, Some(end))
    }

    /// Parse an interval from text.
    ///
    /// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp (converted to its UTC
    /// date). A blank end is treated as open.
    pub fn parse(start: &str, end: Option<&str>) -> Result<Self, IntervalError> {
        if start.trim().is_empty() {
            return Err(IntervalError::MissingStart);
        }
        let start = parse_date("start", start)?;
        let end = match end.map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_date("end", raw)?),
        };
        Self::new(start, end)
    }

    /// Check that `end` is not before `start`.
    pub fn validate(&self) -> Result<(), IntervalError> {
        match self.end {
            Some(end) if end < self.start => Err(IntervalError::EndBeforeStart {
                start: self.start,
                end,
            }),
            _ => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

fn parse_date(field: &str, raw: &str) -> Result<Date, IntervalError> {
    let raw = raw.trim();
    if let Ok(date) = Date::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.naive_utc().date());
    }
    Err(IntervalError::Unparseable {
        field: field.to_string(),
        value: raw.to_string(),
    })
}

/// One in-training internship as supplied by the counts repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternshipWindow {
    pub internship_id: InternshipId,
    /// Missing when the upstream record never captured a start date.
    pub start: Option<Date>,
    pub end: Option<Date>,
    /// Monthly reports submitted so far.
    pub reports_submitted: u32,
    /// Faculty visits completed so far.
    pub visits_completed: u32,
    /// Whether a report covering the previous calendar month was submitted.
    pub report_submitted_last_month: bool,
}

impl InternshipWindow {
    /// Window with no submissions yet.
    pub fn new(internship_id: InternshipId, start: Option<Date>, end: Option<Date>) -> Self {
        Self {
            internship_id,
            start,
            end,
            reports_submitted: 0,
            visits_completed: 0,
            report_submitted_last_month: false,
        }
    }

    pub fn with_reports(mut self, reports_submitted: u32) -> Self {
        self.reports_submitted = reports_submitted;
        self
    }

    pub fn with_visits(mut self, visits_completed: u32) -> Self {
        self.visits_completed = visits_completed;
        self
    }

    pub fn with_last_month_report(mut self, submitted: bool) -> Self {
        self.report_submitted_last_month = submitted;
        self
    }

    /// The obligation interval of this window.
    pub fn interval(&self) -> Result<ObligationInterval, IntervalError> {
        let start = self.start.ok_or(IntervalError::MissingStart)?;
        ObligationInterval::new(start, self.end)
    }
}
