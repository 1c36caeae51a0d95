//! Bounded, nullable compliance scores.
//!
//! Every rate is a percentage capped at 100. A rate with a zero denominator is
//! `None`, never 0: an institution with no active students has no compliance
//! figure at all, which is different from a figure of zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Inputs averaged into a [`ComplianceScore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceComponent {
    /// Share of active students with a faculty mentor.
    MentorAssignment,
    /// Share of active students with an uploaded joining letter.
    JoiningLetter,
}

impl ComplianceComponent {
    pub const ALL: [Self; 2] = [Self::MentorAssignment, Self::JoiningLetter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MentorAssignment => "mentor_assignment",
            Self::JoiningLetter => "joining_letter",
        }
    }
}

impl fmt::Display for ComplianceComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `numerator / denominator` as a percentage in `[0, 100]`.
///
/// Over-counting upstream (more assignments than students) saturates at 100.
/// Returns `None` when `denominator` is zero.
pub fn capped_rate(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        return None;
    }
    let ratio = numerator as f64 / denominator as f64;
    Some(ratio.min(1.0) * 100.0)
}

/// Round a rate to a whole percentage.
pub fn round_rate(rate: Option<f64>) -> Option<u32> {
    rate.map(|r| r.round().clamp(0.0, 100.0) as u32)
}

/// Mean of the non-null rates, or `None` when every rate is null.
pub fn mean_rate<I>(rates: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let (sum, count) = rates
        .into_iter()
        .flatten()
        .fold((0.0, 0u32), |(sum, count), rate| (sum + rate, count + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Headline compliance figure plus the component rates it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceScore {
    /// Rounded mean of the non-null components; null when all are null.
    pub value: Option<u32>,
    /// Unrounded, capped component rates.
    pub components: BTreeMap<ComplianceComponent, Option<f64>>,
}

impl ComplianceScore {
    /// Combine already-capped component rates. Rounding happens only here.
    pub fn blend<I>(components: I) -> Self
    where
        I: IntoIterator<Item = (ComplianceComponent, Option<f64>)>,
    {
        let components: BTreeMap<_, _> = components.into_iter().collect();
        let value = round_rate(mean_rate(components.values().copied()));
        Self { value, components }
    }

    pub fn component(&self, component: ComplianceComponent) -> Option<f64> {
        self.components.get(&component).copied().flatten()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}
