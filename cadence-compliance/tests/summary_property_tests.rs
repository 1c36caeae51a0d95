//! Property-Based Tests for Institution Summaries
//!
//! **Property 7: Bounded Figures**
//!
//! For any counts and any mix of valid and unusable internship windows, every
//! rate SHALL lie in `[0, 100]`, every window SHALL be either evaluated or
//! counted as skipped, and last-month figures SHALL be internally consistent.

use cadence_compliance::{summarize_institution, ComplianceComponent};
use cadence_core::{CycleCalculator, InstitutionId};
use cadence_test_utils::generators::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_summary_is_bounded(
        policy in arb_cycle_policy(),
        counts in arb_counts(),
        windows in prop::collection::vec(arb_window(), 0..12),
        as_of in arb_date(),
    ) {
        let calculator = CycleCalculator::new(policy);
        let stats = summarize_institution(&calculator, InstitutionId::new(1), as_of, counts, &windows);

        prop_assert_eq!(
            (stats.in_training + stats.skipped_intervals) as usize,
            windows.len()
        );
        prop_assert_eq!(stats.score.is_null(), counts.active_students == 0);
        if let Some(value) = stats.score.value {
            prop_assert!(value <= 100);
        }
        for component in ComplianceComponent::ALL {
            if let Some(rate) = stats.score.component(component) {
                prop_assert!((0.0..=100.0).contains(&rate));
            }
        }
        for rate in [stats.visit_completion_rate, stats.report_submission_rate].into_iter().flatten() {
            prop_assert!((0.0..=100.0).contains(&rate));
        }
        prop_assert_eq!(stats.visit_completion_rate.is_none(), stats.expected_visits == 0);
        prop_assert!(stats.last_month.submitted <= stats.last_month.expected);
        prop_assert_eq!(
            stats.last_month.missing,
            stats.last_month.expected - stats.last_month.submitted
        );
        prop_assert!(stats.last_month.expected <= stats.in_training);
    }

    #[test]
    fn prop_expected_counts_never_exceed_totals(
        interval in arb_interval(),
        as_of in arb_date(),
        policy in arb_cycle_policy(),
    ) {
        let calculator = CycleCalculator::new(policy);
        let count = calculator.cycle_count(&interval, as_of).unwrap();
        prop_assert!(count.expected_as_of <= count.total_expected);
    }
}
