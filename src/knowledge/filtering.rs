//! Gap/strength/tuning-rule applicability filtering.
//!
//! Pure predicate evaluation over a query's [`FeatureVector`] -- no I/O, no
//! async, so the determinism properties (same features always select the
//! same gaps) are trivially unit-testable.

use crate::sql::FeatureVector;

use super::types::{ApplicableGap, Gap, Strength, TuningRule};

/// Evaluates every gap's `match`/`skip`/`high_when`/`low_when` predicates
/// against `features`. A gap appears in the result only when it fires
/// (§4.1's detection-rule algorithm) -- evaluation order doesn't matter
/// since each gap's firing is independent of every other gap's.
pub fn applicable_gaps(features: &FeatureVector, gaps: &[Gap]) -> Vec<ApplicableGap> {
    gaps.iter()
        .filter_map(|g| g.fires(features).map(|confidence| ApplicableGap { gap: g.clone(), confidence }))
        .collect()
}

pub fn applicable_strengths(features: &FeatureVector, strengths: &[Strength]) -> Vec<Strength> {
    strengths
        .iter()
        .filter(|s| s.predicate.evaluate(features))
        .cloned()
        .collect()
}

pub fn applicable_tuning_rules(features: &FeatureVector, rules: &[TuningRule]) -> Vec<TuningRule> {
    rules
        .iter()
        .filter(|r| r.applies_when.evaluate(features))
        .cloned()
        .collect()
}
