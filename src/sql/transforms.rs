//! Declared-vs-detected transform bookkeeping.
//!
//! A worker declares which transform IDs it intended to apply
//! ([`crate::candidate::Candidate::declared_transforms`]); `diff_transforms`
//! independently detects what actually changed between the original and
//! candidate feature vectors so the two can be compared. Divergence between
//! declared and detected is logged, not rejected -- the validation gates
//! are what decide whether a candidate survives, not whether its
//! self-report was accurate.

use serde::{Deserialize, Serialize};

use super::features::FeatureVector;

/// Identifies a known rewrite shape, e.g. `"subquery_to_join"` or
/// `"cte_extraction"`. Kept as a newtype over `String` rather than an enum
/// because the knowledge corpus can introduce new transform IDs without a
/// crate release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransformId(pub String);

impl TransformId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TransformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransformId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Detects which known transform shapes explain the difference between an
/// original query's feature vector and a candidate's.
pub fn diff_transforms(original: &FeatureVector, candidate: &FeatureVector) -> Vec<TransformId> {
    let mut detected = Vec::new();

    if candidate.subquery_count < original.subquery_count
        && candidate.join_count > original.join_count
    {
        detected.push(TransformId::new("subquery_to_join"));
    }
    if candidate.cte_count > original.cte_count {
        detected.push(TransformId::new("cte_extraction"));
    }
    if original.has_select_star && !candidate.has_select_star {
        detected.push(TransformId::new("column_pruning"));
    }
    if candidate.cross_join_count < original.cross_join_count
        && candidate.inner_join_count > original.inner_join_count
    {
        detected.push(TransformId::new("cross_join_to_inner_join"));
    }
    if original.outer_join_count > 0
        && candidate.outer_join_count < original.outer_join_count
        && candidate.inner_join_count > original.inner_join_count
    {
        detected.push(TransformId::new("outer_join_strength_reduction"));
    }
    if candidate.predicate_count > original.predicate_count
        && candidate.subquery_count <= original.subquery_count
    {
        detected.push(TransformId::new("predicate_pushdown"));
    }
    if original.has_union && !candidate.has_union {
        detected.push(TransformId::new("union_elimination"));
    }

    detected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_subquery_to_join_rewrite() {
        let original = FeatureVector {
            subquery_count: 1,
            join_count: 0,
            ..Default::default()
        };
        let candidate = FeatureVector {
            subquery_count: 0,
            join_count: 1,
            ..Default::default()
        };
        let detected = diff_transforms(&original, &candidate);
        assert!(detected.contains(&TransformId::new("subquery_to_join")));
    }

    #[test]
    fn no_transforms_detected_for_identical_vectors() {
        let v = FeatureVector::default();
        assert!(diff_transforms(&v, &v).is_empty());
    }

    #[test]
    fn detects_column_pruning() {
        let original = FeatureVector {
            has_select_star: true,
            ..Default::default()
        };
        let candidate = FeatureVector {
            has_select_star: false,
            ..Default::default()
        };
        assert!(diff_transforms(&original, &candidate).contains(&TransformId::new("column_pruning")));
    }
}
