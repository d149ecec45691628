//! Gold-example matching.
//!
//! Examples are ranked by structural overlap with the query under
//! optimization ([`FeatureVector::construct_overlap`]) plus a tag-based
//! boost when an example's tags intersect the applicable gaps/strengths for
//! the query, combining a continuous score with categorical boosts rather
//! than picking one or the other.

use crate::sql::FeatureVector;

use super::types::GoldExample;

/// Ranks `examples` against `features` and returns the top `limit` matches
/// whose relevance score clears `min_score`. `example_features` must be
/// parallel to `examples` (the caller parses each example's `original_sql`
/// once and reuses the result across queries). Nothing clearing the floor
/// is not an error -- an empty result is a valid, non-fatal outcome.
pub fn top_matches(
    features: &FeatureVector,
    examples: &[GoldExample],
    example_features: &[FeatureVector],
    gap_ids: &[String],
    limit: usize,
    min_score: f64,
) -> Vec<GoldExample> {
    debug_assert_eq!(examples.len(), example_features.len());

    let mut scored: Vec<(f64, &GoldExample)> = examples
        .iter()
        .zip(example_features.iter())
        .map(|(example, example_features)| {
            let overlap = features.construct_overlap(example_features);
            let gap_boost = if example
                .demonstrates_gaps
                .iter()
                .any(|id| gap_ids.contains(id))
            {
                0.25
            } else {
                0.0
            };
            (overlap + gap_boost, example)
        })
        .collect();

    // Ties broken by validated speedup descending, then example ID
    // ascending, so retrieval stays deterministic across two examples with
    // otherwise-identical relevance scores.
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.outcome_speedup.partial_cmp(&a.1.outcome_speedup).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    scored
        .into_iter()
        .filter(|(score, _)| *score >= min_score)
        .take(limit)
        .map(|(_, example)| example.clone())
        .collect()
}
