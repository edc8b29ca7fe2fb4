//! Match engine: decides which enrolled identity, if any, a query embedding
//! belongs to.

use crate::store::EncodingStore;
use crate::types::{Embedding, Identity};
use serde::{Deserialize, Serialize};

/// Maximum Euclidean distance accepted as a match.
///
/// On L2-normalised embeddings (ArcFace), distance `d` corresponds to cosine
/// similarity `1 - d²/2`, so 0.5 only accepts cosine ≥ 0.875. That is much
/// stricter than typical ArcFace thresholds (cosine 0.3 to 0.5, distance
/// 1.0 to 1.18); tune with `ROLLCALL_TOLERANCE` or `--tolerance`.
pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// Cosine similarity equivalent to Euclidean `tolerance` between unit vectors.
pub fn cosine_equivalent(tolerance: f32) -> f32 {
    1.0 - tolerance * tolerance / 2.0
}

/// Result of matching one query against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Match {
        identity: Identity,
        /// Position of the matched record in the store.
        index: usize,
        distance: f32,
    },
    NoMatch,
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Match { identity, .. } => Some(identity),
            Self::NoMatch => None,
        }
    }
}

/// Strategy for comparing a query embedding against an encoding store.
///
/// Implementations are pure: they never mutate the store and can be shared
/// across threads. A query whose dimension differs from the store's never
/// matches.
pub trait Matcher: Send + Sync {
    fn find(&self, query: &Embedding, store: &EncodingStore) -> MatchOutcome;

    /// Maximum accepted distance (inclusive).
    fn tolerance(&self) -> f32;
}

/// Selection rule applied among candidates within tolerance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// First candidate in store order.
    #[default]
    FirstHit,
    /// Candidate with the smallest distance.
    Nearest,
}

impl MatchPolicy {
    pub fn matcher(self, tolerance: f32) -> Box<dyn Matcher> {
        match self {
            Self::FirstHit => Box::new(FirstHitMatcher::new(tolerance)),
            Self::Nearest => Box::new(NearestMatcher::new(tolerance)),
        }
    }
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-hit" => Ok(Self::FirstHit),
            "nearest" => Ok(Self::Nearest),
            other => Err(format!("unknown match policy '{other}' (expected first-hit or nearest)")),
        }
    }
}

/// Returns the first record in store order whose distance is within
/// tolerance, even when a later record is closer.
///
/// Linear scan with early return. The distance bound is inclusive.
#[derive(Debug, Clone, Copy)]
pub struct FirstHitMatcher {
    pub tolerance: f32,
}

impl FirstHitMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Default for FirstHitMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE)
    }
}

impl Matcher for FirstHitMatcher {
    fn find(&self, query: &Embedding, store: &EncodingStore) -> MatchOutcome {
        if !comparable(query, store) {
            return MatchOutcome::NoMatch;
        }
        for (index, record) in store.records().iter().enumerate() {
            let distance = query.euclidean_distance(&record.embedding);
            if distance <= self.tolerance {
                return MatchOutcome::Match {
                    identity: record.identity.clone(),
                    index,
                    distance,
                };
            }
        }
        MatchOutcome::NoMatch
    }

    fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

/// Returns the closest record within tolerance; ties go to the earlier record.
#[derive(Debug, Clone, Copy)]
pub struct NearestMatcher {
    pub tolerance: f32,
}

impl NearestMatcher {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl Matcher for NearestMatcher {
    fn find(&self, query: &Embedding, store: &EncodingStore) -> MatchOutcome {
        if !comparable(query, store) {
            return MatchOutcome::NoMatch;
        }
        store
            .records()
            .iter()
            .enumerate()
            .map(|(index, record)| (index, query.euclidean_distance(&record.embedding)))
            .filter(|&(_, distance)| distance <= self.tolerance)
            .fold(None, |best: Option<(usize, f32)>, (index, distance)| match best {
                Some((_, best_distance)) if best_distance <= distance => best,
                _ => Some((index, distance)),
            })
            .map_or(MatchOutcome::NoMatch, |(index, distance)| MatchOutcome::Match {
                identity: store.records()[index].identity.clone(),
                index,
                distance,
            })
    }

    fn tolerance(&self) -> f32 {
        self.tolerance
    }
}

fn comparable(query: &Embedding, store: &EncodingStore) -> bool {
    match store.dim() {
        Some(dim) if dim == query.dim() => true,
        Some(dim) => {
            tracing::debug!(expected = dim, actual = query.dim(), "query dimension differs from store");
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncodingRecord;

    fn store(entries: &[(&str, [f32; 2])]) -> EncodingStore {
        EncodingStore::from_records(
            entries
                .iter()
                .map(|(name, v)| EncodingRecord {
                    identity: Identity::new(*name).unwrap(),
                    embedding: Embedding::new(v.to_vec()),
                    source: format!("{name}.jpg").into(),
                })
                .collect(),
        )
    }

    fn query(v: [f32; 2]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn test_first_hit_prefers_store_order_over_distance() {
        // Both within tolerance; the later record is strictly closer.
        let s = store(&[("Far", [0.4, 0.0]), ("Near", [0.05, 0.0])]);
        let outcome = FirstHitMatcher::new(0.5).find(&query([0.0, 0.0]), &s);
        assert_eq!(outcome.identity().map(Identity::as_str), Some("Far"));
        assert!(matches!(outcome, MatchOutcome::Match { index: 0, .. }));
    }

    #[test]
    fn test_first_hit_exact_tie_picks_earliest() {
        let s = store(&[("Left", [-0.3, 0.0]), ("Right", [0.3, 0.0])]);
        let outcome = FirstHitMatcher::new(0.5).find(&query([0.0, 0.0]), &s);
        assert_eq!(outcome.identity().map(Identity::as_str), Some("Left"));
    }

    #[test]
    fn test_first_hit_skips_records_beyond_tolerance() {
        let s = store(&[("Other", [3.0, 0.0]), ("Alice", [0.1, 0.0])]);
        let outcome = FirstHitMatcher::default().find(&query([0.0, 0.0]), &s);
        assert!(matches!(outcome, MatchOutcome::Match { index: 1, .. }));
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let s = store(&[("Edge", [0.5, 0.0])]);
        assert!(matches!(
            FirstHitMatcher::new(0.5).find(&query([0.0, 0.0]), &s),
            MatchOutcome::Match { .. }
        ));
        assert_eq!(FirstHitMatcher::new(0.49).find(&query([0.0, 0.0]), &s), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_no_match_when_all_exceed_tolerance() {
        let s = store(&[("A", [1.0, 0.0]), ("B", [0.0, 1.0])]);
        assert_eq!(FirstHitMatcher::default().find(&query([0.0, 0.0]), &s), MatchOutcome::NoMatch);
        assert_eq!(NearestMatcher::new(0.5).find(&query([0.0, 0.0]), &s), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_empty_store_never_matches() {
        let s = EncodingStore::from_records(Vec::new());
        assert_eq!(FirstHitMatcher::default().find(&query([0.0, 0.0]), &s), MatchOutcome::NoMatch);
    }

    #[test]
    fn test_query_of_other_dimension_never_matches() {
        let s = store(&[("Alice", [0.0, 100.0])]);
        for p in [Embedding::new(vec![0.0]), Embedding::new(Vec::new())] {
            assert_eq!(FirstHitMatcher::new(0.5).find(&p, &s), MatchOutcome::NoMatch);
            assert_eq!(NearestMatcher::new(0.5).find(&p, &s), MatchOutcome::NoMatch);
        }
    }

    #[test]
    fn test_nearest_picks_minimum_distance() {
        let s = store(&[("Far", [0.4, 0.0]), ("Near", [0.05, 0.0]), ("Tie", [-0.05, 0.0])]);
        let outcome = NearestMatcher::new(0.5).find(&query([0.0, 0.0]), &s);
        assert_eq!(outcome.identity().map(Identity::as_str), Some("Near"));
    }

    #[test]
    fn test_default_tolerance_cosine_equivalent() {
        assert!((cosine_equivalent(DEFAULT_TOLERANCE) - 0.875).abs() < 1e-6);
        assert_eq!(cosine_equivalent(0.0), 1.0);
        assert_eq!(MatchPolicy::Nearest.matcher(0.9).tolerance(), 0.9);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("first-hit".parse::<MatchPolicy>(), Ok(MatchPolicy::FirstHit));
        assert_eq!("nearest".parse::<MatchPolicy>(), Ok(MatchPolicy::Nearest));
        assert!("best".parse::<MatchPolicy>().is_err());
        assert_eq!(MatchPolicy::default(), MatchPolicy::FirstHit);
    }
}
