//! Nearest-identity selection over the enrolled roster.

use crate::types::{Embedding, RosterEntry};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error(
        "embedding dimension mismatch: probe has {probe} components, \
         candidate '{identity_id}' has {candidate}"
    )]
    DimensionMismatch {
        probe: usize,
        candidate: usize,
        identity_id: String,
    },
}

/// Outcome of matching one probe embedding against the roster.
///
/// `identity_id` is `None` when the roster is empty or the nearest candidate
/// missed the threshold; `distance` still carries the nearest distance in the
/// latter case so operators can see near-misses in logs.
#[derive(Debug, Clone, Default)]
pub struct BestMatch {
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub distance: Option<f32>,
}

/// Strategy for selecting the closest enrolled identity for a probe embedding.
pub trait Matcher {
    fn best_match(
        &self,
        probe: &Embedding,
        roster: &[RosterEntry],
        threshold: f32,
    ) -> Result<BestMatch, MatchError>;
}

/// Euclidean-distance matcher.
///
/// Every roster entry is visited with the same code path regardless of roster
/// size. Ties on the minimum distance keep the earliest entry in roster order,
/// so repeated calls with identical input are deterministic. A candidate is
/// accepted only when its distance is strictly below the threshold.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match(
        &self,
        probe: &Embedding,
        roster: &[RosterEntry],
        threshold: f32,
    ) -> Result<BestMatch, MatchError> {
        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in roster.iter().enumerate() {
            if entry.embedding.dim() != probe.dim() {
                return Err(MatchError::DimensionMismatch {
                    probe: probe.dim(),
                    candidate: entry.embedding.dim(),
                    identity_id: entry.identity_id.clone(),
                });
            }

            let distance = probe.euclidean_distance(&entry.embedding);
            // Strict `<` keeps the first entry on equal distance.
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        Ok(match best_idx {
            Some(idx) if best_distance < threshold => BestMatch {
                identity_id: Some(roster[idx].identity_id.clone()),
                display_name: Some(roster[idx].display_name.clone()),
                distance: Some(best_distance),
            },
            Some(_) => BestMatch {
                identity_id: None,
                display_name: None,
                distance: Some(best_distance),
            },
            None => BestMatch::default(),
        })
    }
}
