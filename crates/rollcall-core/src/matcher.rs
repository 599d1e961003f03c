//! Nearest-embedding search over the roster.

use crate::types::{Embedding, EnrolledUser};

/// Minimum similarity a probe must exceed to be accepted as a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;

/// Result of matching a probe embedding against the roster.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the closest enrolled embedding, 0.0 if none was comparable.
    pub similarity: f32,
    /// ID of the matched user (if any).
    pub user_id: Option<String>,
    /// Display name of the matched user (if any).
    pub display_name: Option<String>,
}

/// Strategy for comparing a probe embedding against the enrolled roster.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, roster: &[EnrolledUser], threshold: f32) -> MatchResult;
}

/// Matcher over `1 - euclidean_distance` similarity.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, roster: &[EnrolledUser], threshold: f32) -> MatchResult {
        match closest(probe, roster) {
            Some((idx, similarity)) if similarity > threshold => MatchResult {
                matched: true,
                similarity,
                user_id: Some(roster[idx].id.clone()),
                display_name: Some(roster[idx].display_name.clone()),
            },
            other => MatchResult {
                matched: false,
                similarity: other.map_or(0.0, |(_, s)| s),
                user_id: None,
                display_name: None,
            },
        }
    }
}

/// Return the enrolled user whose embedding is most similar to `probe`,
/// provided the similarity is strictly above `threshold`.
///
/// Users without an embedding are skipped. When two users score equally the
/// one enrolled first wins.
pub fn best_match<'a>(
    probe: &Embedding,
    roster: &'a [EnrolledUser],
    threshold: f32,
) -> Option<&'a EnrolledUser> {
    closest(probe, roster)
        .filter(|&(_, similarity)| similarity > threshold)
        .map(|(idx, _)| &roster[idx])
}

/// Index and similarity of the first roster entry with the highest positive
/// similarity to `probe`.
fn closest(probe: &Embedding, roster: &[EnrolledUser]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    let mut best_score = 0.0f32;

    for (i, user) in roster.iter().enumerate() {
        let Some(enrolled) = user.embedding.as_ref() else {
            continue;
        };
        if enrolled.len() != probe.len() {
            tracing::debug!(
                user_id = %user.id,
                enrolled = enrolled.len(),
                probe = probe.len(),
                "skipping embedding of different dimension"
            );
            continue;
        }

        let score = probe.similarity(enrolled);
        if score > best_score {
            best_score = score;
            best = Some((i, score));
        }
    }

    best
}
