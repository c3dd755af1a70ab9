//! Matching a probe embedding against the set of known faces.

use crate::types::Embedding;

/// Strategy for finding the known face closest to a probe embedding.
pub trait Matcher {
    /// Return the index of the best-matching known embedding, or `None`
    /// if nothing exceeds `threshold`.
    fn best_match(&self, probe: &Embedding, known: &[Embedding], threshold: f32) -> Option<usize>;
}

/// Cosine similarity matcher.
///
/// Scans the whole known set, keeps the maximum similarity and returns
/// its index only when it strictly exceeds the threshold. Ties keep the
/// earliest index (stable argmax), so results are deterministic for a
/// given snapshot order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, known: &[Embedding], threshold: f32) -> Option<usize> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx = None;

        for (i, candidate) in known.iter().enumerate() {
            let sim = probe.similarity(candidate);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        best_idx.filter(|_| best_sim > threshold)
    }
}
