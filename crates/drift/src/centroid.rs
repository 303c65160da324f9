//! Rolling-window centroid computation and the shift/staleness metrics.

use quarry_embed::{cosine_similarity, mean_vector};

/// Mean embedding for a window, or None when the window holds fewer than
/// `min_count` listings; thin windows produce noise, not signal.
pub fn window_centroid(embeddings: &[Vec<f32>], min_count: usize) -> Option<Vec<f32>> {
    if embeddings.len() < min_count {
        return None;
    }
    mean_vector(embeddings)
}

/// Cosine distance between consecutive centroids of the same archetype.
pub fn shift_between(previous: &[f32], current: &[f32]) -> f64 {
    1.0 - cosine_similarity(previous, current)
}

/// Cosine similarity between a variant embedding and its archetype's latest
/// centroid.
pub fn alignment(variant_embedding: &[f32], centroid: &[f32]) -> f64 {
    cosine_similarity(variant_embedding, centroid)
}

/// 1 - alignment: how far the variant sits from where the market moved.
pub fn staleness(alignment: f64) -> f64 {
    1.0 - alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vectors(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![1.0, i as f32 % 2.0]).collect()
    }

    #[test]
    fn window_of_exactly_five_produces_a_centroid() {
        assert!(window_centroid(&vectors(5), 5).is_some());
    }

    #[test]
    fn window_of_four_produces_nothing() {
        assert!(window_centroid(&vectors(4), 5).is_none());
    }

    #[test]
    fn centroid_is_the_arithmetic_mean() {
        let centroid =
            window_centroid(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]], 1).expect("centroid");
        assert_eq!(centroid, vec![2.0 / 3.0, 2.0 / 3.0]);
    }

    #[test]
    fn identical_centroids_have_zero_shift() {
        let v = vec![0.4, 0.6, 0.2];
        assert!(shift_between(&v, &v).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_centroids_have_unit_shift() {
        assert!((shift_between(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn staleness_is_one_minus_alignment() {
        assert_eq!(staleness(0.92), 1.0 - 0.92);
    }
}
