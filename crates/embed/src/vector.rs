//! Small vector helpers shared by classification and drift tracking.

/// Cosine similarity in [-1, 1].  Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

/// Arithmetic mean of a non-empty set of equal-length vectors.
pub fn mean_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    let mut sum = vec![0.0f64; dim];
    for vector in vectors {
        if vector.len() != dim {
            return None;
        }
        for (slot, value) in sum.iter_mut().zip(vector.iter()) {
            *slot += *value as f64;
        }
    }
    let n = vectors.len() as f64;
    Some(sum.into_iter().map(|v| (v / n) as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.5, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_opposed_vectors_is_negative() {
        assert!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) < -0.99);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn mean_vector_averages_componentwise() {
        let mean = mean_vector(&[vec![1.0, 0.0], vec![0.0, 1.0]]).expect("mean");
        assert_eq!(mean, vec![0.5, 0.5]);
    }

    #[test]
    fn mean_of_empty_set_is_none() {
        assert!(mean_vector(&[]).is_none());
    }
}
