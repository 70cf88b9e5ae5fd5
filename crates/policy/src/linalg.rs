//! Dense row-major helpers for the small `d x d` ridge matrices kept per arm.

pub(crate) fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn mat_vec(matrix: &[f64], dim: usize, x: &[f64]) -> Vec<f64> {
    matrix
        .chunks_exact(dim)
        .take(dim)
        .map(|row| dot(row, x))
        .collect()
}

pub(crate) fn scaled_identity(dim: usize, scale: f64) -> Vec<f64> {
    let mut out = vec![0.0; dim * dim];
    for i in 0..dim {
        out[i * dim + i] = scale;
    }
    out
}

/// `xᵀ M x`.
pub(crate) fn quadratic_form(matrix: &[f64], dim: usize, x: &[f64]) -> f64 {
    dot(x, &mat_vec(matrix, dim, x))
}

/// In-place Sherman–Morrison rank-one update of `A⁻¹` for `A ← A + x xᵀ`.
pub(crate) fn sherman_morrison_update(ainv: &mut [f64], dim: usize, x: &[f64]) {
    let ax = mat_vec(ainv, dim, x);
    let denom = 1.0 + dot(x, &ax);
    for i in 0..dim {
        for j in 0..dim {
            ainv[i * dim + j] -= ax[i] * ax[j] / denom;
        }
    }
}

/// A positive-definite matrix has strictly positive finite diagonal entries; anything else
/// means the running inverse has degenerated.
pub(crate) fn diagonal_is_sane(matrix: &[f64], dim: usize) -> bool {
    (0..dim).all(|i| {
        let value = matrix[i * dim + i];
        value.is_finite() && value > 0.0
    }) && matrix.iter().all(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sherman_morrison_matches_closed_form_two_by_two() {
        // A = I + x xᵀ with x = (1, 2) gives A = [[2, 2], [2, 5]], det 6.
        let mut ainv = scaled_identity(2, 1.0);
        sherman_morrison_update(&mut ainv, 2, &[1.0, 2.0]);
        let expected = [5.0 / 6.0, -2.0 / 6.0, -2.0 / 6.0, 2.0 / 6.0];
        for (got, want) in ainv.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "got {ainv:?}");
        }
        assert!(diagonal_is_sane(&ainv, 2));
    }

    #[test]
    fn quadratic_form_on_identity_is_squared_norm() {
        let identity = scaled_identity(3, 1.0);
        assert_eq!(quadratic_form(&identity, 3, &[1.0, 2.0, 2.0]), 9.0);
        assert_eq!(mat_vec(&identity, 3, &[4.0, 5.0, 6.0]), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn diagonal_check_rejects_nan_and_non_positive_entries() {
        assert!(!diagonal_is_sane(&[f64::NAN, 0.0, 0.0, 1.0], 2));
        assert!(!diagonal_is_sane(&[1.0, 0.0, 0.0, 0.0], 2));
        assert!(!diagonal_is_sane(&[1.0, f64::INFINITY, 0.0, 1.0], 2));
    }
}
