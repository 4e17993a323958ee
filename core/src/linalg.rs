//! Small dense linear algebra kernel
//!
//! The contextual bandit keeps a ridge-regression design matrix `A` and its
//! inverse per feature space. Feature spaces are low dimensional (single or
//! low double digits), so everything here works on dense `nalgebra` matrices.
//!
//! ## Sherman-Morrison rank-1 update
//!
//! ```text
//! (A + x xᵀ)⁻¹ = A⁻¹ − (A⁻¹ x)(xᵀ A⁻¹) / (1 + xᵀ A⁻¹ x)
//! ```
//!
//! which costs O(d²) instead of the O(d³) of a fresh inversion. When the
//! denominator is within [`SINGULARITY_EPSILON`] of zero the update is
//! numerically unsafe; the input inverse is returned untouched together with a
//! [`NumericalInstabilityWarning`].
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::fmt;

use log::warn;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Dense matrix used throughout the kernel
pub type Matrix = DMatrix<f64>;

/// Dense column vector used throughout the kernel
pub type Vector = DVector<f64>;

/// Denominators closer to zero than this reject the rank-1 update
pub const SINGULARITY_EPSILON: f64 = 1e-10;

/// Kernel result type
pub type KernelResult<T> = Result<T, ValidationError>;

/// Raised instead of propagating NaN/Inf from a near-singular update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericalInstabilityWarning {
    /// The offending `1 + xᵀA⁻¹x`
    pub denominator: f64,
}

impl fmt::Display for NumericalInstabilityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sherman-Morrison denominator {:e} is within {:e} of zero; inverse retained",
            self.denominator, SINGULARITY_EPSILON
        )
    }
}

/// Outcome of a rank-1 inverse update
#[derive(Debug, Clone, PartialEq)]
pub struct RankOneUpdate {
    /// Updated inverse, or the unmodified input when `warning` is set
    pub inverse: Matrix,
    pub warning: Option<NumericalInstabilityWarning>,
}

impl RankOneUpdate {
    pub fn is_applied(&self) -> bool {
        self.warning.is_none()
    }
}

pub fn identity(dimension: usize) -> Matrix {
    Matrix::identity(dimension, dimension)
}

pub fn zero_matrix(dimension: usize) -> Matrix {
    Matrix::zeros(dimension, dimension)
}

pub fn zero_vector(dimension: usize) -> Vector {
    Vector::zeros(dimension)
}

/// Reject non-square matrices and non-finite entries
pub fn validate_matrix(matrix: &Matrix, context: &str) -> KernelResult<()> {
    if matrix.nrows() != matrix.ncols() {
        return Err(ValidationError::DimensionMismatch {
            expected: matrix.nrows(),
            actual: matrix.ncols(),
        });
    }
    if !matrix.iter().all(|v| v.is_finite()) {
        return Err(ValidationError::NonFinite {
            context: context.to_string(),
        });
    }
    Ok(())
}

/// Reject vectors with non-finite entries
pub fn validate_vector(vector: &Vector, context: &str) -> KernelResult<()> {
    if !vector.iter().all(|v| v.is_finite()) {
        return Err(ValidationError::NonFinite {
            context: context.to_string(),
        });
    }
    Ok(())
}

fn check_dimension(expected: usize, actual: usize) -> KernelResult<()> {
    if expected != actual {
        return Err(ValidationError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

pub fn matrix_vector_multiply(matrix: &Matrix, vector: &Vector) -> KernelResult<Vector> {
    check_dimension(matrix.ncols(), vector.len())?;
    Ok(matrix * vector)
}

pub fn dot_product(a: &Vector, b: &Vector) -> KernelResult<f64> {
    check_dimension(a.len(), b.len())?;
    Ok(a.dot(b))
}

pub fn outer_product(a: &Vector, b: &Vector) -> Matrix {
    a * b.transpose()
}

pub fn matrix_add(a: &Matrix, b: &Matrix) -> KernelResult<Matrix> {
    check_dimension(a.nrows(), b.nrows())?;
    check_dimension(a.ncols(), b.ncols())?;
    Ok(a + b)
}

/// `xᵀ M x`
pub fn quadratic_form(matrix: &Matrix, x: &Vector) -> KernelResult<f64> {
    let mx = matrix_vector_multiply(matrix, x)?;
    Ok(x.dot(&mx))
}

/// Compute `(A + x xᵀ)⁻¹` from `A⁻¹` in O(d²)
///
/// Fails with [`ValidationError::DimensionMismatch`] when `len(x)` differs
/// from the matrix dimension and with [`ValidationError::NonFinite`] for
/// non-finite inputs. A near-zero denominator is not an error: the input is
/// returned unchanged with a warning attached.
pub fn sherman_morrison_update(a_inv: &Matrix, x: &Vector) -> KernelResult<RankOneUpdate> {
    validate_matrix(a_inv, "inverse design matrix")?;
    check_dimension(a_inv.nrows(), x.len())?;
    validate_vector(x, "context vector")?;

    let left = a_inv * x;
    let right = a_inv.transpose() * x;
    let denominator = 1.0 + x.dot(&left);

    if !denominator.is_finite() || denominator.abs() < SINGULARITY_EPSILON {
        let warning = NumericalInstabilityWarning { denominator };
        warn!("{}", warning);
        return Ok(RankOneUpdate {
            inverse: a_inv.clone(),
            warning: Some(warning),
        });
    }

    let updated = a_inv - (left * right.transpose()) / denominator;
    if !updated.iter().all(|v| v.is_finite()) {
        let warning = NumericalInstabilityWarning { denominator };
        warn!("Rank-1 update produced non-finite entries: {}", warning);
        return Ok(RankOneUpdate {
            inverse: a_inv.clone(),
            warning: Some(warning),
        });
    }

    Ok(RankOneUpdate {
        inverse: updated,
        warning: None,
    })
}

/// Exact inverse of a symmetric positive-definite matrix via Cholesky
///
/// Returns `None` when the matrix is not numerically SPD.
pub fn invert_spd(matrix: &Matrix) -> Option<Matrix> {
    if validate_matrix(matrix, "design matrix").is_err() {
        return None;
    }
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    let inverse = symmetric.cholesky()?.inverse();
    inverse.iter().all(|v| v.is_finite()).then_some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spd(rng: &mut StdRng, d: usize) -> Matrix {
        let b = Matrix::from_fn(d, d, |_, _| rng.gen_range(-1.0..1.0));
        b.transpose() * &b + identity(d)
    }

    fn random_vector(rng: &mut StdRng, d: usize) -> Vector {
        Vector::from_fn(d, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn max_abs_diff(a: &Matrix, b: &Matrix) -> f64 {
        (a - b).iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    #[test]
    fn test_sherman_morrison_matches_direct_inverse_up_to_dimension_20() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for d in 1..=20 {
            for _ in 0..5 {
                let a = random_spd(&mut rng, d);
                let a_inv = a.clone().try_inverse().unwrap();
                let x = random_vector(&mut rng, d);

                let update = sherman_morrison_update(&a_inv, &x).unwrap();
                assert!(update.is_applied());

                let direct = (a + outer_product(&x, &x)).try_inverse().unwrap();
                assert!(
                    max_abs_diff(&update.inverse, &direct) < 1e-6,
                    "dimension {} diverged",
                    d
                );
            }
        }
    }

    #[test]
    fn test_near_singular_denominator_returns_input_unchanged() {
        let a_inv = Matrix::from_diagonal(&Vector::from_vec(vec![-1.0, 1.0]));
        let x = Vector::from_vec(vec![1.0, 0.0]);

        let update = sherman_morrison_update(&a_inv, &x).unwrap();

        assert!(!update.is_applied());
        assert_eq!(update.inverse, a_inv);
        let warning = update.warning.unwrap();
        assert!(warning.denominator.abs() < SINGULARITY_EPSILON);
    }

    #[test]
    fn test_dimension_mismatch_is_rejected() {
        let err = sherman_morrison_update(&identity(3), &zero_vector(2)).unwrap_err();
        assert_eq!(err, ValidationError::DimensionMismatch { expected: 3, actual: 2 });
    }

    #[test]
    fn test_non_finite_inputs_are_rejected() {
        let mut a_inv = identity(2);
        a_inv[(0, 1)] = f64::NAN;
        assert!(matches!(
            sherman_morrison_update(&a_inv, &Vector::from_vec(vec![1.0, 1.0])),
            Err(ValidationError::NonFinite { .. })
        ));
        assert!(matches!(
            sherman_morrison_update(&identity(2), &Vector::from_vec(vec![f64::INFINITY, 0.0])),
            Err(ValidationError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_primitives() {
        let a = Vector::from_vec(vec![1.0, 2.0]);
        let b = Vector::from_vec(vec![3.0, 4.0]);
        assert_eq!(dot_product(&a, &b).unwrap(), 11.0);
        assert_eq!(
            outer_product(&a, &b),
            Matrix::from_row_slice(2, 2, &[3.0, 4.0, 6.0, 8.0])
        );
        assert_eq!(
            matrix_add(&identity(2), &identity(2)).unwrap(),
            identity(2) * 2.0
        );
        assert_eq!(
            matrix_vector_multiply(&(identity(2) * 3.0), &a).unwrap(),
            Vector::from_vec(vec![3.0, 6.0])
        );
        assert!(dot_product(&a, &zero_vector(3)).is_err());
        assert!(matrix_add(&identity(2), &identity(3)).is_err());
        assert_eq!(quadratic_form(&identity(2), &a).unwrap(), 5.0);
        assert_eq!(zero_matrix(2), Matrix::zeros(2, 2));
    }

    #[test]
    fn test_invert_spd_agrees_with_general_inverse() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = random_spd(&mut rng, 6);
        let exact = a.clone().try_inverse().unwrap();
        let spd = invert_spd(&a).unwrap();
        for (lhs, rhs) in spd.iter().zip(exact.iter()) {
            assert_abs_diff_eq!(*lhs, *rhs, epsilon = 1e-9);
        }
        assert!(invert_spd(&(identity(2) * -1.0)).is_none());
    }

    proptest! {
        #[test]
        fn prop_rank_one_update_matches_recomputation(seed in any::<u64>(), d in 1usize..12) {
            let mut rng = StdRng::seed_from_u64(seed);
            let a = random_spd(&mut rng, d);
            let a_inv = a.clone().try_inverse().unwrap();
            let x = random_vector(&mut rng, d);

            let update = sherman_morrison_update(&a_inv, &x).unwrap();
            let direct = (a + outer_product(&x, &x)).try_inverse().unwrap();
            prop_assert!(max_abs_diff(&update.inverse, &direct) < 1e-6);
        }
    }
}
