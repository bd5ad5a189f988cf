//! Small dense linear algebra helpers.

use ndarray::{Array1, Array2, ArrayView1};

use crate::problem::OptimizerError;

/// Lower-triangular Cholesky factor `L` with `a = L Lᵀ`.
pub fn cholesky(a: &Array2<f64>) -> Result<Array2<f64>, OptimizerError> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(OptimizerError::DimensionMismatch {
            what: "square matrix columns",
            expected: n,
            found: a.ncols(),
        });
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if diag <= 0.0 || diag.is_nan() {
            return Err(OptimizerError::NotPositiveDefinite);
        }
        let pivot = diag.sqrt();
        l[[j, j]] = pivot;
        for i in (j + 1)..n {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = sum / pivot;
        }
    }
    Ok(l)
}

/// Solve `L Lᵀ x = b` given the factor from [`cholesky`].
pub fn cholesky_solve(l: &Array2<f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Infinity norm. Zero for an empty vector.
pub fn max_abs(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}
