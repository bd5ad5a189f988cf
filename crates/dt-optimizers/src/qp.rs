//! Convex quadratic subproblem solver.
//!
//! Solves
//!
//! ```text
//! minimize    ½ dᵀ B d + gᵀ d
//! subject to  aᵢ d >= bᵢ   (inequality rows)
//!             aᵢ d  = bᵢ   (equality rows)
//! ```
//!
//! for symmetric positive definite `B` by coordinate ascent on the dual
//! (Hildreth's method). The primal step is kept in sync with the multipliers,
//! so each coordinate update is O(n).

use ndarray::{Array1, Array2};

use crate::dense::{cholesky, cholesky_solve, max_abs};
use crate::problem::OptimizerError;

const MAX_SWEEPS: usize = 10_000;
const SWEEP_TOLERANCE: f64 = 1e-13;
const TINY: f64 = 1e-300;

/// One quadratic subproblem.
#[derive(Debug, Clone)]
pub struct QpProblem<'a> {
    pub hessian: &'a Array2<f64>,
    pub gradient: &'a Array1<f64>,
    /// Constraint rows, `m x n`.
    pub rows: &'a Array2<f64>,
    pub rhs: &'a Array1<f64>,
    /// `true` for equality rows.
    pub equality: &'a [bool],
}

#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub step: Array1<f64>,
    /// One multiplier per row, non-negative for inequality rows.
    pub multipliers: Array1<f64>,
    pub sweeps: usize,
}

pub fn solve(problem: &QpProblem<'_>) -> Result<QpSolution, OptimizerError> {
    let n = problem.gradient.len();
    let m = problem.rows.nrows();
    if problem.rows.ncols() != n {
        return Err(OptimizerError::DimensionMismatch {
            what: "subproblem row width",
            expected: n,
            found: problem.rows.ncols(),
        });
    }
    if problem.rhs.len() != m || problem.equality.len() != m {
        return Err(OptimizerError::DimensionMismatch {
            what: "subproblem right-hand side",
            expected: m,
            found: problem.rhs.len(),
        });
    }

    let l = cholesky(problem.hessian)?;
    let binv_g = cholesky_solve(&l, problem.gradient.view());
    let binv_rows: Vec<Array1<f64>> = problem
        .rows
        .rows()
        .into_iter()
        .map(|row| cholesky_solve(&l, row))
        .collect();
    let diag: Vec<f64> = problem
        .rows
        .rows()
        .into_iter()
        .zip(&binv_rows)
        .map(|(row, binv_row)| row.dot(binv_row))
        .collect();

    let mut multipliers = Array1::<f64>::zeros(m);
    let mut step = -binv_g;

    for sweep in 0..MAX_SWEEPS {
        let mut delta = 0.0_f64;
        for i in 0..m {
            if diag[i] <= TINY {
                continue;
            }
            let residual = problem.rhs[i] - problem.rows.row(i).dot(&step);
            let mut updated = multipliers[i] + residual / diag[i];
            if !problem.equality[i] {
                updated = updated.max(0.0);
            }
            let change = updated - multipliers[i];
            if change != 0.0 {
                multipliers[i] = updated;
                step.scaled_add(change, &binv_rows[i]);
                delta = delta.max(change.abs() * diag[i].sqrt());
            }
        }
        if delta <= SWEEP_TOLERANCE * (1.0 + max_abs(&step)) {
            return Ok(QpSolution {
                step,
                multipliers,
                sweeps: sweep + 1,
            });
        }
    }

    Err(OptimizerError::SubproblemDidNotConverge { sweeps: MAX_SWEEPS })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn unconstrained_step_is_newton_step() {
        let b = array![[2.0, 0.0], [0.0, 4.0]];
        let g = array![2.0, -4.0];
        let rows = Array2::zeros((0, 2));
        let rhs = Array1::zeros(0);
        let sol = solve(&QpProblem {
            hessian: &b,
            gradient: &g,
            rows: &rows,
            rhs: &rhs,
            equality: &[],
        })
        .unwrap();
        assert_abs_diff_eq!(sol.step[0], -1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(sol.step[1], 1.0, epsilon = 1e-14);
    }

    #[test]
    fn active_inequality_and_multiplier() {
        // min ½|d|² - d₀  s.t. d₀ <= 0.25  (written as -d₀ >= -0.25)
        let b = Array2::eye(2);
        let g = array![-1.0, 0.0];
        let rows = array![[-1.0, 0.0]];
        let rhs = array![-0.25];
        let sol = solve(&QpProblem {
            hessian: &b,
            gradient: &g,
            rows: &rows,
            rhs: &rhs,
            equality: &[false],
        })
        .unwrap();
        assert_abs_diff_eq!(sol.step[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(sol.multipliers[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn equality_row_may_take_negative_multiplier() {
        // min ½|d|²  s.t. d₀ + d₁ = -2
        let b = Array2::eye(2);
        let g = array![0.0, 0.0];
        let rows = array![[1.0, 1.0]];
        let rhs = array![-2.0];
        let sol = solve(&QpProblem {
            hessian: &b,
            gradient: &g,
            rows: &rows,
            rhs: &rhs,
            equality: &[true],
        })
        .unwrap();
        assert_abs_diff_eq!(sol.step[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sol.step[1], -1.0, epsilon = 1e-12);
        assert!(sol.multipliers[0] < 0.0);
    }

    #[test]
    fn inactive_inequality_keeps_zero_multiplier() {
        let b = Array2::eye(1);
        let g = array![1.0];
        let rows = array![[1.0]];
        let rhs = array![-10.0];
        let sol = solve(&QpProblem {
            hessian: &b,
            gradient: &g,
            rows: &rows,
            rhs: &rhs,
            equality: &[false],
        })
        .unwrap();
        assert_abs_diff_eq!(sol.step[0], -1.0, epsilon = 1e-14);
        assert_eq!(sol.multipliers[0], 0.0);
    }
}
