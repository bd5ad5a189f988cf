//! Problem description and run reports shared by the backends.

use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Setup errors. Algorithmic failures are reported through [`Status`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid bounds at index {index}: lower {lower} > upper {upper}")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    #[error("Matrix is not positive definite")]
    NotPositiveDefinite,

    #[error("Subproblem did not converge after {sweeps} sweeps")]
    SubproblemDidNotConverge { sweeps: usize },
}

/// Bounds and constraint counts of a problem in flat form.
///
/// Constraint values are laid out with the `n_inequality` rows (feasible when
/// `>= 0`) first, followed by the `n_equality` rows (feasible when `== 0`).
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemShape {
    pub lower: Array1<f64>,
    pub upper: Array1<f64>,
    pub n_inequality: usize,
    pub n_equality: usize,
}

impl ProblemShape {
    pub fn new(lower: Array1<f64>, upper: Array1<f64>) -> Result<Self, OptimizerError> {
        if lower.len() != upper.len() {
            return Err(OptimizerError::DimensionMismatch {
                what: "upper bounds",
                expected: lower.len(),
                found: upper.len(),
            });
        }
        for (index, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(OptimizerError::InvalidBounds {
                    index,
                    lower: lo,
                    upper: hi,
                });
            }
        }
        Ok(Self {
            lower,
            upper,
            n_inequality: 0,
            n_equality: 0,
        })
    }

    pub fn unbounded(dim: usize) -> Self {
        Self {
            lower: Array1::from_elem(dim, f64::NEG_INFINITY),
            upper: Array1::from_elem(dim, f64::INFINITY),
            n_inequality: 0,
            n_equality: 0,
        }
    }

    pub fn with_constraints(mut self, n_inequality: usize, n_equality: usize) -> Self {
        self.n_inequality = n_inequality;
        self.n_equality = n_equality;
        self
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.n_inequality + self.n_equality
    }

    /// Clip a point into the bounds.
    pub fn project(&self, x: &Array1<f64>) -> Array1<f64> {
        Zip::from(x)
            .and(&self.lower)
            .and(&self.upper)
            .map_collect(|&v, &lo, &hi| v.max(lo).min(hi))
    }

    /// Point that failed evaluations retreat toward: the middle of the box
    /// where both bounds are finite, the finite bound where only one is, zero
    /// otherwise.
    pub fn anchor(&self) -> Array1<f64> {
        Zip::from(&self.lower)
            .and(&self.upper)
            .map_collect(|&lo, &hi| match (lo.is_finite(), hi.is_finite()) {
                (true, true) => 0.5 * (lo + hi),
                (true, false) => lo,
                (false, true) => hi,
                (false, false) => 0.0,
            })
    }

    /// Move halfway from `x` toward the anchor.
    pub fn retreat(&self, x: &Array1<f64>) -> Array1<f64> {
        let anchor = self.anchor();
        x + &((&anchor - x) * 0.5)
    }

    /// Per-row infeasibility of a constraint vector.
    pub fn violation(&self, constraints: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(constraints.iter().enumerate().map(|(i, &c)| {
            if i < self.n_inequality {
                (-c).max(0.0)
            } else {
                c.abs()
            }
        }))
    }

    pub(crate) fn check_point(&self, x: &Array1<f64>) -> Result<(), OptimizerError> {
        if x.len() != self.dim() {
            return Err(OptimizerError::DimensionMismatch {
                what: "initial point",
                expected: self.dim(),
                found: x.len(),
            });
        }
        Ok(())
    }
}

/// Values and derivatives at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub objective: f64,
    pub gradient: Array1<f64>,
    pub constraints: Array1<f64>,
    /// `n_constraints x dim`, rows in the same order as `constraints`.
    pub jacobian: Array2<f64>,
}

impl Evaluation {
    pub fn unconstrained(objective: f64, gradient: Array1<f64>) -> Self {
        let n = gradient.len();
        Self {
            objective,
            gradient,
            constraints: Array1::zeros(0),
            jacobian: Array2::zeros((0, n)),
        }
    }

    /// Evaluation filled with NaN, for replies that carry no usable values.
    pub fn nan(dim: usize, n_constraints: usize) -> Self {
        Self {
            objective: f64::NAN,
            gradient: Array1::from_elem(dim, f64::NAN),
            constraints: Array1::from_elem(n_constraints, f64::NAN),
            jacobian: Array2::from_elem((n_constraints, dim), f64::NAN),
        }
    }
}

/// Why a backend stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Converged,
    IterationLimit,
    LineSearchFailed,
    InitialPointFailed,
    SubproblemFailed,
    /// The objective asked the backend to stop.
    Stopped,
}

impl Status {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::IterationLimit => "iteration limit reached",
            Self::LineSearchFailed => "line search failed to find an acceptable step",
            Self::InitialPointFailed => "no evaluable starting point found",
            Self::SubproblemFailed => "quadratic subproblem failed",
            Self::Stopped => "stopped on request",
        }
    }
}

/// Final state of a backend run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub x: Array1<f64>,
    /// Objective at `x`. `None` when no point was ever evaluated successfully.
    pub objective: Option<f64>,
    pub iterations: usize,
    pub evaluations: usize,
    pub status: Status,
}
