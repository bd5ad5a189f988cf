//! Sequential quadratic programming with a failure flag.
//!
//! Each major iteration solves a quadratic model of the Lagrangian subject to
//! linearized constraints and bounds, then backtracks along the resulting step
//! until an exact-penalty merit function decreases enough. The Hessian model is
//! kept positive definite with Powell's damped BFGS update.
//!
//! The objective reports a failed evaluation by returning [`EvalFlag::Failed`].
//! A failed trial point is treated like a rejected one: the step is halved and
//! the point re-evaluated, without advancing the iteration counter.

use ndarray::{s, Array1, Array2, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dense::max_abs;
use crate::problem::{Evaluation, OptimizerError, ProblemShape, Report, Status};
use crate::qp::{self, QpProblem};

const ARMIJO: f64 = 0.1;
const DAMPING: f64 = 0.2;
const TINY: f64 = 1e-300;

/// How the objective answered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalFlag {
    Ok,
    /// The point could not be evaluated. Values are ignored.
    Failed,
    /// Abandon the run.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedEvaluation {
    pub values: Evaluation,
    pub flag: EvalFlag,
}

impl FlaggedEvaluation {
    pub fn ok(values: Evaluation) -> Self {
        Self {
            values,
            flag: EvalFlag::Ok,
        }
    }

    pub fn failed(dim: usize, n_constraints: usize) -> Self {
        Self {
            values: Evaluation::nan(dim, n_constraints),
            flag: EvalFlag::Failed,
        }
    }

    pub fn stop(dim: usize, n_constraints: usize) -> Self {
        Self {
            values: Evaluation::nan(dim, n_constraints),
            flag: EvalFlag::Stop,
        }
    }
}

/// Objective and constraint callback for [`Sqp`].
pub trait FlaggedObjective {
    /// `iteration` is the major iteration the point belongs to.
    fn evaluate(&mut self, x: &Array1<f64>, iteration: usize) -> FlaggedEvaluation;
}

impl<F> FlaggedObjective for F
where
    F: FnMut(&Array1<f64>, usize) -> FlaggedEvaluation,
{
    fn evaluate(&mut self, x: &Array1<f64>, iteration: usize) -> FlaggedEvaluation {
        self(x, iteration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqpOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub feasibility_tolerance: f64,
    pub max_step_halvings: usize,
    /// Diagonal of the first Hessian model. Identity when `None`.
    pub initial_hessian: Option<Vec<f64>>,
}

impl Default for SqpOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            feasibility_tolerance: 1e-8,
            max_step_halvings: 30,
            initial_hessian: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sqp {
    options: SqpOptions,
}

impl Sqp {
    pub fn new(options: SqpOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SqpOptions {
        &self.options
    }

    pub fn minimize<O>(
        &self,
        shape: &ProblemShape,
        x0: Array1<f64>,
        objective: &mut O,
    ) -> Result<Report, OptimizerError>
    where
        O: FlaggedObjective + ?Sized,
    {
        shape.check_point(&x0)?;
        let n = shape.dim();
        let m = shape.n_constraints();
        let opts = &self.options;
        let mut hessian = initial_hessian(opts.initial_hessian.as_deref(), n)?;

        let mut evaluations = 0;
        let mut iteration = 0;
        let mut x = x0;

        // ---- starting point ----
        let mut retreats = 0;
        let mut current = loop {
            evaluations += 1;
            let reply = objective.evaluate(&x, iteration);
            match reply.flag {
                EvalFlag::Ok => {
                    check_evaluation(shape, &reply.values)?;
                    break reply.values;
                }
                EvalFlag::Stop => {
                    return Ok(finish(x, None, iteration, evaluations, Status::Stopped));
                }
                EvalFlag::Failed => {
                    retreats += 1;
                    if retreats > opts.max_step_halvings {
                        warn!(evaluations, "no evaluable starting point");
                        return Ok(finish(
                            x,
                            None,
                            iteration,
                            evaluations,
                            Status::InitialPointFailed,
                        ));
                    }
                    x = shape.retreat(&x);
                    debug!(retreats, "starting point failed, retreating toward anchor");
                }
            }
        };

        let mut penalty = Array1::<f64>::zeros(m);

        // ---- major iterations ----
        while iteration < opts.max_iterations {
            let (rows, rhs, equality) = subproblem_rows(shape, &x, &current);
            let solution = match qp::solve(&QpProblem {
                hessian: &hessian,
                gradient: &current.gradient,
                rows: &rows,
                rhs: &rhs,
                equality: &equality,
            }) {
                Ok(solution) => solution,
                Err(err) => {
                    warn!(iteration, error = %err, "quadratic subproblem failed");
                    return Ok(finish(
                        x,
                        Some(current.objective),
                        iteration,
                        evaluations,
                        Status::SubproblemFailed,
                    ));
                }
            };
            let step = solution.step;

            let violation = shape.violation(&current.constraints);
            if max_abs(&step) <= opts.tolerance * (1.0 + max_abs(&x))
                && max_abs(&violation) <= opts.feasibility_tolerance
            {
                debug!(iteration, objective = current.objective, "sqp converged");
                return Ok(finish(
                    x,
                    Some(current.objective),
                    iteration,
                    evaluations,
                    Status::Converged,
                ));
            }

            let lambda = solution.multipliers.slice(s![..m]).to_owned();
            Zip::from(&mut penalty)
                .and(&lambda)
                .for_each(|mu, &l| *mu = l.abs().max(0.5 * (*mu + l.abs())));

            let merit0 = current.objective + penalty.dot(&violation);
            let slope = current.gradient.dot(&step) - penalty.dot(&violation);

            // ---- merit line search ----
            let mut alpha = 1.0;
            let mut halvings = 0;
            let (trial_x, trial) = loop {
                let candidate = shape.project(&(&x + &(&step * alpha)));
                evaluations += 1;
                let reply = objective.evaluate(&candidate, iteration);
                let accepted = match reply.flag {
                    EvalFlag::Stop => {
                        return Ok(finish(
                            x,
                            Some(current.objective),
                            iteration,
                            evaluations,
                            Status::Stopped,
                        ));
                    }
                    EvalFlag::Failed => {
                        debug!(iteration, alpha, "trial point failed, halving step");
                        None
                    }
                    EvalFlag::Ok => {
                        check_evaluation(shape, &reply.values)?;
                        let merit = reply.values.objective
                            + penalty.dot(&shape.violation(&reply.values.constraints));
                        // NaN merit compares false and is rejected.
                        if merit <= merit0 + ARMIJO * alpha * slope {
                            Some(reply.values)
                        } else {
                            None
                        }
                    }
                };
                if let Some(values) = accepted {
                    break (candidate, values);
                }
                halvings += 1;
                if halvings > opts.max_step_halvings {
                    warn!(iteration, halvings, "line search exhausted");
                    return Ok(finish(
                        x,
                        Some(current.objective),
                        iteration,
                        evaluations,
                        Status::LineSearchFailed,
                    ));
                }
                alpha *= 0.5;
            };

            let s = &trial_x - &x;
            let y = lagrangian_gradient(&trial, &lambda) - lagrangian_gradient(&current, &lambda);
            damped_bfgs_update(&mut hessian, &s, &y);

            x = trial_x;
            current = trial;
            iteration += 1;
            debug!(iteration, objective = current.objective, alpha, "sqp step accepted");
        }

        Ok(finish(
            x,
            Some(current.objective),
            iteration,
            evaluations,
            Status::IterationLimit,
        ))
    }
}

fn finish(
    x: Array1<f64>,
    objective: Option<f64>,
    iterations: usize,
    evaluations: usize,
    status: Status,
) -> Report {
    Report {
        x,
        objective,
        iterations,
        evaluations,
        status,
    }
}

fn initial_hessian(diagonal: Option<&[f64]>, n: usize) -> Result<Array2<f64>, OptimizerError> {
    let Some(diagonal) = diagonal else {
        return Ok(Array2::eye(n));
    };
    if diagonal.len() != n {
        return Err(OptimizerError::DimensionMismatch {
            what: "initial hessian",
            expected: n,
            found: diagonal.len(),
        });
    }
    if !diagonal.iter().all(|d| d.is_finite() && *d > 0.0) {
        return Err(OptimizerError::NotPositiveDefinite);
    }
    Ok(Array2::from_diag(&Array1::from(diagonal.to_vec())))
}

fn check_evaluation(shape: &ProblemShape, values: &Evaluation) -> Result<(), OptimizerError> {
    let (n, m) = (shape.dim(), shape.n_constraints());
    if values.gradient.len() != n {
        return Err(OptimizerError::DimensionMismatch {
            what: "gradient",
            expected: n,
            found: values.gradient.len(),
        });
    }
    if values.constraints.len() != m {
        return Err(OptimizerError::DimensionMismatch {
            what: "constraints",
            expected: m,
            found: values.constraints.len(),
        });
    }
    if values.jacobian.dim() != (m, n) {
        return Err(OptimizerError::DimensionMismatch {
            what: "jacobian elements",
            expected: m * n,
            found: values.jacobian.len(),
        });
    }
    Ok(())
}

/// Linearized constraints followed by one row per finite bound.
fn subproblem_rows(
    shape: &ProblemShape,
    x: &Array1<f64>,
    current: &Evaluation,
) -> (Array2<f64>, Array1<f64>, Vec<bool>) {
    let n = shape.dim();
    let m = shape.n_constraints();
    let n_bounds = shape.lower.iter().filter(|b| b.is_finite()).count()
        + shape.upper.iter().filter(|b| b.is_finite()).count();

    let mut rows = Array2::<f64>::zeros((m + n_bounds, n));
    let mut rhs = Array1::<f64>::zeros(m + n_bounds);
    let mut equality = vec![false; m + n_bounds];

    rows.slice_mut(s![..m, ..]).assign(&current.jacobian);
    for i in 0..m {
        rhs[i] = -current.constraints[i];
        equality[i] = i >= shape.n_inequality;
    }

    let mut row = m;
    for k in 0..n {
        if shape.lower[k].is_finite() {
            rows[[row, k]] = 1.0;
            rhs[row] = shape.lower[k] - x[k];
            row += 1;
        }
        if shape.upper[k].is_finite() {
            rows[[row, k]] = -1.0;
            rhs[row] = x[k] - shape.upper[k];
            row += 1;
        }
    }
    (rows, rhs, equality)
}

fn lagrangian_gradient(values: &Evaluation, lambda: &Array1<f64>) -> Array1<f64> {
    &values.gradient - &values.jacobian.t().dot(lambda)
}

/// Powell-damped BFGS update of a Hessian approximation. Keeps `b` positive
/// definite even when `sᵀy` is small or negative.
fn damped_bfgs_update(b: &mut Array2<f64>, s: &Array1<f64>, y: &Array1<f64>) {
    let bs = b.dot(s);
    let sbs = s.dot(&bs);
    if sbs <= TINY {
        return;
    }
    let sy = s.dot(y);
    let theta = if sy >= DAMPING * sbs {
        1.0
    } else {
        (1.0 - DAMPING) * sbs / (sbs - sy)
    };
    let r = y * theta + &bs * (1.0 - theta);
    let sr = s.dot(&r);

    let n = s.len();
    for i in 0..n {
        for j in 0..n {
            b[[i, j]] += r[i] * r[j] / sr - bs[i] * bs[j] / sbs;
        }
    }
}
