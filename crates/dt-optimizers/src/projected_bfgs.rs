//! Bound-constrained quasi-Newton search with bad-point signalling.
//!
//! Directions come from an inverse-Hessian BFGS model; trial points are
//! projected back onto the bounds and accepted on sufficient decrease. An
//! objective that cannot evaluate a point raises [`Signal::BadPoint`] and the
//! step is halved, the same way an insufficient decrease is handled.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dense::max_abs;
use crate::problem::{Evaluation, OptimizerError, ProblemShape, Report, Status};

const SUFFICIENT_DECREASE: f64 = 1e-4;
const CURVATURE_FLOOR: f64 = 1e-10;
const TINY: f64 = 1e-300;

/// Raised by a [`SignalledObjective`] instead of returning values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The point lies outside the region the objective can evaluate.
    BadPoint { reason: String },
    /// Abandon the run.
    Stop,
}

/// Objective callback for [`ProjectedBfgs`]. Only `objective` and `gradient`
/// of the returned [`Evaluation`] are used.
pub trait SignalledObjective {
    fn evaluate(&mut self, x: &Array1<f64>, iteration: usize) -> Result<Evaluation, Signal>;
}

impl<F> SignalledObjective for F
where
    F: FnMut(&Array1<f64>, usize) -> Result<Evaluation, Signal>,
{
    fn evaluate(&mut self, x: &Array1<f64>, iteration: usize) -> Result<Evaluation, Signal> {
        self(x, iteration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedBfgsOptions {
    pub max_iterations: usize,
    /// Infinity-norm tolerance on the projected gradient.
    pub tolerance: f64,
    pub max_step_halvings: usize,
}

impl Default for ProjectedBfgsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
            max_step_halvings: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectedBfgs {
    options: ProjectedBfgsOptions,
}

impl ProjectedBfgs {
    pub fn new(options: ProjectedBfgsOptions) -> Self {
        Self { options }
    }

    pub fn minimize<O>(
        &self,
        shape: &ProblemShape,
        x0: Array1<f64>,
        objective: &mut O,
    ) -> Result<Report, OptimizerError>
    where
        O: SignalledObjective + ?Sized,
    {
        shape.check_point(&x0)?;
        if shape.n_constraints() > 0 {
            return Err(OptimizerError::DimensionMismatch {
                what: "general constraints",
                expected: 0,
                found: shape.n_constraints(),
            });
        }
        let n = shape.dim();
        let opts = &self.options;

        let mut evaluations = 0;
        let mut iteration = 0;
        let mut x = shape.project(&x0);

        let mut retreats = 0;
        let (mut f, mut g) = loop {
            evaluations += 1;
            match objective.evaluate(&x, iteration) {
                Ok(values) => {
                    check_gradient(n, &values)?;
                    break (values.objective, values.gradient);
                }
                Err(Signal::Stop) => {
                    return Ok(report(x, None, iteration, evaluations, Status::Stopped));
                }
                Err(Signal::BadPoint { reason }) => {
                    retreats += 1;
                    if retreats > opts.max_step_halvings {
                        warn!(evaluations, %reason, "no evaluable starting point");
                        return Ok(report(
                            x,
                            None,
                            iteration,
                            evaluations,
                            Status::InitialPointFailed,
                        ));
                    }
                    x = shape.retreat(&x);
                }
            }
        };

        let mut h = Array2::<f64>::eye(n);
        let mut scaled = false;

        while iteration < opts.max_iterations {
            let projected_gradient = shape.project(&(&x - &g)) - &x;
            if max_abs(&projected_gradient) <= opts.tolerance {
                debug!(iteration, objective = f, "projected bfgs converged");
                return Ok(report(x, Some(f), iteration, evaluations, Status::Converged));
            }

            let mut d = -h.dot(&g);
            for i in 0..n {
                let blocked = (x[i] <= shape.lower[i] && d[i] < 0.0)
                    || (x[i] >= shape.upper[i] && d[i] > 0.0);
                if blocked {
                    d[i] = 0.0;
                }
            }
            if g.dot(&d) >= 0.0 {
                debug!(iteration, "not a descent direction, resetting model");
                h = Array2::eye(n);
                d = -&g;
            }

            let mut alpha = 1.0;
            let mut halvings = 0;
            let (trial_x, s, trial_f, trial_g) = loop {
                let candidate = shape.project(&(&x + &(&d * alpha)));
                let s = &candidate - &x;
                evaluations += 1;
                match objective.evaluate(&candidate, iteration) {
                    Ok(values) => {
                        check_gradient(n, &values)?;
                        if values.objective <= f + SUFFICIENT_DECREASE * g.dot(&s) {
                            break (candidate, s, values.objective, values.gradient);
                        }
                    }
                    Err(Signal::Stop) => {
                        return Ok(report(x, Some(f), iteration, evaluations, Status::Stopped));
                    }
                    Err(Signal::BadPoint { reason }) => {
                        debug!(iteration, alpha, %reason, "bad point, halving step");
                    }
                }
                halvings += 1;
                if halvings > opts.max_step_halvings {
                    warn!(iteration, halvings, "line search exhausted");
                    return Ok(report(
                        x,
                        Some(f),
                        iteration,
                        evaluations,
                        Status::LineSearchFailed,
                    ));
                }
                alpha *= 0.5;
            };

            let y = &trial_g - &g;
            let sy = s.dot(&y);
            let ss = s.dot(&s);
            if !scaled && sy > 0.0 {
                h = Array2::eye(n) * (sy / y.dot(&y));
                scaled = true;
            }
            if ss > TINY && sy >= CURVATURE_FLOOR * ss {
                inverse_bfgs_update(&mut h, &s, &y, sy);
            }

            x = trial_x;
            f = trial_f;
            g = trial_g;
            iteration += 1;
            debug!(iteration, objective = f, alpha, "projected bfgs step accepted");
        }

        Ok(report(x, Some(f), iteration, evaluations, Status::IterationLimit))
    }
}

fn report(
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

fn check_gradient(n: usize, values: &Evaluation) -> Result<(), OptimizerError> {
    if values.gradient.len() != n {
        return Err(OptimizerError::DimensionMismatch {
            what: "gradient",
            expected: n,
            found: values.gradient.len(),
        });
    }
    Ok(())
}

/// `H ← (I - ρ s yᵀ) H (I - ρ y sᵀ) + ρ s sᵀ`, expanded into rank-one terms.
fn inverse_bfgs_update(h: &mut Array2<f64>, s: &Array1<f64>, y: &Array1<f64>, sy: f64) {
    let rho = 1.0 / sy;
    let hy = h.dot(y);
    let yhy = y.dot(&hy);

    let s_col = s.view().insert_axis(Axis(1));
    let s_row = s.view().insert_axis(Axis(0));
    let hy_col = hy.view().insert_axis(Axis(1));
    let hy_row = hy.view().insert_axis(Axis(0));

    h.scaled_add(-rho, &hy_col.dot(&s_row));
    h.scaled_add(-rho, &s_col.dot(&hy_row));
    h.scaled_add(rho * rho * yhy + rho, &s_col.dot(&s_row));
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn paraboloid(x: &Array1<f64>) -> Evaluation {
        let (a, b) = (x[0], x[1]);
        Evaluation::unconstrained(
            (a - 3.0).powi(2) + a * b + (b + 4.0).powi(2) - 3.0,
            array![2.0 * (a - 3.0) + b, a + 2.0 * (b + 4.0)],
        )
    }

    fn smooth(x: &Array1<f64>, _iteration: usize) -> Result<Evaluation, Signal> {
        Ok(paraboloid(x))
    }

    #[test]
    fn interior_minimum() {
        let shape = ProblemShape::new(array![-50.0, -50.0], array![50.0, 50.0]).unwrap();
        let mut objective = smooth;
        let report = ProjectedBfgs::default()
            .minimize(&shape, array![50.0, 50.0], &mut objective)
            .unwrap();
        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x[0], 20.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.x[1], -22.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.objective.unwrap(), -27.0 - 1.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn active_bound_at_minimum() {
        let shape = ProblemShape::new(array![0.0, 0.0], array![10.0, 10.0]).unwrap();
        let mut objective = smooth;
        let report = ProjectedBfgs::default()
            .minimize(&shape, array![5.0, 5.0], &mut objective)
            .unwrap();
        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.x[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn bad_point_signal_is_backed_off() {
        let shape = ProblemShape::new(array![-50.0, -50.0], array![50.0, 50.0]).unwrap();
        let mut bad_points = Vec::new();
        let mut objective = |x: &Array1<f64>, iteration: usize| {
            if x[0] < -40.0 && x[1] < -40.0 {
                bad_points.push((iteration, x.clone()));
                return Err(Signal::BadPoint {
                    reason: "outside the valid region".into(),
                });
            }
            Ok(paraboloid(x))
        };
        let report = ProjectedBfgs::default()
            .minimize(&shape, array![50.0, 50.0], &mut objective)
            .unwrap();
        assert_eq!(report.status, Status::Converged);
        assert_abs_diff_eq!(report.x[0], 20.0 / 3.0, epsilon = 1e-6);
        assert_eq!(bad_points.len(), 1);
        assert_eq!(bad_points[0].0, 0);
        assert_eq!(bad_points[0].1, array![-50.0, -50.0]);
    }

    #[test]
    fn stop_signal() {
        let shape = ProblemShape::unbounded(2);
        let mut objective = |_: &Array1<f64>, _: usize| -> Result<Evaluation, Signal> { Err(Signal::Stop) };
        let report = ProjectedBfgs::default()
            .minimize(&shape, array![1.0, 1.0], &mut objective)
            .unwrap();
        assert_eq!(report.status, Status::Stopped);
        assert_eq!(report.evaluations, 1);
        assert!(report.objective.is_none());
    }

    #[test]
    fn general_constraints_rejected() {
        let shape = ProblemShape::unbounded(2).with_constraints(1, 0);
        let mut objective = smooth;
        assert!(ProjectedBfgs::default()
            .minimize(&shape, array![0.0, 0.0], &mut objective)
            .is_err());
    }

    #[test]
    fn iteration_limit() {
        let shape = ProblemShape::unbounded(2);
        let mut objective = smooth;
        let solver = ProjectedBfgs::new(ProjectedBfgsOptions {
            max_iterations: 1,
            ..ProjectedBfgsOptions::default()
        });
        let report = solver.minimize(&shape, array![50.0, 50.0], &mut objective).unwrap();
        assert_eq!(report.status, Status::IterationLimit);
        assert_eq!(report.iterations, 1);
    }
}
