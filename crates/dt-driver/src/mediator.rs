//! Evaluation mediator.
//!
//! Runs exactly one model evaluation, classifies what came back into an
//! [`Outcome`], applies the recoverable-failure budget and appends the record
//! to the history before handing the outcome back.

use chrono::Utc;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error, warn};

use dt_types::{
    DesignPoint, DifferenceForm, DriverConfig, EvaluationRecord, FailurePolicy, FatalCause,
    FiniteDifference, HistoryError, Jacobian, Outcome, Response,
};

use crate::history::EvaluationHistory;
use crate::model::{Model, ModelError};

/// Counts consecutive recoverable failures and escalates once the limit is
/// passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureBudget {
    max_consecutive: usize,
    consecutive: usize,
}

impl FailureBudget {
    pub fn new(max_consecutive: usize) -> Self {
        Self {
            max_consecutive,
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    /// Pass an outcome through the budget. A recoverable failure beyond the
    /// limit comes back as a fatal one.
    pub fn apply(&mut self, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::RecoverableFailure { reason } => {
                self.consecutive += 1;
                if self.consecutive > self.max_consecutive {
                    Outcome::FatalFailure {
                        reason: format!(
                            "{} consecutive recoverable failures exceed the limit of {}; last: {reason}",
                            self.consecutive, self.max_consecutive
                        ),
                        cause: FatalCause::BudgetExhausted {
                            consecutive: self.consecutive,
                        },
                    }
                } else {
                    Outcome::RecoverableFailure { reason }
                }
            }
            Outcome::Success(response) => {
                self.consecutive = 0;
                Outcome::Success(response)
            }
            fatal @ Outcome::FatalFailure { .. } => fatal,
        }
    }
}

#[derive(Debug, Clone)]
struct OutputDecl {
    name: String,
    size: usize,
    objective: bool,
}

impl OutputDecl {
    /// Values of this output, looked up only among its own kind.
    fn values<'r>(&self, response: &'r Response) -> Option<&'r [f64]> {
        if self.objective {
            response.objective(&self.name)
        } else {
            response.constraint(&self.name)
        }
    }
}

pub struct EvaluationMediator {
    variables: Vec<(String, usize)>,
    outputs: Vec<OutputDecl>,
    policy: FailurePolicy,
    finite_difference: FiniteDifference,
    budget: FailureBudget,
    next_index: u64,
}

impl EvaluationMediator {
    pub fn new(config: &DriverConfig) -> Self {
        let variables = config
            .design_variables
            .iter()
            .map(|v| (v.name.clone(), v.size()))
            .collect();
        let outputs = config
            .objectives
            .iter()
            .map(|o| OutputDecl {
                name: o.name.clone(),
                size: 1,
                objective: true,
            })
            .chain(config.constraints.iter().map(|c| OutputDecl {
                name: c.name.clone(),
                size: c.size,
                objective: false,
            }))
            .collect();

        Self {
            variables,
            outputs,
            policy: config.failure_policy.clone(),
            finite_difference: config.finite_difference.clone(),
            budget: FailureBudget::new(config.failure_policy.max_consecutive_recoverable),
            next_index: 0,
        }
    }

    pub fn budget(&self) -> &FailureBudget {
        &self.budget
    }

    /// Evaluate `point`, record the attempt and return its outcome.
    pub fn evaluate<M>(
        &mut self,
        point: &DesignPoint,
        iteration: u64,
        model: &mut M,
        history: &EvaluationHistory,
    ) -> Result<Outcome, HistoryError>
    where
        M: Model + ?Sized,
    {
        let index = self.next_index;
        let started_at = Utc::now();
        let clock = Instant::now();

        let classified = self.classify(point, model);
        let outcome = self.budget.apply(classified);
        let wall_time = clock.elapsed();

        match &outcome {
            Outcome::Success(_) => {
                debug!(index, iteration, %point, ?wall_time, "evaluation succeeded")
            }
            Outcome::RecoverableFailure { reason } => warn!(
                index,
                iteration,
                %point,
                %reason,
                consecutive = self.budget.consecutive(),
                "recoverable evaluation failure"
            ),
            Outcome::FatalFailure { reason, cause } => {
                error!(index, iteration, %point, %reason, ?cause, "fatal evaluation failure")
            }
        }

        history.append(EvaluationRecord {
            index,
            iteration,
            design_point: point.clone(),
            outcome: outcome.clone(),
            started_at,
            wall_time,
        })?;
        self.next_index += 1;
        Ok(outcome)
    }

    /// Classify one evaluation without recording it or touching the budget.
    pub fn classify<M>(&self, point: &DesignPoint, model: &mut M) -> Outcome
    where
        M: Model + ?Sized,
    {
        let mut response = match guarded(|| model.evaluate(point)) {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        if let Err(reason) = self.check_outputs(&response) {
            return Outcome::FatalFailure {
                reason,
                cause: FatalCause::InvalidResponse,
            };
        }
        if !response.values_are_finite() {
            return self.non_finite("model returned non-finite values");
        }

        let derivatives = match response.derivatives.take() {
            Some(jacobian) => jacobian,
            None => match guarded(|| model.linearize(point)) {
                Ok(Some(jacobian)) => jacobian,
                Ok(None) => match self.finite_differences(point, &response, model) {
                    Ok(jacobian) => jacobian,
                    Err(outcome) => return outcome,
                },
                Err(outcome) => return outcome,
            },
        };
        if !derivatives.is_finite() {
            return self.non_finite("model returned non-finite derivatives");
        }

        Outcome::Success(response.with_derivatives(derivatives))
    }

    fn non_finite(&self, reason: &str) -> Outcome {
        if self.policy.non_finite_is_recoverable {
            Outcome::RecoverableFailure {
                reason: reason.to_string(),
            }
        } else {
            Outcome::FatalFailure {
                reason: reason.to_string(),
                cause: FatalCause::InvalidResponse,
            }
        }
    }

    fn check_outputs(&self, response: &Response) -> Result<(), String> {
        for output in &self.outputs {
            match output.values(response) {
                None if output.objective => {
                    return Err(format!("model did not return objective {}", output.name))
                }
                None => return Err(format!("model did not return constraint {}", output.name)),
                Some(values) if values.len() != output.size => {
                    return Err(format!(
                        "output {} has {} values, expected {}",
                        output.name,
                        values.len(),
                        output.size
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn finite_differences<M>(
        &self,
        point: &DesignPoint,
        base: &Response,
        model: &mut M,
    ) -> Result<Jacobian, Outcome>
    where
        M: Model + ?Sized,
    {
        let step = self.finite_difference.step;
        let central = self.finite_difference.form == DifferenceForm::Central;
        let mut jacobian = Jacobian::new();

        for (name, size) in &self.variables {
            let base_values = point.get(name).unwrap_or_default().to_vec();
            // One block per output, row-major (output element, variable element).
            let mut blocks: Vec<Vec<f64>> = self
                .outputs
                .iter()
                .map(|o| vec![0.0; o.size * size])
                .collect();

            for j in 0..*size {
                let forward = self.perturbed(point, name, &base_values, j, step, model)?;
                let backward = if central {
                    Some(self.perturbed(point, name, &base_values, j, -step, model)?)
                } else {
                    None
                };

                for (k, output) in self.outputs.iter().enumerate() {
                    let plus = output.values(&forward).unwrap_or_default();
                    let reference = match &backward {
                        Some(r) => output.values(r).unwrap_or_default(),
                        None => output.values(base).unwrap_or_default(),
                    };
                    let width = if central { 2.0 * step } else { step };
                    for i in 0..output.size {
                        let (Some(p), Some(r)) = (plus.get(i), reference.get(i)) else {
                            continue;
                        };
                        blocks[k][i * size + j] = (p - r) / width;
                    }
                }
            }

            for (output, values) in self.outputs.iter().zip(blocks) {
                jacobian.insert(output.name.clone(), name.clone(), values);
            }
        }
        Ok(jacobian)
    }

    fn perturbed<M>(
        &self,
        point: &DesignPoint,
        name: &str,
        base_values: &[f64],
        element: usize,
        delta: f64,
        model: &mut M,
    ) -> Result<Response, Outcome>
    where
        M: Model + ?Sized,
    {
        let mut values = base_values.to_vec();
        values[element] += delta;
        let mut shifted = point.clone();
        shifted.insert(name, values);

        let response = guarded(|| model.evaluate(&shifted)).map_err(|outcome| match outcome {
            Outcome::RecoverableFailure { reason } => Outcome::RecoverableFailure {
                reason: format!("{reason} (finite-difference step on {name}[{element}])"),
            },
            other => other,
        })?;
        if let Err(reason) = self.check_outputs(&response) {
            return Err(Outcome::FatalFailure {
                reason,
                cause: FatalCause::InvalidResponse,
            });
        }
        Ok(response)
    }
}

/// Call into the model, turning model errors and panics into outcomes.
fn guarded<T>(call: impl FnOnce() -> Result<T, ModelError>) -> Result<T, Outcome> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(ModelError::DomainInvalid(reason))) => Err(Outcome::RecoverableFailure { reason }),
        Ok(Err(ModelError::Failed(reason))) => Err(Outcome::FatalFailure {
            reason,
            cause: FatalCause::Model,
        }),
        Err(payload) => Err(Outcome::FatalFailure {
            reason: format!("model panicked: {}", panic_message(payload.as_ref())),
            cause: FatalCause::Panic,
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use dt_types::{ConstraintDecl, DesignVariable, ObjectiveDecl};

    fn config() -> DriverConfig {
        DriverConfig::new("mediator")
            .with_design_variable(DesignVariable::scalar("x", 1.0))
            .with_design_variable(DesignVariable::vector("z", vec![0.0, 0.0]))
            .with_objective(ObjectiveDecl::minimize("f"))
            .with_constraint(ConstraintDecl::lower("c", 0.0))
            .with_max_consecutive_recoverable(2)
    }

    /// f = x² + z₀ z₁, c = x - z₁; invalid for x < 0.
    struct Quadratic;

    impl Model for Quadratic {
        fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
            let x = point.scalar("x").unwrap_or_default();
            let z = point.get("z").unwrap_or_default();
            if x < 0.0 {
                return Err(ModelError::domain_invalid("x must be non-negative"));
            }
            Ok(Response::new()
                .with_objective("f", [x * x + z[0] * z[1]])
                .with_constraint("c", [x - z[1]]))
        }
    }

    fn at(x: f64, z0: f64, z1: f64) -> DesignPoint {
        DesignPoint::new().with_scalar("x", x).with("z", [z0, z1])
    }

    #[test]
    fn success_carries_finite_difference_derivatives() {
        let mediator = EvaluationMediator::new(&config());
        let outcome = mediator.classify(&at(2.0, 3.0, 5.0), &mut Quadratic);
        let response = outcome.response().unwrap();
        let jac = response.derivatives.as_ref().unwrap();

        assert_abs_diff_eq!(jac.get("f", "x").unwrap()[0], 4.0, epsilon = 1e-4);
        let dfdz = jac.get("f", "z").unwrap();
        assert_abs_diff_eq!(dfdz[0], 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dfdz[1], 3.0, epsilon = 1e-6);
        let dcdz = jac.get("c", "z").unwrap();
        assert_abs_diff_eq!(dcdz[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn central_differences() {
        let config = config().with_finite_difference(FiniteDifference {
            step: 1e-4,
            form: DifferenceForm::Central,
        });
        let mediator = EvaluationMediator::new(&config);
        let outcome = mediator.classify(&at(2.0, 0.0, 0.0), &mut Quadratic);
        let jac = outcome.response().unwrap().derivatives.clone().unwrap();
        assert_abs_diff_eq!(jac.get("f", "x").unwrap()[0], 4.0, epsilon = 1e-8);
    }

    #[test]
    fn invalid_finite_difference_step_is_recoverable() {
        let config = config().with_finite_difference(FiniteDifference {
            step: 1e-3,
            form: DifferenceForm::Central,
        });
        let mediator = EvaluationMediator::new(&config);
        let outcome = mediator.classify(&at(0.0, 1.0, 1.0), &mut Quadratic);
        assert!(outcome.is_recoverable());
        assert!(outcome.reason().unwrap().contains("finite-difference step on x[0]"));
    }

    #[test]
    fn model_errors_and_panics_are_fatal() {
        struct Broken(bool);
        impl Model for Broken {
            fn evaluate(&mut self, _: &DesignPoint) -> Result<Response, ModelError> {
                if self.0 {
                    panic!("index out of range");
                }
                Err(ModelError::failed("internal solver failure"))
            }
        }

        let mediator = EvaluationMediator::new(&config());
        let failed = mediator.classify(&at(1.0, 0.0, 0.0), &mut Broken(false));
        assert!(matches!(
            failed,
            Outcome::FatalFailure {
                cause: FatalCause::Model,
                ..
            }
        ));

        let panicked = mediator.classify(&at(1.0, 0.0, 0.0), &mut Broken(true));
        match panicked {
            Outcome::FatalFailure { reason, cause } => {
                assert_eq!(cause, FatalCause::Panic);
                assert!(reason.contains("index out of range"));
            }
            other => panic!("expected fatal failure, got {other:?}"),
        }
    }

    #[test]
    fn missing_output_is_invalid_response() {
        struct NoConstraint;
        impl Model for NoConstraint {
            fn evaluate(&mut self, _: &DesignPoint) -> Result<Response, ModelError> {
                Ok(Response::new().with_objective("f", [0.0]))
            }
        }
        let mediator = EvaluationMediator::new(&config());
        let outcome = mediator.classify(&at(1.0, 0.0, 0.0), &mut NoConstraint);
        assert!(matches!(
            outcome,
            Outcome::FatalFailure {
                cause: FatalCause::InvalidResponse,
                ..
            }
        ));
    }

    #[test]
    fn objective_returned_as_constraint_is_invalid_response() {
        struct Misfiled;
        impl Model for Misfiled {
            fn evaluate(&mut self, _: &DesignPoint) -> Result<Response, ModelError> {
                Ok(Response::new()
                    .with_constraint("f", [1.0])
                    .with_constraint("c", [0.0]))
            }
        }
        let mediator = EvaluationMediator::new(&config());
        match mediator.classify(&at(1.0, 0.0, 0.0), &mut Misfiled) {
            Outcome::FatalFailure { reason, cause } => {
                assert_eq!(cause, FatalCause::InvalidResponse);
                assert_eq!(reason, "model did not return objective f");
            }
            other => panic!("expected fatal failure, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_values_follow_policy() {
        struct Nan;
        impl Model for Nan {
            fn evaluate(&mut self, _: &DesignPoint) -> Result<Response, ModelError> {
                Ok(Response::new()
                    .with_objective("f", [f64::NAN])
                    .with_constraint("c", [0.0]))
            }
        }
        let strict = EvaluationMediator::new(&config());
        assert!(strict.classify(&at(1.0, 0.0, 0.0), &mut Nan).is_fatal());

        let mut lenient = config();
        lenient.failure_policy.non_finite_is_recoverable = true;
        let lenient = EvaluationMediator::new(&lenient);
        assert!(lenient.classify(&at(1.0, 0.0, 0.0), &mut Nan).is_recoverable());
    }

    #[test]
    fn evaluate_records_and_applies_budget() {
        let history = EvaluationHistory::new();
        let mut mediator = EvaluationMediator::new(&config());
        let bad = at(-1.0, 0.0, 0.0);

        let kinds: Vec<bool> = (0..3)
            .map(|i| {
                mediator
                    .evaluate(&bad, i, &mut Quadratic, &history)
                    .unwrap()
                    .is_fatal()
            })
            .collect();
        assert_eq!(kinds, vec![false, false, true]);
        assert_eq!(history.len(), 3);

        let last = history.reader().get(2).unwrap();
        assert!(matches!(
            last.outcome,
            Outcome::FatalFailure {
                cause: FatalCause::BudgetExhausted { consecutive: 3 },
                ..
            }
        ));
    }

    #[test]
    fn success_resets_budget() {
        let mut budget = FailureBudget::new(1);
        let soft = || Outcome::RecoverableFailure {
            reason: "invalid".into(),
        };
        assert!(budget.apply(soft()).is_recoverable());
        assert!(budget
            .apply(Outcome::Success(Response::new()))
            .is_success());
        assert_eq!(budget.consecutive(), 0);
        assert!(budget.apply(soft()).is_recoverable());
        assert!(budget.apply(soft()).is_fatal());
    }

    #[test]
    fn analytic_derivatives_skip_finite_differences() {
        struct Counting {
            calls: usize,
        }
        impl Model for Counting {
            fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
                self.calls += 1;
                Quadratic.evaluate(point)
            }
            fn linearize(&mut self, _: &DesignPoint) -> Result<Option<Jacobian>, ModelError> {
                Ok(Some(Jacobian::new().with("f", "x", [4.0])))
            }
        }

        let mediator = EvaluationMediator::new(&config());
        let mut model = Counting { calls: 0 };
        let outcome = mediator.classify(&at(2.0, 0.0, 0.0), &mut model);
        assert!(outcome.is_success());
        assert_eq!(model.calls, 1);
    }
}
