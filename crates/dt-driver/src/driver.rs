//! Driver: runs one optimization to termination.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dt_types::{
    AdapterError, DesignPoint, DetourResult, DriverConfig, HistoryError, HistorySummary,
    Outcome, RunError, RunResult, RunStatus, TerminationStatus,
};

use crate::adapter::{adapter_for, Action, OptimizerAdapter, OptimizerSession, Termination};
use crate::history::{EvaluationHistory, HistoryReader};
use crate::layout::ProblemLayout;
use crate::mediator::EvaluationMediator;
use crate::model::Model;

/// Cooperative cancellation flag, checked between evaluations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Closes the session on every exit path.
struct SessionGuard {
    session: Box<dyn OptimizerSession>,
}

impl SessionGuard {
    fn session(&mut self) -> &mut dyn OptimizerSession {
        self.session.as_mut()
    }

    fn close(&mut self) -> Result<(), AdapterError> {
        self.session.close()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.session.close() {
            error!(error = %err, "failed to close optimizer session");
        }
    }
}

enum Exit {
    Terminated(Termination),
    Cancelled,
    Failed(RunError),
}

pub struct Driver {
    run_id: Uuid,
    config: DriverConfig,
    layout: Arc<ProblemLayout>,
    adapter: Box<dyn OptimizerAdapter>,
    history: EvaluationHistory,
    cancel: CancelToken,
}

impl Driver {
    /// Validate `config` and pick the adapter for its backend.
    pub fn new(config: DriverConfig) -> DetourResult<Self> {
        let adapter = adapter_for(&config);
        Self::with_adapter(config, adapter)
    }

    pub fn with_adapter(
        config: DriverConfig,
        adapter: Box<dyn OptimizerAdapter>,
    ) -> DetourResult<Self> {
        config.validate()?;
        let layout = Arc::new(ProblemLayout::from_config(&config));
        Ok(Self {
            run_id: Uuid::new_v4(),
            config,
            layout,
            adapter,
            history: EvaluationHistory::new(),
            cancel: CancelToken::new(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Read-only view of the history, usable while the run is in progress.
    pub fn history(&self) -> HistoryReader {
        self.history.reader()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run<M>(self, model: &mut M) -> RunResult
    where
        M: Model + ?Sized,
    {
        let started_at = Utc::now();
        let backend = self.adapter.name();
        info!(
            run_id = %self.run_id,
            name = %self.config.name,
            backend,
            dim = self.layout.dim(),
            "starting run"
        );

        let mut mediator = EvaluationMediator::new(&self.config);
        let mut last_success: Option<(DesignPoint, Option<f64>)> = None;
        let mut fatal: Option<(u64, String)> = None;
        let mut iterations = 0;

        let exit = match self.adapter.open(Arc::clone(&self.layout)) {
            Err(err) => Exit::Failed(run_error(err)),
            Ok(session) => {
                let mut guard = SessionGuard { session };
                let exit = loop {
                    if self.cancel.is_cancelled() {
                        info!(run_id = %self.run_id, evaluations = self.history.len(), "run cancelled");
                        break Exit::Cancelled;
                    }

                    let action = match guard.session().next_action() {
                        Ok(action) => action,
                        Err(err) => break Exit::Failed(run_error(err)),
                    };
                    let (point, iteration) = match action {
                        Action::Evaluate { point, iteration } => (point, iteration),
                        Action::Terminate(termination) => break Exit::Terminated(termination),
                    };
                    iterations = iterations.max(iteration);

                    let index = self.history.next_index();
                    let outcome =
                        match mediator.evaluate(&point, iteration, model, &self.history) {
                            Ok(outcome) => outcome,
                            Err(HistoryError::Corruption { expected, found }) => {
                                break Exit::Failed(RunError::HistoryCorruption { expected, found })
                            }
                        };
                    match &outcome {
                        Outcome::Success(response) => {
                            let objective = response
                                .objective(self.layout.objective_name())
                                .and_then(|v| v.first().copied());
                            last_success = Some((point, objective));
                        }
                        Outcome::FatalFailure { reason, .. } => {
                            fatal = Some((index, reason.clone()));
                        }
                        Outcome::RecoverableFailure { .. } => {}
                    }

                    if let Err(err) = guard.session().accept_outcome(&outcome) {
                        break Exit::Failed(run_error(err));
                    }
                };

                if let Err(err) = guard.close() {
                    warn!(run_id = %self.run_id, error = %err, "session did not close cleanly");
                }
                exit
            }
        };

        let (status, final_point, final_objective) = match exit {
            Exit::Terminated(termination) => {
                iterations = iterations.max(termination.iterations);
                let status = match termination.status {
                    TerminationStatus::Converged => RunStatus::Success,
                    TerminationStatus::Unconverged { reason } => RunStatus::Unconverged { reason },
                    TerminationStatus::Stopped | TerminationStatus::Error { .. } => match &fatal {
                        Some((index, reason)) => RunStatus::Error {
                            error: RunError::FatalFailure {
                                index: *index,
                                reason: reason.clone(),
                            },
                        },
                        None => RunStatus::Error {
                            error: RunError::Session {
                                message: "backend stopped without a fatal outcome".to_string(),
                            },
                        },
                    },
                };
                match termination.point {
                    Some(point) => (status, Some(point), termination.objective),
                    None => split(status, last_success),
                }
            }
            Exit::Cancelled => split(RunStatus::Cancelled, last_success),
            Exit::Failed(error) => split(RunStatus::Error { error }, last_success),
        };

        let history = self.history.snapshot();
        let summary = HistorySummary::from_records(&history);
        let finished_at = Utc::now();
        match &status {
            RunStatus::Error { error } => {
                error!(run_id = %self.run_id, %error, evaluations = summary.evaluations, "run failed")
            }
            status => info!(
                run_id = %self.run_id,
                %status,
                evaluations = summary.evaluations,
                recoverable_failures = summary.recoverable_failures,
                objective = ?final_objective,
                "run finished"
            ),
        }
        debug!(run_id = %self.run_id, %summary, "history summary");

        RunResult {
            run_id: self.run_id,
            name: self.config.name.clone(),
            backend: backend.to_string(),
            status,
            final_point,
            final_objective,
            iterations,
            summary,
            history,
            started_at,
            finished_at,
        }
    }
}

fn split(
    status: RunStatus,
    last_success: Option<(DesignPoint, Option<f64>)>,
) -> (RunStatus, Option<DesignPoint>, Option<f64>) {
    match last_success {
        Some((point, objective)) => (status, Some(point), objective),
        None => (status, None, None),
    }
}

fn run_error(err: AdapterError) -> RunError {
    match err {
        AdapterError::BackendProtocol {
            backend,
            message,
            raw,
        } => RunError::BackendProtocol {
            backend,
            message,
            raw,
        },
        other => RunError::Session {
            message: other.to_string(),
        },
    }
}

/// Validate `config`, run it against `model` and return the result.
pub fn run<M>(config: DriverConfig, model: &mut M) -> DetourResult<RunResult>
where
    M: Model + ?Sized,
{
    Ok(Driver::new(config)?.run(model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_types::{
        ConfigError, DesignVariable, DetourError, EvaluationRecord, ObjectiveDecl, Response,
        SessionState,
    };

    use crate::model::ModelError;

    fn config() -> DriverConfig {
        DriverConfig::new("driver")
            .with_design_variable(DesignVariable::scalar("x", 2.0).with_bounds(-10.0, 10.0))
            .with_objective(ObjectiveDecl::minimize("f"))
    }

    struct Shifted;

    impl Model for Shifted {
        fn evaluate(&mut self, point: &DesignPoint) -> Result<Response, ModelError> {
            let x = point.scalar("x").unwrap_or_default();
            Ok(Response::new().with_objective("f", [(x - 1.0).powi(2)]))
        }
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = DriverConfig::new("empty").with_objective(ObjectiveDecl::minimize("f"));
        match Driver::new(config) {
            Err(DetourError::Config(ConfigError::NoDesignVariables)) => {}
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected a config error"),
        }
    }

    #[test]
    fn one_dimensional_minimum() {
        let result = run(config(), &mut Shifted).unwrap();
        assert!(result.status.is_success(), "{}", result.status);
        let x = result.final_point.as_ref().unwrap().scalar("x").unwrap();
        assert!((x - 1.0).abs() < 1e-5);
        assert_eq!(result.history.len() as u64, result.evaluations());
    }

    #[test]
    fn cancelled_before_first_request() {
        let driver = Driver::new(config()).unwrap();
        driver.cancel_token().cancel();
        let reader = driver.history();
        let result = driver.run(&mut Shifted);
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(result.history.is_empty());
        assert!(reader.is_empty());
        assert!(result.final_point.is_none());
    }

    /// Adapter whose session misbehaves, for checking the protocol guards.
    struct Scripted {
        actions: Vec<Action>,
    }

    struct ScriptedSession {
        actions: std::vec::IntoIter<Action>,
        state: SessionState,
    }

    impl OptimizerAdapter for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open(
            &self,
            _layout: Arc<ProblemLayout>,
        ) -> Result<Box<dyn OptimizerSession>, AdapterError> {
            Ok(Box::new(ScriptedSession {
                actions: self.actions.clone().into_iter(),
                state: SessionState::Initialized,
            }))
        }
    }

    impl OptimizerSession for ScriptedSession {
        fn state(&self) -> SessionState {
            self.state
        }

        fn next_action(&mut self) -> Result<Action, AdapterError> {
            match self.actions.next() {
                Some(action) => {
                    self.state = SessionState::AwaitingOutcome;
                    Ok(action)
                }
                None => Err(AdapterError::protocol("scripted", "script exhausted")),
            }
        }

        fn accept_outcome(&mut self, _outcome: &Outcome) -> Result<(), AdapterError> {
            self.state = SessionState::Requesting;
            Ok(())
        }

        fn close(&mut self) -> Result<(), AdapterError> {
            self.state = SessionState::Terminated;
            Ok(())
        }
    }

    #[test]
    fn adapter_protocol_error_surfaces_in_result() {
        let actions = vec![Action::Evaluate {
            point: DesignPoint::new().with_scalar("x", 0.5),
            iteration: 0,
        }];
        let driver =
            Driver::with_adapter(config(), Box::new(Scripted { actions })).unwrap();
        let result = driver.run(&mut Shifted);

        match result.status.error() {
            Some(RunError::BackendProtocol { backend, message, .. }) => {
                assert_eq!(backend, "scripted");
                assert_eq!(message, "script exhausted");
            }
            other => panic!("expected a protocol error, got {other:?}"),
        }
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.final_point.and_then(|p| p.scalar("x")), Some(0.5));
        assert_eq!(result.final_objective, Some(0.25));
    }

    #[test]
    fn history_index_mismatch_is_corruption() {
        let driver = Driver::new(config()).unwrap();
        // A record the mediator does not know about.
        driver
            .history
            .append(EvaluationRecord {
                index: 0,
                iteration: 0,
                design_point: DesignPoint::new().with_scalar("x", 2.0),
                outcome: Outcome::Success(Response::new().with_objective("f", [1.0])),
                started_at: Utc::now(),
                wall_time: std::time::Duration::ZERO,
            })
            .unwrap();
        let result = driver.run(&mut Shifted);

        assert_eq!(
            result.status,
            RunStatus::Error {
                error: RunError::HistoryCorruption {
                    expected: 1,
                    found: 0,
                },
            }
        );
        assert_eq!(result.history.len(), 1);
        assert!(result.final_point.is_none());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
