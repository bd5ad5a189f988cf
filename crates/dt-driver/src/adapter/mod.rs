//! Optimizer adapters.
//!
//! An [`OptimizerAdapter`] opens one [`OptimizerSession`] per run. The session
//! hides the backend's calling convention behind a request/response protocol:
//! the driver asks for the next [`Action`], evaluates, and reports the
//! [`Outcome`] back. How a recoverable failure reaches the backend is the
//! variant's business.

mod flag;
mod session;
mod signal;

use std::sync::Arc;

use dt_types::{
    AdapterError, BackendSelection, DesignPoint, DriverConfig, Outcome, SessionState,
    TerminationStatus,
};

use crate::layout::ProblemLayout;

pub use flag::SqpAdapter;
pub use session::{BackendLink, BackendMessage, ReplyConvention, ThreadedSession};
pub use signal::ProjectedBfgsAdapter;

/// What the backend wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Evaluate { point: DesignPoint, iteration: u64 },
    Terminate(Termination),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub status: TerminationStatus,
    /// Last point the backend accepted.
    pub point: Option<DesignPoint>,
    /// Objective at `point`, in the declared direction.
    pub objective: Option<f64>,
    pub iterations: u64,
}

pub trait OptimizerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a session for one run.
    fn open(&self, layout: Arc<ProblemLayout>) -> Result<Box<dyn OptimizerSession>, AdapterError>;
}

/// One run's worth of backend state.
///
/// `Initialized -> Requesting -> AwaitingOutcome -> (Requesting | Terminated)`.
/// Calls out of that order fail with [`AdapterError::InvalidTransition`].
pub trait OptimizerSession {
    fn state(&self) -> SessionState;

    fn next_action(&mut self) -> Result<Action, AdapterError>;

    /// Report the outcome of the last requested point.
    fn accept_outcome(&mut self, outcome: &Outcome) -> Result<(), AdapterError>;

    /// Release the backend. Idempotent.
    fn close(&mut self) -> Result<(), AdapterError>;
}

/// Adapter for the configured backend.
///
/// The backend's own retry limit is raised to at least the failure budget, so
/// a run of recoverable failures always ends at the driver's budget.
pub fn adapter_for(config: &DriverConfig) -> Box<dyn OptimizerAdapter> {
    let timeout = config.backend_timeout();
    let budget = config.failure_policy.max_consecutive_recoverable;
    match &config.backend {
        BackendSelection::Sqp(settings) => {
            Box::new(SqpAdapter::new(settings.clone(), timeout).with_failure_budget(budget))
        }
        BackendSelection::ProjectedBfgs(settings) => Box::new(
            ProjectedBfgsAdapter::new(settings.clone(), timeout).with_failure_budget(budget),
        ),
    }
}
