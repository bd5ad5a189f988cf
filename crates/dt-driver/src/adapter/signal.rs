//! Adapter for the signal-convention projected BFGS backend.
//!
//! A recoverable failure is raised into the backend as
//! [`Signal::BadPoint`], which its line search maps to a step halving. A fatal
//! failure is raised as [`Signal::Stop`].

use ndarray::Array1;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dt_optimizers::{Evaluation, ProjectedBfgs, ProjectedBfgsOptions, Signal};
use dt_types::{AdapterError, ProjectedBfgsSettings, Response};

use super::session::{BackendLink, ReplyConvention, ThreadedSession};
use super::{OptimizerAdapter, OptimizerSession};
use crate::layout::ProblemLayout;

pub struct SignalConvention;

impl ReplyConvention for SignalConvention {
    type Reply = Result<Evaluation, Signal>;

    fn success(
        layout: &ProblemLayout,
        response: &Response,
    ) -> Result<Result<Evaluation, Signal>, String> {
        layout.evaluation(response).map(Ok)
    }

    fn recoverable(_layout: &ProblemLayout, reason: &str) -> Result<Evaluation, Signal> {
        Err(Signal::BadPoint {
            reason: reason.to_string(),
        })
    }

    fn stop(_layout: &ProblemLayout) -> Result<Evaluation, Signal> {
        Err(Signal::Stop)
    }
}

#[derive(Debug, Clone)]
pub struct ProjectedBfgsAdapter {
    settings: ProjectedBfgsSettings,
    timeout: Option<Duration>,
    min_halvings: usize,
}

impl ProjectedBfgsAdapter {
    pub fn new(settings: ProjectedBfgsSettings, timeout: Option<Duration>) -> Self {
        Self {
            settings,
            timeout,
            min_halvings: 0,
        }
    }

    /// See [`SqpAdapter::with_failure_budget`](super::SqpAdapter::with_failure_budget).
    pub fn with_failure_budget(mut self, max_consecutive: usize) -> Self {
        self.min_halvings = max_consecutive.saturating_add(1);
        self
    }

    pub fn options(&self) -> ProjectedBfgsOptions {
        ProjectedBfgsOptions {
            max_iterations: self.settings.max_iterations,
            tolerance: self.settings.tolerance,
            max_step_halvings: self.settings.max_step_halvings.max(self.min_halvings),
        }
    }
}

impl OptimizerAdapter for ProjectedBfgsAdapter {
    fn name(&self) -> &'static str {
        "projected_bfgs"
    }

    fn open(&self, layout: Arc<ProblemLayout>) -> Result<Box<dyn OptimizerSession>, AdapterError> {
        if layout.n_constraints() > 0 {
            return Err(AdapterError::protocol(
                self.name(),
                "general constraints are not supported, only bounds",
            ));
        }
        let solver = ProjectedBfgs::new(self.options());
        let shape = layout.shape();
        let x0 = layout.initial().clone();
        info!(backend = self.name(), dim = layout.dim(), "opening session");

        let session = ThreadedSession::<SignalConvention>::spawn(
            self.name(),
            layout,
            self.timeout,
            move |link: BackendLink<Result<Evaluation, Signal>>| {
                let result = {
                    let mut objective = |x: &Array1<f64>, iteration: usize| {
                        link.request(x, iteration).unwrap_or(Err(Signal::Stop))
                    };
                    solver.minimize(&shape, x0, &mut objective)
                };
                link.finish(result);
            },
        )?;
        Ok(Box::new(session))
    }
}
