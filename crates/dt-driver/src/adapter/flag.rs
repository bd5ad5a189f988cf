//! Adapter for the flag-convention SQP backend.
//!
//! A recoverable failure goes back as NaN-filled values with the `Failed`
//! flag set; the backend halves its step and asks for a nearby point. A fatal
//! failure goes back as `Stop`.

use ndarray::Array1;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use dt_optimizers::{FlaggedEvaluation, Sqp, SqpOptions};
use dt_types::{AdapterError, Response, SqpSettings};

use super::session::{BackendLink, ReplyConvention, ThreadedSession};
use super::{OptimizerAdapter, OptimizerSession};
use crate::layout::ProblemLayout;

pub struct FlagConvention;

impl ReplyConvention for FlagConvention {
    type Reply = FlaggedEvaluation;

    fn success(layout: &ProblemLayout, response: &Response) -> Result<FlaggedEvaluation, String> {
        layout.evaluation(response).map(FlaggedEvaluation::ok)
    }

    fn recoverable(layout: &ProblemLayout, _reason: &str) -> FlaggedEvaluation {
        FlaggedEvaluation::failed(layout.dim(), layout.n_constraints())
    }

    fn stop(layout: &ProblemLayout) -> FlaggedEvaluation {
        FlaggedEvaluation::stop(layout.dim(), layout.n_constraints())
    }
}

#[derive(Debug, Clone)]
pub struct SqpAdapter {
    settings: SqpSettings,
    timeout: Option<Duration>,
    min_halvings: usize,
}

impl SqpAdapter {
    pub fn new(settings: SqpSettings, timeout: Option<Duration>) -> Self {
        Self {
            settings,
            timeout,
            min_halvings: 0,
        }
    }

    /// Keep the backend retrying for as long as the driver tolerates
    /// `max_consecutive` recoverable failures in a row.
    pub fn with_failure_budget(mut self, max_consecutive: usize) -> Self {
        self.min_halvings = max_consecutive.saturating_add(1);
        self
    }

    pub fn options(&self) -> SqpOptions {
        SqpOptions {
            max_iterations: self.settings.max_iterations,
            tolerance: self.settings.tolerance,
            feasibility_tolerance: self.settings.feasibility_tolerance,
            max_step_halvings: self.settings.max_step_halvings.max(self.min_halvings),
            initial_hessian: self.settings.initial_hessian.clone(),
        }
    }
}

impl OptimizerAdapter for SqpAdapter {
    fn name(&self) -> &'static str {
        "sqp"
    }

    fn open(&self, layout: Arc<ProblemLayout>) -> Result<Box<dyn OptimizerSession>, AdapterError> {
        let solver = Sqp::new(self.options());
        let shape = layout.shape();
        let x0 = layout.initial().clone();
        let (dim, n_constraints) = (layout.dim(), layout.n_constraints());
        info!(
            backend = self.name(),
            dim,
            n_inequality = shape.n_inequality,
            n_equality = shape.n_equality,
            "opening session"
        );

        let session = ThreadedSession::<FlagConvention>::spawn(
            self.name(),
            layout,
            self.timeout,
            move |link: BackendLink<FlaggedEvaluation>| {
                let result = {
                    let mut objective = |x: &Array1<f64>, iteration: usize| {
                        link.request(x, iteration)
                            .unwrap_or_else(|| FlaggedEvaluation::stop(dim, n_constraints))
                    };
                    solver.minimize(&shape, x0, &mut objective)
                };
                link.finish(result);
            },
        )?;
        Ok(Box::new(session))
    }
}
