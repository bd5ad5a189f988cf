//! Detour evaluation driver.
//!
//! Sits between a [`Model`] and a gradient-based optimizer backend. The
//! [`Driver`] pulls design points from an optimizer session, has the
//! [`EvaluationMediator`] evaluate and classify each one, records every
//! attempt in the [`EvaluationHistory`] and reports the classified outcome
//! back in the backend's own failure convention.

pub mod adapter;
pub mod diagnostics;
pub mod driver;
pub mod history;
pub mod layout;
pub mod mediator;
pub mod model;
pub mod models;

pub use adapter::{Action, OptimizerAdapter, OptimizerSession, Termination};
pub use diagnostics::{replay, DiagnosticsReport, ReplayReport};
pub use driver::{run, CancelToken, Driver};
pub use history::{EvaluationHistory, HistoryReader, Query};
pub use layout::ProblemLayout;
pub use mediator::{EvaluationMediator, FailureBudget};
pub use model::{BinaryModel, Classified, FailureClass, InvalidInput, Model, ModelError};
pub use models::{Paraboloid, Region};
