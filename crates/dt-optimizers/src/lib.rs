//! Gradient-based optimizer backends.
//!
//! Two backends with different ways of hearing about a failed evaluation:
//!
//! - [`Sqp`] asks a [`FlaggedObjective`] for values and a failure flag.
//! - [`ProjectedBfgs`] asks a [`SignalledObjective`], which may raise a
//!   bad-point signal instead of returning values.
//!
//! Both backtrack toward the last accepted point when an evaluation fails,
//! and both stop cleanly when the objective asks them to.

pub mod dense;
pub mod problem;
pub mod projected_bfgs;
pub mod qp;
pub mod sqp;

pub use problem::*;
pub use projected_bfgs::{ProjectedBfgs, ProjectedBfgsOptions, Signal, SignalledObjective};
pub use qp::{QpProblem, QpSolution};
pub use sqp::{EvalFlag, FlaggedEvaluation, FlaggedObjective, Sqp, SqpOptions};
