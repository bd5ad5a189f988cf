//! Evaluation records and history summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::outcome::{Outcome, OutcomeKind};
use crate::point::DesignPoint;

/// Immutable snapshot of one evaluation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// Position in the run's history. Starts at zero, gap-free.
    pub index: u64,
    /// Major iteration the backend was on when it asked for this point.
    pub iteration: u64,
    pub design_point: DesignPoint,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub wall_time: Duration,
}

impl EvaluationRecord {
    pub fn kind(&self) -> OutcomeKind {
        self.outcome.kind()
    }

    /// Scalar objective value, if the evaluation succeeded.
    pub fn objective_value(&self, name: &str) -> Option<f64> {
        self.outcome
            .response()
            .and_then(|r| r.objective(name))
            .and_then(|v| v.first().copied())
    }
}

/// Counts and failure locations over a history.
///
/// This is what a reporting layer needs to reproduce messages of the form
/// "N recoverable failures at evaluations [...]".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistorySummary {
    pub evaluations: u64,
    pub successes: u64,
    pub recoverable_failures: u64,
    pub fatal_failures: u64,
    /// Record indices of every recoverable failure.
    pub recoverable_indices: Vec<u64>,
    /// Major iterations at which recoverable failures occurred (deduplicated).
    pub recoverable_iterations: Vec<u64>,
    /// Record index of the fatal failure that ended the run, if any.
    pub fatal_index: Option<u64>,
}

impl HistorySummary {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a EvaluationRecord>,
    {
        let mut summary = Self::default();
        for record in records {
            summary.evaluations += 1;
            match record.kind() {
                OutcomeKind::Success => summary.successes += 1,
                OutcomeKind::RecoverableFailure => {
                    summary.recoverable_failures += 1;
                    summary.recoverable_indices.push(record.index);
                    if summary.recoverable_iterations.last() != Some(&record.iteration) {
                        summary.recoverable_iterations.push(record.iteration);
                    }
                }
                OutcomeKind::FatalFailure => {
                    summary.fatal_failures += 1;
                    summary.fatal_index = Some(record.index);
                }
            }
        }
        summary
    }
}

impl fmt::Display for HistorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} evaluations, {} recoverable failures at evaluations {:?}",
            self.evaluations, self.recoverable_failures, self.recoverable_indices
        )?;
        if let Some(index) = self.fatal_index {
            write!(f, ", fatal failure at evaluation {index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FatalCause;
    use crate::point::Response;

    fn record(index: u64, iteration: u64, outcome: Outcome) -> EvaluationRecord {
        EvaluationRecord {
            index,
            iteration,
            design_point: DesignPoint::new().with_scalar("x", index as f64),
            outcome,
            started_at: Utc::now(),
            wall_time: Duration::from_millis(1),
        }
    }

    fn soft() -> Outcome {
        Outcome::RecoverableFailure {
            reason: "outside domain".into(),
        }
    }

    #[test]
    fn summary_counts_and_locations() {
        let records = vec![
            record(0, 0, Outcome::Success(Response::new().with_objective("f", [3.0]))),
            record(1, 1, soft()),
            record(2, 1, soft()),
            record(3, 2, soft()),
            record(
                4,
                2,
                Outcome::FatalFailure {
                    reason: "boom".into(),
                    cause: FatalCause::Model,
                },
            ),
        ];

        let summary = HistorySummary::from_records(&records);
        assert_eq!(summary.evaluations, 5);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.recoverable_failures, 3);
        assert_eq!(summary.recoverable_indices, vec![1, 2, 3]);
        assert_eq!(summary.recoverable_iterations, vec![1, 2]);
        assert_eq!(summary.fatal_index, Some(4));
        assert_eq!(
            summary.to_string(),
            "5 evaluations, 3 recoverable failures at evaluations [1, 2, 3], fatal failure at evaluation 4"
        );
    }

    #[test]
    fn objective_value_only_for_success() {
        let ok = record(0, 0, Outcome::Success(Response::new().with_objective("f", [3.0])));
        assert_eq!(ok.objective_value("f"), Some(3.0));
        assert_eq!(record(1, 0, soft()).objective_value("f"), None);
    }
}
