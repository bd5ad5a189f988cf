//! Run diagnostics and replay.

use serde::{Deserialize, Serialize};
use std::fmt;

use dt_types::{
    DesignPoint, DetourResult, DriverConfig, EvaluationRecord, FatalCause, HistorySummary,
    Outcome, OutcomeKind,
};

use crate::history::HistoryReader;
use crate::mediator::EvaluationMediator;
use crate::model::Model;

/// One history entry without the response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDigest {
    pub index: u64,
    pub iteration: u64,
    pub kind: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub point: DesignPoint,
    pub wall_time_ms: f64,
}

impl From<&EvaluationRecord> for RecordDigest {
    fn from(record: &EvaluationRecord) -> Self {
        Self {
            index: record.index,
            iteration: record.iteration,
            kind: record.kind(),
            reason: record.outcome.reason().map(str::to_string),
            point: record.design_point.clone(),
            wall_time_ms: record.wall_time.as_secs_f64() * 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub summary: HistorySummary,
    pub records: Vec<RecordDigest>,
}

impl DiagnosticsReport {
    pub fn from_records(records: &[EvaluationRecord]) -> Self {
        Self {
            summary: HistorySummary::from_records(records),
            records: records.iter().map(RecordDigest::from).collect(),
        }
    }

    pub fn from_reader(reader: &HistoryReader) -> Self {
        Self::from_records(&reader.snapshot())
    }

    pub fn to_json(&self) -> DetourResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// E.g. `"2 recoverable failures at iterations [0, 3]"`.
    pub fn failure_message(&self) -> String {
        let count = self.summary.recoverable_failures;
        let noun = if count == 1 { "failure" } else { "failures" };
        format!(
            "{count} recoverable {noun} at iterations {:?}",
            self.summary.recoverable_iterations
        )
    }

    pub fn recoverable(&self) -> impl Iterator<Item = &RecordDigest> {
        self.records
            .iter()
            .filter(|r| r.kind == OutcomeKind::RecoverableFailure)
    }
}

impl fmt::Display for DiagnosticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary)?;
        writeln!(f, "{}", self.failure_message())?;
        for record in self.records.iter().filter(|r| r.kind != OutcomeKind::Success) {
            writeln!(
                f,
                "  #{} (iteration {}) {} at {}: {}",
                record.index,
                record.iteration,
                record.kind,
                record.point,
                record.reason.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

// ---- replay ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayMismatch {
    pub index: u64,
    pub recorded: OutcomeKind,
    pub replayed: OutcomeKind,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplayReport {
    pub outcomes: Vec<OutcomeKind>,
    pub mismatches: Vec<ReplayMismatch>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-evaluate every recorded point in isolation and compare classifications.
///
/// Budget escalation depends on what came before a record, so a record
/// escalated by the failure budget is expected to replay as recoverable.
pub fn replay<M>(records: &[EvaluationRecord], config: &DriverConfig, model: &mut M) -> ReplayReport
where
    M: Model + ?Sized,
{
    let mediator = EvaluationMediator::new(config);
    let mut report = ReplayReport::default();

    for record in records {
        let expected = match &record.outcome {
            Outcome::FatalFailure {
                cause: FatalCause::BudgetExhausted { .. },
                ..
            } => OutcomeKind::RecoverableFailure,
            outcome => outcome.kind(),
        };
        let replayed = mediator.classify(&record.design_point, model).kind();
        if replayed != expected {
            report.mismatches.push(ReplayMismatch {
                index: record.index,
                recorded: expected,
                replayed,
            });
        }
        report.outcomes.push(replayed);
    }
    report
}
