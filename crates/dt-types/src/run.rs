//! Run-level status and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::point::DesignPoint;
use crate::record::{EvaluationRecord, HistorySummary};

/// Lifecycle of an adapter session.
///
/// `Initialized -> Requesting -> AwaitingOutcome -> Requesting -> ... -> Terminated`.
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initialized,
    Requesting,
    AwaitingOutcome,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Requesting => "requesting",
            Self::AwaitingOutcome => "awaiting outcome",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a backend ended its search, as reported through the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminationStatus {
    /// Optimality and feasibility tolerances were met.
    Converged,
    /// The backend gave up without meeting its tolerances.
    Unconverged { reason: String },
    /// The backend honored a stop request.
    Stopped,
    /// The session was ended by a fatal evaluation outcome.
    Error { reason: String },
}

/// Errors that end a run with [`RunStatus::Error`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunError {
    #[error("Fatal failure at evaluation {index}: {reason}")]
    FatalFailure { index: u64, reason: String },

    #[error("Backend {backend} protocol error: {message}")]
    BackendProtocol {
        backend: String,
        message: String,
        raw: Option<String>,
    },

    #[error("History corruption: expected record index {expected}, found {found}")]
    HistoryCorruption { expected: u64, found: u64 },

    #[error("Session error: {message}")]
    Session { message: String },
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Unconverged { reason: String },
    Cancelled,
    Error { error: RunError },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn error(&self) -> Option<&RunError> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Unconverged { reason } => write!(f, "unconverged ({reason})"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error { error } => write!(f, "error: {error}"),
        }
    }
}

/// Everything a caller gets back from a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub name: String,
    pub backend: String,
    pub status: RunStatus,
    /// Best point reported by the backend, or the last successfully evaluated
    /// point when the backend produced no report.
    pub final_point: Option<DesignPoint>,
    pub final_objective: Option<f64>,
    pub iterations: u64,
    pub summary: HistorySummary,
    /// Every evaluation attempt, in request order.
    pub history: Vec<EvaluationRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn evaluations(&self) -> u64 {
        self.summary.evaluations
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
